#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Marker that turns a chat line into an image generation request.
pub const IMAGE_PREFIX: &str = "#image:";

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "text_model",
        action: "set_text_model",
    },
    CommandSpec {
        command: "image_model",
        action: "set_image_model",
    },
];

pub(crate) const IMAGE_KEY_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "adjust",
        action: "adjust",
    },
    CommandSpec {
        command: "reset",
        action: "reset_effects",
    },
    CommandSpec {
        command: "download",
        action: "download",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "clear",
        action: "clear",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

/// `/adjust` argument names and the effect field each one drives.
pub(crate) const EFFECT_ARG_ALIASES: &[(&str, &str)] = &[
    ("brightness", "brightness"),
    ("contrast", "contrast"),
    ("grayscale", "grayscale"),
    ("greyscale", "grayscale"),
    ("gray", "grayscale"),
    ("bw", "black_and_white"),
    ("black_and_white", "black_and_white"),
    ("nobg", "remove_background"),
    ("remove_background", "remove_background"),
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/clear",
    "/help",
    "/text_model",
    "/image_model",
    "/adjust",
    "/reset",
    "/download",
    "/quit",
    IMAGE_PREFIX,
];
