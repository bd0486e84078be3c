mod command_registry;
mod intent_parser;

pub use command_registry::{CHAT_HELP_COMMANDS, IMAGE_PREFIX};
pub use intent_parser::{image_prompt, parse_intent, Intent};
