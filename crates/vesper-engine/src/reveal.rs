use std::time::Duration;

pub const REVEAL_STEPS: usize = 10;
pub const REVEAL_DELAY: Duration = Duration::from_millis(100);
pub const REVEAL_CURSOR: &str = "▌";

#[derive(Debug, Clone, PartialEq)]
pub struct RevealFrame {
    /// Characters of the full text visible in this frame.
    pub shown_chars: usize,
    /// Visible prefix, followed by the cursor on all but the final frame.
    pub text: String,
    pub progress: f32,
    pub done: bool,
}

/// Progressive display of an already complete reply: ten growing prefixes
/// with a cursor, then the full text.
pub fn reveal_frames(full: &str) -> Vec<RevealFrame> {
    let total = full.chars().count();
    let mut frames = Vec::with_capacity(REVEAL_STEPS + 1);
    for step in 1..=REVEAL_STEPS {
        let shown_chars = total * step / REVEAL_STEPS;
        let prefix: String = full.chars().take(shown_chars).collect();
        frames.push(RevealFrame {
            shown_chars,
            text: format!("{prefix}{REVEAL_CURSOR}"),
            progress: step as f32 / REVEAL_STEPS as f32,
            done: false,
        });
    }
    frames.push(RevealFrame {
        shown_chars: total,
        text: full.to_string(),
        progress: 1.0,
        done: true,
    });
    frames
}
