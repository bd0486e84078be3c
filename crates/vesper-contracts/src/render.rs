use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::effects::EffectSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which application flavour is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Text chat only.
    Basic,
    /// Text chat plus `#image:` generation and per-image effects.
    Studio,
}

impl Variant {
    pub fn title(&self) -> &'static str {
        match self {
            Variant::Basic => "💬 Chatbot",
            Variant::Studio => "🎨 Chatbot with Image Generation",
        }
    }

    pub fn supports_images(&self) -> bool {
        matches!(self, Variant::Studio)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Basic => "basic",
            Variant::Studio => "studio",
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "basic" | "chat" => Ok(Variant::Basic),
            "studio" | "image" | "images" => Ok(Variant::Studio),
            other => Err(format!("unknown variant '{other}' (expected basic or studio)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationState {
    Idle,
    Responding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Inline message shown for the dispatch that produced it only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedImage {
    pub key: String,
    pub width: u32,
    pub height: u32,
    pub prompt: String,
    pub settings: EffectSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<RenderedImage>,
}

/// Everything a front end needs to redraw one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderModel {
    pub session_id: String,
    pub title: String,
    pub variant: Variant,
    pub state: PresentationState,
    pub text_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_model: Option<String>,
    pub messages: Vec<RenderedMessage>,
    pub notices: Vec<Notice>,
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{new_session_id, Notice, RenderedMessage, Role, Variant};

    #[test]
    fn variant_parses_aliases() {
        assert_eq!("Studio".parse::<Variant>(), Ok(Variant::Studio));
        assert_eq!("chat".parse::<Variant>(), Ok(Variant::Basic));
        assert!("paint".parse::<Variant>().is_err());
        assert!(Variant::Studio.supports_images());
        assert!(!Variant::Basic.supports_images());
    }

    #[test]
    fn rendered_text_message_omits_image_fields() -> anyhow::Result<()> {
        let message = RenderedMessage {
            role: Role::Assistant,
            content: "hi".to_string(),
            timestamp: None,
            image: None,
        };
        let value = serde_json::to_value(&message)?;
        assert_eq!(value, json!({ "role": "assistant", "content": "hi" }));
        Ok(())
    }

    #[test]
    fn notice_serializes_lowercase_level() -> anyhow::Result<()> {
        let value = serde_json::to_value(Notice::warning("careful"))?;
        assert_eq!(value, json!({ "level": "warning", "text": "careful" }));
        Ok(())
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
