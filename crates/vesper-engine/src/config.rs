use vesper_contracts::render::Variant;

use crate::imagegen::StabilityProvider;
use crate::text::GeminiTextProvider;
use crate::util::{api_base_from_env, non_empty_env};

pub const BASIC_TEXT_MODEL: &str = "gemini-2.0-flash-thinking-exp-01-21";
pub const STUDIO_TEXT_MODEL: &str = "gemini-2.0-flash-exp-image-generation";
pub const DEFAULT_IMAGE_MODEL: &str = "stable-diffusion-v1-6";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub variant: Variant,
    pub text_model: String,
    pub image_model: String,
    pub gemini_api_base: String,
    pub stability_api_base: String,
    /// `None` disables background removal.
    pub rembg_endpoint: Option<String>,
}

impl AppConfig {
    /// Defaults for `variant`, overridable through the environment.
    pub fn from_env(variant: Variant) -> Self {
        let default_text = match variant {
            Variant::Basic => BASIC_TEXT_MODEL,
            Variant::Studio => STUDIO_TEXT_MODEL,
        };
        Self {
            variant,
            text_model: non_empty_env("VESPER_TEXT_MODEL")
                .unwrap_or_else(|| default_text.to_string()),
            image_model: non_empty_env("VESPER_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            gemini_api_base: api_base_from_env(
                "GEMINI_API_BASE",
                GeminiTextProvider::DEFAULT_API_BASE,
            ),
            stability_api_base: api_base_from_env(
                "STABILITY_API_BASE",
                StabilityProvider::DEFAULT_API_BASE,
            ),
            rembg_endpoint: non_empty_env("REMBG_ENDPOINT"),
        }
    }

    pub fn with_text_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model.filter(|value| !value.trim().is_empty()) {
            self.text_model = model.trim().to_string();
        }
        self
    }

    pub fn with_image_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model.filter(|value| !value.trim().is_empty()) {
            self.image_model = model.trim().to_string();
        }
        self
    }

    pub fn with_rembg_endpoint(mut self, endpoint: Option<String>) -> Self {
        if let Some(endpoint) = endpoint.filter(|value| !value.trim().is_empty()) {
            self.rembg_endpoint = Some(endpoint.trim().to_string());
        }
        self
    }
}
