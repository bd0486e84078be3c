use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::util::first_non_empty_env;

/// Checked when no explicit secrets file is given.
pub const DEFAULT_SECRETS_PATH: &str = ".streamlit/secrets.toml";

#[derive(Debug, Default, Deserialize)]
struct SecretsFile {
    #[serde(rename = "GENAI_API_KEY")]
    genai_api_key: Option<String>,
    #[serde(rename = "STABILITY_API_KEY")]
    stability_api_key: Option<String>,
}

/// API credentials, resolved once at startup.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub genai_api_key: Option<String>,
    pub stability_api_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("genai_api_key", &self.genai_api_key.as_ref().map(|_| "***"))
            .field(
                "stability_api_key",
                &self.stability_api_key.as_ref().map(|_| "***"),
            )
            .finish()
    }
}

impl Secrets {
    /// Environment first, then the secrets file. An explicitly named file
    /// must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Self::read_file(path)?,
            None => {
                let default = PathBuf::from(DEFAULT_SECRETS_PATH);
                if default.is_file() {
                    Self::read_file(&default)?
                } else {
                    SecretsFile::default()
                }
            }
        };

        Ok(Self {
            genai_api_key: first_non_empty_env(&["GENAI_API_KEY", "GEMINI_API_KEY", "GOOGLE_API_KEY"])
                .or_else(|| clean(file.genai_api_key)),
            stability_api_key: first_non_empty_env(&["STABILITY_API_KEY"])
                .or_else(|| clean(file.stability_api_key)),
        })
    }

    fn read_file(path: &Path) -> Result<SecretsFile> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read secrets file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse secrets file {}", path.display()))
    }

    /// Key needed by `provider`, `None` for providers that need no secret.
    pub fn key_for_provider(&self, provider: &str) -> Option<&str> {
        match provider {
            "gemini" => self.genai_api_key.as_deref(),
            "stability" => self.stability_api_key.as_deref(),
            _ => None,
        }
    }

    pub fn secret_name_for_provider(provider: &str) -> Option<&'static str> {
        match provider {
            "gemini" => Some("GENAI_API_KEY"),
            "stability" => Some("STABILITY_API_KEY"),
            _ => None,
        }
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
