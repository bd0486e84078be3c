use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::util::response_json_or_error;

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct TextResponse {
    pub text: String,
    pub finish_reason: Option<String>,
}

/// Single-shot text generation. Each call sees only its own prompt.
pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &TextRequest) -> Result<TextResponse>;
}

#[derive(Default)]
pub struct TextProviderRegistry {
    providers: BTreeMap<String, Box<dyn TextProvider>>,
}

impl TextProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: TextProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn TextProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub struct DryrunTextProvider;

impl TextProvider for DryrunTextProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &TextRequest) -> Result<TextResponse> {
        Ok(TextResponse {
            text: format!("Echo: {}", request.prompt.trim()),
            finish_reason: Some("STOP".to_string()),
        })
    }
}

pub struct GeminiTextProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiTextProvider {
    pub const DEFAULT_API_BASE: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn with_api_base(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|value| !value.trim().is_empty()),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(prompt: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
        })
    }

    /// Joins the text parts of the first candidate, skipping thought parts.
    fn extract_text(response_payload: &Value) -> Result<(String, Option<String>)> {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let Some(candidate) = candidates.first() else {
            let reason = response_payload
                .get("promptFeedback")
                .and_then(|feedback| feedback.get("blockReason"))
                .and_then(Value::as_str);
            match reason {
                Some(reason) => bail!("Gemini blocked the prompt ({reason})"),
                None => bail!("Gemini response contained no candidates"),
            }
        };

        let finish_reason = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let text: String = parts
            .iter()
            .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();

        if text.is_empty() {
            match finish_reason.as_deref() {
                Some(reason) => bail!("Gemini returned no text (finish reason {reason})"),
                None => bail!("Gemini returned no text"),
            }
        }
        Ok((text, finish_reason))
    }
}

impl TextProvider for GeminiTextProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &TextRequest) -> Result<TextResponse> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("GENAI_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&Self::build_payload(&request.prompt))
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let payload = response_json_or_error("Gemini", response)?;
        let (text, finish_reason) = Self::extract_text(&payload)?;
        Ok(TextResponse {
            text,
            finish_reason,
        })
    }
}
