use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::ACCEPT;
use serde_json::{json, Value};

use crate::util::{color_from_prompt, response_json_or_error};

pub const DEFAULT_STEPS: u32 = 30;
pub const DEFAULT_CFG_SCALE: f32 = 7.0;
pub const DEFAULT_DIMENSION: u32 = 512;
pub const DEFAULT_SAMPLES: u32 = 1;
pub const DEFAULT_SAMPLER: &str = "K_DPMPP_2M";

#[derive(Debug, Clone, PartialEq)]
pub struct ImageGenerateRequest {
    pub model: String,
    pub prompt: String,
    pub seed: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub sampler: String,
}

impl ImageGenerateRequest {
    /// Request with the fixed generation parameters used by image turns.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, seed: u32) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            seed,
            steps: DEFAULT_STEPS,
            cfg_scale: DEFAULT_CFG_SCALE,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            samples: DEFAULT_SAMPLES,
            sampler: DEFAULT_SAMPLER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageArtifact {
    pub bytes: Vec<u8>,
    pub seed: Option<u64>,
}

/// What came back from a generation call that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    Generated(ImageArtifact),
    Filtered,
    NoArtifact,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ImageGenerateRequest) -> Result<ImageOutcome>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Solid colour PNG derived from prompt and seed.
pub struct DryrunImageProvider;

impl ImageProvider for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ImageGenerateRequest) -> Result<ImageOutcome> {
        let (r, g, b) = color_from_prompt(&request.prompt, u64::from(request.seed));
        let mut image = RgbImage::new(request.width.max(1), request.height.max(1));
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("failed to encode dryrun image")?;
        Ok(ImageOutcome::Generated(ImageArtifact {
            bytes,
            seed: Some(u64::from(request.seed)),
        }))
    }
}

pub struct StabilityProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl StabilityProvider {
    pub const DEFAULT_API_BASE: &'static str = "https://api.stability.ai";

    pub fn with_api_base(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|value| !value.trim().is_empty()),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        format!(
            "{}/v1/generation/{}/text-to-image",
            self.api_base,
            model.trim()
        )
    }

    fn build_payload(request: &ImageGenerateRequest) -> Value {
        json!({
            "text_prompts": [{ "text": request.prompt }],
            "seed": request.seed,
            "steps": request.steps,
            "cfg_scale": request.cfg_scale,
            "width": request.width,
            "height": request.height,
            "samples": request.samples,
            "sampler": request.sampler,
        })
    }

    /// Walks artifacts in order; a filtered artifact ends the walk, otherwise
    /// the first artifact carrying image bytes wins.
    fn outcome_from_payload(payload: &Value) -> Result<ImageOutcome> {
        let artifacts = payload
            .get("artifacts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for artifact in artifacts {
            let finish_reason = artifact
                .get("finishReason")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if finish_reason == "CONTENT_FILTERED" {
                return Ok(ImageOutcome::Filtered);
            }
            if finish_reason == "ERROR" {
                continue;
            }
            let Some(image_b64) = artifact
                .get("base64")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
            else {
                continue;
            };
            let bytes = BASE64
                .decode(image_b64.as_bytes())
                .context("Stability image base64 decode failed")?;
            let seed = artifact.get("seed").and_then(Value::as_u64);
            return Ok(ImageOutcome::Generated(ImageArtifact { bytes, seed }));
        }

        Ok(ImageOutcome::NoArtifact)
    }
}

impl ImageProvider for StabilityProvider {
    fn name(&self) -> &str {
        "stability"
    }

    fn generate(&self, request: &ImageGenerateRequest) -> Result<ImageOutcome> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("STABILITY_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(ACCEPT, "application/json")
            .json(&Self::build_payload(request))
            .send()
            .with_context(|| format!("Stability request failed ({endpoint})"))?;
        let payload = response_json_or_error("Stability", response)?;
        Self::outcome_from_payload(&payload)
    }
}
