use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use vesper_contracts::effects::EffectSettings;

use crate::util::truncate_text;

/// Side length generated images are stored at.
pub const STORED_IMAGE_DIMENSION: u32 = 384;

const BW_THRESHOLD: u8 = 128;

/// Segmentation collaborator used for the last effect step.
pub trait BackgroundRemover: Send + Sync {
    fn name(&self) -> &str;
    fn remove(&self, image: &DynamicImage) -> Result<DynamicImage>;
}

/// Talks to a rembg style HTTP server (`POST` multipart `file`, PNG back).
pub struct RembgRemover {
    endpoint: String,
    http: HttpClient,
}

impl RembgRemover {
    pub const DEFAULT_ENDPOINT: &'static str = "http://127.0.0.1:7000/api/remove";

    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: HttpClient::new(),
        }
    }
}

impl BackgroundRemover for RembgRemover {
    fn name(&self) -> &str {
        "rembg"
    }

    fn remove(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let png = encode_png(image)?;
        let part = MultipartPart::bytes(png)
            .file_name("image.png")
            .mime_str("image/png")
            .context("invalid background removal mime type")?;
        let form = MultipartForm::new().part("file", part);
        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .with_context(|| format!("background removal request failed ({})", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "background removal failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        let bytes = response
            .bytes()
            .context("failed reading background removal bytes")?;
        image::load_from_memory(&bytes).context("background removal returned an unreadable image")
    }
}

/// Used when no segmentation service is configured.
pub struct UnavailableRemover;

impl BackgroundRemover for UnavailableRemover {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn remove(&self, _image: &DynamicImage) -> Result<DynamicImage> {
        bail!("background removal is not configured")
    }
}

#[derive(Debug, Clone)]
pub struct EffectsOutput {
    pub image: DynamicImage,
    pub warnings: Vec<String>,
}

/// Applies brightness, contrast, grayscale, black-and-white and background
/// removal in that order. A failed background removal keeps the image from
/// the earlier steps and adds a warning.
pub fn apply_effects(
    source: &DynamicImage,
    settings: &EffectSettings,
    remover: &dyn BackgroundRemover,
) -> EffectsOutput {
    let settings = settings.normalized();
    if settings.is_identity() {
        return EffectsOutput {
            image: source.clone(),
            warnings: Vec::new(),
        };
    }
    let mut image = apply_pixel_effects(source, &settings);
    let mut warnings = Vec::new();

    if settings.remove_background {
        match remover.remove(&image) {
            Ok(cutout) => image = cutout,
            Err(err) => warnings.push(format!("Background removal failed: {err:#}")),
        }
    }

    EffectsOutput { image, warnings }
}

/// The deterministic part of the pipeline (everything but background removal).
pub fn apply_pixel_effects(source: &DynamicImage, settings: &EffectSettings) -> DynamicImage {
    let mut image = source.clone();

    if settings.brightness != 0.0 {
        let factor = 1.0 + settings.brightness;
        image = map_color_channels(&image, |value| scale_channel(value, factor, 0.0));
    }

    if settings.contrast != 0.0 {
        let factor = 1.0 + settings.contrast;
        let mean = f32::from(mean_luma(&image));
        image = map_color_channels(&image, |value| scale_channel(value, factor, mean));
    }

    if settings.grayscale || settings.black_and_white {
        image = DynamicImage::ImageLuma8(luma_plane(&image));
    }

    if settings.black_and_white {
        let mut binary = image.to_luma8();
        for pixel in binary.pixels_mut() {
            pixel[0] = if pixel[0] >= BW_THRESHOLD { 255 } else { 0 };
        }
        image = DynamicImage::ImageLuma8(binary);
    }

    image
}

/// `center + factor * (value - center)`, rounded and clamped to a byte.
fn scale_channel(value: u8, factor: f32, center: f32) -> u8 {
    let scaled = center + factor * (f32::from(value) - center);
    scaled.round().clamp(0.0, 255.0) as u8
}

fn map_color_channels(image: &DynamicImage, f: impl Fn(u8) -> u8) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(buffer) => {
            let mut out = buffer.clone();
            for pixel in out.pixels_mut() {
                pixel[0] = f(pixel[0]);
            }
            DynamicImage::ImageLuma8(out)
        }
        DynamicImage::ImageLumaA8(buffer) => {
            let mut out = buffer.clone();
            for pixel in out.pixels_mut() {
                pixel[0] = f(pixel[0]);
            }
            DynamicImage::ImageLumaA8(out)
        }
        DynamicImage::ImageRgb8(buffer) => {
            let mut out = buffer.clone();
            for pixel in out.pixels_mut() {
                for channel in 0..3 {
                    pixel[channel] = f(pixel[channel]);
                }
            }
            DynamicImage::ImageRgb8(out)
        }
        other => {
            let mut out = other.to_rgba8();
            for pixel in out.pixels_mut() {
                for channel in 0..3 {
                    pixel[channel] = f(pixel[channel]);
                }
            }
            DynamicImage::ImageRgba8(out)
        }
    }
}

/// ITU-R 601 luma, `(299 R + 587 G + 114 B) / 1000` rounded.
fn luma_of(r: u8, g: u8, b: u8) -> u8 {
    let weighted = 299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b);
    ((weighted + 500) / 1000) as u8
}

fn luma_plane(image: &DynamicImage) -> GrayImage {
    match image {
        DynamicImage::ImageLuma8(buffer) => buffer.clone(),
        DynamicImage::ImageLumaA8(buffer) => {
            GrayImage::from_fn(buffer.width(), buffer.height(), |x, y| {
                Luma([buffer.get_pixel(x, y)[0]])
            })
        }
        other => {
            let rgb = other.to_rgb8();
            GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
                let pixel = rgb.get_pixel(x, y);
                Luma([luma_of(pixel[0], pixel[1], pixel[2])])
            })
        }
    }
}

fn mean_luma(image: &DynamicImage) -> u8 {
    let plane = luma_plane(image);
    let count = u64::from(plane.width()) * u64::from(plane.height());
    if count == 0 {
        return 0;
    }
    let total: u64 = plane.pixels().map(|pixel| u64::from(pixel[0])).sum();
    ((total as f64 / count as f64) + 0.5).floor().min(255.0) as u8
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("failed to decode generated image")
}

pub fn resize_for_storage(image: &DynamicImage) -> DynamicImage {
    image.resize_exact(
        STORED_IMAGE_DIMENSION,
        STORED_IMAGE_DIMENSION,
        FilterType::CatmullRom,
    )
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(bytes)
}
