use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-image adjustment controls.
///
/// `brightness` and `contrast` live in `[-1.0, 1.0]` and scale by
/// `1.0 + value`; zero leaves the image untouched. The toggles are applied
/// in field order after the two sliders.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectSettings {
    pub brightness: f32,
    pub contrast: f32,
    pub grayscale: bool,
    pub black_and_white: bool,
    pub remove_background: bool,
}

impl EffectSettings {
    pub const SLIDER_MIN: f32 = -1.0;
    pub const SLIDER_MAX: f32 = 1.0;

    /// Clamps both sliders into range; non-finite values reset to zero.
    pub fn normalized(self) -> Self {
        Self {
            brightness: clamp_slider(self.brightness),
            contrast: clamp_slider(self.contrast),
            ..self
        }
    }

    pub fn is_identity(&self) -> bool {
        self.brightness == 0.0
            && self.contrast == 0.0
            && !self.grayscale
            && !self.black_and_white
            && !self.remove_background
    }

    /// Applies `/adjust` style updates keyed by field name. Unknown keys and
    /// values of the wrong type are ignored.
    pub fn merged(self, updates: &BTreeMap<String, Value>) -> Self {
        let mut next = self;
        for (key, value) in updates {
            match key.as_str() {
                "brightness" => {
                    if let Some(number) = value.as_f64() {
                        next.brightness = number as f32;
                    }
                }
                "contrast" => {
                    if let Some(number) = value.as_f64() {
                        next.contrast = number as f32;
                    }
                }
                "grayscale" => {
                    if let Some(flag) = value.as_bool() {
                        next.grayscale = flag;
                    }
                }
                "black_and_white" => {
                    if let Some(flag) = value.as_bool() {
                        next.black_and_white = flag;
                    }
                }
                "remove_background" => {
                    if let Some(flag) = value.as_bool() {
                        next.remove_background = flag;
                    }
                }
                _ => {}
            }
        }
        next.normalized()
    }

    /// Short human label, e.g. `brightness +0.20, grayscale`.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.brightness != 0.0 {
            parts.push(format!("brightness {:+.2}", self.brightness));
        }
        if self.contrast != 0.0 {
            parts.push(format!("contrast {:+.2}", self.contrast));
        }
        if self.grayscale {
            parts.push("grayscale".to_string());
        }
        if self.black_and_white {
            parts.push("black & white".to_string());
        }
        if self.remove_background {
            parts.push("background removed".to_string());
        }
        if parts.is_empty() {
            return "original".to_string();
        }
        parts.join(", ")
    }
}

fn clamp_slider(value: f32) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(EffectSettings::SLIDER_MIN, EffectSettings::SLIDER_MAX)
}
