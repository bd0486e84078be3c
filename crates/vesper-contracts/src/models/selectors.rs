use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.registry.ensure(requested_value, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let candidates = self.registry.by_capability(capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::{ModelRegistry, ModelSelector, ModelSpec};

    #[test]
    fn select_returns_requested_model_when_capable() {
        let selector = ModelSelector::new(None);
        let selection = selector
            .select(Some("dryrun-text-1"), "text")
            .expect("selection");
        assert_eq!(selection.model.name, "dryrun-text-1");
        assert_eq!(selection.fallback_reason, None);
    }

    #[test]
    fn select_falls_back_with_reason() {
        let selector = ModelSelector::new(None);
        let selection = selector
            .select(Some("dryrun-image-1"), "text")
            .expect("selection");
        assert_eq!(selection.model.name, "gemini-2.0-flash-thinking-exp-01-21");
        assert_eq!(selection.requested.as_deref(), Some("dryrun-image-1"));
        assert!(selection
            .fallback_reason
            .as_deref()
            .unwrap_or_default()
            .contains("unavailable"));

        let blank = selector.select(Some("  "), "image").expect("selection");
        assert_eq!(blank.model.name, "stable-diffusion-v1-6");
        assert_eq!(blank.requested, None);
    }

    #[test]
    fn select_errors_when_capability_missing() {
        let mut models = IndexMap::new();
        models.insert(
            "only-text".to_string(),
            ModelSpec {
                name: "only-text".to_string(),
                provider: "dryrun".to_string(),
                capabilities: vec!["text".to_string()],
            },
        );
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(models))));
        assert!(selector.select(None, "image").is_err());
    }
}
