use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    // First entry per capability is the fallback default.
    insert("gemini-2.0-flash-thinking-exp-01-21", "gemini", &["text"]);
    insert("gemini-2.0-flash-exp-image-generation", "gemini", &["text"]);
    insert("gemini-2.0-flash", "gemini", &["text"]);
    insert("dryrun-text-1", "dryrun", &["text"]);
    insert("stable-diffusion-v1-6", "stability", &["image"]);
    insert("stable-diffusion-xl-1024-v1-0", "stability", &["image"]);
    insert("dryrun-image-1", "dryrun", &["image"]);

    map
}
