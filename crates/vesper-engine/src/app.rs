use std::fmt;

use anyhow::{anyhow, bail, Result};
use image::DynamicImage;
use serde::Serialize;
use serde_json::{json, Value};
use vesper_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use vesper_contracts::effects::EffectSettings;
use vesper_contracts::events::EventWriter;
use vesper_contracts::models::ModelSelector;
use vesper_contracts::render::{
    Notice, PresentationState, RenderModel, RenderedImage, RenderedMessage, Variant,
};

use crate::config::{AppConfig, BASIC_TEXT_MODEL, DEFAULT_IMAGE_MODEL, STUDIO_TEXT_MODEL};
use crate::effects::{
    apply_effects, decode_image, encode_png, resize_for_storage, BackgroundRemover, RembgRemover,
    UnavailableRemover,
};
use crate::imagegen::{
    DryrunImageProvider, ImageGenerateRequest, ImageOutcome, ImageProvider, ImageProviderRegistry,
    StabilityProvider,
};
use crate::secrets::{Secrets, DEFAULT_SECRETS_PATH};
use crate::session::{Message, Session, SessionSlot, SessionStore, SharedSession};
use crate::text::{DryrunTextProvider, GeminiTextProvider, TextProvider, TextProviderRegistry, TextRequest};
use crate::util::{error_chain_text, map_object, timestamp_millis, unix_seconds};

pub const FALLBACK_REPLY: &str = "Sorry, I couldn't process your request.";
pub const EMPTY_IMAGE_PROMPT: &str = "Please provide a prompt after #image:";
pub const FILTERED_WARNING: &str = "Your request activated the API's safety filters and could not be processed. Please modify the prompt and try again.";
pub const NO_ARTIFACT_WARNING: &str = "No image was returned for this prompt.";
pub const IMAGES_DISABLED: &str = "Image features are not enabled in this mode.";

const ERROR_TEXT_MAX_CHARS: usize = 512;

/// One user action against a session.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    SubmitText(String),
    Clear,
    UpdateEffects {
        key: String,
        settings: EffectSettings,
    },
    ResetEffects {
        key: String,
    },
    SelectTextModel(String),
    SelectImageModel(String),
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadRequest {
    pub key: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatch {
    pub render: RenderModel,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub quit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadRequest>,
}

#[derive(Debug, Clone)]
pub struct ImageExport {
    pub key: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSession(pub String);

impl fmt::Display for UnknownSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown session '{}'", self.0)
    }
}

impl std::error::Error for UnknownSession {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownImage(pub String);

impl fmt::Display for UnknownImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown image '{}'", self.0)
    }
}

impl std::error::Error for UnknownImage {}

#[derive(Debug, Default)]
struct SubmitOutcome {
    quit: bool,
    download: Option<DownloadRequest>,
}

enum ImageTurn {
    Ready(DynamicImage, Option<u64>),
    Filtered,
    NoArtifact,
}

/// Event dispatcher over a store of sessions. Every handler runs to
/// completion on the calling thread and answers with a full render model.
pub struct ChatApp {
    variant: Variant,
    default_text_model: String,
    default_image_model: Option<String>,
    selector: ModelSelector,
    text_providers: TextProviderRegistry,
    image_providers: ImageProviderRegistry,
    remover: Box<dyn BackgroundRemover>,
    sessions: SessionStore,
    events: EventWriter,
    startup_notices: Vec<Notice>,
}

impl ChatApp {
    /// Dry-run providers only, default models for `variant`.
    pub fn new(variant: Variant, events: EventWriter) -> Self {
        let mut text_providers = TextProviderRegistry::new();
        text_providers.register(DryrunTextProvider);
        let mut image_providers = ImageProviderRegistry::new();
        image_providers.register(DryrunImageProvider);
        let default_text_model = match variant {
            Variant::Basic => BASIC_TEXT_MODEL,
            Variant::Studio => STUDIO_TEXT_MODEL,
        };

        Self {
            variant,
            default_text_model: default_text_model.to_string(),
            default_image_model: variant
                .supports_images()
                .then(|| DEFAULT_IMAGE_MODEL.to_string()),
            selector: ModelSelector::new(None),
            text_providers,
            image_providers,
            remover: Box::new(UnavailableRemover),
            sessions: SessionStore::new(),
            events,
            startup_notices: Vec::new(),
        }
    }

    /// Real providers wired from configuration. A missing key for a selected
    /// model is a startup error.
    pub fn from_config(config: &AppConfig, secrets: &Secrets, events: EventWriter) -> Result<Self> {
        let mut app = Self::new(config.variant, events)
            .with_text_provider(GeminiTextProvider::with_api_base(
                config.gemini_api_base.clone(),
                secrets.genai_api_key.clone(),
            ))
            .with_image_provider(StabilityProvider::with_api_base(
                config.stability_api_base.clone(),
                secrets.stability_api_key.clone(),
            ))
            .with_models(&config.text_model, &config.image_model)?;
        if let Some(endpoint) = config.rembg_endpoint.as_deref() {
            app = app.with_remover(RembgRemover::new(endpoint));
        }
        app.require_secrets(secrets)?;

        app.events.emit(
            "app_started",
            map_object(json!({
                "variant": app.variant.as_str(),
                "text_model": app.default_text_model,
                "image_model": app.default_image_model,
                "text_providers": app.text_providers.names(),
                "image_providers": app.image_providers.names(),
                "background_remover": app.remover.name(),
            })),
        )?;
        Ok(app)
    }

    pub fn with_text_provider<P: TextProvider + 'static>(mut self, provider: P) -> Self {
        self.text_providers.register(provider);
        self
    }

    pub fn with_image_provider<P: ImageProvider + 'static>(mut self, provider: P) -> Self {
        self.image_providers.register(provider);
        self
    }

    pub fn with_remover<R: BackgroundRemover + 'static>(mut self, remover: R) -> Self {
        self.remover = Box::new(remover);
        self
    }

    /// Picks the default models for new sessions, falling back to the first
    /// capable model with a startup notice when a name is unknown.
    pub fn with_models(mut self, text_model: &str, image_model: &str) -> Result<Self> {
        let text = self
            .selector
            .select(Some(text_model), "text")
            .map_err(|message| anyhow!(message))?;
        if let Some(reason) = text.fallback_reason {
            self.startup_notices.push(Notice::warning(reason));
        }
        self.default_text_model = text.model.name;

        if self.variant.supports_images() {
            let image = self
                .selector
                .select(Some(image_model), "image")
                .map_err(|message| anyhow!(message))?;
            if let Some(reason) = image.fallback_reason {
                self.startup_notices.push(Notice::warning(reason));
            }
            self.default_image_model = Some(image.model.name);
        }
        Ok(self)
    }

    fn require_secrets(&self, secrets: &Secrets) -> Result<()> {
        let models = std::iter::once(self.default_text_model.as_str())
            .chain(self.default_image_model.as_deref());
        for model in models {
            let Some(spec) = self.selector.registry.get(model) else {
                continue;
            };
            let Some(secret) = Secrets::secret_name_for_provider(&spec.provider) else {
                continue;
            };
            if secrets.key_for_provider(&spec.provider).is_none() {
                bail!(
                    "{secret} is not set (needed by {model}); export it or add it to {DEFAULT_SECRETS_PATH}"
                );
            }
        }
        Ok(())
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn default_text_model(&self) -> &str {
        &self.default_text_model
    }

    pub fn default_image_model(&self) -> Option<&str> {
        self.default_image_model.as_deref()
    }

    pub fn startup_notices(&self) -> &[Notice] {
        &self.startup_notices
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn create_session(&self) -> Result<String> {
        let id = self.new_session()?;
        self.log_session_created(&id)?;
        Ok(id)
    }

    /// New session rendered with the startup notices attached. The session
    /// is usable even when the event log cannot be written; that failure
    /// becomes a notice.
    pub fn open_session(&self) -> Result<RenderModel> {
        let id = self.new_session()?;
        let mut notices = self.startup_notices.clone();
        if let Err(err) = self.log_session_created(&id) {
            notices.push(failure_notice(&err));
        }
        let slot = self.session(&id)?;
        let session = slot.lock()?;
        Ok(self.render_session(&session, PresentationState::Idle, notices))
    }

    fn new_session(&self) -> Result<String> {
        self.sessions.create(
            self.default_text_model.clone(),
            self.default_image_model.clone(),
        )
    }

    fn log_session_created(&self, id: &str) -> Result<()> {
        self.events.emit(
            "session_created",
            map_object(json!({
                "session_id": id,
                "text_model": self.default_text_model,
                "image_model": self.default_image_model,
            })),
        )?;
        Ok(())
    }

    pub fn destroy_session(&self, id: &str) -> Result<bool> {
        let removed = self.sessions.destroy(id)?;
        if removed {
            self.events.emit(
                "session_destroyed",
                map_object(json!({ "session_id": id })),
            )?;
        }
        Ok(removed)
    }

    fn session(&self, id: &str) -> Result<SharedSession> {
        self.sessions
            .get(id)?
            .ok_or_else(|| anyhow::Error::new(UnknownSession(id.to_string())))
    }

    /// Current render. While a turn runs this is the render the turn
    /// published when it started, so callers never wait on a provider.
    pub fn render(&self, id: &str) -> Result<RenderModel> {
        let slot = self.session(id)?;
        if let Some(in_flight) = slot.in_flight()? {
            return Ok(in_flight);
        }
        let session = slot.lock()?;
        Ok(self.render_session(&session, PresentationState::Idle, Vec::new()))
    }

    /// Runs one event to completion. Unknown sessions, and effect events for
    /// unknown image keys, are typed errors; failures after the session
    /// changed come back as error notices on the new render.
    pub fn dispatch(&self, id: &str, event: UiEvent) -> Result<Dispatch> {
        let slot = self.session(id)?;
        let mut session = slot.lock()?;
        let mut notices = Vec::new();
        let mut outcome = SubmitOutcome::default();

        let handled = match event {
            UiEvent::SubmitText(text) => self
                .submit_text(&slot, &mut session, &text, &mut notices)
                .map(|submitted| outcome = submitted),
            UiEvent::Clear => self.clear(&mut session),
            UiEvent::UpdateEffects { key, settings } => {
                require_image(&session, &key)?;
                self.update_effects(&mut session, &key, settings, &mut notices)
            }
            UiEvent::ResetEffects { key } => {
                require_image(&session, &key)?;
                self.update_effects(&mut session, &key, EffectSettings::default(), &mut notices)
            }
            UiEvent::SelectTextModel(model) => {
                self.select_model(&mut session, "text", &model, &mut notices)
            }
            UiEvent::SelectImageModel(model) => {
                self.select_model(&mut session, "image", &model, &mut notices)
            }
            UiEvent::Refresh => Ok(()),
        };
        if let Err(err) = handled {
            notices.push(failure_notice(&err));
        }

        Ok(Dispatch {
            render: self.render_session(&session, PresentationState::Idle, notices),
            quit: outcome.quit,
            download: outcome.download,
        })
    }

    fn submit_text(
        &self,
        slot: &SessionSlot,
        session: &mut Session,
        text: &str,
        notices: &mut Vec<Notice>,
    ) -> Result<SubmitOutcome> {
        let intent = parse_intent(text);
        let mut outcome = SubmitOutcome::default();
        // Without images the image commands are plain text for the model.
        let action = match intent.action.as_str() {
            "generate_image" | "set_image_model" | "adjust" | "reset_effects" | "download"
                if !self.variant.supports_images() =>
            {
                "chat"
            }
            action => action,
        };

        match action {
            "noop" => {}
            "chat" => self.respond(slot, session, text, |session| {
                self.chat_turn(session, text, notices)
            })?,
            "generate_image" => {
                let prompt = intent.prompt.clone().unwrap_or_default();
                if prompt.is_empty() {
                    notices.push(Notice::error(EMPTY_IMAGE_PROMPT));
                    self.emit(session, "image_rejected", json!({ "reason": "empty_prompt" }))?;
                    return Ok(outcome);
                }
                self.respond(slot, session, text, |session| {
                    self.image_turn(session, &prompt, notices)
                })?
            }
            "clear" => self.clear(session)?,
            "help" => notices.push(Notice::info(format!(
                "Commands: {}",
                CHAT_HELP_COMMANDS.join(" ")
            ))),
            "quit" => outcome.quit = true,
            "set_text_model" => {
                let model = intent_string(&intent, "model");
                self.select_model(session, "text", &model, notices)?;
            }
            "set_image_model" => {
                let model = intent_string(&intent, "model");
                self.select_model(session, "image", &model, notices)?;
            }
            "adjust" => {
                let key = intent_string(&intent, "key");
                let invalid: Vec<String> = intent
                    .command_args
                    .get("invalid")
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if !invalid.is_empty() {
                    notices.push(Notice::warning(format!(
                        "Ignored adjustments: {}",
                        invalid.join(" ")
                    )));
                }
                let settings = session.settings_for(&key).merged(&intent.settings_update);
                self.update_effects(session, &key, settings, notices)?;
            }
            "reset_effects" => {
                let key = intent_string(&intent, "key");
                self.update_effects(session, &key, EffectSettings::default(), notices)?;
            }
            "download" => {
                let key = intent_string(&intent, "key");
                if session.image(&key).is_none() {
                    notices.push(Notice::error(format!("Unknown image key '{key}'.")));
                } else {
                    outcome.download = Some(DownloadRequest {
                        file_name: export_file_name(&key),
                        path: intent
                            .command_args
                            .get("path")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        key,
                    });
                }
            }
            other => notices.push(Notice::warning(format!("Unsupported action '{other}'."))),
        }

        Ok(outcome)
    }

    /// Appends the user line and publishes the responding render, runs
    /// `turn`, then returns to idle whatever the turn returned.
    fn respond<F>(
        &self,
        slot: &SessionSlot,
        session: &mut Session,
        text: &str,
        turn: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        session.push(Message::user(text));
        slot.begin_turn(self.render_session(session, PresentationState::Responding, Vec::new()))?;
        let result = turn(session);
        let ended = slot.end_turn();
        result.and(ended)
    }

    fn text_provider(&self, model: &str) -> Result<&dyn TextProvider> {
        let spec = self
            .selector
            .registry
            .ensure(model, "text")
            .ok_or_else(|| anyhow!("unknown text model '{model}'"))?;
        self.text_providers
            .get(&spec.provider)
            .ok_or_else(|| anyhow!("no text provider registered for '{}'", spec.provider))
    }

    fn image_provider(&self, model: &str) -> Result<&dyn ImageProvider> {
        let spec = self
            .selector
            .registry
            .ensure(model, "image")
            .ok_or_else(|| anyhow!("unknown image model '{model}'"))?;
        self.image_providers
            .get(&spec.provider)
            .ok_or_else(|| anyhow!("no image provider registered for '{}'", spec.provider))
    }

    fn chat_turn(&self, session: &mut Session, text: &str, notices: &mut Vec<Notice>) -> Result<()> {
        let model = session.text_model.clone();
        let request = TextRequest {
            model: model.clone(),
            prompt: text.to_string(),
        };
        let result = self
            .text_provider(&model)
            .and_then(|provider| provider.generate(&request));

        match result {
            Ok(response) => {
                let reply_chars = response.text.chars().count();
                session.push(Message::assistant(response.text));
                self.emit(
                    session,
                    "chat_turn",
                    json!({
                        "model": model,
                        "prompt_chars": text.chars().count(),
                        "reply_chars": reply_chars,
                        "finish_reason": response.finish_reason,
                    }),
                )
            }
            Err(err) => {
                let message = error_chain_text(&err, ERROR_TEXT_MAX_CHARS);
                session.push(Message::assistant(FALLBACK_REPLY));
                notices.push(Notice::error(format!("Error: {message}")));
                self.emit(
                    session,
                    "chat_failed",
                    json!({ "model": model, "error": message }),
                )
            }
        }
    }

    fn image_turn(&self, session: &mut Session, prompt: &str, notices: &mut Vec<Notice>) -> Result<()> {
        let model = session
            .image_model
            .clone()
            .or_else(|| self.default_image_model.clone())
            .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());
        let seed = (unix_seconds() % u64::from(u32::MAX)) as u32;
        let request = ImageGenerateRequest::new(model.clone(), prompt, seed);

        let result = self
            .image_provider(&model)
            .and_then(|provider| provider.generate(&request))
            .and_then(|outcome| match outcome {
                ImageOutcome::Generated(artifact) => {
                    let decoded = decode_image(&artifact.bytes)?;
                    Ok(ImageTurn::Ready(resize_for_storage(&decoded), artifact.seed))
                }
                ImageOutcome::Filtered => Ok(ImageTurn::Filtered),
                ImageOutcome::NoArtifact => Ok(ImageTurn::NoArtifact),
            });

        match result {
            Ok(ImageTurn::Ready(image, artifact_seed)) => {
                let key = session.push_image_reply(
                    format!("Here is your image for: {prompt}"),
                    prompt,
                    image,
                    timestamp_millis(),
                );
                self.emit(
                    session,
                    "image_generated",
                    json!({
                        "key": key,
                        "model": model,
                        "seed": artifact_seed.unwrap_or(u64::from(seed)),
                    }),
                )
            }
            Ok(ImageTurn::Filtered) => {
                notices.push(Notice::warning(FILTERED_WARNING));
                session.push(Message::assistant(FILTERED_WARNING));
                self.emit(session, "image_filtered", json!({ "model": model }))
            }
            Ok(ImageTurn::NoArtifact) => {
                notices.push(Notice::warning(NO_ARTIFACT_WARNING));
                session.push(Message::assistant(NO_ARTIFACT_WARNING));
                self.emit(session, "image_missing", json!({ "model": model }))
            }
            Err(err) => {
                let message = error_chain_text(&err, ERROR_TEXT_MAX_CHARS);
                let text = format!("Error generating image: {message}");
                notices.push(Notice::error(text.clone()));
                session.push(Message::assistant(text));
                self.emit(
                    session,
                    "image_failed",
                    json!({ "model": model, "error": message }),
                )
            }
        }
    }

    fn clear(&self, session: &mut Session) -> Result<()> {
        let messages = session.messages().len();
        let images = session.image_count();
        session.clear();
        self.emit(
            session,
            "session_cleared",
            json!({ "messages": messages, "images": images }),
        )
    }

    fn update_effects(
        &self,
        session: &mut Session,
        key: &str,
        settings: EffectSettings,
        notices: &mut Vec<Notice>,
    ) -> Result<()> {
        if session.set_settings(key, settings).is_err() {
            notices.push(Notice::error(format!("Unknown image key '{key}'.")));
            return Ok(());
        }
        let applied = session.settings_for(key);
        self.emit(
            session,
            "effects_updated",
            json!({ "key": key, "settings": applied }),
        )
    }

    fn select_model(
        &self,
        session: &mut Session,
        capability: &str,
        requested: &str,
        notices: &mut Vec<Notice>,
    ) -> Result<()> {
        if capability == "image" && !self.variant.supports_images() {
            notices.push(Notice::warning(IMAGES_DISABLED));
            return Ok(());
        }
        let selection = match self.selector.select(Some(requested), capability) {
            Ok(selection) => selection,
            Err(message) => {
                notices.push(Notice::error(message));
                return Ok(());
            }
        };
        if let Some(reason) = selection.fallback_reason.as_deref() {
            notices.push(Notice::warning(reason));
        }
        let name = selection.model.name.clone();
        match capability {
            "image" => session.image_model = Some(name.clone()),
            _ => session.text_model = name.clone(),
        }
        let label = if capability == "image" { "Image" } else { "Text" };
        notices.push(Notice::info(format!("{label} model set to {name}")));
        self.emit(
            session,
            "model_selected",
            json!({
                "capability": capability,
                "model": name,
                "requested": selection.requested,
            }),
        )
    }

    /// PNG of the image with its current widget settings applied.
    pub fn export_png(&self, id: &str, key: &str) -> Result<ImageExport> {
        let slot = self.session(id)?;
        let mut session = slot.lock()?;
        let settings = session.settings_for(key);

        let generated = session
            .image_mut(key)
            .ok_or_else(|| anyhow::Error::new(UnknownImage(key.to_string())))?;
        let (image, warnings) = match generated.preview.as_ref() {
            Some((cached, image)) if *cached == settings => (image.clone(), Vec::new()),
            _ => {
                let output = apply_effects(&generated.image, &settings, self.remover.as_ref());
                if output.warnings.is_empty() {
                    generated.preview = Some((settings, output.image.clone()));
                }
                (output.image, output.warnings)
            }
        };
        let bytes = encode_png(&image)?;

        for warning in &warnings {
            self.emit(
                &session,
                "background_removal_failed",
                json!({ "key": key, "error": warning }),
            )?;
        }
        self.emit(
            &session,
            "image_exported",
            json!({ "key": key, "bytes": bytes.len(), "settings": settings }),
        )?;

        Ok(ImageExport {
            key: key.to_string(),
            file_name: export_file_name(key),
            bytes,
            warnings,
        })
    }

    fn render_session(
        &self,
        session: &Session,
        state: PresentationState,
        notices: Vec<Notice>,
    ) -> RenderModel {
        let messages = session
            .messages()
            .iter()
            .map(|message| RenderedMessage {
                role: message.role,
                content: message.content.clone(),
                timestamp: message.timestamp,
                image: message
                    .image
                    .as_deref()
                    .and_then(|key| session.image(key))
                    .map(|generated| RenderedImage {
                        key: generated.key.clone(),
                        width: generated.image.width(),
                        height: generated.image.height(),
                        prompt: generated.prompt.clone(),
                        settings: session.settings_for(&generated.key),
                    }),
            })
            .collect();

        RenderModel {
            session_id: session.id().to_string(),
            title: self.variant.title().to_string(),
            variant: self.variant,
            state,
            text_model: session.text_model.clone(),
            image_model: session.image_model.clone(),
            messages,
            notices,
        }
    }

    fn emit(&self, session: &Session, event_type: &str, payload: Value) -> Result<()> {
        let mut payload = map_object(payload);
        payload.insert(
            "session_id".to_string(),
            Value::String(session.id().to_string()),
        );
        self.events.emit(event_type, payload)?;
        Ok(())
    }
}

fn require_image(session: &Session, key: &str) -> Result<()> {
    match session.image(key) {
        Some(_) => Ok(()),
        None => Err(anyhow::Error::new(UnknownImage(key.to_string()))),
    }
}

fn failure_notice(err: &anyhow::Error) -> Notice {
    Notice::error(format!(
        "Error: {}",
        error_chain_text(err, ERROR_TEXT_MAX_CHARS)
    ))
}

fn intent_string(intent: &Intent, key: &str) -> String {
    intent
        .command_args
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

pub fn export_file_name(key: &str) -> String {
    format!("generated_image_{key}.png")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;

    use anyhow::{bail, Result};
    use image::ColorType;
    use serde_json::Value;
    use vesper_contracts::effects::EffectSettings;
    use vesper_contracts::events::EventWriter;
    use vesper_contracts::render::{NoticeLevel, PresentationState, Role, Variant};

    use super::{
        ChatApp, UiEvent, UnknownImage, UnknownSession, EMPTY_IMAGE_PROMPT, FALLBACK_REPLY,
        FILTERED_WARNING, NO_ARTIFACT_WARNING,
    };
    use crate::config::AppConfig;
    use crate::effects::STORED_IMAGE_DIMENSION;
    use crate::imagegen::{ImageGenerateRequest, ImageOutcome, ImageProvider};
    use crate::secrets::Secrets;
    use crate::text::{TextProvider, TextRequest, TextResponse};

    struct FailingText;

    impl TextProvider for FailingText {
        fn name(&self) -> &str {
            "dryrun"
        }

        fn generate(&self, _request: &TextRequest) -> Result<TextResponse> {
            bail!("quota exceeded")
        }
    }

    /// Signals when a turn reaches the provider, then waits to be released.
    struct GatedText {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl TextProvider for GatedText {
        fn name(&self) -> &str {
            "dryrun"
        }

        fn generate(&self, request: &TextRequest) -> Result<TextResponse> {
            self.entered.lock().expect("entered lock").send(())?;
            self.release.lock().expect("release lock").recv()?;
            Ok(TextResponse {
                text: format!("Echo: {}", request.prompt),
                finish_reason: None,
            })
        }
    }

    struct ScriptedImage {
        calls: Arc<AtomicUsize>,
        filtered: bool,
    }

    impl ImageProvider for ScriptedImage {
        fn name(&self) -> &str {
            "dryrun"
        }

        fn generate(&self, _request: &ImageGenerateRequest) -> Result<ImageOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.filtered {
                Ok(ImageOutcome::Filtered)
            } else {
                Ok(ImageOutcome::NoArtifact)
            }
        }
    }

    fn studio() -> Result<ChatApp> {
        ChatApp::new(Variant::Studio, EventWriter::discard())
            .with_models("dryrun-text-1", "dryrun-image-1")
    }

    fn generate_image(app: &ChatApp, id: &str, prompt: &str) -> Result<String> {
        let dispatch = app.dispatch(id, UiEvent::SubmitText(format!("#image: {prompt}")))?;
        let key = dispatch
            .render
            .messages
            .last()
            .and_then(|message| message.image.as_ref())
            .map(|image| image.key.clone());
        match key {
            Some(key) => Ok(key),
            None => bail!("no image in render"),
        }
    }

    #[test]
    fn hello_appends_user_and_assistant_messages() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;
        let dispatch = app.dispatch(&id, UiEvent::SubmitText("Hello".to_string()))?;

        let messages = &dispatch.render.messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Echo: Hello");
        assert_eq!(dispatch.render.state, PresentationState::Idle);
        assert!(dispatch.render.notices.is_empty());
        assert!(!dispatch.quit);
        Ok(())
    }

    #[test]
    fn text_failure_falls_back_with_error_notice() -> Result<()> {
        let app = studio()?.with_text_provider(FailingText);
        let id = app.create_session()?;
        let dispatch = app.dispatch(&id, UiEvent::SubmitText("Hello".to_string()))?;

        let messages = &dispatch.render.messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, FALLBACK_REPLY);
        assert_eq!(dispatch.render.notices.len(), 1);
        assert_eq!(dispatch.render.notices[0].level, NoticeLevel::Error);
        assert!(dispatch.render.notices[0].text.starts_with("Error: "));
        assert!(dispatch.render.notices[0].text.contains("quota exceeded"));
        assert_eq!(dispatch.render.state, PresentationState::Idle);
        Ok(())
    }

    #[test]
    fn blank_input_is_ignored() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;
        let dispatch = app.dispatch(&id, UiEvent::SubmitText("   ".to_string()))?;
        assert!(dispatch.render.messages.is_empty());
        assert!(dispatch.render.notices.is_empty());
        Ok(())
    }

    #[test]
    fn empty_image_prompt_is_rejected_without_provider_call() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = studio()?.with_image_provider(ScriptedImage {
            calls: Arc::clone(&calls),
            filtered: true,
        });
        let id = app.create_session()?;
        let dispatch = app.dispatch(&id, UiEvent::SubmitText("#image:   ".to_string()))?;

        assert!(dispatch.render.messages.is_empty());
        assert_eq!(dispatch.render.notices.len(), 1);
        assert_eq!(dispatch.render.notices[0].text, EMPTY_IMAGE_PROMPT);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn image_prompt_stores_resized_image() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;
        let dispatch = app.dispatch(&id, UiEvent::SubmitText("#IMAGE: a red fox".to_string()))?;

        let messages = &dispatch.render.messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "#IMAGE: a red fox");
        let image = messages[1].image.as_ref().expect("assistant image");
        assert_eq!(image.width, STORED_IMAGE_DIMENSION);
        assert_eq!(image.height, STORED_IMAGE_DIMENSION);
        assert_eq!(image.prompt, "a red fox");
        assert_eq!(image.settings, EffectSettings::default());
        assert_eq!(messages[1].timestamp.map(|stamp| stamp.to_string()), Some(image.key.clone()));
        assert_eq!(dispatch.render.state, PresentationState::Idle);
        Ok(())
    }

    #[test]
    fn filtered_and_missing_images_leave_text_replies() -> Result<()> {
        for (filtered, expected) in [(true, FILTERED_WARNING), (false, NO_ARTIFACT_WARNING)] {
            let calls = Arc::new(AtomicUsize::new(0));
            let app = studio()?.with_image_provider(ScriptedImage {
                calls: Arc::clone(&calls),
                filtered,
            });
            let id = app.create_session()?;
            let dispatch = app.dispatch(&id, UiEvent::SubmitText("#image: castle".to_string()))?;

            let messages = &dispatch.render.messages;
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[1].content, expected);
            assert!(messages[1].image.is_none());
            assert_eq!(dispatch.render.notices[0].level, NoticeLevel::Warning);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
        Ok(())
    }

    #[test]
    fn clear_empties_history_and_images() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;
        for idx in 0..3 {
            app.dispatch(&id, UiEvent::SubmitText(format!("message {idx}")))?;
        }
        let key = generate_image(&app, &id, "owl")?;

        let cleared = app.dispatch(&id, UiEvent::SubmitText("/clear".to_string()))?;
        assert!(cleared.render.messages.is_empty());
        let missing = app.export_png(&id, &key);
        assert!(missing.is_err());

        app.dispatch(&id, UiEvent::SubmitText("again".to_string()))?;
        let again = app.dispatch(&id, UiEvent::Clear)?;
        assert!(again.render.messages.is_empty());
        Ok(())
    }

    #[test]
    fn basic_variant_treats_image_prefix_as_chat() -> Result<()> {
        let app = ChatApp::new(Variant::Basic, EventWriter::discard())
            .with_models("dryrun-text-1", "dryrun-image-1")?;
        assert_eq!(app.default_image_model(), None);
        let id = app.create_session()?;

        let dispatch = app.dispatch(&id, UiEvent::SubmitText("#image: a fox".to_string()))?;
        assert_eq!(dispatch.render.title, "💬 Chatbot");
        assert_eq!(dispatch.render.messages.len(), 2);
        assert_eq!(dispatch.render.messages[1].content, "Echo: #image: a fox");
        assert!(dispatch.render.messages[1].image.is_none());

        let adjust = app.dispatch(&id, UiEvent::SubmitText("/adjust 1 gray".to_string()))?;
        assert!(adjust.render.notices.is_empty());
        assert_eq!(adjust.render.messages.len(), 4);
        assert_eq!(adjust.render.messages[3].content, "Echo: /adjust 1 gray");
        assert!(app.export_png(&id, "1").is_err());
        Ok(())
    }

    #[test]
    fn adjust_reset_and_export_follow_widget_state() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;
        let key = generate_image(&app, &id, "lighthouse")?;

        let adjusted = app.dispatch(
            &id,
            UiEvent::SubmitText(format!("/adjust {key} gray brightness=0.25 sparkle")),
        )?;
        let settings = adjusted.render.messages[1]
            .image
            .as_ref()
            .map(|image| image.settings)
            .unwrap_or_default();
        assert!(settings.grayscale);
        assert_eq!(settings.brightness, 0.25);
        assert_eq!(adjusted.render.notices[0].level, NoticeLevel::Warning);
        assert!(adjusted.render.notices[0].text.contains("sparkle"));

        let export = app.export_png(&id, &key)?;
        assert_eq!(export.file_name, format!("generated_image_{key}.png"));
        assert!(export.warnings.is_empty());
        let decoded = image::load_from_memory(&export.bytes)?;
        assert_eq!(decoded.color(), ColorType::L8);
        assert_eq!(decoded.width(), STORED_IMAGE_DIMENSION);

        let reset = app.dispatch(&id, UiEvent::ResetEffects { key: key.clone() })?;
        let settings = reset.render.messages[1].image.as_ref().map(|image| image.settings);
        assert_eq!(settings, Some(EffectSettings::default()));
        let original = image::load_from_memory(&app.export_png(&id, &key)?.bytes)?;
        assert_ne!(original.color(), ColorType::L8);
        Ok(())
    }

    #[test]
    fn background_removal_failure_is_a_warning() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;
        let key = generate_image(&app, &id, "cat")?;
        app.dispatch(
            &id,
            UiEvent::UpdateEffects {
                key: key.clone(),
                settings: EffectSettings {
                    remove_background: true,
                    ..EffectSettings::default()
                },
            },
        )?;

        let export = app.export_png(&id, &key)?;
        assert_eq!(export.warnings.len(), 1);
        assert!(image::load_from_memory(&export.bytes).is_ok());
        Ok(())
    }

    #[test]
    fn download_command_names_the_file() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;
        let key = generate_image(&app, &id, "boat")?;

        let dispatch =
            app.dispatch(&id, UiEvent::SubmitText(format!("/download {key} out/boat.png")))?;
        let download = dispatch.download.expect("download request");
        assert_eq!(download.key, key);
        assert_eq!(download.path.as_deref(), Some("out/boat.png"));
        assert_eq!(download.file_name, format!("generated_image_{key}.png"));

        let unknown = app.dispatch(&id, UiEvent::SubmitText("/download 123".to_string()))?;
        assert!(unknown.download.is_none());
        assert_eq!(unknown.render.notices[0].level, NoticeLevel::Error);
        Ok(())
    }

    #[test]
    fn commands_cover_help_quit_and_models() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;

        let help = app.dispatch(&id, UiEvent::SubmitText("/help".to_string()))?;
        assert!(help.render.notices[0].text.contains("#image:"));
        assert!(app.dispatch(&id, UiEvent::SubmitText("/exit".to_string()))?.quit);

        let model = app.dispatch(&id, UiEvent::SubmitText("/text_model gemini-2.0-flash".to_string()))?;
        assert_eq!(model.render.text_model, "gemini-2.0-flash");
        let fallback = app.dispatch(&id, UiEvent::SelectImageModel("paint-9000".to_string()))?;
        assert_eq!(fallback.render.image_model.as_deref(), Some("stable-diffusion-v1-6"));
        assert_eq!(fallback.render.notices[0].level, NoticeLevel::Warning);
        assert!(model.render.messages.is_empty());
        Ok(())
    }

    #[test]
    fn slash_lines_that_are_not_commands_reach_the_model() -> Result<()> {
        for variant in [Variant::Basic, Variant::Studio] {
            let app = ChatApp::new(variant, EventWriter::discard())
                .with_models("dryrun-text-1", "dryrun-image-1")?;
            let id = app.create_session()?;

            let path = "/etc/hosts what does this file do?";
            let asked = app.dispatch(&id, UiEvent::SubmitText(path.to_string()))?;
            assert_eq!(asked.render.messages.len(), 2);
            assert_eq!(asked.render.messages[0].content, path);
            assert_eq!(asked.render.messages[1].content, format!("Echo: {path}"));
            assert!(asked.render.notices.is_empty());

            let poem = "/help me write a poem";
            let asked = app.dispatch(&id, UiEvent::SubmitText(poem.to_string()))?;
            assert_eq!(asked.render.messages.len(), 4);
            assert_eq!(asked.render.messages[3].content, format!("Echo: {poem}"));
            assert!(asked.render.notices.is_empty());
            assert!(!asked.quit);
        }
        Ok(())
    }

    #[test]
    fn render_reports_responding_while_a_turn_runs() -> Result<()> {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let app = Arc::new(studio()?.with_text_provider(GatedText {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));
        let id = app.create_session()?;

        let turn = {
            let app = Arc::clone(&app);
            let id = id.clone();
            thread::spawn(move || app.dispatch(&id, UiEvent::SubmitText("Hello".to_string())))
        };
        entered_rx.recv()?;
        let during = app.render(&id)?;
        assert_eq!(during.state, PresentationState::Responding);
        assert_eq!(during.messages.len(), 1);
        assert_eq!(during.messages[0].content, "Hello");

        release_tx.send(())?;
        let finished = turn.join().expect("turn thread")?;
        assert_eq!(finished.render.state, PresentationState::Idle);
        assert_eq!(finished.render.messages.len(), 2);
        assert_eq!(app.render(&id)?.state, PresentationState::Idle);
        Ok(())
    }

    #[test]
    fn effect_events_for_unknown_images_are_typed_errors() -> Result<()> {
        let app = studio()?;
        let id = app.create_session()?;

        let err = app
            .dispatch(
                &id,
                UiEvent::UpdateEffects {
                    key: "404".to_string(),
                    settings: EffectSettings::default(),
                },
            )
            .expect_err("unknown image");
        assert_eq!(
            err.downcast_ref::<UnknownImage>(),
            Some(&UnknownImage("404".to_string()))
        );
        let reset = app.dispatch(&id, UiEvent::ResetEffects { key: "404".to_string() });
        assert!(reset.is_err());

        let typed = app.dispatch(&id, UiEvent::SubmitText("/adjust 404 gray".to_string()))?;
        assert_eq!(typed.render.notices[0].level, NoticeLevel::Error);
        assert!(typed.render.notices[0].text.contains("404"));
        Ok(())
    }

    #[test]
    fn event_log_failures_become_notices() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"")?;
        let app = ChatApp::new(
            Variant::Studio,
            EventWriter::new(blocker.join("events.jsonl"), "test-instance"),
        )
        .with_models("dryrun-text-1", "dryrun-image-1")?;

        let opened = app.open_session()?;
        assert_eq!(opened.notices.len(), 1);
        assert_eq!(opened.notices[0].level, NoticeLevel::Error);

        let dispatch = app.dispatch(&opened.session_id, UiEvent::SubmitText("Hello".to_string()))?;
        assert_eq!(dispatch.render.messages.len(), 2);
        assert_eq!(dispatch.render.messages[1].content, "Echo: Hello");
        assert_eq!(dispatch.render.notices.len(), 1);
        assert_eq!(dispatch.render.notices[0].level, NoticeLevel::Error);
        assert_eq!(dispatch.render.state, PresentationState::Idle);
        Ok(())
    }

    #[test]
    fn unknown_session_is_a_typed_error() -> Result<()> {
        let app = studio()?;
        let err = app
            .dispatch("missing", UiEvent::Refresh)
            .expect_err("unknown session");
        assert_eq!(
            err.downcast_ref::<UnknownSession>(),
            Some(&UnknownSession("missing".to_string()))
        );

        let id = app.create_session()?;
        assert!(app.destroy_session(&id)?);
        assert!(app.render(&id).is_err());
        Ok(())
    }

    #[test]
    fn unknown_default_model_falls_back_with_startup_notice() -> Result<()> {
        let app = ChatApp::new(Variant::Studio, EventWriter::discard())
            .with_models("gpt-nope", "dryrun-image-1")?;
        assert_eq!(app.default_text_model(), "gemini-2.0-flash-thinking-exp-01-21");
        let render = app.open_session()?;
        assert_eq!(render.notices.len(), 1);
        assert!(render.notices[0].text.contains("gpt-nope"));
        Ok(())
    }

    fn config(text_model: &str, image_model: &str) -> AppConfig {
        AppConfig {
            variant: Variant::Studio,
            text_model: text_model.to_string(),
            image_model: image_model.to_string(),
            gemini_api_base: "http://127.0.0.1:9".to_string(),
            stability_api_base: "http://127.0.0.1:9".to_string(),
            rembg_endpoint: None,
        }
    }

    #[test]
    fn from_config_requires_keys_for_selected_providers() -> Result<()> {
        let missing = ChatApp::from_config(
            &config("gemini-2.0-flash", "dryrun-image-1"),
            &Secrets::default(),
            EventWriter::discard(),
        );
        let message = format!("{:#}", missing.err().expect("missing key"));
        assert!(message.contains("GENAI_API_KEY"));

        let missing_image = ChatApp::from_config(
            &config("dryrun-text-1", "stable-diffusion-v1-6"),
            &Secrets::default(),
            EventWriter::discard(),
        );
        assert!(missing_image.is_err());

        let dryrun = ChatApp::from_config(
            &config("dryrun-text-1", "dryrun-image-1"),
            &Secrets::default(),
            EventWriter::discard(),
        )?;
        assert_eq!(dryrun.default_image_model(), Some("dryrun-image-1"));
        Ok(())
    }

    #[test]
    fn turns_are_recorded_in_the_event_log() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let app = ChatApp::new(Variant::Studio, EventWriter::new(&path, "test-instance"))
            .with_models("dryrun-text-1", "dryrun-image-1")?
            .with_text_provider(FailingText);
        let id = app.create_session()?;
        app.dispatch(&id, UiEvent::SubmitText("Hello".to_string()))?;

        let events: Vec<Value> = fs::read_to_string(&path)?
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<_, _>>()?;
        let types: Vec<&str> = events
            .iter()
            .filter_map(|event| event.get("type").and_then(Value::as_str))
            .collect();
        assert_eq!(types, vec!["session_created", "chat_failed"]);
        assert_eq!(events[1]["session_id"], Value::String(id));
        assert_eq!(events[1]["instance_id"], "test-instance");
        Ok(())
    }
}
