use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use image::DynamicImage;
use vesper_contracts::effects::EffectSettings;
use vesper_contracts::render::{new_session_id, PresentationState, RenderModel, Role};

/// One chat history entry. `image` names a key served by [`Session::image`].
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub image: Option<String>,
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image: None,
            timestamp: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            image: None,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub key: String,
    pub prompt: String,
    pub image: DynamicImage,
    /// Last derived render, reused while the widget settings are unchanged.
    pub(crate) preview: Option<(EffectSettings, DynamicImage)>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    pub text_model: String,
    pub image_model: Option<String>,
    messages: Vec<Message>,
    images: BTreeMap<String, GeneratedImage>,
    widgets: BTreeMap<String, EffectSettings>,
}

impl Session {
    pub fn new(id: impl Into<String>, text_model: String, image_model: Option<String>) -> Self {
        Self {
            id: id.into(),
            text_model,
            image_model,
            messages: Vec::new(),
            images: BTreeMap::new(),
            widgets: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, key: &str) -> Option<&GeneratedImage> {
        self.images.get(key)
    }

    pub(crate) fn image_mut(&mut self, key: &str) -> Option<&mut GeneratedImage> {
        self.images.get_mut(key)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Stores `image` under a fresh key derived from `now_millis` and appends
    /// the assistant message that shows it. Returns the key.
    pub fn push_image_reply(
        &mut self,
        content: impl Into<String>,
        prompt: impl Into<String>,
        image: DynamicImage,
        now_millis: i64,
    ) -> String {
        let mut stamp = now_millis;
        while self.images.contains_key(&stamp.to_string()) {
            stamp += 1;
        }
        let key = stamp.to_string();
        self.images.insert(
            key.clone(),
            GeneratedImage {
                key: key.clone(),
                prompt: prompt.into(),
                image,
                preview: None,
            },
        );
        self.messages.push(Message {
            role: Role::Assistant,
            content: content.into(),
            image: Some(key.clone()),
            timestamp: Some(stamp),
        });
        key
    }

    pub fn settings_for(&self, key: &str) -> EffectSettings {
        self.widgets.get(key).copied().unwrap_or_default()
    }

    pub fn set_settings(&mut self, key: &str, settings: EffectSettings) -> Result<()> {
        if !self.images.contains_key(key) {
            return Err(anyhow!("unknown image key '{key}'"));
        }
        self.widgets.insert(key.to_string(), settings.normalized());
        Ok(())
    }

    /// Drops messages, images and widget state together.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.images.clear();
        self.widgets.clear();
    }
}

/// A session and the render published by the turn currently holding its
/// lock. Readers see the published render instead of waiting on the turn.
#[derive(Debug)]
pub struct SessionSlot {
    session: Mutex<Session>,
    in_flight: Mutex<Option<RenderModel>>,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            in_flight: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| anyhow!("session lock poisoned"))
    }

    fn published(&self) -> Result<MutexGuard<'_, Option<RenderModel>>> {
        self.in_flight
            .lock()
            .map_err(|_| anyhow!("session turn lock poisoned"))
    }

    pub fn in_flight(&self) -> Result<Option<RenderModel>> {
        Ok(self.published()?.clone())
    }

    pub fn state(&self) -> Result<PresentationState> {
        Ok(match self.published()?.as_ref() {
            Some(_) => PresentationState::Responding,
            None => PresentationState::Idle,
        })
    }

    pub(crate) fn begin_turn(&self, snapshot: RenderModel) -> Result<()> {
        *self.published()? = Some(snapshot);
        Ok(())
    }

    pub(crate) fn end_turn(&self) -> Result<()> {
        *self.published()? = None;
        Ok(())
    }
}

pub type SharedSession = Arc<SessionSlot>;

/// Process-local sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SharedSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> Result<MutexGuard<'_, HashMap<String, SharedSession>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session store lock poisoned"))
    }

    pub fn create(&self, text_model: String, image_model: Option<String>) -> Result<String> {
        let mut sessions = self.map()?;
        let mut id = new_session_id();
        while sessions.contains_key(&id) {
            id = new_session_id();
        }
        let session = Session::new(id.clone(), text_model, image_model);
        sessions.insert(id.clone(), Arc::new(SessionSlot::new(session)));
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<SharedSession>> {
        Ok(self.map()?.get(id).cloned())
    }

    pub fn destroy(&self, id: &str) -> Result<bool> {
        Ok(self.map()?.remove(id).is_some())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.map()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.map()?.is_empty())
    }
}
