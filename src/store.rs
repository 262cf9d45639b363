//! Conversation state and the actions that change it.
//!
//! [`ChatStore`] is the only writer of [`ChatState`]. Readers either take a
//! [`ChatStore::snapshot`] or [`ChatStore::subscribe`] to be woken on every
//! change, which is how the console prints a reply while it streams in.
//!
//! One conversation turn runs at a time; a second [`ChatStore::send_message`]
//! issued while the first is in flight is rejected with [`StoreError::Busy`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::api::{ChatRequest, ChatTransport, ModelInfo};
use crate::message::{Attachment, ChatMessage, Role, WireMessage, approximate_tokens};
use crate::settings::{ChatSettings, ChatSettingsPatch};
use crate::storage::{PersistedState, SnapshotRepository};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    pub messages: Vec<ChatMessage>,
    pub streaming_message: String,
    pub is_streaming: bool,
    pub is_loading: bool,
    pub error: Option<String>,
    pub settings: ChatSettings,
    pub available_models: Vec<ModelInfo>,
}

impl ChatState {
    pub fn is_busy(&self) -> bool { self.is_loading || self.is_streaming }

    /// Projects the whole log onto the wire format with the current settings.
    fn request(&self) -> ChatRequest {
        ChatRequest {
            messages: self.messages.iter().map(WireMessage::from).collect(),
            model: Some(self.settings.model.clone()),
            max_tokens: Some(self.settings.max_tokens),
            temperature: Some(self.settings.temperature),
            provider: Some(self.settings.provider.clone()),
            stream: Some(self.settings.streaming_enabled),
        }
    }

    fn persisted(&self) -> PersistedState {
        PersistedState { messages: self.messages.clone(), settings: self.settings.clone() }
    }

    fn restore(persisted: PersistedState) -> Self {
        Self { messages: persisted.messages, settings: persisted.settings, ..Self::default() }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("a message is already being sent")]
    Busy,
}

pub struct ChatStore {
    state: watch::Sender<ChatState>,
    transport: Arc<dyn ChatTransport>,
    repo: Arc<dyn SnapshotRepository>,
    key: String,
    in_flight: AtomicBool,
}

/// Holds the single-flight slot for one turn. Dropping it releases the slot
/// and, if the turn was abandoned midway, puts the store back to idle.
struct TurnGuard<'a> {
    store: &'a ChatStore,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.store.state.send_if_modified(|s| {
            if !s.is_busy() {
                return false;
            }
            tracing::warn!("conversation turn abandoned before completion");
            s.is_loading = false;
            s.is_streaming = false;
            s.streaming_message.clear();
            true
        });
        self.store.in_flight.store(false, Ordering::Release);
    }
}

impl ChatStore {
    /// Builds a store, hydrating messages and settings from `repo`. A snapshot
    /// that cannot be read is logged and replaced by defaults.
    pub async fn open(transport: Arc<dyn ChatTransport>, repo: Arc<dyn SnapshotRepository>, key: impl Into<String>) -> Self {
        let key = key.into();
        let initial = match repo.load(&key).await {
            Ok(Some(persisted)) => {
                tracing::debug!(key = %key, messages = persisted.messages.len(), "restored conversation");
                ChatState::restore(persisted)
            }
            Ok(None) => ChatState::default(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "ignoring unreadable conversation snapshot");
                ChatState::default()
            }
        };
        let (state, _) = watch::channel(initial);
        Self { state, transport, repo, key, in_flight: AtomicBool::new(false) }
    }

    pub fn snapshot(&self) -> ChatState { self.state.borrow().clone() }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> { self.state.subscribe() }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> { &self.transport }

    async fn persist(&self) {
        let persisted = self.state.borrow().persisted();
        if let Err(e) = self.repo.save(&self.key, &persisted).await {
            tracing::warn!(key = %self.key, error = %e, "failed to persist conversation");
        }
    }

    pub async fn add_message(&self, msg: ChatMessage) {
        self.state.send_modify(|s| {
            s.messages.push(msg);
            s.error = None;
        });
        self.persist().await;
    }

    pub fn start_streaming(&self) {
        self.state.send_modify(|s| {
            s.is_streaming = true;
            s.streaming_message.clear();
            s.error = None;
        });
    }

    pub fn update_streaming_message(&self, content: impl Into<String>) {
        let content = content.into();
        self.state.send_modify(|s| s.streaming_message = content);
    }

    fn append_chunk(&self, chunk: &str) {
        self.state.send_modify(|s| s.streaming_message.push_str(chunk));
    }

    /// Ends streaming. A non-empty buffer becomes an assistant message.
    pub async fn stop_streaming(&self) {
        let mut materialized = false;
        self.state.send_modify(|s| {
            let buffer = std::mem::take(&mut s.streaming_message);
            s.is_streaming = false;
            if buffer.is_empty() {
                return;
            }
            let tokens = approximate_tokens(&buffer);
            let msg = ChatMessage::new(&s.messages, Role::Assistant, buffer, s.settings.model.clone())
                .with_tokens(Some(tokens));
            tracing::debug!(message_id = %msg.id, tokens, "materialized streamed reply");
            s.messages.push(msg);
            materialized = true;
        });
        if materialized {
            self.persist().await;
        }
    }

    /// Runs one conversation turn. Transport failures land in
    /// [`ChatState::error`]; the user message is kept either way.
    pub async fn send_message(&self, content: impl Into<String>, attachments: Vec<Attachment>) -> Result<(), StoreError> {
        let _guard = self.begin_turn()?;
        let content = content.into();

        self.state.send_modify(|s| {
            let user = ChatMessage::new(&s.messages, Role::User, content, s.settings.model.clone())
                .with_attachments(attachments);
            tracing::info!(message_id = %user.id, "sending message");
            s.messages.push(user);
            s.is_loading = true;
            s.error = None;
        });
        let (request, streaming) = {
            let s = self.state.borrow();
            (s.request(), s.settings.streaming_enabled)
        };
        self.persist().await;

        let outcome = if streaming {
            self.start_streaming();
            self.state.send_modify(|s| s.is_loading = false);
            let result = self
                .transport
                .send_message_stream(&request, &mut |chunk| self.append_chunk(&chunk))
                .await;
            if result.is_ok() {
                self.stop_streaming().await;
            }
            result
        } else {
            match self.transport.send_message(&request).await {
                Ok(resp) => {
                    let tokens = resp.tokens();
                    self.state.send_modify(|s| {
                        let msg = ChatMessage::new(&s.messages, Role::Assistant, resp.content, resp.model)
                            .with_tokens(tokens);
                        s.messages.push(msg);
                        s.is_loading = false;
                    });
                    self.persist().await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = outcome {
            tracing::error!(error = %e, "chat request failed");
            self.state.send_modify(|s| {
                s.is_loading = false;
                s.is_streaming = false;
                s.streaming_message.clear();
                s.error = Some(e.to_string());
            });
        }
        Ok(())
    }

    fn begin_turn(&self) -> Result<TurnGuard<'_>, StoreError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| StoreError::Busy)?;
        Ok(TurnGuard { store: self })
    }

    pub async fn update_settings(&self, patch: ChatSettingsPatch) {
        self.state.send_modify(|s| s.settings.apply_patch(patch));
        self.persist().await;
    }

    pub async fn load_models(&self) {
        match self.transport.get_models().await {
            Ok(models) => {
                tracing::debug!(count = models.len(), "loaded models");
                self.state.send_modify(|s| s.available_models = models);
            }
            Err(e) => tracing::error!(error = %e, "failed to load models"),
        }
    }

    pub async fn clear_messages(&self) {
        self.state.send_modify(|s| {
            s.messages.clear();
            s.error = None;
        });
        self.persist().await;
    }

    pub fn set_error(&self, error: Option<String>) {
        self.state.send_modify(|s| s.error = error);
    }
}
