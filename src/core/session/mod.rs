//! Per-user chat session: which conversation is open, what is being sent,
//! and how streamed replies settle into confirmed history.
//!
//! All state lives in [`SessionController`] and is only touched through
//! `&mut self`. Network work runs on spawned tasks that report back as
//! [`SessionEvent`]s; the owner drains them with [`SessionController::next_event`]
//! and applies them with [`SessionController::handle_event`].

use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{
    ApiError, ConversationDetails, ConversationFilter, ConversationListResponse,
    ConversationStatus, CreateConversationRequest, CreateConversationResponse,
};
use crate::core::cache::SessionCache;
use crate::core::chat_stream::{StreamChunk, StreamRequest, StreamTransport};
use crate::core::message::{is_temporary_id, Message};
use crate::core::overlay::OptimisticOverlay;
use crate::core::reconcile::reconcile_since;

pub mod refetch;
mod streaming;


pub use refetch::ScheduledRefetch;
use streaming::{forward_chunks, StreamRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    /// A reply is streaming in.
    Sending,
    /// The stream finished; waiting for history to confirm it.
    Settling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The token is missing or was rejected; the user has to sign in again.
    AuthenticationRequired,
    Stream(ApiError),
    History(ApiError),
    Mutation(ApiError),
}

impl SessionError {
    fn from_api(err: ApiError, kind: fn(ApiError) -> SessionError) -> Self {
        if err.is_unauthorized() {
            SessionError::AuthenticationRequired
        } else {
            kind(err)
        }
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, SessionError::AuthenticationRequired)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::AuthenticationRequired => false,
            SessionError::Stream(_) => true,
            SessionError::History(err) | SessionError::Mutation(err) => err.is_retryable(),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AuthenticationRequired => {
                write!(f, "Your session has expired. Please sign in again.")
            }
            SessionError::Stream(err) => write!(f, "Response failed: {err}"),
            SessionError::History(err) => write!(f, "Failed to load conversation: {err}"),
            SessionError::Mutation(err) => write!(f, "Request failed: {err}"),
        }
    }
}

impl StdError for SessionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            SessionError::AuthenticationRequired => None,
            SessionError::Stream(err) | SessionError::History(err) | SessionError::Mutation(err) => {
                Some(err)
            }
        }
    }
}

/// Work finished in the background, waiting to be applied.
#[derive(Debug)]
pub enum SessionEvent {
    Stream {
        stream_id: u64,
        /// Delivery number within the stream, starting at 1.
        seq: u64,
        chunk: StreamChunk,
    },
    HistoryLoaded {
        conversation_id: String,
        generation: u64,
        result: Result<Arc<Vec<Message>>, ApiError>,
    },
    RefetchDue {
        conversation_id: String,
        refetch_id: u64,
    },
}

/// What applying an event changed, for front ends that render incrementally.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    /// The event belonged to a superseded stream, fetch or timer.
    Ignored,
    Chunk(String),
    StreamDone,
    StreamFailed(SessionError),
    HistoryUpdated,
    HistoryFailed(SessionError),
    /// Optimistic messages were retired, or stopped waiting for history.
    Settled,
    RefetchStarted,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Delay between a finished stream and the history reload that
    /// confirms it.
    pub settle_delay: Duration,
    /// Delayed reloads attempted before giving up on confirmation.
    pub settle_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1000),
            settle_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub conversation_id: Option<String>,
    pub phase: SessionPhase,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub is_loading_history: bool,
    pub error: Option<SessionError>,
}

pub struct SessionController {
    cache: SessionCache,
    transport: Arc<dyn StreamTransport>,
    settings: SessionSettings,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,

    conversation_id: Option<String>,
    phase: SessionPhase,
    server_messages: Arc<Vec<Message>>,
    overlay: OptimisticOverlay,
    // Confirmed ids present when the current send started.
    baseline_ids: HashSet<String>,
    streams: StreamRegistry,
    history_generation: u64,
    is_loading_history: bool,
    refetch: Option<ScheduledRefetch>,
    last_refetch_id: u64,
    settle_attempts_left: u32,
    error: Option<SessionError>,
}

impl SessionController {
    pub fn new(
        cache: SessionCache,
        transport: Arc<dyn StreamTransport>,
        settings: SessionSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            cache,
            transport,
            settings,
            events_tx,
            events_rx,
            conversation_id: None,
            phase: SessionPhase::Idle,
            server_messages: Arc::default(),
            overlay: OptimisticOverlay::new(),
            baseline_ids: HashSet::new(),
            streams: StreamRegistry::default(),
            history_generation: 0,
            is_loading_history: false,
            refetch: None,
            last_refetch_id: 0,
            settle_attempts_left: 0,
            error: None,
        }
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_current_stream(&self, stream_id: u64) -> bool {
        self.streams.is_current_stream(stream_id)
    }

    pub fn view(&self) -> SessionView {
        let is_streaming = self.phase == SessionPhase::Sending;
        let messages = reconcile_since(
            &self.server_messages,
            &self.baseline_ids,
            &self.overlay.messages(),
            is_streaming,
        )
        .messages;

        SessionView {
            conversation_id: self.conversation_id.clone(),
            phase: self.phase,
            messages,
            is_streaming,
            is_loading_history: self.is_loading_history,
            error: self.error.clone(),
        }
    }

    /// Open a conversation, always reloading its history. A stream still
    /// running for the previous conversation keeps going in the background.
    pub fn select_conversation(&mut self, conversation_id: &str) {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return;
        }
        debug!(%conversation_id, "selecting conversation");

        self.streams.detach_current();
        self.refetch = None;
        self.overlay.clear();
        self.baseline_ids.clear();
        self.phase = SessionPhase::Idle;
        self.error = None;
        self.conversation_id = Some(conversation_id.to_string());
        self.server_messages = self
            .cache
            .cached_history(conversation_id)
            .unwrap_or_default();

        self.cache.invalidate(conversation_id);
        self.load_history();
    }

    /// Show `text` immediately and stream the reply. Returns whether a send
    /// was started; blank text or no open conversation is a no-op.
    pub fn send_message(&mut self, text: &str) -> bool {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return false;
        };
        let content = text.trim();
        if content.is_empty() {
            return false;
        }

        self.refetch = None;
        let (cancel_token, stream_id) = self.streams.start_new_stream(&conversation_id);
        self.overlay.begin_send(&conversation_id, content);
        self.baseline_ids = self.server_messages.iter().map(|m| m.id.clone()).collect();
        self.error = None;

        let request = StreamRequest::new(conversation_id.as_str(), content);
        match self.transport.open_stream(request, cancel_token.clone()) {
            Ok(stream) => {
                debug!(%conversation_id, stream_id, "message sent");
                forward_chunks(stream_id, stream, cancel_token, self.events_tx.clone());
                self.phase = SessionPhase::Sending;
                self.settle_attempts_left = self.settings.settle_attempts.max(1);
                true
            }
            Err(err) => {
                warn!(%conversation_id, error = %err, "stream request rejected");
                self.streams.cancel_current_stream();
                self.overlay.clear();
                self.baseline_ids.clear();
                self.phase = SessionPhase::Idle;
                false
            }
        }
    }

    /// Cancel the streaming reply and drop everything shown for it.
    pub fn stop_stream(&mut self) -> bool {
        if !self.streams.cancel_current_stream() {
            return false;
        }
        self.overlay.clear();
        self.baseline_ids.clear();
        self.refetch = None;
        self.phase = SessionPhase::Idle;
        true
    }

    pub async fn edit_message(
        &mut self,
        message_id: &str,
        new_text: &str,
    ) -> Result<(), SessionError> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return Ok(());
        };
        let content = new_text.trim();
        if content.is_empty() || is_temporary_id(message_id) {
            return Ok(());
        }

        let backend_id = self.backend_id_for(message_id);
        let backend = Arc::clone(self.cache.backend());
        match backend
            .edit_message(&conversation_id, &backend_id, content)
            .await
        {
            Ok(_) => {
                self.after_mutation(&conversation_id);
                Ok(())
            }
            Err(err) => Err(self.record_error(SessionError::from_api(err, SessionError::Mutation))),
        }
    }

    pub async fn regenerate_message(&mut self, message_id: &str) -> Result<(), SessionError> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return Ok(());
        };
        if is_temporary_id(message_id) {
            return Ok(());
        }

        let backend_id = self.backend_id_for(message_id);
        let backend = Arc::clone(self.cache.backend());
        match backend.regenerate_message(&conversation_id, &backend_id).await {
            Ok(_) => {
                self.after_mutation(&conversation_id);
                Ok(())
            }
            Err(err) => Err(self.record_error(SessionError::from_api(err, SessionError::Mutation))),
        }
    }

    /// Create a conversation for the signed-in user and open it.
    pub async fn create_conversation(
        &mut self,
        mut request: CreateConversationRequest,
    ) -> Result<CreateConversationResponse, SessionError> {
        if request.user_id.is_empty() {
            request.user_id = self.cache.user_id().to_string();
        }
        let backend = Arc::clone(self.cache.backend());
        let created = match backend.create_conversation(&request).await {
            Ok(created) => created,
            Err(err) => {
                return Err(self.record_error(SessionError::from_api(err, SessionError::Mutation)))
            }
        };
        self.cache.invalidate_conversations();
        self.select_conversation(&created.conversation_id);
        Ok(created)
    }

    pub async fn rename_conversation(
        &mut self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), SessionError> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(());
        }
        let backend = Arc::clone(self.cache.backend());
        if let Err(err) = backend.update_conversation_title(conversation_id, title).await {
            return Err(self.record_error(SessionError::from_api(err, SessionError::Mutation)));
        }
        self.cache.invalidate_conversations();
        self.cache.invalidate_details(conversation_id);
        Ok(())
    }

    pub async fn set_conversation_status(
        &mut self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<(), SessionError> {
        let backend = Arc::clone(self.cache.backend());
        if let Err(err) = backend
            .update_conversation_status(conversation_id, status)
            .await
        {
            return Err(self.record_error(SessionError::from_api(err, SessionError::Mutation)));
        }
        self.cache.invalidate_conversations();
        self.cache.invalidate_details(conversation_id);
        Ok(())
    }

    pub async fn delete_conversation(&mut self, conversation_id: &str) -> Result<(), SessionError> {
        let backend = Arc::clone(self.cache.backend());
        if let Err(err) = backend.delete_conversation(conversation_id).await {
            return Err(self.record_error(SessionError::from_api(err, SessionError::Mutation)));
        }
        self.cache.remove(conversation_id);
        self.cache.invalidate_conversations();
        if self.conversation_id.as_deref() == Some(conversation_id) {
            self.streams.cancel_current_stream();
            self.clear_selection();
        }
        Ok(())
    }

    pub async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Arc<ConversationListResponse>, SessionError> {
        self.cache
            .list_conversations(filter)
            .await
            .map_err(|err| SessionError::from_api(err, SessionError::History))
    }

    /// Details of the open conversation, if any.
    pub async fn conversation_details(
        &self,
    ) -> Result<Option<Arc<ConversationDetails>>, SessionError> {
        let Some(conversation_id) = self.conversation_id.as_deref() else {
            return Ok(None);
        };
        self.cache
            .get_details(conversation_id)
            .await
            .map(Some)
            .map_err(|err| SessionError::from_api(err, SessionError::History))
    }

    /// Messages in the current view containing `query`, ignoring case.
    pub fn search_messages(&self, query: &str) -> Vec<Message> {
        let needle = query.trim().to_lowercase();
        let messages = self.view().messages;
        if needle.is_empty() {
            return messages;
        }
        messages
            .into_iter()
            .filter(|message| message.content.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Reload the open conversation from the backend.
    pub fn refresh(&mut self) {
        if let Some(conversation_id) = self.conversation_id.clone() {
            self.cache.invalidate(&conversation_id);
            self.load_history();
        }
    }

    /// Cancel every stream and timer this session owns.
    pub fn shutdown(&mut self) {
        self.streams.cancel_all();
        self.refetch = None;
        self.overlay.clear();
        self.baseline_ids.clear();
        self.phase = SessionPhase::Idle;
    }

    /// Return to a signed-out state.
    pub fn reset(&mut self) {
        self.shutdown();
        self.cache.clear();
        self.clear_selection();
        self.error = None;
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_event(&mut self, event: SessionEvent) -> SessionChange {
        match event {
            SessionEvent::Stream {
                stream_id,
                seq,
                chunk,
            } => self.apply_stream_chunk(stream_id, seq, chunk),
            SessionEvent::HistoryLoaded {
                conversation_id,
                generation,
                result,
            } => self.apply_history(&conversation_id, generation, result),
            SessionEvent::RefetchDue {
                conversation_id,
                refetch_id,
            } => self.apply_refetch_due(&conversation_id, refetch_id),
        }
    }

    fn apply_stream_chunk(&mut self, stream_id: u64, seq: u64, chunk: StreamChunk) -> SessionChange {
        if !self.streams.is_current_stream(stream_id) {
            return self.apply_detached_chunk(stream_id, chunk);
        }

        match chunk {
            StreamChunk::Chunk(text) => {
                if self.overlay.apply_chunk(seq, &text) {
                    SessionChange::Chunk(text)
                } else {
                    SessionChange::Ignored
                }
            }
            StreamChunk::Done => {
                self.streams.finish_current(stream_id);
                self.phase = SessionPhase::Settling;
                if let Some(conversation_id) = self.conversation_id.as_deref() {
                    self.cache.invalidate(conversation_id);
                }
                self.schedule_refetch();
                debug!(stream_id, "stream complete; settling");
                SessionChange::StreamDone
            }
            StreamChunk::Error(err) => {
                self.streams.finish_current(stream_id);
                self.overlay.clear();
                self.baseline_ids.clear();
                self.phase = SessionPhase::Idle;
                warn!(stream_id, error = %err, "stream failed");
                let error = self.record_error(SessionError::from_api(err, SessionError::Stream));
                SessionChange::StreamFailed(error)
            }
        }
    }

    fn apply_detached_chunk(&mut self, stream_id: u64, chunk: StreamChunk) -> SessionChange {
        if !chunk.is_terminal() {
            return SessionChange::Ignored;
        }
        let Some(conversation_id) = self.streams.finish_detached(stream_id) else {
            return SessionChange::Ignored;
        };
        debug!(stream_id, %conversation_id, "background stream finished");
        if !matches!(chunk, StreamChunk::Done) {
            return SessionChange::Ignored;
        }

        self.cache.invalidate(&conversation_id);
        if self.conversation_id.as_deref() == Some(conversation_id.as_str())
            && self.phase == SessionPhase::Idle
        {
            self.load_history();
            return SessionChange::RefetchStarted;
        }
        SessionChange::Ignored
    }

    fn apply_history(
        &mut self,
        conversation_id: &str,
        generation: u64,
        result: Result<Arc<Vec<Message>>, ApiError>,
    ) -> SessionChange {
        if self.conversation_id.as_deref() != Some(conversation_id)
            || generation != self.history_generation
        {
            return SessionChange::Ignored;
        }
        self.is_loading_history = false;

        match result {
            Ok(messages) => {
                self.server_messages = messages;
                self.settle()
            }
            Err(err) => {
                warn!(%conversation_id, error = %err, "history load failed");
                if self.phase == SessionPhase::Settling {
                    self.refetch = None;
                    self.phase = SessionPhase::Idle;
                }
                let error = self.record_error(SessionError::from_api(err, SessionError::History));
                SessionChange::HistoryFailed(error)
            }
        }
    }

    // Retire the overlay once confirmed history contains it.
    fn settle(&mut self) -> SessionChange {
        if self.overlay.is_empty() || self.phase == SessionPhase::Sending {
            return SessionChange::HistoryUpdated;
        }

        let outcome = reconcile_since(
            &self.server_messages,
            &self.baseline_ids,
            &self.overlay.messages(),
            false,
        );
        if outcome.overlay_subsumed {
            debug!("optimistic messages confirmed");
            self.overlay.clear();
            self.baseline_ids.clear();
            self.refetch = None;
            self.phase = SessionPhase::Idle;
            return SessionChange::Settled;
        }

        if self.phase == SessionPhase::Settling && !self.schedule_refetch() {
            debug!("history never confirmed the reply; keeping optimistic messages");
            self.phase = SessionPhase::Idle;
            return SessionChange::Settled;
        }
        SessionChange::HistoryUpdated
    }

    fn apply_refetch_due(&mut self, conversation_id: &str, refetch_id: u64) -> SessionChange {
        let due = self
            .refetch
            .as_ref()
            .is_some_and(|r| r.id() == refetch_id && r.conversation_id() == conversation_id);
        if !due || self.conversation_id.as_deref() != Some(conversation_id) {
            return SessionChange::Ignored;
        }
        self.refetch = None;
        self.cache.invalidate(conversation_id);
        self.load_history();
        SessionChange::RefetchStarted
    }

    fn schedule_refetch(&mut self) -> bool {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return false;
        };
        if self.settle_attempts_left == 0 {
            return false;
        }
        self.settle_attempts_left -= 1;
        self.last_refetch_id += 1;
        self.refetch = Some(ScheduledRefetch::schedule(
            self.last_refetch_id,
            conversation_id,
            self.settings.settle_delay,
            self.events_tx.clone(),
        ));
        true
    }

    fn load_history(&mut self) {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return;
        };
        self.history_generation += 1;
        self.is_loading_history = true;

        let generation = self.history_generation;
        let cache = self.cache.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = cache.get_history(&conversation_id).await;
            let _ = events.send(SessionEvent::HistoryLoaded {
                conversation_id,
                generation,
                result,
            });
        });
    }

    fn after_mutation(&mut self, conversation_id: &str) {
        self.cache.invalidate(conversation_id);
        self.cache.invalidate_conversations();
        if self.conversation_id.as_deref() == Some(conversation_id) {
            self.load_history();
        }
    }

    fn backend_id_for(&self, message_id: &str) -> String {
        self.server_messages
            .iter()
            .find(|message| message.id == message_id)
            .map(|message| message.backend_id().to_string())
            .unwrap_or_else(|| message_id.to_string())
    }

    fn clear_selection(&mut self) {
        self.conversation_id = None;
        self.server_messages = Arc::default();
        self.overlay.clear();
        self.baseline_ids.clear();
        self.refetch = None;
        self.phase = SessionPhase::Idle;
        self.is_loading_history = false;
        self.history_generation += 1;
    }

    fn record_error(&mut self, error: SessionError) -> SessionError {
        self.error = Some(error.clone());
        error
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.streams.cancel_all();
    }
}
