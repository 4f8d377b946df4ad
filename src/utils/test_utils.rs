//! In-memory stand-ins for the chat backend and the stream transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::api::{
    ApiError, ChatBackend, ChatResponse, ConversationConfiguration, ConversationDetails,
    ConversationFilter, ConversationHistory, ConversationListResponse, ConversationStatus,
    ConversationSummary, CreateConversationRequest, CreateConversationResponse, HistoryTurn,
};
use crate::core::chat_stream::{
    ChunkStream, StreamChunk, StreamRequest, StreamRequestError, StreamTransport,
};

/// Fixed reference instant plus `seconds`.
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

pub fn turn(id: &str, user: &str, assistant: &str, timestamp: DateTime<Utc>) -> HistoryTurn {
    HistoryTurn {
        turn_id: id.to_string(),
        user_message: user.to_string(),
        assistant_response: assistant.to_string(),
        timestamp,
        response_time_ms: 120,
        sources_count: 0,
        tools_used: Vec::new(),
    }
}

pub fn configuration() -> ConversationConfiguration {
    ConversationConfiguration {
        collection_names: vec!["handbook".to_string()],
        personality_type: "professional".to_string(),
        role_type: "assistant".to_string(),
        custom_role: None,
        communication_style: "concise".to_string(),
        expertise_areas: Vec::new(),
        response_tone: "neutral".to_string(),
        custom_instructions: None,
        use_tools: false,
        max_context_turns: 10,
        temperature: 0.7,
        max_tokens: 1024,
    }
}

#[derive(Default)]
struct FakeState {
    turns: HashMap<String, Vec<HistoryTurn>>,
    conversations: Vec<ConversationSummary>,
    calls: Vec<String>,
    history_failures: VecDeque<ApiError>,
    mutation_failure: Option<ApiError>,
    created: u32,
}

/// Chat backend that serves canned data and records every call.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    history_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(
        &self,
        conversation_id: &str,
        turn_id: &str,
        user: &str,
        assistant: &str,
        timestamp: DateTime<Utc>,
    ) {
        self.state
            .lock()
            .unwrap()
            .turns
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn(turn_id, user, assistant, timestamp));
    }

    pub fn add_conversation(&self, conversation_id: &str, title: &str) {
        self.state
            .lock()
            .unwrap()
            .conversations
            .push(summary(conversation_id, title, ConversationStatus::Active));
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationSummary> {
        self.state
            .lock()
            .unwrap()
            .conversations
            .iter()
            .find(|c| c.conversation_id == conversation_id)
            .cloned()
    }

    /// Fail the next `times` history fetches with `err`.
    pub fn fail_history(&self, times: usize, err: ApiError) {
        let mut state = self.state.lock().unwrap();
        state.history_failures.clear();
        state
            .history_failures
            .extend(std::iter::repeat(err).take(times));
    }

    pub fn fail_mutations(&self, err: Option<ApiError>) {
        self.state.lock().unwrap().mutation_failure = err;
    }

    /// Hold history fetches until [`FakeBackend::open_history_gate`].
    pub fn close_history_gate(&self) {
        *self.history_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_history_gate(&self) {
        if let Some(gate) = self.history_gate.lock().unwrap().take() {
            gate.close();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn history_calls(&self, conversation_id: &str) -> usize {
        let call = format!("history:{conversation_id}");
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub async fn wait_for_history_calls(&self, conversation_id: &str, count: usize) {
        for _ in 0..500 {
            if self.history_calls(conversation_id) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {count} history fetches for {conversation_id}");
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn mutation_result(&self) -> Result<(), ApiError> {
        match self.state.lock().unwrap().mutation_failure.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn summary(conversation_id: &str, title: &str, status: ConversationStatus) -> ConversationSummary {
    ConversationSummary {
        conversation_id: conversation_id.to_string(),
        title: title.to_string(),
        status,
        last_activity: at(0),
        total_turns: 0,
        created_at: at(0),
        collection_names: Vec::new(),
        personality_type: "professional".to_string(),
        role_type: "assistant".to_string(),
        topic_summary: None,
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<CreateConversationResponse, ApiError> {
        self.record(format!("create:{}", request.title));
        self.mutation_result()?;
        let mut state = self.state.lock().unwrap();
        state.created += 1;
        let id = format!("c-new-{}", state.created);
        state
            .conversations
            .push(summary(&id, &request.title, ConversationStatus::Active));
        Ok(CreateConversationResponse {
            conversation_id: id,
            title: request.title.clone(),
            status: ConversationStatus::Active,
            created_at: at(0),
            configuration: Some(configuration()),
        })
    }

    async fn list_conversations(
        &self,
        user_id: &str,
        filter: &ConversationFilter,
    ) -> Result<ConversationListResponse, ApiError> {
        self.record(format!("list:{user_id}"));
        let state = self.state.lock().unwrap();
        let conversations: Vec<_> = state
            .conversations
            .iter()
            .filter(|c| filter.status.map_or(true, |status| c.status == status))
            .cloned()
            .collect();
        Ok(ConversationListResponse {
            total_count: conversations.len() as u32,
            conversations,
            limit: 50,
            offset: 0,
            has_more: false,
        })
    }

    async fn get_conversation_details(
        &self,
        conversation_id: &str,
        _user_id: &str,
    ) -> Result<ConversationDetails, ApiError> {
        self.record(format!("details:{conversation_id}"));
        let state = self.state.lock().unwrap();
        let title = state
            .conversations
            .iter()
            .find(|c| c.conversation_id == conversation_id)
            .map(|c| c.title.clone())
            .unwrap_or_else(|| "Untitled".to_string());
        let message_count = state
            .turns
            .get(conversation_id)
            .map_or(0, |turns| turns.len() as u32 * 2);
        Ok(ConversationDetails {
            id: conversation_id.to_string(),
            title,
            status: ConversationStatus::Active,
            created_at: at(0),
            updated_at: at(0),
            configuration: configuration(),
            message_count,
            last_message_at: None,
        })
    }

    async fn get_conversation_history(
        &self,
        conversation_id: &str,
        _user_id: &str,
        limit: u32,
        _offset: u32,
    ) -> Result<ConversationHistory, ApiError> {
        self.record(format!("history:{conversation_id}"));
        let gate = self.history_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.history_failures.pop_front() {
            return Err(err);
        }
        let history = state
            .turns
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        Ok(ConversationHistory {
            total_shown: history.len() as u32,
            history,
            page: 1,
            limit,
            has_more: false,
            conversation_id: conversation_id.to_string(),
        })
    }

    async fn update_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), ApiError> {
        self.record(format!("rename:{conversation_id}"));
        self.mutation_result()?;
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state
            .conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
        {
            c.title = title.to_string();
        }
        Ok(())
    }

    async fn update_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<(), ApiError> {
        self.record(format!("status:{conversation_id}:{}", status.as_str()));
        self.mutation_result()?;
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state
            .conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
        {
            c.status = status;
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ApiError> {
        self.record(format!("delete:{conversation_id}"));
        self.mutation_result()?;
        let mut state = self.state.lock().unwrap();
        state
            .conversations
            .retain(|c| c.conversation_id != conversation_id);
        state.turns.remove(conversation_id);
        Ok(())
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<ChatResponse, ApiError> {
        self.record(format!("edit:{conversation_id}:{message_id}"));
        self.mutation_result()?;
        let mut state = self.state.lock().unwrap();
        if let Some(turn) = state
            .turns
            .get_mut(conversation_id)
            .and_then(|turns| turns.iter_mut().find(|t| t.turn_id == message_id))
        {
            turn.user_message = content.to_string();
        }
        Ok(ChatResponse {
            message_id: message_id.to_string(),
            content: content.to_string(),
        })
    }

    async fn regenerate_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<ChatResponse, ApiError> {
        self.record(format!("regenerate:{conversation_id}:{message_id}"));
        self.mutation_result()?;
        let mut state = self.state.lock().unwrap();
        let mut content = String::new();
        if let Some(turn) = state
            .turns
            .get_mut(conversation_id)
            .and_then(|turns| turns.iter_mut().find(|t| t.turn_id == message_id))
        {
            turn.assistant_response = format!("{} (regenerated)", turn.assistant_response);
            content = turn.assistant_response.clone();
        }
        Ok(ChatResponse {
            message_id: message_id.to_string(),
            content,
        })
    }
}

/// A stream opened through [`ManualTransport`]; the test pushes chunks.
pub struct ManualStream {
    pub request: StreamRequest,
    pub cancel_token: CancellationToken,
    tx: mpsc::UnboundedSender<StreamChunk>,
}

impl ManualStream {
    pub fn chunk(&self, text: &str) {
        let _ = self.tx.send(StreamChunk::Chunk(text.to_string()));
    }

    pub fn done(&self) {
        let _ = self.tx.send(StreamChunk::Done);
    }

    pub fn error(&self, err: ApiError) {
        let _ = self.tx.send(StreamChunk::Error(err));
    }
}

/// Stream transport whose streams are driven by the test.
#[derive(Default)]
pub struct ManualTransport {
    streams: Mutex<Vec<Arc<ManualStream>>>,
}

impl ManualTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn stream(&self, index: usize) -> Arc<ManualStream> {
        Arc::clone(&self.streams.lock().unwrap()[index])
    }

    pub fn last(&self) -> Arc<ManualStream> {
        let streams = self.streams.lock().unwrap();
        Arc::clone(streams.last().expect("no stream opened"))
    }
}

impl StreamTransport for ManualTransport {
    fn open_stream(
        &self,
        request: StreamRequest,
        cancel_token: CancellationToken,
    ) -> Result<ChunkStream, StreamRequestError> {
        request.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push(Arc::new(ManualStream {
            request,
            cancel_token,
            tx,
        }));
        Ok(ChunkStream::from_receiver(rx))
    }
}
