use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::client::add_auth_headers;
use crate::api::error::{extract_error_detail, extract_error_summary};
use crate::api::{ApiError, ChatStreamRequest};
use crate::auth::token::TokenProvider;
use crate::utils::url::construct_api_url;

const DONE_SENTINEL: &str = "[DONE]";

/// One unit delivered by a chat stream. Every stream ends with exactly one
/// `Done` or `Error`, unless it is cancelled first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamChunk {
    Chunk(String),
    Done,
    Error(ApiError),
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamChunk::Chunk(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub conversation_id: String,
    pub message: String,
}

impl StreamRequest {
    pub fn new(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: message.into(),
        }
    }

    pub fn validate(&self) -> Result<(), StreamRequestError> {
        if self.conversation_id.trim().is_empty() {
            return Err(StreamRequestError::MissingConversation);
        }
        if self.message.trim().is_empty() {
            return Err(StreamRequestError::BlankMessage);
        }
        Ok(())
    }
}

/// Rejections raised before any network I/O happens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamRequestError {
    MissingConversation,
    BlankMessage,
}

impl fmt::Display for StreamRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRequestError::MissingConversation => write!(f, "conversation id is empty"),
            StreamRequestError::BlankMessage => write!(f, "message is blank"),
        }
    }
}

impl StdError for StreamRequestError {}

/// Receiving half of an open chat stream.
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<StreamChunk>,
}

impl ChunkStream {
    pub fn from_receiver(rx: mpsc::UnboundedReceiver<StreamChunk>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }
}

/// Opens streamed completions against the chat backend.
pub trait StreamTransport: Send + Sync {
    fn open_stream(
        &self,
        request: StreamRequest,
        cancel_token: CancellationToken,
    ) -> Result<ChunkStream, StreamRequestError>;
}

/// Forwards decoded chunks and guarantees a single terminal event.
struct ChunkSink {
    tx: mpsc::UnboundedSender<StreamChunk>,
    delivered: usize,
    finished: bool,
}

impl ChunkSink {
    fn new(tx: mpsc::UnboundedSender<StreamChunk>) -> Self {
        Self {
            tx,
            delivered: 0,
            finished: false,
        }
    }

    /// Returns false once the stream has ended or nobody is listening.
    fn send(&mut self, chunk: StreamChunk) -> bool {
        if self.finished {
            return false;
        }
        let terminal = chunk.is_terminal();
        if !terminal {
            self.delivered += 1;
        }
        if self.tx.send(chunk).is_err() {
            self.finished = true;
            return false;
        }
        if terminal {
            self.finished = true;
        }
        !terminal
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        if self.delivered > 0 {
            self.send(StreamChunk::Done);
        } else {
            self.send(StreamChunk::Error(ApiError::Stream(
                "The assistant returned an empty response".to_string(),
            )));
        }
    }
}

/// Splits a byte stream into lines without trimming their content, since
/// raw text payloads carry meaningful leading and trailing spaces. Lines are
/// decoded only once complete, so multi-byte characters split across reads
/// survive; invalid bytes become U+FFFD instead of dropping the line.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let mut line_end = newline_pos;
            if line_end > 0 && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            lines.push(String::from_utf8_lossy(&self.buffer[..line_end]).into_owned());
            self.buffer.drain(..=newline_pos);
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest)
            .trim_end_matches('\r')
            .to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Payload of a `data:` line, with the single optional space removed.
fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:")
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

/// Decode one `data:` payload. `None` means the payload carries nothing
/// the caller needs to see.
pub fn decode_payload(payload: &str) -> Option<StreamChunk> {
    if payload.trim() == DONE_SENTINEL {
        return Some(StreamChunk::Done);
    }
    if payload.trim().is_empty() {
        return None;
    }

    let value = match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => value,
        // The chat backend also streams bare text tokens.
        Err(_) => return Some(StreamChunk::Chunk(payload.to_string())),
    };

    match value {
        serde_json::Value::String(text) => (!text.is_empty()).then_some(StreamChunk::Chunk(text)),
        serde_json::Value::Object(ref map) => {
            let kind = map.get("type").and_then(|v| v.as_str());
            if kind == Some("error") || map.contains_key("error") {
                let message = extract_error_summary(&value)
                    .unwrap_or_else(|| "The assistant stream reported an error".to_string());
                return Some(StreamChunk::Error(ApiError::Stream(message)));
            }
            if kind == Some("done") {
                return Some(StreamChunk::Done);
            }
            let content = map
                .get("content")
                .and_then(|v| v.as_str())
                .or_else(|| value.pointer("/choices/0/delta/content").and_then(|v| v.as_str()));
            match content {
                Some(text) if !text.is_empty() => Some(StreamChunk::Chunk(text.to_string())),
                _ => None,
            }
        }
        serde_json::Value::Null => None,
        other => Some(StreamChunk::Chunk(other.to_string())),
    }
}

/// Handle one line; returns false once the stream has ended.
fn process_sse_line(line: &str, sink: &mut ChunkSink) -> bool {
    match sse_data_payload(line).and_then(decode_payload) {
        Some(chunk) => sink.send(chunk),
        None => true,
    }
}

fn status_error(status: u16, body: &str) -> ApiError {
    if status == 401 {
        return ApiError::Unauthorized;
    }
    let message = extract_error_detail(body).unwrap_or_else(|| "Stream request failed".to_string());
    ApiError::Status { status, message }
}

/// Streams completions from `POST {base_url}/chat`.
#[derive(Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpStreamTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            tokens,
        }
    }

    async fn run(http_request: reqwest::RequestBuilder, mut sink: ChunkSink) {
        Self::pump(http_request, &mut sink).await;
        debug!(delivered = sink.delivered, "chat stream finished");
    }

    async fn pump(http_request: reqwest::RequestBuilder, sink: &mut ChunkSink) {
        let response = match http_request.send().await {
            Ok(response) => response,
            Err(err) => {
                sink.send(StreamChunk::Error(ApiError::Network(err.to_string())));
                return;
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            sink.send(StreamChunk::Error(status_error(status, &body)));
            return;
        }

        let mut stream = response.bytes_stream();
        let mut lines = SseLineBuffer::default();
        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    sink.send(StreamChunk::Error(ApiError::Network(err.to_string())));
                    return;
                }
            };
            for line in lines.push(&bytes) {
                if !process_sse_line(&line, sink) {
                    return;
                }
            }
        }

        if let Some(line) = lines.finish() {
            if !process_sse_line(&line, sink) {
                return;
            }
        }
        sink.finish();
    }
}

impl StreamTransport for HttpStreamTransport {
    fn open_stream(
        &self,
        request: StreamRequest,
        cancel_token: CancellationToken,
    ) -> Result<ChunkStream, StreamRequestError> {
        request.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let url = construct_api_url(&self.base_url, "chat");
        let http_request = add_auth_headers(
            self.client
                .post(url)
                .header("Content-Type", "application/json")
                .header("Accept", "text/event-stream"),
            self.api_key.as_deref(),
            self.tokens.as_ref(),
        )
        .json(&ChatStreamRequest {
            conversation_id: request.conversation_id.clone(),
            message: request.message,
            stream: true,
        });
        let conversation_id = request.conversation_id;

        tokio::spawn(async move {
            debug!(%conversation_id, "opening chat stream");
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    debug!(%conversation_id, "chat stream cancelled");
                }
                _ = Self::run(http_request, ChunkSink::new(tx)) => {}
            }
        });

        Ok(ChunkStream::from_receiver(rx))
    }
}
