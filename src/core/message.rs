use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::HistoryTurn;

/// Prefix carried by every locally generated message id.
pub const TEMP_ID_PREFIX: &str = "temp-";
const TEMP_USER_PREFIX: &str = "temp-user-";
const TEMP_ASSISTANT_PREFIX: &str = "temp-ai-";

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    // Declaration order is the tie-break order for equal timestamps.
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Backend turn this message was expanded from.
    pub turn_id: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub sources_count: Option<u32>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub regenerated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            timestamp,
            metadata: None,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }

    /// True for optimistic messages that the backend has never seen.
    pub fn is_temporary(&self) -> bool {
        is_temporary_id(&self.id)
    }

    /// Identifier the backend expects for edit/regenerate calls.
    pub fn backend_id(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.turn_id.as_deref())
            .unwrap_or(&self.id)
    }

    /// Whether two messages say the same thing, ignoring surrounding whitespace.
    pub fn same_content(&self, other: &Message) -> bool {
        self.role == other.role && self.content.trim() == other.content.trim()
    }
}

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Build the id pair for an optimistic send: `temp-user-…` and `temp-ai-…`.
pub fn temp_id_pair(now: DateTime<Utc>) -> (String, String) {
    let seq = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let stamp = now.timestamp_millis();
    (
        format!("{TEMP_USER_PREFIX}{stamp}-{seq}"),
        format!("{TEMP_ASSISTANT_PREFIX}{stamp}-{seq}"),
    )
}

/// Expand one backend turn into its user and assistant messages.
pub fn expand_turn(conversation_id: &str, turn: &HistoryTurn) -> [Message; 2] {
    let mut user = Message::new(
        format!("{}-user", turn.turn_id),
        conversation_id,
        Role::User,
        turn.user_message.clone(),
        turn.timestamp,
    );
    user.metadata = Some(MessageMetadata {
        turn_id: Some(turn.turn_id.clone()),
        ..MessageMetadata::default()
    });

    let mut assistant = Message::new(
        format!("{}-assistant", turn.turn_id),
        conversation_id,
        Role::Assistant,
        turn.assistant_response.clone(),
        turn.timestamp,
    );
    assistant.metadata = Some(MessageMetadata {
        turn_id: Some(turn.turn_id.clone()),
        processing_time_ms: Some(turn.response_time_ms),
        sources_count: Some(turn.sources_count),
        tools_used: turn.tools_used.clone(),
        ..MessageMetadata::default()
    });

    [user, assistant]
}

pub fn expand_history(conversation_id: &str, turns: &[HistoryTurn]) -> Vec<Message> {
    turns
        .iter()
        .flat_map(|turn| expand_turn(conversation_id, turn))
        .collect()
}
