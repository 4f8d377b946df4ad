//! Wire payloads exchanged with the chat and authentication backends.
//!
//! Everything the backends return is decoded into these structs at the HTTP
//! boundary; nothing downstream inspects raw JSON.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub mod client;
pub mod error;

pub use client::{ChatBackend, HttpChatBackend};
pub use error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            "deleted" => Ok(ConversationStatus::Deleted),
            other => Err(format!("invalid conversation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationConfiguration {
    #[serde(default)]
    pub collection_names: Vec<String>,
    #[serde(default)]
    pub personality_type: String,
    #[serde(default)]
    pub role_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_role: Option<String>,
    #[serde(default)]
    pub communication_style: String,
    #[serde(default)]
    pub expertise_areas: Vec<String>,
    #[serde(default)]
    pub response_tone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub use_tools: bool,
    #[serde(default)]
    pub max_context_turns: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateConversationRequest {
    pub title: String,
    pub collection_names: Vec<String>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personality_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub communication_style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expertise_areas: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_tone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_tools: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConversationResponse {
    pub conversation_id: String,
    pub title: String,
    pub status: ConversationStatus,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    pub configuration: Option<ConversationConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: String,
    pub status: ConversationStatus,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub total_turns: u32,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub collection_names: Vec<String>,
    #[serde(default)]
    pub personality_type: String,
    #[serde(default)]
    pub role_type: String,
    pub topic_summary: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
    pub total_count: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub has_more: bool,
}

/// Query parameters accepted by the conversation listing endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ConversationFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

/// One persisted exchange: a user message and the assistant's reply.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryTurn {
    pub turn_id: String,
    pub user_message: String,
    pub assistant_response: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub response_time_ms: u64,
    #[serde(default)]
    pub sources_count: u32,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationHistory {
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    #[serde(default)]
    pub total_shown: u32,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationDetails {
    pub id: String,
    pub title: String,
    pub status: ConversationStatus,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
    pub configuration: ConversationConfiguration,
    #[serde(default)]
    pub message_count: u32,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatStreamRequest {
    pub conversation_id: String,
    pub message: String,
    pub stream: bool,
}

/// Body returned by the edit and regenerate endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user: User,
    pub access_token: String,
    pub expires_in: u64,
}

/// Accepts RFC 3339 timestamps as well as the naive ISO-8601 form some
/// backend endpoints emit; naive values are read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|_| format!("invalid timestamp: {raw}"))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => parse_timestamp(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
