use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    ApiError, ChatResponse, ConversationDetails, ConversationFilter, ConversationHistory,
    ConversationListResponse, ConversationStatus, CreateConversationRequest,
    CreateConversationResponse,
};
use crate::auth::token::TokenProvider;
use crate::utils::url::{construct_api_url, endpoint_path};

/// Operations the chat backend exposes to the client.
///
/// The session engine only talks to the backend through this trait so tests
/// can substitute an in-memory implementation.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<CreateConversationResponse, ApiError>;

    async fn list_conversations(
        &self,
        user_id: &str,
        filter: &ConversationFilter,
    ) -> Result<ConversationListResponse, ApiError>;

    async fn get_conversation_details(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<ConversationDetails, ApiError>;

    async fn get_conversation_history(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ConversationHistory, ApiError>;

    async fn update_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), ApiError>;

    async fn update_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<(), ApiError>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ApiError>;

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<ChatResponse, ApiError>;

    async fn regenerate_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<ChatResponse, ApiError>;
}

/// Attach the configured API key and the session bearer token, if any.
pub(crate) fn add_auth_headers(
    request: reqwest::RequestBuilder,
    api_key: Option<&str>,
    tokens: &dyn TokenProvider,
) -> reqwest::RequestBuilder {
    let mut request = request;
    if let Some(key) = api_key.filter(|key| !key.is_empty()) {
        request = request.header("x-api-key", key);
    }
    match tokens.get_token() {
        Ok(Some(token)) => request.header("Authorization", format!("Bearer {token}")),
        Ok(None) => request,
        Err(err) => {
            warn!(error = %err, "failed to read session token; sending request without it");
            request
        }
    }
}

#[derive(Clone)]
pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpChatBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        Ok(Self::with_client(client, base_url, api_key, tokens))
    }

    pub fn with_client(
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

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        let url = construct_api_url(&self.base_url, endpoint);
        let request = self
            .client
            .request(method, url)
            .header("Content-Type", "application/json");
        add_auth_headers(request, self.api_key.as_deref(), self.tokens.as_ref())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "chat backend returned an error status");
        Err(ApiError::from_status(status.as_u16(), &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<CreateConversationResponse, ApiError> {
        self.send_json(
            self.request(reqwest::Method::POST, "conversations")
                .json(request),
        )
        .await
    }

    async fn list_conversations(
        &self,
        user_id: &str,
        filter: &ConversationFilter,
    ) -> Result<ConversationListResponse, ApiError> {
        self.send_json(
            self.request(reqwest::Method::GET, "conversations")
                .query(&[("user_id", user_id)])
                .query(filter),
        )
        .await
    }

    async fn get_conversation_details(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<ConversationDetails, ApiError> {
        let endpoint = endpoint_path(&["conversations", conversation_id]);
        self.send_json(
            self.request(reqwest::Method::GET, &endpoint)
                .query(&[("user_id", user_id)]),
        )
        .await
    }

    async fn get_conversation_history(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ConversationHistory, ApiError> {
        let endpoint = endpoint_path(&["conversations", conversation_id, "history"]);
        self.send_json(
            self.request(reqwest::Method::GET, &endpoint)
                .query(&[("user_id", user_id)])
                .query(&[("limit", limit), ("offset", offset)]),
        )
        .await
    }

    async fn update_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), ApiError> {
        let endpoint = endpoint_path(&["conversations", conversation_id]);
        self.send(
            self.request(reqwest::Method::PUT, &endpoint)
                .json(&serde_json::json!({ "title": title })),
        )
        .await
        .map(|_| ())
    }

    async fn update_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<(), ApiError> {
        let endpoint = endpoint_path(&["conversations", conversation_id, "status"]);
        self.send(
            self.request(reqwest::Method::PUT, &endpoint)
                .json(&serde_json::json!({ "status": status })),
        )
        .await
        .map(|_| ())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ApiError> {
        let endpoint = endpoint_path(&["conversations", conversation_id]);
        self.send(self.request(reqwest::Method::DELETE, &endpoint))
            .await
            .map(|_| ())
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<ChatResponse, ApiError> {
        let endpoint = endpoint_path(&["conversations", conversation_id, "messages", message_id]);
        self.send_json(
            self.request(reqwest::Method::PUT, &endpoint)
                .json(&serde_json::json!({ "content": content })),
        )
        .await
    }

    async fn regenerate_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<ChatResponse, ApiError> {
        let endpoint = endpoint_path(&[
            "conversations",
            conversation_id,
            "messages",
            message_id,
            "regenerate",
        ]);
        self.send_json(self.request(reqwest::Method::POST, &endpoint))
            .await
    }
}
