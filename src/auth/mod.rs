//! Client for the authentication service plus session-token storage.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::api::{ApiError, LoginRequest, LoginResponse, User};
use crate::utils::url::construct_api_url;

pub mod token;

use self::token::{TokenProvider, TokenStoreError};

#[derive(Debug)]
pub enum AuthError {
    /// Credentials were rejected or the token has expired.
    Api(ApiError),
    /// The token could not be persisted or read back.
    Storage(TokenStoreError),
}

impl AuthError {
    pub fn requires_login(&self) -> bool {
        matches!(self, AuthError::Api(ApiError::Unauthorized))
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Api(err) => write!(f, "{err}"),
            AuthError::Storage(err) => write!(f, "Failed to access stored session: {err}"),
        }
    }
}

impl StdError for AuthError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AuthError::Api(err) => Some(err),
            AuthError::Storage(err) => Some(err),
        }
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        AuthError::Api(err)
    }
}

impl From<TokenStoreError> for AuthError {
    fn from(err: TokenStoreError) -> Self {
        AuthError::Storage(err)
    }
}

/// A signed-in identity. The user id keys every session cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn from_login(response: &LoginResponse, now: DateTime<Utc>) -> Self {
        let lifetime = chrono::Duration::seconds(response.expires_in.min(i64::MAX as u64) as i64);
        Self {
            user: response.user.clone(),
            expires_at: now + lifetime,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct AuthClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl AuthClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::Api(ApiError::Network(err.to_string())))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            tokens,
        })
    }

    /// Exchange credentials for an access token and store it.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let url = construct_api_url(&self.base_url, "auth/login");
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&LoginRequest {
                email: email.trim().to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .map_err(ApiError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body).into());
        }

        let login: LoginResponse = response.json().await.map_err(ApiError::from)?;
        self.tokens.set_token(&login.access_token)?;
        debug!(user_id = %login.user.id, "login succeeded");
        Ok(AuthSession::from_login(&login, Utc::now()))
    }

    /// Revoke the current token. The local token is cleared even when the
    /// backend call fails, so a broken network never leaves a stale login.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let token = self.tokens.get_token()?;
        let remote = match token {
            Some(token) => {
                let url = construct_api_url(&self.base_url, "auth/logout");
                self.client
                    .post(url)
                    .header("Authorization", format!("Bearer {token}"))
                    .send()
                    .await
                    .map_err(ApiError::from)
                    .and_then(|response| {
                        if response.status().is_success() || response.status().as_u16() == 401 {
                            Ok(())
                        } else {
                            Err(ApiError::from_status(response.status().as_u16(), ""))
                        }
                    })
            }
            None => Ok(()),
        };
        self.tokens.clear_token()?;
        remote.map_err(AuthError::from)
    }

    /// Ask the auth service whether the stored token is still accepted.
    pub async fn check_token(&self) -> Result<User, AuthError> {
        let Some(token) = self.tokens.get_token()? else {
            return Err(ApiError::Unauthorized.into());
        };
        let url = construct_api_url(&self.base_url, "users/me");
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await
            .map_err(ApiError::from)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body).into());
        }
        Ok(response.json().await.map_err(ApiError::from)?)
    }
}
