//! Wiring shared by every subcommand: configuration, stored credentials and
//! the HTTP clients built from them.

use std::error::Error;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::{HttpChatBackend, User};
use crate::auth::token::{KeyringTokenStore, TokenProvider};
use crate::auth::{AuthClient, AuthError};
use crate::core::cache::SessionCache;
use crate::core::chat_stream::HttpStreamTransport;
use crate::core::config::Config;
use crate::core::session::SessionController;

pub struct CliContext {
    pub config: Config,
    pub tokens: Arc<KeyringTokenStore>,
    pub auth: AuthClient,
    http: reqwest::Client,
}

impl CliContext {
    pub fn load() -> Result<Self, Box<dyn Error>> {
        let config = Config::load()?;
        let tokens = Arc::new(KeyringTokenStore::default());
        let provider: Arc<dyn TokenProvider> = tokens.clone();
        let auth = AuthClient::new(config.auth_api_url(), provider, config.request_timeout())?;
        // Streams can outlive any fixed request timeout, so only connecting is bounded.
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            config,
            tokens,
            auth,
            http,
        })
    }

    pub fn backend(&self) -> Result<Arc<HttpChatBackend>, Box<dyn Error>> {
        Ok(Arc::new(HttpChatBackend::new(
            self.config.chat_api_url(),
            self.config.api_key(),
            self.tokens.clone(),
            self.config.request_timeout(),
        )?))
    }

    pub fn transport(&self) -> Arc<HttpStreamTransport> {
        Arc::new(HttpStreamTransport::new(
            self.http.clone(),
            self.config.chat_api_url(),
            self.config.api_key(),
            self.tokens.clone(),
        ))
    }

    /// The signed-in user, confirmed with the auth service.
    pub async fn current_user(&self) -> Result<User, Box<dyn Error>> {
        match self.auth.check_token().await {
            Ok(user) => {
                if let Err(err) = self.tokens.store_user(&user) {
                    warn!(error = %err, "could not cache signed-in user");
                }
                Ok(user)
            }
            Err(err) if err.requires_login() => {
                Err("Not signed in or session expired. Run `syntra login` first.".into())
            }
            Err(AuthError::Api(err)) if err.is_retryable() => {
                // Offline: fall back to the last confirmed identity.
                match self.tokens.load_user()? {
                    Some(user) => {
                        debug!(error = %err, "auth service unreachable; using cached user");
                        Ok(user)
                    }
                    None => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn session(&self) -> Result<SessionController, Box<dyn Error>> {
        let user = self.current_user().await?;
        let cache = SessionCache::new(self.backend()?, user.id, self.config.cache_settings());
        Ok(SessionController::new(
            cache,
            self.transport(),
            self.config.session_settings(),
        ))
    }
}
