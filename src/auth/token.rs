use std::error::Error;
use std::fmt;
use std::sync::Mutex;

use keyring::Entry;

use crate::api::User;

const KEYRING_SERVICE: &str = "syntra";
const TOKEN_ENTRY: &str = "access-token";
const USER_ENTRY: &str = "user";

/// Describes failures when reading or writing the stored session token.
///
/// Recoverable errors indicate that the credential backend was temporarily
/// unavailable (a locked keychain, a missing secret service). Permanent
/// errors surface the underlying cause directly.
#[derive(Debug)]
pub enum TokenStoreError {
    Recoverable(keyring::Error),
    Permanent(keyring::Error),
    Corrupt(String),
}

impl TokenStoreError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TokenStoreError::Recoverable(_))
    }
}

impl From<keyring::Error> for TokenStoreError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                TokenStoreError::Recoverable(err)
            }
            other => TokenStoreError::Permanent(other),
        }
    }
}

impl fmt::Display for TokenStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenStoreError::Recoverable(err) | TokenStoreError::Permanent(err) => {
                write!(f, "{err}")
            }
            TokenStoreError::Corrupt(detail) => write!(f, "stored session is corrupt: {detail}"),
        }
    }
}

impl Error for TokenStoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TokenStoreError::Recoverable(err) | TokenStoreError::Permanent(err) => Some(err),
            TokenStoreError::Corrupt(_) => None,
        }
    }
}

/// Source of the bearer token attached to backend requests.
///
/// HTTP code depends only on this contract, never on where the token lives.
pub trait TokenProvider: Send + Sync {
    fn get_token(&self) -> Result<Option<String>, TokenStoreError>;
    fn set_token(&self, token: &str) -> Result<(), TokenStoreError>;
    fn clear_token(&self) -> Result<(), TokenStoreError>;
}

/// Process-local token holder, used by tests and one-shot commands.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }
}

impl TokenProvider for MemoryTokenStore {
    fn get_token(&self) -> Result<Option<String>, TokenStoreError> {
        Ok(self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn set_token(&self, token: &str) -> Result<(), TokenStoreError> {
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.to_string());
        Ok(())
    }

    fn clear_token(&self) -> Result<(), TokenStoreError> {
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

/// Token and signed-in user persisted in the platform keyring.
pub struct KeyringTokenStore {
    service: String,
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl KeyringTokenStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<Entry, TokenStoreError> {
        Ok(Entry::new(&self.service, name)?)
    }

    fn read(&self, name: &str) -> Result<Option<String>, TokenStoreError> {
        match self.entry(name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<(), TokenStoreError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn store_user(&self, user: &User) -> Result<(), TokenStoreError> {
        let encoded =
            serde_json::to_string(user).map_err(|err| TokenStoreError::Corrupt(err.to_string()))?;
        self.entry(USER_ENTRY)?.set_password(&encoded)?;
        Ok(())
    }

    pub fn load_user(&self) -> Result<Option<User>, TokenStoreError> {
        match self.read(USER_ENTRY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| TokenStoreError::Corrupt(err.to_string())),
            None => Ok(None),
        }
    }

    pub fn clear_user(&self) -> Result<(), TokenStoreError> {
        self.delete(USER_ENTRY)
    }
}

impl TokenProvider for KeyringTokenStore {
    fn get_token(&self) -> Result<Option<String>, TokenStoreError> {
        self.read(TOKEN_ENTRY)
    }

    fn set_token(&self, token: &str) -> Result<(), TokenStoreError> {
        self.entry(TOKEN_ENTRY)?.set_password(token)?;
        Ok(())
    }

    fn clear_token(&self) -> Result<(), TokenStoreError> {
        self.delete(TOKEN_ENTRY)
    }
}
