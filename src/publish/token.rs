//! Platform credentials.
//!
//! Token issuance and refresh happen outside this service; a `TokenProvider`
//! only hands out the current credentials.

use std::env;
use std::fmt;

use async_trait::async_trait;

use crate::error::PublishError;

/// Environment variable holding the Instagram business account id.
pub const INSTAGRAM_USER_ID_VAR: &str = "INSTAGRAM_USER_ID";
/// Environment variable holding the Graph API access token.
pub const INSTAGRAM_ACCESS_TOKEN_VAR: &str = "INSTAGRAM_ACCESS_TOKEN";

/// Credentials for the Instagram Graph API.
#[derive(Clone, PartialEq, Eq)]
pub struct InstagramCredentials {
    /// Instagram business account id.
    pub user_id: String,
    pub access_token: String,
}

impl fmt::Debug for InstagramCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstagramCredentials")
            .field("user_id", &self.user_id)
            .field("access_token", &"***")
            .finish()
    }
}

/// Source of platform credentials.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn credentials(&self) -> Result<InstagramCredentials, PublishError>;
}

/// Provider returning fixed credentials.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    credentials: InstagramCredentials,
}

impl StaticTokenProvider {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            credentials: InstagramCredentials {
                user_id: user_id.into(),
                access_token: access_token.into(),
            },
        }
    }

    /// Reads `INSTAGRAM_USER_ID` and `INSTAGRAM_ACCESS_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns `PublishError::MissingCredentials` if either is unset or blank.
    pub fn from_env() -> Result<Self, PublishError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the credentials through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PublishError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| PublishError::MissingCredentials(format!("{} is not set", key)))
        };

        Ok(Self::new(
            read(INSTAGRAM_USER_ID_VAR)?,
            read(INSTAGRAM_ACCESS_TOKEN_VAR)?,
        ))
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn credentials(&self) -> Result<InstagramCredentials, PublishError> {
        Ok(self.credentials.clone())
    }
}
