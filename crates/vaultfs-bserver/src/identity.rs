//! Source of the caller's identity for session establishment.

use async_trait::async_trait;
use thiserror::Error;

use crate::block::UserId;

/// Failure to obtain the current identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// No user is logged in.
    #[error("not logged in")]
    NotLoggedIn,
    /// The identity provider could not be reached.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the current user id and session token. Consulted on every
/// session establishment, so a refreshed token is picked up on reconnect.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// The current user.
    async fn current_uid(&self) -> Result<UserId, IdentityError>;

    /// A token proving the current session.
    async fn current_token(&self) -> Result<String, IdentityError>;
}

/// A fixed identity.
#[derive(Debug, Clone)]
pub struct StaticSession {
    uid: UserId,
    token: String,
}

impl StaticSession {
    /// Identity `uid` with session token `token`.
    pub fn new(uid: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl SessionSource for StaticSession {
    async fn current_uid(&self) -> Result<UserId, IdentityError> {
        Ok(self.uid.clone())
    }

    async fn current_token(&self) -> Result<String, IdentityError> {
        Ok(self.token.clone())
    }
}
