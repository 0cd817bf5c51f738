use crate::domain_model::*;
use crate::domain_port::{ChannelError, StoreError};

/// Per-user tracking session.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    /// Tracked, waiting for the channel to report a live connection.
    Connecting,
    Online,
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("presence channel unavailable: {0}")]
    ChannelUnavailable(String),
}

impl From<StoreError> for PresenceError {
    fn from(e: StoreError) -> Self {
        PresenceError::StoreUnavailable(e.to_string())
    }
}

impl From<ChannelError> for PresenceError {
    fn from(e: ChannelError) -> Self {
        PresenceError::ChannelUnavailable(e.to_string())
    }
}

#[async_trait::async_trait]
pub trait PresenceService: Send + Sync {
    /// Begins tracking `user`. No-op when the user is already tracked.
    async fn start(&self, user: &UserId) -> Result<(), PresenceError>;

    /// Explicit offline transition: listeners are dropped and the user is
    /// written offline with `lastSeen = now`.
    async fn stop(&self, user: &UserId) -> Result<(), PresenceError>;

    fn state(&self, user: &UserId) -> SessionState;

    /// Durable presence record, `None` if the user never went online.
    async fn presence_of(&self, user: &UserId) -> Result<Option<UserPresence>, PresenceError>;
}
