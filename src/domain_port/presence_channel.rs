use crate::domain_model::{Timestamp, UserId};
use crate::domain_port::Subscription;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Value held under a user's status key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    /// Server time of the write.
    pub last_changed: Timestamp,
}

impl StatusSnapshot {
    pub fn is_online(&self) -> bool {
        self.state == ConnectionState::Online
    }
}

pub fn status_key(root: &str, user_id: &UserId) -> String {
    format!("{}/{}", root, user_id)
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("presence channel unavailable: {0}")]
    Unavailable(String),
    #[error("malformed value under {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Low-latency key/value channel with server-side disconnect detection.
/// Each instance is one client connection.
#[async_trait::async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Writes `state` under `key`, stamped with the channel's server time.
    async fn set_value(&self, key: &str, state: ConnectionState) -> Result<(), ChannelError>;

    /// Arms a write of `state` under `key` that the channel performs itself
    /// when this connection drops.
    async fn on_disconnect(&self, key: &str, state: ConnectionState) -> Result<(), ChannelError>;

    /// Current value (if any) followed by every change of `key`.
    async fn subscribe(&self, key: &str) -> Result<Subscription<StatusSnapshot>, ChannelError>;

    /// Current connection state followed by every transition.
    async fn subscribe_connection(&self) -> Result<Subscription<bool>, ChannelError>;
}
