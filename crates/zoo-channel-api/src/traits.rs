//! Channel client traits

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use zoo_api::ChannelStatus;
use zoo_util::PresenceKey;

/// Errors from channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not subscribed: {0}")]
    NotSubscribed(String),

    #[error("Track rejected: {0}")]
    TrackRejected(String),

    #[error("Untrack rejected: {0}")]
    UntrackRejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Full presence state of a channel: presence key to the metadata tracked
/// under it, in tracking order. A key may carry several entries when more
/// than one session tracks under it.
pub type PresenceState = BTreeMap<String, Vec<serde_json::Value>>;

/// Total number of metadata entries across all keys
pub fn entry_count(state: &PresenceState) -> usize {
    state.values().map(Vec::len).sum()
}

/// Options for opening a channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Key this client tracks itself under
    pub presence_key: PresenceKey,
}

impl ChannelOptions {
    pub fn new(presence_key: PresenceKey) -> Self {
        Self { presence_key }
    }
}

/// Events delivered by a subscribed channel, in transport order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Subscription status changed
    Status(ChannelStatus),

    /// The presence state changed; read it with `presence_state()`
    PresenceSync,
}

/// Opens channels on a pub/sub transport
pub trait ChannelClient: Send + Sync {
    /// Open a channel handle; nothing is sent until `subscribe()`
    fn channel(&self, name: &str, options: ChannelOptions) -> Arc<dyn PresenceChannel>;
}

/// A single channel with presence support
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Channel topic name
    fn name(&self) -> &str;

    /// Key this handle tracks under
    fn presence_key(&self) -> &PresenceKey;

    /// Join the channel. Status changes and presence syncs arrive on the
    /// returned receiver; it closes when the channel is unsubscribed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent>;

    /// Track (or replace) this handle's presence metadata
    async fn track(&self, payload: serde_json::Value) -> ChannelResult<()>;

    /// Remove this handle's presence metadata
    async fn untrack(&self) -> ChannelResult<()>;

    /// Leave the channel
    async fn unsubscribe(&self) -> ChannelResult<()>;

    /// Current presence state as last synced
    fn presence_state(&self) -> PresenceState;
}
