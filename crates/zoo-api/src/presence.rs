//! Presence types

use serde::{Deserialize, Serialize};
use std::fmt;
use zoo_util::UserId;

/// Aggregated presence for one room, as published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    /// Tracked connections across all presence keys
    pub tabs: usize,
    /// Logical users; equals `tabs` unless distinct-user counting is active
    pub unique: usize,
    /// Whether the channel has reached `SUBSCRIBED` with no terminal status since
    pub connected: bool,
}

impl PresenceSnapshot {
    /// The value published before subscription and after any terminal status
    pub const fn disconnected() -> Self {
        Self {
            tabs: 0,
            unique: 0,
            connected: false,
        }
    }
}

/// Metadata tracked by each session in a room channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: Option<UserId>,
    pub room: String,
    /// Milliseconds since the Unix epoch
    pub ts: i64,
}

/// Metadata tracked by a player's own tabs in `presence:player:{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerPresenceMeta {
    pub user_id: UserId,
    /// Whether the tracking tab is currently visible
    pub active: bool,
    /// Milliseconds since the Unix epoch
    pub updated_at: i64,
}

/// Tri-state status of a single player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Online,
    Away,
    #[default]
    Offline,
}

/// Subscription status of a channel
///
/// The transport reports `Subscribed`, `Closed`, `ChannelError` and
/// `TimedOut`; `Unsubscribed` and `Subscribing` are local states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
}

impl ChannelStatus {
    /// Terminal statuses reset the published snapshot
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelStatus::Closed | ChannelStatus::ChannelError | ChannelStatus::TimedOut
        )
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelStatus::Unsubscribed => "UNSUBSCRIBED",
            ChannelStatus::Subscribing => "SUBSCRIBING",
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::Closed => "CLOSED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}
