//! Validated settings structures

use crate::schema::{RawConfig, RawPresenceConfig, RawStreakConfig};
use crate::validation::{COMPLETION_THRESHOLD, parse_pool, parse_release, parse_unique};
use std::fmt;
use zoo_util::{PresenceKey, RoomKey};

/// Default highest miss count for a positive day
pub const DEFAULT_MAX_MISSES: u32 = 2;

/// Default lowest completion fraction for a qualifying day
pub const DEFAULT_MIN_COMPLETION: f64 = 0.75;

/// Default room of the global presence pool
pub const DEFAULT_GLOBAL_ROOM: &str = "__global__";

/// Validated settings ready for use by the core
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub streak: StreakPolicy,
    pub presence: PresenceSettings,
}

impl Settings {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            streak: StreakPolicy::from_raw(raw.streak),
            presence: PresenceSettings::from_raw(raw.presence),
        }
    }
}

/// How a day's record is classified for streaks
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreakPolicy {
    /// Positive iff `missing_blocks <= max_misses`; otherwise negative
    MissThreshold { max_misses: u32 },

    /// Qualifies iff `completion_pct >= min_completion`. Only positive streaks
    /// exist; a non-qualifying latest day means no streak.
    CompletionThreshold { min_completion: f64 },
}

impl StreakPolicy {
    fn from_raw(raw: RawStreakConfig) -> Self {
        match raw.policy.as_deref() {
            Some(COMPLETION_THRESHOLD) => StreakPolicy::CompletionThreshold {
                min_completion: raw.min_completion.unwrap_or(DEFAULT_MIN_COMPLETION),
            },
            _ => StreakPolicy::MissThreshold {
                max_misses: raw.max_misses.unwrap_or(DEFAULT_MAX_MISSES),
            },
        }
    }

    pub fn miss_threshold() -> Self {
        StreakPolicy::MissThreshold {
            max_misses: DEFAULT_MAX_MISSES,
        }
    }

    pub fn completion_threshold() -> Self {
        StreakPolicy::CompletionThreshold {
            min_completion: DEFAULT_MIN_COMPLETION,
        }
    }
}

impl Default for StreakPolicy {
    fn default() -> Self {
        Self::miss_threshold()
    }
}

impl fmt::Display for StreakPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreakPolicy::MissThreshold { max_misses } => {
                write!(f, "miss_threshold (max_misses = {})", max_misses)
            }
            StreakPolicy::CompletionThreshold { min_completion } => {
                write!(f, "completion_threshold (min_completion = {})", min_completion)
            }
        }
    }
}

/// How `unique` is computed from a room's presence state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UniquePolicy {
    /// Every tracked connection counts; `unique == tabs`
    #[default]
    PerConnection,

    /// Distinct non-null `user_id` values
    DistinctUser,
}

/// When a room's channel is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// Untrack and unsubscribe when the last observer leaves
    #[default]
    RefCounted,

    /// Keep the channel until the service shuts down
    KeepAlive,
}

/// Which channel a per-room presence request uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// Every room request shares the global room
    #[default]
    Global,

    /// Each room gets its own channel
    PerRoom,
}

/// Presence service settings
#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub unique: UniquePolicy,
    pub release: ReleasePolicy,
    pub pool: PoolMode,
    pub global_room: RoomKey,
    /// Fixed key; `None` means generate one per process
    pub session_key: Option<PresenceKey>,
}

impl PresenceSettings {
    fn from_raw(raw: RawPresenceConfig) -> Self {
        let defaults = Self::default();

        Self {
            unique: raw
                .unique
                .as_deref()
                .and_then(|s| parse_unique(s).ok())
                .unwrap_or(defaults.unique),
            release: raw
                .release
                .as_deref()
                .and_then(|s| parse_release(s).ok())
                .unwrap_or(defaults.release),
            pool: raw
                .pool
                .as_deref()
                .and_then(|s| parse_pool(s).ok())
                .unwrap_or(defaults.pool),
            global_room: raw.global_room.map(RoomKey::new).unwrap_or(defaults.global_room),
            session_key: raw.session_key.map(PresenceKey::new),
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            unique: UniquePolicy::default(),
            release: ReleasePolicy::default(),
            pool: PoolMode::default(),
            global_room: RoomKey::new(DEFAULT_GLOBAL_ROOM),
            session_key: None,
        }
    }
}
