//! Core logic for zoo
//!
//! This crate provides:
//! - Streak calculation over daily completion records
//! - An observable value store that drives channel lifetimes
//! - Room presence aggregation over the channel capability
//! - Per-player online/away/offline status

pub mod observable;
pub mod player;
pub mod presence;
pub mod streak;

pub use observable::{Readable, Setter, Subscription, Teardown};
pub use player::{
    ActivitySignal, PlayerPresenceTracker, Visibility, player_channel_name, player_status,
    watch_player_status,
};
pub use presence::{ANY_ROOM_LABEL, PresenceService, aggregate};
pub use streak::{DayKey, StreakCalculator, calculate_streak, classify_day, parse_day};
