//! Shared data types for zoo
//!
//! This crate defines the values exchanged between the channel layer, the
//! core reducers and UI consumers:
//! - Presence snapshots and tracked metadata
//! - Channel subscription status
//! - Daily completion records and streaks

mod presence;
mod streak;

pub use presence::*;
pub use streak::*;
