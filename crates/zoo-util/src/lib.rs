//! Shared utilities for zoo
//!
//! This crate provides:
//! - ID types (RoomKey, UserId, PresenceKey)
//! - Time utilities (mock-able wall clock, timestamp formatting)
//! - Error types
//! - Default paths for the configuration file

mod error;
mod ids;
mod paths;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
