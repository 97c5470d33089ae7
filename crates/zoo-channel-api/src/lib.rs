//! Channel capability interfaces for zoo
//!
//! This crate defines the boundary between the presence core and whatever
//! pub/sub transport carries presence. It contains no transport code itself;
//! `MockChannelClient` is an in-process stand-in for tests and replays.

mod mock;
mod traits;

pub use mock::*;
pub use traits::*;
