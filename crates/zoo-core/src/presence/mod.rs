//! Room presence: channel lifecycle and aggregation

mod aggregate;
mod room;
mod service;

pub use aggregate::aggregate;
pub use service::{ANY_ROOM_LABEL, PresenceService};
