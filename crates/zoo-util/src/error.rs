//! Error types for zoo

use thiserror::Error;

use crate::RoomKey;

/// Core error type for zoo operations
#[derive(Debug, Error)]
pub enum ZooError {
    #[error("Room not open: {0}")]
    RoomNotOpen(RoomKey),

    #[error("Presence service is shut down")]
    ServiceShutDown,
}

pub type Result<T> = std::result::Result<T, ZooError>;
