//! Configuration validation

use crate::policy::{PoolMode, ReleasePolicy, UniquePolicy};
use crate::schema::{RawConfig, RawPresenceConfig, RawStreakConfig};
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Unknown streak policy '{0}' (expected miss_threshold or completion_threshold)")]
    UnknownStreakPolicy(String),

    #[error("min_completion {0} must be within [0, 1]")]
    CompletionOutOfRange(f64),

    #[error("Unknown unique counting '{0}' (expected per_connection or distinct_user)")]
    UnknownUniquePolicy(String),

    #[error("Unknown release policy '{0}' (expected ref_counted or keep_alive)")]
    UnknownReleasePolicy(String),

    #[error("Unknown presence pool '{0}' (expected global or per_room)")]
    UnknownPoolMode(String),

    #[error("{0} cannot be empty")]
    EmptyValue(&'static str),
}

/// Streak policy names accepted in `[streak] policy`
pub const MISS_THRESHOLD: &str = "miss_threshold";
pub const COMPLETION_THRESHOLD: &str = "completion_threshold";

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = validate_streak(&config.streak);
    errors.extend(validate_presence(&config.presence));
    errors
}

fn validate_streak(streak: &RawStreakConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(policy) = &streak.policy
        && policy != MISS_THRESHOLD
        && policy != COMPLETION_THRESHOLD
    {
        errors.push(ValidationError::UnknownStreakPolicy(policy.clone()));
    }

    // NaN fails the range check too
    if let Some(min) = streak.min_completion
        && !(0.0..=1.0).contains(&min)
    {
        errors.push(ValidationError::CompletionOutOfRange(min));
    }

    errors
}

fn validate_presence(presence: &RawPresenceConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(unique) = &presence.unique
        && let Err(e) = parse_unique(unique)
    {
        errors.push(e);
    }

    if let Some(release) = &presence.release
        && let Err(e) = parse_release(release)
    {
        errors.push(e);
    }

    if let Some(pool) = &presence.pool
        && let Err(e) = parse_pool(pool)
    {
        errors.push(e);
    }

    if presence.global_room.as_deref().is_some_and(|r| r.trim().is_empty()) {
        errors.push(ValidationError::EmptyValue("presence.global_room"));
    }

    if presence.session_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
        errors.push(ValidationError::EmptyValue("presence.session_key"));
    }

    errors
}

/// Parse `[presence] unique`
pub fn parse_unique(s: &str) -> Result<UniquePolicy, ValidationError> {
    match s {
        "per_connection" => Ok(UniquePolicy::PerConnection),
        "distinct_user" => Ok(UniquePolicy::DistinctUser),
        other => Err(ValidationError::UnknownUniquePolicy(other.to_string())),
    }
}

/// Parse `[presence] release`
pub fn parse_release(s: &str) -> Result<ReleasePolicy, ValidationError> {
    match s {
        "ref_counted" => Ok(ReleasePolicy::RefCounted),
        "keep_alive" => Ok(ReleasePolicy::KeepAlive),
        other => Err(ValidationError::UnknownReleasePolicy(other.to_string())),
    }
}

/// Parse `[presence] pool`
pub fn parse_pool(s: &str) -> Result<PoolMode, ValidationError> {
    match s {
        "global" => Ok(PoolMode::Global),
        "per_room" => Ok(PoolMode::PerRoom),
        other => Err(ValidationError::UnknownPoolMode(other.to_string())),
    }
}
