//! Presence state to snapshot reduction

use serde_json::Value;
use std::collections::HashSet;
use zoo_api::PresenceSnapshot;
use zoo_channel_api::{PresenceState, entry_count};
use zoo_config::UniquePolicy;

/// Reduce a channel's presence state to a snapshot.
///
/// `tabs` counts every metadata entry, including malformed ones. `unique`
/// follows `policy`.
pub fn aggregate(state: &PresenceState, policy: UniquePolicy, connected: bool) -> PresenceSnapshot {
    let tabs = entry_count(state);
    let unique = match policy {
        UniquePolicy::PerConnection => tabs,
        UniquePolicy::DistinctUser => distinct_users(state),
    };

    PresenceSnapshot {
        tabs,
        unique,
        connected,
    }
}

fn distinct_users(state: &PresenceState) -> usize {
    state
        .values()
        .flatten()
        .filter_map(|meta| meta.get("user_id").and_then(Value::as_str))
        .collect::<HashSet<_>>()
        .len()
}
