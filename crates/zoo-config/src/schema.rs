//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Streak classification settings
    #[serde(default)]
    pub streak: RawStreakConfig,

    /// Presence aggregation settings
    #[serde(default)]
    pub presence: RawPresenceConfig,
}

/// Streak settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawStreakConfig {
    /// "miss_threshold" (default) or "completion_threshold"
    pub policy: Option<String>,

    /// Highest missing-block count that still qualifies a day
    pub max_misses: Option<u32>,

    /// Lowest completion fraction that qualifies a day
    pub min_completion: Option<f64>,
}

/// Presence settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawPresenceConfig {
    /// "per_connection" (default) or "distinct_user"
    pub unique: Option<String>,

    /// "ref_counted" (default) or "keep_alive"
    pub release: Option<String>,

    /// "global" (default) or "per_room"
    pub pool: Option<String>,

    /// Room used for the global pool (default: "__global__")
    pub global_room: Option<String>,

    /// Fixed presence key for this process; generated when absent
    pub session_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
            config_version = 1

            [streak]
            policy = "completion_threshold"
            min_completion = 0.8

            [presence]
            unique = "distinct_user"
            release = "keep_alive"
            pool = "per_room"
            global_room = "lobby"
            session_key = "tab-1"
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.streak.policy.as_deref(), Some("completion_threshold"));
        assert_eq!(config.streak.min_completion, Some(0.8));
        assert_eq!(config.presence.unique.as_deref(), Some("distinct_user"));
        assert_eq!(config.presence.session_key.as_deref(), Some("tab-1"));
    }

    #[test]
    fn sections_are_optional() {
        let config: RawConfig = toml::from_str("config_version = 1").unwrap();
        assert!(config.streak.policy.is_none());
        assert!(config.presence.pool.is_none());
    }
}
