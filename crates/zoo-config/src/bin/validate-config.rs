//! Config validation CLI tool
//!
//! Validates a zoo configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use zoo_config::{ConfigError, PoolMode, ReleasePolicy, UniquePolicy};
use zoo_util::default_config_path;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a zoo configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match zoo_config::load_config(&config_path) {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", zoo_config::CURRENT_CONFIG_VERSION);
            println!("  Streak policy:  {}", settings.streak);

            let unique = match settings.presence.unique {
                UniquePolicy::PerConnection => "per connection",
                UniquePolicy::DistinctUser => "distinct users",
            };
            let release = match settings.presence.release {
                ReleasePolicy::RefCounted => "when the last observer leaves",
                ReleasePolicy::KeepAlive => "at shutdown",
            };
            let pool = match settings.presence.pool {
                PoolMode::Global => "global",
                PoolMode::PerRoom => "per room",
            };

            println!("  Unique count:   {}", unique);
            println!("  Channel release: {}", release);
            println!("  Presence pool:  {} ({})", pool, settings.presence.global_room);
            match &settings.presence.session_key {
                Some(key) => println!("  Session key:    {}", key),
                None => println!("  Session key:    generated per process"),
            }

            ExitCode::SUCCESS
        }
        Err(ConfigError::ValidationFailed { errors }) => {
            eprintln!("✗ Configuration has {} error(s):", errors.len());
            for error in errors {
                eprintln!("  - {}", error);
            }
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            ExitCode::from(1)
        }
    }
}
