//! zoo - presence aggregation and streak tools
//!
//! Wires together:
//! - Configuration loading
//! - Streak calculation over a records file
//! - Presence replay against an in-process channel

mod replay;
mod streak;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zoo_config::{Settings, load_config, load_config_or_default};
use zoo_util::{ZOO_CONFIG_ENV, config_path_without_env};

use replay::{Published, Replay, load_script};
use streak::{PolicyArg, effective_policy};

/// zoo - presence aggregation and streak tools
#[derive(Parser, Debug)]
#[command(name = "zoo")]
#[command(about = "Presence aggregation and streak tools", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/zoo/config.toml)
    #[arg(short, long, env = ZOO_CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the current streak from a JSON array of day records
    Streak {
        /// Records file
        records: PathBuf,

        /// Override the configured streak policy
        #[arg(short, long, value_enum)]
        policy: Option<PolicyArg>,
    },

    /// Replay a presence script and print every published snapshot
    Replay {
        /// Script file
        script: PathBuf,

        /// Room for steps that do not name one
        #[arg(short, long)]
        room: Option<String>,
    },
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// An explicit path must exist; the default path may be absent
fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    match explicit {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path)),
        None => {
            let path = config_path_without_env();
            load_config_or_default(&path)
                .with_context(|| format!("Failed to load config from {:?}", path))
        }
    }
}

async fn run_replay(settings: Settings, script: &Path, room: Option<String>) -> Result<()> {
    let script = load_script(script)?;
    let mut replay = Replay::new(settings.presence, room);

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;

    let print = |published: &Published| println!("{}", published.to_json());

    info!(
        steps = script.steps.len(),
        session_key = %replay.service().session_key(),
        "Replay running"
    );

    let outcome = tokio::select! {
        result = replay.run(script.steps, print) => result,
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
            Ok(())
        }
    };

    for published in replay.finish().await {
        print(&published);
    }

    if let Err(e) = &outcome {
        warn!(error = %e, "Replay stopped early");
    }
    info!(channels = replay.mock().channels_opened(), "Replay finished");
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(version = env!("CARGO_PKG_VERSION"), "zoo starting");

    let settings = load_settings(args.config.as_deref())?;

    match args.command {
        Command::Streak { records, policy } => {
            let policy = effective_policy(settings.streak, policy);
            let streak = streak::run(&records, policy)?;
            println!("{}", serde_json::to_string_pretty(&streak)?);
        }
        Command::Replay { script, room } => {
            run_replay(settings, &script, room).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parse_streak_command() {
        let args = Args::try_parse_from(["zoo", "streak", "days.json", "--policy", "completion"])
            .unwrap();
        assert!(matches!(
            args.command,
            Command::Streak { policy: Some(PolicyArg::Completion), .. }
        ));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_settings(Some(dir.path().join("absent.toml").as_path())).is_err());
    }
}
