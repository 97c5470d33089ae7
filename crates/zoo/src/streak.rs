//! `zoo streak`

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::path::Path;
use tracing::info;
use zoo_api::{DayCompletionSummary, PlayerStreak};
use zoo_config::StreakPolicy;
use zoo_core::StreakCalculator;

/// Policy override on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Positive when missed blocks stay within the threshold
    Miss,
    /// Positive when the completion fraction reaches the threshold
    Completion,
}

/// Resolve the effective policy, keeping configured thresholds when the
/// override names the configured kind
pub fn effective_policy(configured: StreakPolicy, arg: Option<PolicyArg>) -> StreakPolicy {
    match (arg, configured) {
        (None, policy) => policy,
        (Some(PolicyArg::Miss), policy @ StreakPolicy::MissThreshold { .. }) => policy,
        (Some(PolicyArg::Miss), _) => StreakPolicy::miss_threshold(),
        (Some(PolicyArg::Completion), policy @ StreakPolicy::CompletionThreshold { .. }) => policy,
        (Some(PolicyArg::Completion), _) => StreakPolicy::completion_threshold(),
    }
}

/// Read a JSON array of day records
pub fn load_records(path: &Path) -> Result<Vec<DayCompletionSummary>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read records from {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid records in {:?}", path))
}

pub fn run(path: &Path, policy: StreakPolicy) -> Result<Option<PlayerStreak>> {
    let records = load_records(path)?;
    let streak = StreakCalculator::new(policy).calculate(&records);

    info!(
        records = records.len(),
        policy = %policy,
        streak = ?streak,
        "Streak calculated"
    );
    Ok(streak)
}
