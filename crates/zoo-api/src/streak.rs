//! Daily completion records and streak results

use serde::{Deserialize, Serialize};

/// One day's completion record, as supplied by the caller
///
/// `date` is kept as the raw `YYYY-MM-DD` string; records whose date does not
/// parse are dropped by the streak calculator rather than rejected here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayCompletionSummary {
    pub date: String,
    #[serde(flatten)]
    pub measure: DayMeasure,
}

impl DayCompletionSummary {
    pub fn misses(date: impl Into<String>, missing_blocks: u32) -> Self {
        Self {
            date: date.into(),
            measure: DayMeasure::Misses { missing_blocks },
        }
    }

    pub fn completion(date: impl Into<String>, completion_pct: f64) -> Self {
        Self {
            date: date.into(),
            measure: DayMeasure::Completion { completion_pct },
        }
    }
}

/// What a day's record measures; which one is meaningful depends on the
/// active streak policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DayMeasure {
    Misses {
        #[serde(rename = "missingBlocks")]
        missing_blocks: u32,
    },
    Completion {
        /// Fraction in `[0, 1]`
        #[serde(rename = "completionPct")]
        completion_pct: f64,
    },
}

impl DayMeasure {
    pub fn missing_blocks(&self) -> Option<u32> {
        match self {
            DayMeasure::Misses { missing_blocks } => Some(*missing_blocks),
            DayMeasure::Completion { .. } => None,
        }
    }

    pub fn completion_pct(&self) -> Option<f64> {
        match self {
            DayMeasure::Completion { completion_pct } => Some(*completion_pct),
            DayMeasure::Misses { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreakKind {
    Positive,
    Negative,
}

/// The current streak, anchored at the most recent valid day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStreak {
    pub kind: StreakKind,
    pub length: u32,
    pub misses_on_latest: u32,
}
