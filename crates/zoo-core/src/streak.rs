//! Streak calculation over daily completion records
//!
//! Records arrive unordered. Each parsable day is classified under the
//! configured [`StreakPolicy`], and the current streak is the run of
//! calendar-consecutive, same-classified days counted back from the most
//! recent one. There is no bound against the wall clock: future-dated
//! records are taken at face value.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use zoo_api::{DayCompletionSummary, DayMeasure, PlayerStreak, StreakKind};
use zoo_config::StreakPolicy;

/// A calendar day at UTC midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn utc_midnight(&self) -> DateTime<Utc> {
        self.0.and_time(NaiveTime::MIN).and_utc()
    }

    /// Whole calendar days from `earlier` to `self` (negative if `earlier` is later)
    pub fn days_since(&self, earlier: DayKey) -> i64 {
        (self.0 - earlier.0).num_days()
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Parse a `YYYY-MM-DD` string into a day.
///
/// Validation is structural only: month must be 1-12 and day 1-31. A day
/// past the end of its month rolls forward into the next month, so
/// `2024-04-31` is the same day as `2024-05-01`.
pub fn parse_day(date: &str) -> Option<DayKey> {
    let mut parts = date.split('-');
    let (year, month, day) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let year: i32 = parse_digits(year)?;
    let month: u32 = parse_digits(month)?;
    let day: u32 = parse_digits(day)?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    NaiveDate::from_ymd_opt(year, month, 1)?
        .checked_add_days(Days::new(u64::from(day - 1)))
        .map(DayKey)
}

fn parse_digits<T: FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Classify one day's record under `policy`.
///
/// A record carrying the other policy's measure never qualifies.
pub fn classify_day(policy: &StreakPolicy, measure: &DayMeasure) -> StreakKind {
    let qualifies = match policy {
        StreakPolicy::MissThreshold { max_misses } => measure
            .missing_blocks()
            .is_some_and(|missing| missing <= *max_misses),
        StreakPolicy::CompletionThreshold { min_completion } => measure
            .completion_pct()
            .is_some_and(|pct| pct >= *min_completion),
    };

    if qualifies {
        StreakKind::Positive
    } else {
        StreakKind::Negative
    }
}

/// Compute the current streak, or `None` if no record has a parsable date
/// (or, under the completion policy, if the latest day does not qualify).
pub fn calculate_streak(
    records: &[DayCompletionSummary],
    policy: &StreakPolicy,
) -> Option<PlayerStreak> {
    let mut days: Vec<(DayKey, &DayCompletionSummary)> = records
        .iter()
        .filter_map(|record| match parse_day(&record.date) {
            Some(day) => Some((day, record)),
            None => {
                debug!(date = %record.date, "Skipping record with unparsable date");
                None
            }
        })
        .collect();

    days.sort_by(|a, b| b.0.cmp(&a.0));

    let (_, latest) = days.first()?;
    let target = classify_day(policy, &latest.measure);

    let misses_on_latest = match policy {
        StreakPolicy::MissThreshold { .. } => latest.measure.missing_blocks().unwrap_or(0),
        StreakPolicy::CompletionThreshold { .. } => {
            if target != StreakKind::Positive {
                return None;
            }
            0
        }
    };

    let mut length = 0u32;
    let mut previous: Option<DayKey> = None;

    for (day, record) in &days {
        if classify_day(policy, &record.measure) != target {
            break;
        }
        // Exactly one day apart; duplicates (0) and gaps (>1) both end the run
        if let Some(prev) = previous
            && prev.days_since(*day) != 1
        {
            break;
        }

        length += 1;
        previous = Some(*day);
    }

    Some(PlayerStreak {
        kind: target,
        length,
        misses_on_latest,
    })
}

/// A streak calculator bound to one policy
#[derive(Debug, Clone, Copy, Default)]
pub struct StreakCalculator {
    policy: StreakPolicy,
}

impl StreakCalculator {
    pub fn new(policy: StreakPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &StreakPolicy {
        &self.policy
    }

    pub fn classify(&self, record: &DayCompletionSummary) -> StreakKind {
        classify_day(&self.policy, &record.measure)
    }

    pub fn calculate(&self, records: &[DayCompletionSummary]) -> Option<PlayerStreak> {
        calculate_streak(records, &self.policy)
    }
}
