//! Picks the next date window to fetch for each source/account.
//!
//! All arithmetic is on calendar days. "Yesterday" is the newest day a
//! window may reach; banks rarely expose complete same-day data.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::history::{CorruptRecord, HistoryStore};

/// How the next window is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Always the last `lookback` days up to yesterday.
    #[default]
    DaysAgo,
    /// Continue from the last recorded fetch.
    SinceLastDownload,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::DaysAgo => "days-ago",
            Strategy::SinceLastDownload => "since-last-download",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "days-ago" => Ok(Strategy::DaysAgo),
            "since-last-download" => Ok(Strategy::SinceLastDownload),
            other => Err(format!(
                "unknown strategy {other:?}; expected days-ago or since-last-download"
            )),
        }
    }
}

/// Inclusive calendar-day range to request from a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    /// Length in days between the bounds.
    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not enough whole days have passed since the last fetch.
    TooRecent {
        last_fetched: NaiveDate,
        yesterday: NaiveDate,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooRecent {
                last_fetched,
                yesterday,
            } => write!(
                f,
                "already fetched through {last_fetched}; nothing new before {yesterday}"
            ),
        }
    }
}

/// Outcome of scheduling one source/account. Skipping is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    Fetch(DateWindow),
    Skip(SkipReason),
}

impl ScheduleDecision {
    pub fn window(&self) -> Option<DateWindow> {
        match self {
            ScheduleDecision::Fetch(window) => Some(*window),
            ScheduleDecision::Skip(_) => None,
        }
    }
}

/// Threshold for the since-last-download skip rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipPolicy {
    /// Minimum whole days between the last fetched day and yesterday
    /// before a new window is produced. Values below 1 are treated as 1.
    pub min_gap_days: u32,
}

impl Default for SkipPolicy {
    fn default() -> Self {
        Self { min_gap_days: 1 }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error(transparent)]
    Corrupt(#[from] CorruptRecord),
}

/// Pure scheduling rule.
///
/// - `days-ago`: `[yesterday - lookback, yesterday]`.
/// - `since-last-download`: `[last, min(last + lookback, yesterday)]`, or
///   the `days-ago` window when there is no history. Skips when fewer
///   than `policy.min_gap_days` days separate `last` from yesterday.
pub fn plan(
    today: NaiveDate,
    last_fetched: Option<NaiveDate>,
    lookback_days: u32,
    strategy: Strategy,
    policy: SkipPolicy,
) -> ScheduleDecision {
    let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    let lookback = Days::new(u64::from(lookback_days));

    let days_ago = || {
        let from = yesterday.checked_sub_days(lookback).unwrap_or(NaiveDate::MIN);
        ScheduleDecision::Fetch(DateWindow::new(from, yesterday))
    };

    let last = match (strategy, last_fetched) {
        (Strategy::DaysAgo, _) | (Strategy::SinceLastDownload, None) => return days_ago(),
        (Strategy::SinceLastDownload, Some(last)) => last,
    };

    let gap = (yesterday - last).num_days();
    if gap < i64::from(policy.min_gap_days.max(1)) {
        return ScheduleDecision::Skip(SkipReason::TooRecent {
            last_fetched: last,
            yesterday,
        });
    }

    let to = last
        .checked_add_days(lookback)
        .map(|to| to.min(yesterday))
        .unwrap_or(yesterday);
    ScheduleDecision::Fetch(DateWindow::new(last, to))
}

/// Schedules against a [`HistoryStore`] using an injectable clock.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    policy: SkipPolicy,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            policy: SkipPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SkipPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> SkipPolicy {
        self.policy
    }

    /// Next window for one source/account.
    ///
    /// The clock is read once, so a single call is internally consistent
    /// even across midnight.
    pub fn next_window(
        &self,
        history: &HistoryStore,
        source: &str,
        account_number: &str,
        lookback_days: u32,
        strategy: Strategy,
    ) -> Result<ScheduleDecision, ScheduleError> {
        let today = self.clock.today();

        let last_fetched = match strategy {
            Strategy::DaysAgo => None,
            Strategy::SinceLastDownload => history
                .latest(source, account_number)?
                .map(|event| event.fetched_through),
        };
        if strategy == Strategy::SinceLastDownload && last_fetched.is_none() {
            tracing::debug!(source, account = account_number, "No history; using days-ago window");
        }

        Ok(plan(
            today,
            last_fetched,
            lookback_days,
            strategy,
            self.policy,
        ))
    }
}
