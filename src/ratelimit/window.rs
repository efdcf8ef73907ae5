//! Time windows, period keys and the in-process burst window state.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// The windows a request is evaluated against, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    /// Trailing sub-minute window, always enforced
    Burst,
    /// UTC clock hour
    Hour,
    /// UTC calendar day
    Day,
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeWindow::Burst => write!(f, "burst"),
            TimeWindow::Hour => write!(f, "hourly"),
            TimeWindow::Day => write!(f, "daily"),
        }
    }
}

/// Identifies the bucket a persistent counter belongs to.
///
/// A new period naturally starts a fresh counter, so there is no explicit
/// reset operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeriodKey {
    /// A UTC calendar date
    Day(NaiveDate),
    /// The start of a UTC hour
    Hour(DateTime<Utc>),
}

impl PeriodKey {
    /// The daily period containing `now`.
    pub fn day(now: DateTime<Utc>) -> Self {
        PeriodKey::Day(now.date_naive())
    }

    /// The hourly period containing `now`.
    pub fn hour(now: DateTime<Utc>) -> Self {
        PeriodKey::Hour(start_of_hour(now))
    }

    /// When this period started.
    pub fn start(&self) -> DateTime<Utc> {
        match self {
            PeriodKey::Day(date) => start_of_day(*date),
            PeriodKey::Hour(start) => *start,
        }
    }

    /// When the next period starts.
    pub fn end(&self) -> DateTime<Utc> {
        match self {
            PeriodKey::Day(_) => self.start() + ChronoDuration::days(1),
            PeriodKey::Hour(start) => *start + ChronoDuration::hours(1),
        }
    }

    /// Compact string form used as a storage key.
    pub fn to_storage_key(&self) -> String {
        match self {
            PeriodKey::Day(date) => format!("d:{}", date.format("%Y-%m-%d")),
            PeriodKey::Hour(start) => format!("h:{}", start.format("%Y-%m-%dT%H")),
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

/// Midnight UTC at the start of `date`.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// The next UTC midnight strictly after `now`.
pub fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    PeriodKey::day(now).end()
}

fn start_of_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(ChronoDuration::hours(1)).unwrap_or(now)
}

/// Usage of one identity's burst window at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstUsage {
    /// Requests inside the trailing window
    pub count: u64,
    /// Timestamp of the oldest request still inside the window
    pub oldest: Option<DateTime<Utc>>,
}

impl BurstUsage {
    const EMPTY: BurstUsage = BurstUsage {
        count: 0,
        oldest: None,
    };

    /// When the oldest request leaves the window and frees a slot.
    pub fn frees_at(&self, window: ChronoDuration) -> Option<DateTime<Utc>> {
        self.oldest.map(|t| t + window)
    }
}

/// Sliding-window request log per identity.
///
/// Each identity keeps the timestamps of its admitted requests that are
/// still inside the trailing window. Entries at or before `now - window` are
/// dropped whenever the identity is touched.
#[derive(Debug, Default)]
pub struct BurstTracker {
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl BurstTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count requests inside the trailing window without recording one.
    pub fn usage(&self, key: &str, now: DateTime<Utc>, window: ChronoDuration) -> BurstUsage {
        match self.windows.get_mut(key) {
            Some(mut entries) => {
                prune(&mut entries, now, window);
                snapshot(&entries)
            }
            None => BurstUsage::EMPTY,
        }
    }

    /// Record an admitted request.
    pub fn record(&self, key: &str, now: DateTime<Utc>, window: ChronoDuration) -> BurstUsage {
        let mut entries = self.windows.entry(key.to_string()).or_default();
        prune(&mut entries, now, window);
        entries.push_back(now);
        snapshot(&entries)
    }

    /// Record a request only if the window has room for it.
    ///
    /// The check and the insert happen under the same shard lock, so
    /// concurrent callers for one identity can never overshoot `limit`.
    /// Returns the usage after the insert, or the blocking usage on refusal.
    pub fn try_acquire(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: ChronoDuration,
        limit: u64,
    ) -> std::result::Result<BurstUsage, BurstUsage> {
        let mut entries = self.windows.entry(key.to_string()).or_default();
        prune(&mut entries, now, window);
        if entries.len() as u64 >= limit {
            return Err(snapshot(&entries));
        }
        entries.push_back(now);
        Ok(snapshot(&entries))
    }

    /// Undo a reservation made by [`try_acquire`](Self::try_acquire).
    pub fn release(&self, key: &str, at: DateTime<Utc>) {
        if let Some(mut entries) = self.windows.get_mut(key) {
            if let Some(pos) = entries.iter().rposition(|t| *t == at) {
                entries.remove(pos);
            }
        }
    }

    /// Drop identities whose windows have fully drained.
    ///
    /// Returns the number of identities removed.
    pub fn prune_idle(&self, now: DateTime<Utc>, window: ChronoDuration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, entries| {
            prune(entries, now, window);
            !entries.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of identities with live burst state.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no identity has live burst state.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

fn prune(entries: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: ChronoDuration) {
    let cutoff = now - window;
    while entries.front().is_some_and(|t| *t <= cutoff) {
        entries.pop_front();
    }
}

fn snapshot(entries: &VecDeque<DateTime<Utc>>) -> BurstUsage {
    BurstUsage {
        count: entries.len() as u64,
        oldest: entries.front().copied(),
    }
}

/// How long denials are kept when no retention is given, in seconds.
pub const DEFAULT_DENIAL_RETENTION_SECS: i64 = 300;

/// Most denials kept per identity; older ones are dropped first.
pub const MAX_DENIALS_PER_KEY: usize = 1024;

/// Record of burst denials per identity, read by the alert sweep.
///
/// Each identity keeps at most [`MAX_DENIALS_PER_KEY`] entries, none older
/// than the retention, so a flooding caller cannot grow it without limit.
#[derive(Debug)]
pub struct DenialLog {
    denials: DashMap<String, VecDeque<DateTime<Utc>>>,
    retention: ChronoDuration,
}

impl Default for DenialLog {
    fn default() -> Self {
        Self::with_retention(ChronoDuration::seconds(DEFAULT_DENIAL_RETENTION_SECS))
    }
}

impl DenialLog {
    /// Create an empty log with the default retention.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log that forgets denials older than `retention`.
    pub fn with_retention(retention: ChronoDuration) -> Self {
        Self {
            denials: DashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> ChronoDuration {
        self.retention
    }

    /// Note a burst denial for `key`.
    pub fn record(&self, key: &str, at: DateTime<Utc>) {
        let mut entries = self.denials.entry(key.to_string()).or_default();
        let cutoff = at - self.retention;
        while entries.front().is_some_and(|t| *t < cutoff) {
            entries.pop_front();
        }
        if entries.len() >= MAX_DENIALS_PER_KEY {
            entries.pop_front();
        }
        entries.push_back(at);
    }

    /// Total entries held across all identities.
    pub fn len(&self) -> usize {
        self.denials.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.denials.is_empty()
    }

    /// Denials for `key` at or after `since`.
    pub fn count_since(&self, key: &str, since: DateTime<Utc>) -> usize {
        self.denials
            .get(key)
            .map(|entries| entries.iter().filter(|t| **t >= since).count())
            .unwrap_or(0)
    }

    /// All identities with at least one denial at or after `since`.
    pub fn counts_since(&self, since: DateTime<Utc>) -> Vec<(String, usize)> {
        self.denials
            .iter()
            .filter_map(|entry| {
                let count = entry.value().iter().filter(|t| **t >= since).count();
                (count > 0).then(|| (entry.key().clone(), count))
            })
            .collect()
    }

    /// Forget denials older than `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) {
        self.denials.retain(|_, entries| {
            while entries.front().is_some_and(|t| *t < cutoff) {
                entries.pop_front();
            }
            !entries.is_empty()
        });
    }
}
