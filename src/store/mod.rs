//! Counter and usage persistence.
//!
//! Correctness under concurrency rests entirely on these traits: every
//! increment is a single atomic operation inside the store (an upsert with
//! server-side arithmetic), never a read followed by a write in the caller.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ratelimit::{Identity, PeriodKey};

/// How a recorded request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    /// Map a success flag to an outcome.
    pub fn from_success(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Error
        }
    }
}

/// Daily aggregate of requests for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsageRecord {
    /// Partition key of the identity
    pub identity: String,
    pub date: NaiveDate,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl QuotaUsageRecord {
    /// A zero-usage record, used when no row exists for a day.
    pub fn empty(identity: &str, date: NaiveDate) -> Self {
        Self {
            identity: identity.to_string(),
            date,
            request_count: 0,
            success_count: 0,
            error_count: 0,
        }
    }

    /// Parse the stored partition key back into an identity.
    pub fn parsed_identity(&self) -> Result<Identity> {
        self.identity.parse()
    }
}

/// Atomic per-period counters keyed by `(identity, period)`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `amount` and return the new count.
    ///
    /// Creates the counter on first use. Negative amounts are only used to
    /// roll back a reservation; the count never drops below zero.
    async fn increment_and_get(&self, identity: &str, period: PeriodKey, amount: i64)
        -> Result<u64>;

    /// Read the current count. Missing counters read as zero.
    async fn get_count(&self, identity: &str, period: PeriodKey) -> Result<u64>;

    /// Atomically add `amount` only if the result stays within `limit`.
    ///
    /// Returns the new count, or `None` if the increment was refused.
    async fn increment_if_below(
        &self,
        identity: &str,
        period: PeriodKey,
        amount: u64,
        limit: u64,
    ) -> Result<Option<u64>>;
}

/// Daily quota usage records keyed by `(identity, date)`.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Atomically count one request and its outcome.
    async fn record_usage(
        &self,
        identity: &str,
        date: NaiveDate,
        outcome: Outcome,
    ) -> Result<QuotaUsageRecord>;

    /// Atomically count one request only if `request_count` stays within `limit`.
    async fn reserve_request(&self, identity: &str, date: NaiveDate, limit: u64)
        -> Result<Option<u64>>;

    /// Undo a reservation made by [`reserve_request`](Self::reserve_request).
    async fn release_request(&self, identity: &str, date: NaiveDate) -> Result<()>;

    /// Count the outcome of a request whose slot was already reserved.
    async fn record_outcome(
        &self,
        identity: &str,
        date: NaiveDate,
        outcome: Outcome,
    ) -> Result<QuotaUsageRecord>;

    /// Usage for one day, if any request was recorded.
    async fn usage(&self, identity: &str, date: NaiveDate) -> Result<Option<QuotaUsageRecord>>;

    /// Usage rows between `from` and `to` inclusive, in any order.
    async fn usage_range(
        &self,
        identity: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<QuotaUsageRecord>>;

    /// Every identity's usage row for `date`.
    async fn active_usage(&self, date: NaiveDate) -> Result<Vec<QuotaUsageRecord>>;

    /// Delete counters and usage rows for periods before `date`.
    ///
    /// Returns the number of rows removed.
    async fn purge_before(&self, date: NaiveDate) -> Result<u64>;
}

/// A backend providing both counter families.
pub trait Store: CounterStore + UsageStore {}

impl<T: CounterStore + UsageStore> Store for T {}
