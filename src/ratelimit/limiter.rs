//! The window evaluator.
//!
//! Requests are checked against three windows in a fixed order, stopping at
//! the first violation: burst, then hourly, then daily. Burst comes first
//! because it is enforced even for tiers whose hourly and daily budgets are
//! unlimited.
//!
//! Two admission modes are supported:
//!
//! - [`AdmissionMode::Split`]: [`RateLimiter::check_rate_limit`] only reads;
//!   the caller records the request afterwards with
//!   [`RateLimiter::record_admission`]. Concurrent requests for one identity
//!   can each pass the check against the same snapshot, so a window may
//!   overshoot by at most the number of requests in flight.
//! - [`AdmissionMode::Strict`]: [`RateLimiter::admit`] reserves a slot in each
//!   window with a conditional atomic increment and rolls back earlier
//!   reservations when a later window refuses. No overshoot.
//!
//! Counter store failures never fail the request: the affected window is
//! skipped, a warning is logged and the decision is marked `degraded`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::decision::{DenialKind, RateLimitDecision, RateLimitError, Remaining, WindowDetail};
use super::identity::Identity;
use super::tiers::{Limit, Tier, TierLimitSet, TierTable};
use super::window::{next_midnight, BurstTracker, DenialLog, PeriodKey, TimeWindow};
use crate::clock::Clock;
use crate::error::{Result, TollgateError};
use crate::store::Store;

/// Default bound on a single counter store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// How checking and counting are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// Read-only check, then a separate record step
    #[default]
    Split,
    /// Atomic check-and-reserve per window
    Strict,
}

/// Accumulates per-window results while a request is being evaluated.
struct Evaluation {
    now: DateTime<Utc>,
    windows: Vec<WindowDetail>,
    remaining: Remaining,
    degraded: bool,
}

impl Evaluation {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            windows: Vec::with_capacity(3),
            remaining: Remaining::default(),
            degraded: false,
        }
    }

    fn pass(&mut self, window: TimeWindow, limit: Limit, used: u64, reset_at: DateTime<Utc>) {
        let remaining = limit.remaining_after(used.saturating_add(1));
        match window {
            TimeWindow::Burst => self.remaining.burst = remaining.unwrap_or(0),
            TimeWindow::Hour => self.remaining.hourly = remaining,
            TimeWindow::Day => self.remaining.daily = remaining,
        }
        self.windows.push(WindowDetail {
            window,
            limit,
            used,
            remaining,
            reset_at,
        });
    }

    fn allow(self) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            remaining: self.remaining,
            reset_time: next_midnight(self.now),
            retry_after: None,
            windows: self.windows,
            error: None,
            degraded: self.degraded,
        }
    }

    fn deny(
        mut self,
        kind: DenialKind,
        limit: u64,
        used: u64,
        reset_at: DateTime<Utc>,
        window_desc: &str,
    ) -> RateLimitDecision {
        let window = kind.window();
        match window {
            TimeWindow::Burst => self.remaining.burst = 0,
            TimeWindow::Hour => self.remaining.hourly = Some(0),
            TimeWindow::Day => self.remaining.daily = Some(0),
        }
        self.windows.push(WindowDetail {
            window,
            limit: Limit::Finite(limit),
            used,
            remaining: Some(0),
            reset_at,
        });

        RateLimitDecision {
            allowed: false,
            remaining: self.remaining,
            reset_time: next_midnight(self.now),
            retry_after: Some((reset_at - self.now).to_std().unwrap_or(Duration::ZERO)),
            windows: self.windows,
            error: Some(RateLimitError::new(kind, limit, window_desc)),
            degraded: self.degraded,
        }
    }
}

/// Evaluates identities against their tier's burst, hourly and daily limits.
///
/// Safe to share across tasks; all state lives in the store, the burst
/// tracker and the denial log, each of which is internally synchronized.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    tiers: TierTable,
    mode: AdmissionMode,
    store_timeout: Duration,
    burst: BurstTracker,
    denials: Arc<DenialLog>,
    /// Strict admissions whose daily slot could not be reserved, per identity
    unreserved: DashMap<String, u64>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tiers", &self.tiers)
            .field("mode", &self.mode)
            .field("store_timeout", &self.store_timeout)
            .field("burst_identities", &self.burst.len())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter in split mode with the default store timeout.
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, tiers: TierTable) -> Self {
        Self {
            store,
            clock,
            tiers,
            mode: AdmissionMode::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            burst: BurstTracker::new(),
            denials: Arc::new(DenialLog::new()),
            unreserved: DashMap::new(),
        }
    }

    /// Use a different admission mode.
    pub fn with_mode(mut self, mode: AdmissionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bound every store call by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Keep burst denials for `retention` (the alert sweep's lookback).
    pub fn with_denial_retention(mut self, retention: Duration) -> Self {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        self.denials = Arc::new(DenialLog::with_retention(retention));
        self
    }

    /// The configured admission mode.
    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    /// The tier lookup table.
    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Burst denials observed so far.
    pub fn denial_log(&self) -> Arc<DenialLog> {
        self.denials.clone()
    }

    /// Check an identity without counting the request.
    ///
    /// Evaluation is read-only; call [`record_admission`](Self::record_admission)
    /// once the request has been accepted for processing.
    pub async fn check_rate_limit(&self, identity: &Identity) -> RateLimitDecision {
        let now = self.clock.now();
        let limits = *self.tiers.limits(identity.tier());
        let key = identity.partition_key();
        let mut eval = Evaluation::new(now);

        trace!(identity = %key, tier = %identity.tier(), "Checking rate limit");

        // Burst
        let burst_window = limits.burst_window_chrono();
        let usage = self.burst.usage(&key, now, burst_window);
        let burst_reset = usage.frees_at(burst_window).unwrap_or(now + burst_window);
        if usage.count >= limits.burst {
            return self.deny_burst(eval, &key, &limits, usage.count, burst_reset);
        }
        eval.pass(TimeWindow::Burst, Limit::Finite(limits.burst), usage.count, burst_reset);

        // Hourly
        if let Limit::Finite(limit) = limits.hourly {
            let period = PeriodKey::hour(now);
            match self.bounded(self.store.get_count(&key, period)).await {
                Ok(used) if used >= limit => {
                    return self.deny(eval, &key, DenialKind::Hourly, limit, used, period.end(), "hour");
                }
                Ok(used) => eval.pass(TimeWindow::Hour, limits.hourly, used, period.end()),
                Err(e) => self.fail_open(&mut eval, &key, TimeWindow::Hour, &e),
            }
        }

        // Daily
        if let Limit::Finite(limit) = limits.daily {
            let period = PeriodKey::day(now);
            let read = self.store.usage(&key, now.date_naive());
            match self.bounded(read).await {
                Ok(record) => {
                    let used = record.map(|r| r.request_count).unwrap_or(0);
                    if used >= limit {
                        return self.deny(eval, &key, DenialKind::Daily, limit, used, period.end(), "day");
                    }
                    eval.pass(TimeWindow::Day, limits.daily, used, period.end());
                }
                Err(e) => self.fail_open(&mut eval, &key, TimeWindow::Day, &e),
            }
        }

        eval.allow()
    }

    /// Count an accepted request in the burst window and the hourly counter.
    ///
    /// Used in split mode after [`check_rate_limit`](Self::check_rate_limit)
    /// allowed the request. The daily counter lives in the usage record and
    /// is updated by the quota tracker.
    pub async fn record_admission(&self, identity: &Identity) -> Result<u64> {
        let now = self.clock.now();
        let limits = self.tiers.limits(identity.tier());
        let key = identity.partition_key();

        self.burst.record(&key, now, limits.burst_window_chrono());
        let hourly = self
            .bounded(self.store.increment_and_get(&key, PeriodKey::hour(now), 1))
            .await?;

        trace!(identity = %key, hourly = hourly, "Recorded admission");
        Ok(hourly)
    }

    /// Check and reserve in one step.
    ///
    /// Each window's slot is taken atomically; if a later window refuses,
    /// the earlier reservations are released so a denied request leaves no
    /// trace in the counters. The daily request count is reserved here, so
    /// only the outcome remains to be recorded afterwards.
    pub async fn admit(&self, identity: &Identity) -> RateLimitDecision {
        let now = self.clock.now();
        let limits = *self.tiers.limits(identity.tier());
        let key = identity.partition_key();
        let mut eval = Evaluation::new(now);

        // Burst
        let burst_window = limits.burst_window_chrono();
        match self.burst.try_acquire(&key, now, burst_window, limits.burst) {
            Ok(usage) => {
                let reset = usage.frees_at(burst_window).unwrap_or(now + burst_window);
                eval.pass(
                    TimeWindow::Burst,
                    Limit::Finite(limits.burst),
                    usage.count.saturating_sub(1),
                    reset,
                );
            }
            Err(usage) => {
                let reset = usage.frees_at(burst_window).unwrap_or(now + burst_window);
                return self.deny_burst(eval, &key, &limits, usage.count, reset);
            }
        }

        // Hourly
        let hour = PeriodKey::hour(now);
        let mut hour_reserved = false;
        match limits.hourly {
            Limit::Finite(limit) => {
                match self
                    .bounded(self.store.increment_if_below(&key, hour, 1, limit))
                    .await
                {
                    Ok(Some(count)) => {
                        hour_reserved = true;
                        eval.pass(TimeWindow::Hour, limits.hourly, count - 1, hour.end());
                    }
                    Ok(None) => {
                        self.burst.release(&key, now);
                        return self.deny(eval, &key, DenialKind::Hourly, limit, limit, hour.end(), "hour");
                    }
                    Err(e) => self.fail_open(&mut eval, &key, TimeWindow::Hour, &e),
                }
            }
            Limit::Unlimited => {
                match self.bounded(self.store.increment_and_get(&key, hour, 1)).await {
                    Ok(_) => hour_reserved = true,
                    Err(e) => self.fail_open(&mut eval, &key, TimeWindow::Hour, &e),
                }
            }
        }

        // Daily
        let day = PeriodKey::day(now);
        let ceiling = limits.daily.as_finite().unwrap_or(u64::MAX);
        match self
            .bounded(self.store.reserve_request(&key, now.date_naive(), ceiling))
            .await
        {
            Ok(Some(count)) => {
                if limits.daily.as_finite().is_some() {
                    eval.pass(TimeWindow::Day, limits.daily, count - 1, day.end());
                }
            }
            Ok(None) => {
                if hour_reserved {
                    if let Err(e) = self.bounded(self.store.increment_and_get(&key, hour, -1)).await {
                        warn!(identity = %key, error = %e, "Failed to release hourly reservation");
                    }
                }
                self.burst.release(&key, now);
                return self.deny(eval, &key, DenialKind::Daily, ceiling, ceiling, day.end(), "day");
            }
            Err(e) => {
                self.fail_open(&mut eval, &key, TimeWindow::Day, &e);
                *self.unreserved.entry(key.clone()).or_insert(0) += 1;
            }
        }

        eval.allow()
    }

    /// Claim one strict admission of `identity` that was let through without
    /// a daily reservation.
    ///
    /// Returns `true` when the request still has to be added to the daily
    /// request count when it completes.
    pub fn take_unreserved(&self, identity: &Identity) -> bool {
        let mut taken = false;
        self.unreserved.remove_if_mut(&identity.partition_key(), |_, pending| {
            taken = true;
            *pending -= 1;
            *pending == 0
        });
        taken
    }

    /// Drop burst state for identities that have been idle for a full window.
    pub fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let widest = [
            self.tiers.limits(Tier::Free).burst_window_chrono(),
            self.tiers.limits(Tier::ApiKey).burst_window_chrono(),
        ]
        .into_iter()
        .max()
        .unwrap_or_else(chrono::Duration::zero);

        self.denials.prune_before(now - self.denials.retention());
        let removed = self.burst.prune_idle(now, widest);
        if removed > 0 {
            debug!(removed = removed, "Pruned idle burst windows");
        }
        removed
    }

    fn deny_burst(
        &self,
        eval: Evaluation,
        key: &str,
        limits: &TierLimitSet,
        used: u64,
        reset_at: DateTime<Utc>,
    ) -> RateLimitDecision {
        self.denials.record(key, eval.now);
        let desc = format!("{}ms", limits.burst_window.as_millis());
        self.deny(eval, key, DenialKind::Burst, limits.burst, used, reset_at, &desc)
    }

    #[allow(clippy::too_many_arguments)]
    fn deny(
        &self,
        eval: Evaluation,
        key: &str,
        kind: DenialKind,
        limit: u64,
        used: u64,
        reset_at: DateTime<Utc>,
        window_desc: &str,
    ) -> RateLimitDecision {
        debug!(
            identity = %key,
            kind = kind.code(),
            limit = limit,
            used = used,
            "Rate limit exceeded"
        );
        eval.deny(kind, limit, used, reset_at, window_desc)
    }

    fn fail_open(&self, eval: &mut Evaluation, key: &str, window: TimeWindow, error: &TollgateError) {
        warn!(
            identity = %key,
            window = %window,
            error = %error,
            "Counter store unavailable, failing open"
        );
        eval.degraded = true;
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(TollgateError::StoreTimeout(self.store_timeout)),
        }
    }
}
