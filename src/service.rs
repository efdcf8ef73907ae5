//! The caller-facing admission-control service.
//!
//! [`Tollgate`] wires the evaluator, quota tracker, alert engine and
//! recommendations to one counter store and clock. A request path calls
//! [`Tollgate::check_rate_limit`] before doing work and
//! [`Tollgate::record_request`] once the work has been accepted.

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{Alert, AlertEngine, AlertScheduler};
use crate::clock::{Clock, SystemClock};
use crate::config::{StoreBackend, TollgateConfig};
use crate::error::{Result, TollgateError};
use crate::quota::{QuotaStatus, QuotaTracker};
use crate::ratelimit::{AdmissionMode, Identity, RateLimitDecision, RateLimiter};
use crate::recommend::{recommend_for, Recommendation};
use crate::store::{MemoryStore, QuotaUsageRecord, Store};

/// Admission control for one deployment.
#[derive(Clone)]
pub struct Tollgate {
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
    quota: QuotaTracker,
    alerts: Arc<AlertEngine>,
}

impl std::fmt::Debug for Tollgate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tollgate")
            .field("limiter", &self.limiter)
            .field("alerts", &self.alerts)
            .finish()
    }
}

impl Tollgate {
    /// Build a service over an existing store and clock.
    pub fn new(config: &TollgateConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let tiers = config.tier_table()?;

        let limiter = Arc::new(
            RateLimiter::new(store.clone(), clock.clone(), tiers)
                .with_mode(config.admission.mode)
                .with_store_timeout(config.admission.store_timeout())
                .with_denial_retention(config.alerts.sweep_interval()),
        );
        let quota = QuotaTracker::new(store.clone(), clock.clone(), tiers);
        let alerts = Arc::new(AlertEngine::new(
            store.clone(),
            clock,
            tiers,
            limiter.denial_log(),
            config.alerts.clone(),
        ));

        Ok(Self {
            store,
            limiter,
            quota,
            alerts,
        })
    }

    /// Open the configured store and build a service on the system clock.
    pub async fn connect(config: &TollgateConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            #[cfg(feature = "postgres")]
            StoreBackend::Postgres => {
                let url = config.store.url.as_deref().ok_or_else(|| {
                    TollgateError::Config("store.url is required for the postgres backend".into())
                })?;
                Arc::new(crate::store::PgStore::connect(url, config.store.max_connections).await?)
            }
            #[cfg(not(feature = "postgres"))]
            StoreBackend::Postgres => {
                return Err(TollgateError::Config(
                    "postgres backend requires the `postgres` feature".into(),
                ));
            }
        };

        info!(
            backend = ?config.store.backend,
            mode = ?config.admission.mode,
            "Tollgate initialized"
        );
        Self::new(config, store, Arc::new(SystemClock))
    }

    /// Pick the identity for a request.
    ///
    /// An API key takes precedence over the source address. A supplied but
    /// malformed value is rejected rather than falling back.
    pub fn resolve_identity(api_key: Option<&str>, source_ip: Option<&str>) -> Result<Identity> {
        match (api_key, source_ip) {
            (Some(key), _) => Identity::api_key(key),
            (None, Some(ip)) => Identity::from_ip_str(ip),
            (None, None) => Err(TollgateError::InvalidIdentity(
                "request carries neither an API key nor a source address".into(),
            )),
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// In strict mode this also reserves the request's slot in every window.
    pub async fn check_rate_limit(&self, identity: &Identity) -> RateLimitDecision {
        match self.limiter.mode() {
            AdmissionMode::Split => self.limiter.check_rate_limit(identity).await,
            AdmissionMode::Strict => self.limiter.admit(identity).await,
        }
    }

    /// Count a request that was accepted for processing.
    ///
    /// Store failures are logged and swallowed so the request path is never
    /// failed by bookkeeping.
    pub async fn record_request(&self, identity: &Identity, success: bool) {
        match self.limiter.mode() {
            AdmissionMode::Split => {
                if let Err(e) = self.limiter.record_admission(identity).await {
                    warn!(identity = %identity, error = %e, "Failed to record admission");
                }
                let today = self.quota.today();
                if let Err(e) = self.quota.record_request(identity, today, success).await {
                    warn!(identity = %identity, error = %e, "Failed to record request");
                }
            }
            AdmissionMode::Strict => self.complete(identity, success).await,
        }
    }

    /// Record the outcome of a request admitted in strict mode.
    ///
    /// The request itself was already counted by its reservation, unless
    /// the store was unreachable at admission; then it is counted here.
    pub async fn complete(&self, identity: &Identity, success: bool) {
        let today = self.quota.today();
        let result = if self.limiter.take_unreserved(identity) {
            self.quota.record_request(identity, today, success).await
        } else {
            self.quota.record_outcome(identity, today, success).await
        };
        if let Err(e) = result {
            warn!(identity = %identity, error = %e, "Failed to record request outcome");
        }
    }

    pub async fn get_quota_status(&self, identity: &Identity) -> Result<QuotaStatus> {
        self.quota.get_quota_status(identity).await
    }

    /// Daily usage for the last `days` days, most recent first.
    pub async fn get_quota_history(
        &self,
        identity: &Identity,
        days: u32,
    ) -> Result<Vec<QuotaUsageRecord>> {
        self.quota.get_history(identity, days).await
    }

    /// Run one alert sweep.
    pub async fn sweep_alerts(&self) -> Result<Vec<Alert>> {
        self.alerts.sweep().await
    }

    /// Guidance for `identity` based on today's usage.
    pub async fn recommend(&self, identity: &Identity) -> Result<Vec<Recommendation>> {
        let usage = self.quota.get_usage(identity, None).await?;
        let limits = self.limiter.tiers().limits(identity.tier());
        Ok(recommend_for(identity, limits, &usage))
    }

    /// A scheduler for periodic sweeps that also prunes idle burst windows.
    ///
    /// Add sinks and call [`AlertScheduler::start`].
    pub fn alert_scheduler(&self) -> AlertScheduler {
        AlertScheduler::new(self.alerts.clone()).with_limiter(self.limiter.clone())
    }

    /// Drop usage rows dated before `date`. Returns the number removed.
    pub async fn purge_usage_before(&self, date: NaiveDate) -> Result<u64> {
        let removed = self.store.purge_before(date).await?;
        info!(before = %date, removed = removed, "Purged usage records");
        Ok(removed)
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }
}
