//! Classification of quota state into alerts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Result, TollgateError};
use crate::quota::usage_ratio;
use crate::ratelimit::{DenialLog, Identity, Limit, TierTable};
use crate::store::Store;

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ApproachingLimit,
    LimitExceeded,
    UnusualActivity,
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A derived alert for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub identity: Identity,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub usage_ratio: Option<f64>,
    pub detected_at: DateTime<Utc>,
}

/// Thresholds and cadence for the alert sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Usage ratio at which an identity is approaching its limit
    #[serde(default = "default_approaching_ratio")]
    pub approaching_ratio: f64,
    /// Usage ratio at which the limit counts as exceeded
    #[serde(default = "default_exceeded_ratio")]
    pub exceeded_ratio: f64,
    /// Usage ratio indicating the limit was bypassed
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: f64,
    /// Burst denials within one sweep interval that raise a low alert
    #[serde(default = "default_unusual_low")]
    pub unusual_low_denials: usize,
    /// Burst denials within one sweep interval that raise a medium alert
    #[serde(default = "default_unusual_medium")]
    pub unusual_medium_denials: usize,
    /// Seconds between scheduled sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_approaching_ratio() -> f64 {
    0.9
}

fn default_exceeded_ratio() -> f64 {
    1.0
}

fn default_critical_ratio() -> f64 {
    1.5
}

fn default_unusual_low() -> usize {
    3
}

fn default_unusual_medium() -> usize {
    10
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            approaching_ratio: default_approaching_ratio(),
            exceeded_ratio: default_exceeded_ratio(),
            critical_ratio: default_critical_ratio(),
            unusual_low_denials: default_unusual_low(),
            unusual_medium_denials: default_unusual_medium(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl AlertConfig {
    /// Reject threshold combinations that cannot classify consistently.
    pub fn validate(&self) -> Result<()> {
        let ratios = [self.approaching_ratio, self.exceeded_ratio, self.critical_ratio];
        if ratios.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return Err(TollgateError::Config(
                "alert ratios must be positive numbers".into(),
            ));
        }
        if self.approaching_ratio >= self.exceeded_ratio {
            return Err(TollgateError::Config(
                "alerts.approaching_ratio must be below alerts.exceeded_ratio".into(),
            ));
        }
        if self.critical_ratio < self.exceeded_ratio {
            return Err(TollgateError::Config(
                "alerts.critical_ratio must not be below alerts.exceeded_ratio".into(),
            ));
        }
        if self.unusual_low_denials == 0 || self.unusual_low_denials > self.unusual_medium_denials {
            return Err(TollgateError::Config(
                "alerts.unusual_low_denials must be positive and not above unusual_medium_denials"
                    .into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "alerts.sweep_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Sweep cadence.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Reads quota state and burst denials and classifies them into alerts.
///
/// A sweep never mutates counters; running it twice against the same state
/// and clock yields the same alerts.
pub struct AlertEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    tiers: TierTable,
    denials: Arc<DenialLog>,
    config: AlertConfig,
}

impl fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEngine")
            .field("tiers", &self.tiers)
            .field("config", &self.config)
            .finish()
    }
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        tiers: TierTable,
        denials: Arc<DenialLog>,
        config: AlertConfig,
    ) -> Self {
        Self {
            store,
            clock,
            tiers,
            denials,
            config,
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Current time according to the engine's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Classify every active identity's current state.
    ///
    /// Results are ordered by severity (most severe first), then identity.
    pub async fn sweep(&self) -> Result<Vec<Alert>> {
        let now = self.clock.now();
        let mut alerts = Vec::new();

        for record in self.store.active_usage(now.date_naive()).await? {
            let identity = match record.parsed_identity() {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(identity = %record.identity, error = %e, "Skipping unparsable usage row");
                    continue;
                }
            };
            let limit = self.tiers.limits(identity.tier()).daily;
            let Some(ratio) = usage_ratio(record.request_count, limit) else {
                continue;
            };
            if let Some(alert) = self.classify_usage(identity, ratio, record.request_count, limit, now) {
                alerts.push(alert);
            }
        }

        let since = now - self.interval_chrono();
        for (key, count) in self.denials.counts_since(since) {
            if let Some(alert) = self.classify_denials(&key, count, now) {
                alerts.push(alert);
            }
        }

        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.identity.partition_key().cmp(&b.identity.partition_key()))
                .then_with(|| (a.alert_type as u8).cmp(&(b.alert_type as u8)))
        });

        debug!(alerts = alerts.len(), "Alert sweep complete");
        Ok(alerts)
    }

    /// Forget burst denials that no future sweep will look at.
    pub fn prune_denials(&self) {
        self.denials.prune_before(self.clock.now() - self.interval_chrono());
    }

    fn interval_chrono(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.sweep_interval()).unwrap_or(ChronoDuration::MAX)
    }

    fn classify_usage(
        &self,
        identity: Identity,
        ratio: f64,
        used: u64,
        limit: Limit,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let pct = (ratio * 100.0).round();
        let (alert_type, severity, message) = if ratio >= self.config.exceeded_ratio {
            let severity = if ratio >= self.config.critical_ratio {
                Severity::Critical
            } else {
                Severity::High
            };
            (
                AlertType::LimitExceeded,
                severity,
                format!(
                    "Daily limit of {} requests exceeded: {} requests ({}%)",
                    limit, used, pct
                ),
            )
        } else if ratio >= self.config.approaching_ratio {
            (
                AlertType::ApproachingLimit,
                Severity::Medium,
                format!(
                    "Daily usage at {}% of {} request limit ({} requests)",
                    pct, limit, used
                ),
            )
        } else {
            return None;
        };

        Some(Alert {
            identity,
            alert_type,
            severity,
            message,
            usage_ratio: Some(ratio),
            detected_at: now,
        })
    }

    fn classify_denials(&self, key: &str, count: usize, now: DateTime<Utc>) -> Option<Alert> {
        if count < self.config.unusual_low_denials {
            return None;
        }
        let identity = match key.parse::<Identity>() {
            Ok(identity) => identity,
            Err(e) => {
                warn!(identity = %key, error = %e, "Skipping unparsable denial entry");
                return None;
            }
        };
        let severity = if count >= self.config.unusual_medium_denials {
            Severity::Medium
        } else {
            Severity::Low
        };

        Some(Alert {
            identity,
            alert_type: AlertType::UnusualActivity,
            severity,
            message: format!(
                "{} burst-limit denials in the last {}s",
                count, self.config.sweep_interval_secs
            ),
            usage_ratio: None,
            detected_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, Outcome, UsageStore};
    use chrono::TimeZone;

    struct Fixture {
        engine: AlertEngine,
        store: Arc<MemoryStore>,
        denials: Arc<DenialLog>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap());
        let denials = Arc::new(DenialLog::new());
        let engine = AlertEngine::new(
            store.clone(),
            Arc::new(clock.clone()),
            TierTable::default(),
            denials.clone(),
            AlertConfig::default(),
        );
        Fixture {
            engine,
            store,
            denials,
            clock,
        }
    }

    async fn fill(store: &MemoryStore, clock: &ManualClock, key: &str, n: u64) {
        for _ in 0..n {
            store
                .record_usage(key, clock.now().date_naive(), Outcome::Success)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_usage_classification() {
        let f = fixture();
        fill(&f.store, &f.clock, "ip:10.0.0.1", 50).await; // 0.5: nothing
        fill(&f.store, &f.clock, "ip:10.0.0.2", 92).await; // approaching
        fill(&f.store, &f.clock, "ip:10.0.0.3", 100).await; // exceeded
        fill(&f.store, &f.clock, "ip:10.0.0.4", 160).await; // critical
        fill(&f.store, &f.clock, "key:tk_big", 10_000).await; // unlimited tier

        let alerts = f.engine.sweep().await.unwrap();
        assert_eq!(alerts.len(), 3);

        assert_eq!(alerts[0].identity.partition_key(), "ip:10.0.0.4");
        assert_eq!(alerts[0].alert_type, AlertType::LimitExceeded);
        assert_eq!(alerts[0].severity, Severity::Critical);

        assert_eq!(alerts[1].identity.partition_key(), "ip:10.0.0.3");
        assert_eq!(alerts[1].severity, Severity::High);
        assert_eq!(
            alerts[1].message,
            "Daily limit of 100 requests exceeded: 100 requests (100%)"
        );

        assert_eq!(alerts[2].alert_type, AlertType::ApproachingLimit);
        assert_eq!(alerts[2].severity, Severity::Medium);
        assert_eq!(alerts[2].usage_ratio, Some(0.92));
    }

    #[tokio::test]
    async fn test_unusual_activity_from_burst_denials() {
        let f = fixture();
        let now = f.clock.now();

        for i in 0..4 {
            f.denials.record("ip:10.0.0.7", now - ChronoDuration::seconds(i * 10));
        }
        for i in 0..12 {
            f.denials.record("ip:10.0.0.8", now - ChronoDuration::seconds(i));
        }
        // Two recent denials plus one outside the sweep interval.
        f.denials.record("ip:10.0.0.9", now);
        f.denials.record("ip:10.0.0.9", now);
        f.denials.record("ip:10.0.0.9", now - ChronoDuration::seconds(600));

        let alerts = f.engine.sweep().await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].identity.partition_key(), "ip:10.0.0.8");
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert_eq!(alerts[1].severity, Severity::Low);
        assert!(alerts
            .iter()
            .all(|a| a.alert_type == AlertType::UnusualActivity));
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_and_read_only() {
        let f = fixture();
        fill(&f.store, &f.clock, "ip:10.0.0.3", 120).await;

        let first = f.engine.sweep().await.unwrap();
        let second = f.engine.sweep().await.unwrap();
        assert_eq!(first, second);

        let usage = f
            .store
            .usage("ip:10.0.0.3", f.clock.now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usage.request_count, 120);
    }

    #[tokio::test]
    async fn test_previous_days_are_not_swept() {
        let f = fixture();
        fill(&f.store, &f.clock, "ip:10.0.0.3", 120).await;

        f.clock.advance(ChronoDuration::days(1));
        assert!(f.engine.sweep().await.unwrap().is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(AlertConfig::default().validate().is_ok());

        let config = AlertConfig {
            approaching_ratio: 1.2,
            ..AlertConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AlertConfig {
            critical_ratio: 0.95,
            ..AlertConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AlertConfig {
            unusual_low_denials: 20,
            ..AlertConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AlertConfig {
            sweep_interval_secs: 0,
            ..AlertConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
