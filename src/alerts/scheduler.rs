//! Periodic alert sweeps.
//!
//! The scheduler owns a background task that sweeps on a fixed interval and
//! hands each batch to its sinks. It is started and stopped explicitly so its
//! lifetime follows the process that owns it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::engine::{Alert, AlertEngine, Severity};
use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimiter;

/// The alerts produced by one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertBatch {
    pub sweep_id: Uuid,
    pub swept_at: DateTime<Utc>,
    pub alerts: Vec<Alert>,
}

/// Destination for alert batches (notifications, audit storage, ...).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, batch: &AlertBatch) -> Result<()>;
}

/// Writes every alert to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, batch: &AlertBatch) -> Result<()> {
        for alert in &batch.alerts {
            if alert.severity >= Severity::High {
                warn!(
                    sweep_id = %batch.sweep_id,
                    identity = %alert.identity,
                    alert_type = ?alert.alert_type,
                    severity = %alert.severity,
                    "{}", alert.message
                );
            } else {
                info!(
                    sweep_id = %batch.sweep_id,
                    identity = %alert.identity,
                    alert_type = ?alert.alert_type,
                    severity = %alert.severity,
                    "{}", alert.message
                );
            }
        }
        Ok(())
    }
}

/// Forwards batches over a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<AlertBatch>,
}

impl ChannelSink {
    /// Create a sink and the receiver its batches arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AlertBatch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelSink {
    async fn deliver(&self, batch: &AlertBatch) -> Result<()> {
        self.tx
            .send(batch.clone())
            .await
            .map_err(|_| TollgateError::AlertDelivery("receiver dropped".into()))
    }
}

/// Runs [`AlertEngine::sweep`] every `alerts.sweep_interval_secs`.
///
/// The tick period is the engine's lookback, so each denial is counted by
/// exactly one scheduled sweep.
pub struct AlertScheduler {
    engine: Arc<AlertEngine>,
    sinks: Vec<Arc<dyn AlertSink>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl AlertScheduler {
    pub fn new(engine: Arc<AlertEngine>) -> Self {
        Self {
            engine,
            sinks: Vec::new(),
            limiter: None,
        }
    }

    /// Time between sweeps.
    pub fn interval(&self) -> Duration {
        self.engine.config().sweep_interval()
    }

    /// Deliver batches to `sink` as well.
    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Also prune the limiter's idle burst windows on every tick.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Sweep once and deliver the batch to every sink.
    ///
    /// Sink failures are logged and do not fail the sweep.
    pub async fn run_once(&self) -> Result<AlertBatch> {
        let batch = AlertBatch {
            sweep_id: Uuid::new_v4(),
            swept_at: self.engine.now(),
            alerts: self.engine.sweep().await?,
        };

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&batch).await {
                warn!(sweep_id = %batch.sweep_id, error = %e, "Alert sink rejected batch");
            }
        }

        self.engine.prune_denials();
        if let Some(limiter) = &self.limiter {
            limiter.prune_idle();
        }

        debug!(sweep_id = %batch.sweep_id, alerts = batch.alerts.len(), "Sweep delivered");
        Ok(batch)
    }

    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn start(self) -> AlertSchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.interval();

        info!(interval_secs = interval.as_secs(), sinks = self.sinks.len(), "Starting alert scheduler");

        let task = tokio::spawn(
            async move {
                let mut ticks = IntervalStream::new(tokio::time::interval(interval));
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        tick = ticks.next() => {
                            if tick.is_none() {
                                break;
                            }
                            if let Err(e) = self.run_once().await {
                                warn!(error = %e, "Alert sweep failed");
                            }
                        }
                    }
                }
                info!("Alert scheduler stopped");
            }
            .instrument(tracing::info_span!("alert_scheduler")),
        );

        AlertSchedulerHandle { shutdown_tx, task }
    }
}

/// Handle to a running [`AlertScheduler`].
pub struct AlertSchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AlertSchedulerHandle {
    /// Whether the sweep loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// A sweep already in progress is allowed to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Alert scheduler task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::engine::{AlertConfig, AlertType};
    use crate::clock::{Clock, ManualClock};
    use crate::ratelimit::{DenialLog, TierTable};
    use crate::store::{MemoryStore, Outcome, UsageStore};
    use chrono::TimeZone;

    async fn engine_with_usage(requests: u64) -> Arc<AlertEngine> {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap());
        for _ in 0..requests {
            store
                .record_usage("ip:10.1.1.1", clock.now().date_naive(), Outcome::Success)
                .await
                .unwrap();
        }
        Arc::new(AlertEngine::new(
            store,
            Arc::new(clock),
            TierTable::default(),
            Arc::new(DenialLog::new()),
            AlertConfig {
                sweep_interval_secs: 1,
                ..AlertConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_run_once_delivers_to_sinks() {
        let engine = engine_with_usage(95).await;
        let (sink, mut rx) = ChannelSink::new(4);
        let scheduler = AlertScheduler::new(engine)
            .with_sink(Arc::new(sink))
            .with_sink(Arc::new(LogSink));

        let batch = scheduler.run_once().await.unwrap();
        assert_eq!(batch.alerts.len(), 1);
        assert_eq!(batch.alerts[0].alert_type, AlertType::ApproachingLimit);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, batch);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_fail_sweep() {
        let engine = engine_with_usage(120).await;
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);

        let scheduler = AlertScheduler::new(engine).with_sink(Arc::new(sink));
        let batch = scheduler.run_once().await.unwrap();
        assert_eq!(batch.alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let engine = engine_with_usage(100).await;
        let (sink, mut rx) = ChannelSink::new(16);
        let scheduler = AlertScheduler::new(engine).with_sink(Arc::new(sink));
        // Ticks follow the engine's lookback.
        assert_eq!(scheduler.interval(), Duration::from_secs(1));
        let handle = scheduler.start();

        // First tick fires immediately, the next one a second later.
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.sweep_id, second.sweep_id);
        assert_eq!(first.alerts, second.alerts);

        handle.stop().await;
    }
}
