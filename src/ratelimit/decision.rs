//! The structured outcome of a rate-limit evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::tiers::Limit;
use super::window::TimeWindow;

/// Which window denied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DenialKind {
    #[serde(rename = "BURST_LIMIT_EXCEEDED")]
    Burst,
    #[serde(rename = "HOURLY_RATE_LIMIT_EXCEEDED")]
    Hourly,
    #[serde(rename = "DAILY_RATE_LIMIT_EXCEEDED")]
    Daily,
}

impl DenialKind {
    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DenialKind::Burst => "BURST_LIMIT_EXCEEDED",
            DenialKind::Hourly => "HOURLY_RATE_LIMIT_EXCEEDED",
            DenialKind::Daily => "DAILY_RATE_LIMIT_EXCEEDED",
        }
    }

    /// The window this denial refers to.
    pub fn window(&self) -> TimeWindow {
        match self {
            DenialKind::Burst => TimeWindow::Burst,
            DenialKind::Hourly => TimeWindow::Hour,
            DenialKind::Daily => TimeWindow::Day,
        }
    }
}

/// Error object attached to a denied decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitError {
    pub kind: DenialKind,
    pub message: String,
}

impl RateLimitError {
    pub(crate) fn new(kind: DenialKind, limit: u64, window_desc: &str) -> Self {
        let message = match kind {
            DenialKind::Burst => format!(
                "Burst limit of {} requests per {} exceeded",
                limit, window_desc
            ),
            DenialKind::Hourly => format!("Hourly rate limit of {} requests exceeded", limit),
            DenialKind::Daily => format!("Daily rate limit of {} requests exceeded", limit),
        };
        Self { kind, message }
    }
}

/// Remaining budget per window.
///
/// `None` means the window is unlimited or was not evaluated because an
/// earlier window already denied the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remaining {
    pub daily: Option<u64>,
    pub hourly: Option<u64>,
    pub burst: u64,
}

/// What one window looked like when the request was evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDetail {
    pub window: TimeWindow,
    pub limit: Limit,
    /// Requests already counted in the window, excluding this one
    pub used: u64,
    /// Budget left once this request is admitted
    pub remaining: Option<u64>,
    /// When the window next frees capacity
    pub reset_at: DateTime<Utc>,
}

/// Result of checking an identity against its tier limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: Remaining,
    /// Start of the next daily period
    pub reset_time: DateTime<Utc>,
    /// How long the caller should wait before retrying a denied request
    #[serde(skip_serializing_if = "Option::is_none", with = "duration_secs")]
    #[serde(default)]
    pub retry_after: Option<Duration>,
    pub windows: Vec<WindowDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub error: Option<RateLimitError>,
    /// Set when the counter store was unreachable and the request was let through
    #[serde(default)]
    pub degraded: bool,
}

impl RateLimitDecision {
    /// Denial kind, if the request was denied.
    pub fn denial(&self) -> Option<DenialKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Minimum remaining budget across all finite windows.
    pub fn overall_remaining(&self) -> u64 {
        [self.remaining.daily, self.remaining.hourly, Some(self.remaining.burst)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(self.remaining.burst)
    }

    /// Detail for a single window, if it was evaluated.
    pub fn window(&self, window: TimeWindow) -> Option<&WindowDetail> {
        self.windows.iter().find(|w| w.window == window)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(d)?
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64))
    }
}
