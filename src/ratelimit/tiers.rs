//! Tier limit sets and the tier lookup table.
//!
//! Limits are configured per tier using the `DAILY_LIMIT`, `HOURLY_LIMIT`,
//! `BURST_LIMIT` and `WINDOW_SIZE` options. A negative daily or hourly limit
//! means unlimited. The burst limit is always finite.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Sentinel used on the configuration surface for "no limit".
pub const UNLIMITED: i64 = -1;

/// A named limit profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Anonymous callers, identified by IP.
    Free,
    /// Authenticated API-key holders.
    ApiKey,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::ApiKey => write!(f, "api_key"),
        }
    }
}

/// A request budget for a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Limit {
    /// No ceiling; the window is never checked.
    Unlimited,
    /// At most this many requests per window.
    Finite(u64),
}

impl Limit {
    /// Whether this limit short-circuits window checks.
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// The finite ceiling, if any.
    pub fn as_finite(&self) -> Option<u64> {
        match self {
            Limit::Finite(n) => Some(*n),
            Limit::Unlimited => None,
        }
    }

    /// Whether `used` requests already exhaust this limit.
    pub fn is_exhausted(&self, used: u64) -> bool {
        match self {
            Limit::Finite(n) => used >= *n,
            Limit::Unlimited => false,
        }
    }

    /// Budget left after `used` requests, or `None` when unlimited.
    pub fn remaining_after(&self, used: u64) -> Option<u64> {
        self.as_finite().map(|n| n.saturating_sub(used))
    }
}

impl From<i64> for Limit {
    fn from(value: i64) -> Self {
        if value < 0 {
            Limit::Unlimited
        } else {
            Limit::Finite(value as u64)
        }
    }
}

impl From<Limit> for i64 {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Unlimited => UNLIMITED,
            Limit::Finite(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::Finite(n) => write!(f, "{}", n),
        }
    }
}

/// Raw per-tier limits as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimitsConfig {
    /// Requests per UTC calendar day; negative for unlimited
    #[serde(rename = "DAILY_LIMIT", alias = "daily_limit")]
    pub daily_limit: i64,
    /// Requests per UTC hour; negative for unlimited
    #[serde(rename = "HOURLY_LIMIT", alias = "hourly_limit")]
    pub hourly_limit: i64,
    /// Requests per burst window; must not be negative
    #[serde(rename = "BURST_LIMIT", alias = "burst_limit")]
    pub burst_limit: i64,
    /// Burst window length in milliseconds
    #[serde(rename = "WINDOW_SIZE", alias = "window_size")]
    pub window_size: u64,
}

impl TierLimitsConfig {
    /// Default limits for anonymous callers.
    pub fn free_default() -> Self {
        Self {
            daily_limit: 100,
            hourly_limit: 20,
            burst_limit: 5,
            window_size: 60_000,
        }
    }

    /// Default limits for API-key holders.
    pub fn api_key_default() -> Self {
        Self {
            daily_limit: UNLIMITED,
            hourly_limit: UNLIMITED,
            burst_limit: 100,
            window_size: 60_000,
        }
    }

    /// Validate and convert into an immutable limit set.
    pub fn build(&self, tier: Tier) -> Result<TierLimitSet> {
        if self.burst_limit < 0 {
            return Err(TollgateError::Config(format!(
                "tier {}: BURST_LIMIT must not be negative (burst is always enforced)",
                tier
            )));
        }
        if self.window_size == 0 {
            return Err(TollgateError::Config(format!(
                "tier {}: WINDOW_SIZE must be greater than zero",
                tier
            )));
        }

        Ok(TierLimitSet {
            daily: Limit::from(self.daily_limit),
            hourly: Limit::from(self.hourly_limit),
            burst: self.burst_limit as u64,
            burst_window: Duration::from_millis(self.window_size),
        })
    }
}

/// The immutable limits applied to one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimitSet {
    /// Daily request budget
    pub daily: Limit,
    /// Hourly request budget
    pub hourly: Limit,
    /// Requests allowed inside one burst window
    pub burst: u64,
    /// Length of the trailing burst window
    pub burst_window: Duration,
}

impl TierLimitSet {
    /// Burst window as a chrono duration, for timestamp arithmetic.
    pub fn burst_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.burst_window).unwrap_or(chrono::Duration::MAX)
    }
}

/// Per-tier limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiersConfig {
    /// Limits for anonymous callers
    #[serde(default = "TierLimitsConfig::free_default")]
    pub free: TierLimitsConfig,
    /// Limits for API-key holders
    #[serde(default = "TierLimitsConfig::api_key_default")]
    pub api_key: TierLimitsConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            free: TierLimitsConfig::free_default(),
            api_key: TierLimitsConfig::api_key_default(),
        }
    }
}

/// Lookup table from [`Tier`] to its validated [`TierLimitSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTable {
    free: TierLimitSet,
    api_key: TierLimitSet,
}

impl TierTable {
    /// Build a table from explicit limit sets.
    pub fn new(free: TierLimitSet, api_key: TierLimitSet) -> Self {
        Self { free, api_key }
    }

    /// Validate a tiers configuration into a lookup table.
    pub fn from_config(config: &TiersConfig) -> Result<Self> {
        Ok(Self {
            free: config.free.build(Tier::Free)?,
            api_key: config.api_key.build(Tier::ApiKey)?,
        })
    }

    /// Limits for a tier.
    pub fn limits(&self, tier: Tier) -> &TierLimitSet {
        match tier {
            Tier::Free => &self.free,
            Tier::ApiKey => &self.api_key,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimitSet {
                daily: Limit::Finite(100),
                hourly: Limit::Finite(20),
                burst: 5,
                burst_window: Duration::from_millis(60_000),
            },
            api_key: TierLimitSet {
                daily: Limit::Unlimited,
                hourly: Limit::Unlimited,
                burst: 100,
                burst_window: Duration::from_millis(60_000),
            },
        }
    }
}
