//! Rate limiting logic and state management.

mod decision;
mod identity;
mod limiter;
mod tiers;
mod window;

pub use decision::{DenialKind, RateLimitDecision, RateLimitError, Remaining, WindowDetail};
pub use identity::Identity;
pub use limiter::{AdmissionMode, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use tiers::{Limit, Tier, TierLimitSet, TierLimitsConfig, TierTable, TiersConfig, UNLIMITED};
pub use window::{
    next_midnight, start_of_day, BurstTracker, BurstUsage, DenialLog, PeriodKey, TimeWindow,
    DEFAULT_DENIAL_RETENTION_SECS, MAX_DENIALS_PER_KEY,
};
