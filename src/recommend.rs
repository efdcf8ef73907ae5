//! Usage guidance derived from quota state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::quota::usage_ratio;
use crate::ratelimit::{Identity, Tier, TierLimitSet};
use crate::store::QuotaUsageRecord;

/// Ratio at which a free-tier caller is pointed at an API key.
pub const UPGRADE_RATIO: f64 = 0.9;
/// Ratio at which a free-tier caller is warned.
pub const WARNING_RATIO: f64 = 0.75;
/// Ratio at which a free-tier caller is informed of their usage.
pub const INFO_RATIO: f64 = 0.5;

/// Kind of recommendation, ordered by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    Info,
    Warning,
    Upgrade,
}

impl fmt::Display for RecommendationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecommendationType::Info => "info",
            RecommendationType::Warning => "warning",
            RecommendationType::Upgrade => "upgrade",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub identity: Identity,
    #[serde(rename = "type")]
    pub rec_type: RecommendationType,
    pub message: String,
}

/// Recommendations for `identity` given its limits and today's usage.
///
/// Pure: the same inputs always give the same output.
pub fn recommend_for(
    identity: &Identity,
    limits: &TierLimitSet,
    usage: &QuotaUsageRecord,
) -> Vec<Recommendation> {
    let make = |rec_type, message: String| Recommendation {
        identity: identity.clone(),
        rec_type,
        message,
    };

    match identity.tier() {
        Tier::ApiKey => vec![make(
            RecommendationType::Info,
            format!(
                "{} requests today. API key usage has no daily ceiling; watch your volume.",
                usage.request_count
            ),
        )],
        Tier::Free => {
            let Some(ratio) = usage_ratio(usage.request_count, limits.daily) else {
                return Vec::new();
            };
            let pct = (ratio * 100.0).round();

            let rec = if ratio >= UPGRADE_RATIO {
                make(
                    RecommendationType::Upgrade,
                    format!(
                        "You have used {}% of your daily limit of {} requests. \
                         Use an API key for unlimited daily requests.",
                        pct, limits.daily
                    ),
                )
            } else if ratio >= WARNING_RATIO {
                make(
                    RecommendationType::Warning,
                    format!(
                        "You have used {}% of your daily limit. Monitor your usage to avoid interruption.",
                        pct
                    ),
                )
            } else if ratio >= INFO_RATIO {
                make(
                    RecommendationType::Info,
                    format!("You have used {}% of your daily limit.", pct),
                )
            } else {
                return Vec::new();
            };
            vec![rec]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TierTable;
    use chrono::NaiveDate;

    fn usage(identity: &Identity, requests: u64) -> QuotaUsageRecord {
        QuotaUsageRecord {
            request_count: requests,
            success_count: requests,
            ..QuotaUsageRecord::empty(
                &identity.partition_key(),
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            )
        }
    }

    fn free_recs(requests: u64) -> Vec<Recommendation> {
        let tiers = TierTable::default();
        let ip = Identity::from_ip_str("198.51.100.4").unwrap();
        recommend_for(&ip, tiers.limits(Tier::Free), &usage(&ip, requests))
    }

    #[test]
    fn test_free_tier_thresholds() {
        assert!(free_recs(0).is_empty());
        assert!(free_recs(49).is_empty());
        assert_eq!(free_recs(50)[0].rec_type, RecommendationType::Info);
        assert_eq!(free_recs(75)[0].rec_type, RecommendationType::Warning);
        assert_eq!(free_recs(89)[0].rec_type, RecommendationType::Warning);
        assert_eq!(free_recs(90)[0].rec_type, RecommendationType::Upgrade);
        assert_eq!(free_recs(250)[0].rec_type, RecommendationType::Upgrade);
    }

    #[test]
    fn test_ninety_five_requests_suggests_upgrade() {
        let recs = free_recs(95);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].rec_type, RecommendationType::Upgrade);
        assert!(recs[0].message.contains("95%"));
    }

    #[test]
    fn test_severity_is_monotonic_in_usage() {
        let mut previous: Option<RecommendationType> = None;
        for requests in 0..=150 {
            let current = free_recs(requests).first().map(|r| r.rec_type);
            assert!(
                current >= previous,
                "{} requests: {:?} < {:?}",
                requests,
                current,
                previous
            );
            previous = current;
        }
    }

    #[test]
    fn test_api_key_always_gets_one_info() {
        let tiers = TierTable::default();
        let key = Identity::api_key("tk_live_1").unwrap();
        for requests in [0, 10, 100_000] {
            let recs = recommend_for(&key, tiers.limits(Tier::ApiKey), &usage(&key, requests));
            assert_eq!(recs.len(), 1);
            assert_eq!(recs[0].rec_type, RecommendationType::Info);
        }
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(&free_recs(95)[0]).unwrap();
        assert_eq!(json["type"], "upgrade");
        assert_eq!(json["identity"], "ip:198.51.100.4");
    }
}
