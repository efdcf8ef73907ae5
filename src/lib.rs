//! Tollgate - Multi-tier admission control
//!
//! This crate guards request paths with three budgets per caller: a sliding
//! burst window, an hourly counter and a daily quota. Anonymous callers are
//! keyed by source address on the free tier; API-key holders get unlimited
//! hourly and daily budgets but are still burst-limited. Daily usage is
//! tracked for reporting, swept into alerts and turned into recommendations.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod error;
pub mod quota;
pub mod ratelimit;
pub mod recommend;
pub mod service;
pub mod store;

pub use service::Tollgate;
