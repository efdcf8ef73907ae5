//! Alert derivation from quota state and burst denials.

mod engine;
mod scheduler;

pub use engine::{Alert, AlertConfig, AlertEngine, AlertType, Severity};
pub use scheduler::{
    AlertBatch, AlertScheduler, AlertSchedulerHandle, AlertSink, ChannelSink, LogSink,
};
