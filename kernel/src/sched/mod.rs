//! Scheduler-side services used by the power governors.
//!
//! - `rq_stats`: windowed nr-running averages
//! - `kthread`: dedicated kernel-style worker threads

pub mod kthread;
pub mod rq_stats;

pub use kthread::KThread;
pub use rq_stats::{NrRunningAvg, NrRunningSource, RqStats};
