//! Runqueue-driven CPU core control
//!
//! Keeps as few cores online in each CPU cluster as the current load needs.
//! The governor sits on top of three host services, each behind a trait:
//! - CPU hotplug ([`cpu::HotplugOps`])
//! - cpufreq policies and governor load reports ([`power::cpufreq::CpuFreqOps`])
//! - scheduler run-queue averages ([`sched::NrRunningSource`])
//!
//! In-process implementations of all three are provided for hosting and
//! tests.

pub mod cpu;
pub mod power;
pub mod sched;
pub mod time;
pub mod timer;
pub mod util;

pub use power::core_ctl::{Attr, Cluster, ClusterStatus, Collaborators, CoreCtl, CoreCtlConfig, CpuStatus};
pub use util::{KError, KResult};
