//! Power Management
//!
//! CPU frequency policies and the core control governor that onlines and
//! offlines cores inside each policy's cluster.

pub mod core_ctl;
pub mod cpufreq;

pub use core_ctl::{CoreCtl, CoreCtlConfig};
pub use cpufreq::{CpuFreqManager, CpuFreqOps, Governor};
