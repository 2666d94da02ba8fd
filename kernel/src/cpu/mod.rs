//! Logical CPU bookkeeping: masks and hotplug.

pub mod hotplug;
pub mod mask;

pub use hotplug::{
    ActionFlags, CpuHotplugManager, CpuState, HotplugAction, HotplugCallback, HotplugOps,
    NotifierPriority,
};
pub use mask::{CpuMask, NR_CPUS};
