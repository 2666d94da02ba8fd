//! Per-CPU record kept by the governor

/// Which cluster list currently holds the CPU's position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LruList {
    /// In the cluster LRU
    Settled,
    /// Queued on the pending list; any LRU entry for it is stale
    Pending,
}

/// Governor view of one logical CPU. Lives inside its cluster's state lock.
#[derive(Debug, Clone)]
pub(super) struct CpuState {
    pub cpu: u32,
    pub online: bool,
    /// A later hotplug notifier refused to bring this CPU up
    pub rejected: bool,
    /// Hysteresis output of the need evaluator
    pub is_busy: bool,
    pub not_preferred: bool,
    /// Last reported load, 0..=100
    pub busy: u32,
    pub list: LruList,
}

impl CpuState {
    pub fn new(cpu: u32, online: bool) -> Self {
        Self {
            cpu,
            online,
            rejected: false,
            is_busy: false,
            not_preferred: false,
            busy: 0,
            list: LruList::Settled,
        }
    }
}

/// Snapshot of one managed CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuStatus {
    pub cpu: u32,
    pub online: bool,
    pub rejected: bool,
    /// Cluster the CPU belongs to
    pub first_cpu: u32,
    pub busy: u32,
    pub is_busy: bool,
    pub not_preferred: bool,
}
