//! Cluster aggregate state
//!
//! One [`Cluster`] per group of CPUs sharing a cpufreq policy, keyed by its
//! lowest-numbered CPU. Locks, always taken in this order:
//! - `lru`: held by the executor for a whole convergence pass
//! - `pending_lru`: short, taken by listeners when `lru` is busy
//! - `state`: short, counters and per-CPU records
//!
//! Nothing blocks while holding `state`.

use std::collections::VecDeque;
use std::sync::Arc;

use spin::{Mutex, Once};

use super::cpu::{CpuState, CpuStatus, LruList};
use super::{CoreCtlConfig, MAX_CPUS_PER_CLUSTER};
use crate::cpu::{CpuMask, HotplugOps};
use crate::sched::KThread;
use crate::time::Clock;
use crate::timer::Timer;
use crate::util::{KError, KResult};

pub(super) struct ClusterState {
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub online_cpus: u32,
    pub avail_cpus: u32,
    pub need_cpus: u32,
    pub task_thres: u32,
    pub nrrun: u32,
    /// Sample changed since the last evaluation from the load path
    pub nrrun_changed: bool,
    pub offline_delay_ms: u64,
    pub need_ts: u64,
    pub busy_up_thres: [u32; MAX_CPUS_PER_CLUSTER],
    pub busy_down_thres: [u32; MAX_CPUS_PER_CLUSTER],
    pub is_big_cluster: bool,
    pub disabled: bool,
    /// Indexed by slot, ascending CPU order
    pub cpus: Vec<CpuState>,
}

impl ClusterState {
    pub fn apply_limits(&self, need: u32) -> u32 {
        need.max(self.min_cpus).min(self.max_cpus)
    }

    pub fn num_cpus(&self) -> u32 {
        self.cpus.len() as u32
    }
}

/// Snapshot of a cluster's decision state and tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatus {
    pub first_cpu: u32,
    pub cpus: CpuMask,
    pub num_cpus: u32,
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub online_cpus: u32,
    pub avail_cpus: u32,
    pub need_cpus: u32,
    pub nrrun: u32,
    pub task_thres: u32,
    pub offline_delay_ms: u64,
    pub busy_up_thres: Vec<u32>,
    pub busy_down_thres: Vec<u32>,
    pub is_big_cluster: bool,
    pub disabled: bool,
    /// Least recently used first
    pub lru: Vec<u32>,
}

pub struct Cluster {
    first_cpu: u32,
    mask: CpuMask,
    pub(super) state: Mutex<ClusterState>,
    pub(super) lru: Mutex<VecDeque<u32>>,
    pub(super) pending_lru: Mutex<VecDeque<u32>>,
    pub(super) hotplug: Arc<dyn HotplugOps>,
    pub(super) clock: Arc<dyn Clock>,
    worker: Once<KThread>,
    pub(super) offline_timer: Once<Timer>,
}

impl Cluster {
    /// Build a cluster over `mask`, probing each CPU's online state.
    /// No threads run until [`Cluster::start`].
    pub(super) fn new(
        mask: CpuMask,
        config: &CoreCtlConfig,
        hotplug: Arc<dyn HotplugOps>,
        clock: Arc<dyn Clock>,
    ) -> KResult<Self> {
        let first_cpu = mask.first().ok_or(KError::Invalid)?;
        let num_cpus = mask.weight();
        if num_cpus as usize > MAX_CPUS_PER_CLUSTER {
            return Err(KError::NotSupported);
        }

        let cpus: Vec<CpuState> = mask
            .iter()
            .map(|cpu| CpuState::new(cpu, hotplug.cpu_online(cpu)))
            .collect();
        let online_cpus = cpus.iter().filter(|c| c.online).count() as u32;

        let state = ClusterState {
            min_cpus: config.min_cpus.clamp(1, num_cpus),
            max_cpus: num_cpus,
            online_cpus,
            avail_cpus: num_cpus,
            need_cpus: num_cpus,
            task_thres: config.task_thres,
            nrrun: num_cpus,
            nrrun_changed: false,
            offline_delay_ms: config.offline_delay_ms,
            need_ts: clock.now_ms(),
            busy_up_thres: [config.busy_up_thres; MAX_CPUS_PER_CLUSTER],
            busy_down_thres: [config.busy_down_thres; MAX_CPUS_PER_CLUSTER],
            is_big_cluster: false,
            disabled: false,
            cpus,
        };

        Ok(Self {
            first_cpu,
            mask,
            state: Mutex::new(state),
            lru: Mutex::new(mask.iter().collect()),
            pending_lru: Mutex::new(VecDeque::new()),
            hotplug,
            clock,
            worker: Once::new(),
            offline_timer: Once::new(),
        })
    }

    /// Spawn the executor thread and the offline-delay timer
    pub(super) fn start(self: &Arc<Self>) -> KResult<()> {
        let weak = Arc::downgrade(self);
        let worker = KThread::spawn(&format!("core_ctl/{}", self.first_cpu), move || {
            if let Some(cluster) = weak.upgrade() {
                cluster.do_hotplug();
            }
        })?;
        self.worker.call_once(|| worker);

        let weak = Arc::downgrade(self);
        let timer = Timer::new(&format!("core_ctl_tmr/{}", self.first_cpu), move || {
            if let Some(cluster) = weak.upgrade() {
                cluster.offline_timer_fired();
            }
        })?;
        self.offline_timer.call_once(|| timer);
        Ok(())
    }

    /// Cancel the offline-delay timer and join the executor
    pub(super) fn stop(&self) {
        if let Some(timer) = self.offline_timer.get() {
            timer.shutdown();
        }
        if let Some(worker) = self.worker.get() {
            worker.stop();
        }
    }

    /// Ask the executor for a convergence pass
    pub fn wake(&self) {
        if let Some(worker) = self.worker.get() {
            worker.wake();
        }
    }

    pub fn first_cpu(&self) -> u32 {
        self.first_cpu
    }

    pub fn mask(&self) -> CpuMask {
        self.mask
    }

    pub fn num_cpus(&self) -> u32 {
        self.mask.weight()
    }

    pub(super) fn slot(&self, cpu: u32) -> Option<usize> {
        if !self.mask.test(cpu) {
            return None;
        }
        self.mask.iter().position(|c| c == cpu)
    }

    // ------------------------------------------------------------------
    // Configuration surface
    // ------------------------------------------------------------------

    pub fn set_min_cpus(&self, val: u32) -> KResult<()> {
        if val == 0 {
            return Err(KError::Invalid);
        }
        {
            let mut st = self.state.lock();
            st.min_cpus = val.min(st.max_cpus);
        }
        self.eval_need();
        self.wake();
        Ok(())
    }

    pub fn set_max_cpus(&self, val: u32) -> KResult<()> {
        if val == 0 {
            return Err(KError::Invalid);
        }
        {
            let mut st = self.state.lock();
            let max = val.min(st.num_cpus());
            st.max_cpus = max;
            st.min_cpus = st.min_cpus.min(max);
        }
        self.eval_need();
        self.wake();
        Ok(())
    }

    pub fn set_offline_delay_ms(&self, val: u64) {
        self.state.lock().offline_delay_ms = val;
        self.apply_need();
    }

    /// One shared value or one value per online-count index
    pub fn set_busy_up_thres(&self, vals: &[u32]) -> KResult<()> {
        {
            let mut st = self.state.lock();
            let num = st.cpus.len();
            fill_thresholds(&mut st.busy_up_thres, num, vals)?;
        }
        self.apply_need();
        Ok(())
    }

    pub fn set_busy_down_thres(&self, vals: &[u32]) -> KResult<()> {
        {
            let mut st = self.state.lock();
            let num = st.cpus.len();
            fill_thresholds(&mut st.busy_down_thres, num, vals)?;
        }
        self.apply_need();
        Ok(())
    }

    pub fn set_task_thres(&self, val: u32) -> KResult<()> {
        {
            let mut st = self.state.lock();
            if val < st.num_cpus() {
                return Err(KError::Invalid);
            }
            st.task_thres = val;
        }
        self.apply_need();
        Ok(())
    }

    pub fn set_is_big_cluster(&self, big: bool) {
        self.state.lock().is_big_cluster = big;
    }

    /// One shared flag or one flag per slot
    pub fn set_not_preferred(&self, vals: &[bool]) -> KResult<()> {
        let mut st = self.state.lock();
        let num = st.cpus.len();
        if vals.len() != 1 && vals.len() != num {
            return Err(KError::Invalid);
        }
        for (i, c) in st.cpus.iter_mut().enumerate() {
            c.not_preferred = if vals.len() == 1 { vals[0] } else { vals[i] };
        }
        Ok(())
    }

    pub fn set_disabled(&self, disabled: bool) {
        {
            let mut st = self.state.lock();
            if st.disabled == disabled {
                return;
            }
            st.disabled = disabled;
        }
        log::info!(
            "core_ctl: cluster {} {}",
            self.first_cpu,
            if disabled { "disabled" } else { "enabled" }
        );
        self.wake();
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Cluster LRU as it would be walked, followed by CPUs still queued on
    /// the pending list
    pub fn lru_order(&self) -> Vec<u32> {
        let lru = self.lru.lock();
        let pending = self.pending_lru.lock();
        let st = self.state.lock();

        let mut order: Vec<u32> = lru
            .iter()
            .copied()
            .filter(|&cpu| {
                self.slot(cpu)
                    .map(|s| st.cpus[s].list == LruList::Settled)
                    .unwrap_or(false)
            })
            .collect();
        order.extend(pending.iter().copied());
        order
    }

    pub fn status(&self) -> ClusterStatus {
        let lru = self.lru_order();
        let st = self.state.lock();
        let num = st.cpus.len();
        ClusterStatus {
            first_cpu: self.first_cpu,
            cpus: self.mask,
            num_cpus: num as u32,
            min_cpus: st.min_cpus,
            max_cpus: st.max_cpus,
            online_cpus: st.online_cpus,
            avail_cpus: st.avail_cpus,
            need_cpus: st.need_cpus,
            nrrun: st.nrrun,
            task_thres: st.task_thres,
            offline_delay_ms: st.offline_delay_ms,
            busy_up_thres: st.busy_up_thres[..num].to_vec(),
            busy_down_thres: st.busy_down_thres[..num].to_vec(),
            is_big_cluster: st.is_big_cluster,
            disabled: st.disabled,
            lru,
        }
    }

    pub fn cpu_status(&self, cpu: u32) -> Option<CpuStatus> {
        let slot = self.slot(cpu)?;
        let st = self.state.lock();
        let c = &st.cpus[slot];
        Some(CpuStatus {
            cpu: c.cpu,
            online: c.online,
            rejected: c.rejected,
            first_cpu: self.first_cpu,
            busy: c.busy,
            is_busy: c.is_busy,
            not_preferred: c.not_preferred,
        })
    }

    pub fn online_cpus(&self) -> u32 {
        self.state.lock().online_cpus
    }

    pub fn need_cpus(&self) -> u32 {
        self.state.lock().need_cpus
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fill_thresholds(
    thres: &mut [u32; MAX_CPUS_PER_CLUSTER],
    num_cpus: usize,
    vals: &[u32],
) -> KResult<()> {
    match vals.len() {
        1 => thres[..num_cpus].fill(vals[0]),
        n if n == num_cpus => thres[..num_cpus].copy_from_slice(vals),
        _ => return Err(KError::Invalid),
    }
    Ok(())
}
