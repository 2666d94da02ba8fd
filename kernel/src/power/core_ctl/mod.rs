//! CPU core control
//!
//! Onlines and offlines cores inside each CPU cluster to follow load.
//!
//! Data flow:
//! - governor load reports set per-CPU busy%
//! - a periodic sampler feeds each cluster the run-queue depth
//! - the need evaluator turns both into a target online count
//! - a per-cluster executor thread converges the online count through
//!   CPU hotplug, picking CPUs in LRU order
//! - the hotplug listener keeps the counters exact and vetoes bring-ups
//!   the cluster does not need
//!
//! Clusters follow cpufreq policies and are created the first time a
//! policy is seen, either at [`CoreCtl::init`] or on a later policy
//! creation event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::{Mutex, Once, RwLock};

use crate::cpu::{ActionFlags, CpuMask, HotplugAction, HotplugOps, NotifierPriority, NR_CPUS};
use crate::power::cpufreq::{CpuFreqOps, CpuFreqPolicy, GovInfo, PolicyEvent};
use crate::sched::NrRunningSource;
use crate::time::Clock;
use crate::timer::Timer;
use crate::util::{KError, KResult};

mod cluster;
mod cpu;
mod eval;
mod executor;
mod notifier;
mod rq_avg;
pub mod sysfs;

pub use cluster::{Cluster, ClusterStatus};
pub use cpu::CpuStatus;
pub use sysfs::Attr;

use rq_avg::RqAvgState;

/// Largest cluster the governor manages
pub const MAX_CPUS_PER_CLUSTER: usize = 4;
/// Default run-queue sampling period
pub const DEFAULT_RQ_AVG_PERIOD_MS: u64 = 20;
/// A sample this close to the period end counts as a full period
pub const RQ_AVG_TOLERANCE_MS: u64 = 2;
/// Hundredths of a task that still round up to a whole task
pub const NR_RUNNING_TOLERANCE: u32 = 5;

const NOTIFIER_NAME: &str = "core_ctl";

/// Subsystem parameters and per-cluster initial tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreCtlConfig {
    pub rq_avg_period_ms: u64,
    pub offline_delay_ms: u64,
    pub task_thres: u32,
    pub busy_up_thres: u32,
    pub busy_down_thres: u32,
    pub min_cpus: u32,
}

impl Default for CoreCtlConfig {
    fn default() -> Self {
        Self {
            rq_avg_period_ms: DEFAULT_RQ_AVG_PERIOD_MS,
            offline_delay_ms: 100,
            task_thres: u32::MAX,
            busy_up_thres: 0,
            busy_down_thres: 0,
            min_cpus: 1,
        }
    }
}

/// Services the governor consumes
#[derive(Clone)]
pub struct Collaborators {
    pub hotplug: Arc<dyn HotplugOps>,
    pub cpufreq: Arc<dyn CpuFreqOps>,
    pub rq_stats: Arc<dyn NrRunningSource>,
    pub clock: Arc<dyn Clock>,
}

pub struct CoreCtl {
    config: CoreCtlConfig,
    hotplug: Arc<dyn HotplugOps>,
    cpufreq: Arc<dyn CpuFreqOps>,
    rq_stats: Arc<dyn NrRunningSource>,
    clock: Arc<dyn Clock>,
    /// Owning cluster per CPU
    per_cpu: RwLock<Vec<Option<Arc<Cluster>>>>,
    /// Clusters in creation order
    clusters: RwLock<Vec<Arc<Cluster>>>,
    rq_avg: Mutex<RqAvgState>,
    sampler: Once<Timer>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl CoreCtl {
    pub fn new(config: CoreCtlConfig, collab: Collaborators) -> Arc<Self> {
        let period_ms = config.rq_avg_period_ms.max(RQ_AVG_TOLERANCE_MS + 1);
        Arc::new(Self {
            config,
            hotplug: collab.hotplug,
            cpufreq: collab.cpufreq,
            rq_stats: collab.rq_stats,
            clock: collab.clock,
            per_cpu: RwLock::new(vec![None; NR_CPUS]),
            clusters: RwLock::new(Vec::new()),
            rq_avg: Mutex::new(RqAvgState {
                period_ms,
                last_sample_ms: None,
            }),
            sampler: Once::new(),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Hook into hotplug and cpufreq, manage the clusters of all online
    /// CPUs and start sampling
    pub fn init(self: &Arc<Self>) -> KResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(KError::Invalid);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(KError::AlreadyExists);
        }

        let weak = Arc::downgrade(self);
        self.hotplug.register_notifier(
            NOTIFIER_NAME,
            NotifierPriority::High,
            Box::new(move |cpu, action, flags| match weak.upgrade() {
                Some(ctl) => ctl.hotplug_event(cpu, action, flags),
                None => Ok(()),
            }),
        );

        let weak = Arc::downgrade(self);
        self.cpufreq.register_policy_notifier(
            NOTIFIER_NAME,
            Box::new(move |event, policy| {
                if let Some(ctl) = weak.upgrade() {
                    ctl.policy_event(event, policy);
                }
            }),
        );

        let weak = Arc::downgrade(self);
        self.cpufreq.register_load_notifier(
            NOTIFIER_NAME,
            Box::new(move |info| {
                if let Some(ctl) = weak.upgrade() {
                    ctl.load_event(info);
                }
            }),
        );

        for cpu in self.hotplug.online_mask() {
            if let Some(policy) = self.cpufreq.policy(cpu) {
                if let Err(e) = self.cluster_init(policy.related_cpus) {
                    log::debug!("core_ctl: policy{} not managed: {:?}", policy.cpu, e);
                }
            }
        }

        let weak = Arc::downgrade(self);
        let timer = Timer::new("core_ctl_rq", move || {
            if let Some(ctl) = weak.upgrade() {
                ctl.rq_avg_timer_fired();
            }
        })?;
        self.sampler.call_once(|| timer);
        self.arm_sampler();

        log::info!(
            "core_ctl: initialized, {} clusters, rq avg period {} ms",
            self.clusters.read().len(),
            self.rq_avg_period_ms()
        );
        Ok(())
    }

    /// Unhook from collaborators, stop the sampler and every executor.
    /// Clusters stay readable.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.initialized.load(Ordering::SeqCst) {
            self.hotplug.unregister_notifier(NOTIFIER_NAME);
            self.cpufreq.unregister_policy_notifier(NOTIFIER_NAME);
            self.cpufreq.unregister_load_notifier(NOTIFIER_NAME);
        }

        if let Some(timer) = self.sampler.get() {
            timer.shutdown();
        }

        for cluster in self.clusters() {
            cluster.stop();
        }

        log::info!("core_ctl: shut down");
    }

    /// Start managing the CPUs in `mask` as one cluster
    pub fn cluster_init(&self, mask: CpuMask) -> KResult<()> {
        let first_cpu = mask.first().ok_or(KError::Invalid)?;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(KError::Invalid);
        }
        if self.cluster(first_cpu).is_some() {
            return Ok(());
        }

        if mask.weight() as usize > MAX_CPUS_PER_CLUSTER {
            log::error!("core_ctl: HW configuration not supported (CPUs {})", mask);
            return Err(KError::NotSupported);
        }
        if self.overlaps(mask) {
            return Err(KError::AlreadyExists);
        }

        let cluster = Arc::new(Cluster::new(
            mask,
            &self.config,
            self.hotplug.clone(),
            self.clock.clone(),
        )?);
        cluster.start()?;

        {
            let mut per_cpu = self.per_cpu.write();
            if mask.iter().any(|cpu| per_cpu[cpu as usize].is_some()) {
                // Lost a race with another creator
                drop(per_cpu);
                cluster.stop();
                return if self.cluster(first_cpu).is_some() {
                    Ok(())
                } else {
                    Err(KError::AlreadyExists)
                };
            }
            for cpu in mask {
                per_cpu[cpu as usize] = Some(cluster.clone());
            }
            self.clusters.write().push(cluster.clone());
        }

        let status = cluster.status();
        log::info!(
            "core_ctl: created cluster {} (CPUs {}, {} online)",
            first_cpu, mask, status.online_cpus
        );
        Ok(())
    }

    fn overlaps(&self, mask: CpuMask) -> bool {
        let per_cpu = self.per_cpu.read();
        mask.iter().any(|cpu| per_cpu[cpu as usize].is_some())
    }

    /// Cluster managing `cpu`
    pub fn cluster(&self, cpu: u32) -> Option<Arc<Cluster>> {
        self.per_cpu.read().get(cpu as usize).cloned().flatten()
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.clusters.read().clone()
    }

    pub fn cluster_status(&self, cpu: u32) -> KResult<ClusterStatus> {
        self.cluster(cpu).map(|c| c.status()).ok_or(KError::NotFound)
    }

    pub fn cpu_status(&self, cpu: u32) -> Option<CpuStatus> {
        self.cluster(cpu)?.cpu_status(cpu)
    }

    /// Governor load report for one CPU
    pub fn set_busy(&self, cpu: u32, busy: u32) {
        self.update_running_avg(false);
        if let Some(cluster) = self.cluster(cpu) {
            cluster.set_busy(cpu, busy);
        }
    }

    fn hotplug_event(&self, cpu: u32, action: HotplugAction, flags: ActionFlags) -> KResult<()> {
        // Suspend and resume leave the accounting alone
        if flags.contains(ActionFlags::TASKS_FROZEN) {
            return Ok(());
        }
        match self.cluster(cpu) {
            Some(cluster) => cluster.cpu_callback(cpu, action),
            None => Ok(()),
        }
    }

    fn policy_event(&self, event: PolicyEvent, policy: &CpuFreqPolicy) {
        if event != PolicyEvent::CreatePolicy {
            return;
        }
        if let Err(e) = self.cluster_init(policy.related_cpus) {
            log::debug!("core_ctl: policy{} not managed: {:?}", policy.cpu, e);
        }
    }

    fn load_event(&self, info: &GovInfo) {
        self.set_busy(info.cpu, info.load);
    }

    pub fn config(&self) -> &CoreCtlConfig {
        &self.config
    }
}

// ============================================================================
// Global instance
// ============================================================================

static CORE_CTL: Once<Arc<CoreCtl>> = Once::new();

/// Install the process-wide governor
pub fn install(ctl: Arc<CoreCtl>) -> KResult<()> {
    let mut installed = false;
    CORE_CTL.call_once(|| {
        installed = true;
        ctl
    });
    if installed {
        Ok(())
    } else {
        Err(KError::AlreadyExists)
    }
}

pub fn instance() -> Option<&'static Arc<CoreCtl>> {
    CORE_CTL.get()
}
