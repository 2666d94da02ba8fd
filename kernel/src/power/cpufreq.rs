//! CPU Frequency Scaling policies
//!
//! Implements:
//! - cpufreq policies (one per group of CPUs sharing a clock)
//! - CPU frequency governors
//! - Policy notifier chain (policy creation and removal)
//! - Governor load notifier chain (per-CPU busy% reports)
//!
//! Load reports only flow for governors that sample load themselves
//! (`ondemand`, `interactive`); the static governors never produce them.

use spin::RwLock;

use crate::cpu::CpuMask;
use crate::util::{KError, KResult};

/// Default governor sampling period
pub const DEFAULT_SAMPLING_RATE_US: u32 = 20_000;

/// CPU frequency governor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Governor {
    Performance,
    Powersave,
    Userspace,
    Ondemand,
    #[default]
    Interactive,
}

impl Governor {
    /// Whether this governor samples CPU load and reports it
    pub fn samples_load(&self) -> bool {
        matches!(self, Governor::Ondemand | Governor::Interactive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Powersave => "powersave",
            Self::Userspace => "userspace",
            Self::Ondemand => "ondemand",
            Self::Interactive => "interactive",
        }
    }
}

/// A cpufreq policy: a set of CPUs that scale together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuFreqPolicy {
    /// Policy owner (lowest CPU in `related_cpus`)
    pub cpu: u32,
    /// All CPUs covered by this policy
    pub related_cpus: CpuMask,
    pub governor: Governor,
}

/// Policy notifier events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    CreatePolicy,
    RemovePolicy,
}

/// Governor load report for one CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovInfo {
    pub cpu: u32,
    /// Busy percentage, 0..=100
    pub load: u32,
    pub sampling_rate_us: u32,
}

pub type PolicyCallback = Box<dyn Fn(PolicyEvent, &CpuFreqPolicy) + Send + Sync>;
pub type LoadCallback = Box<dyn Fn(&GovInfo) + Send + Sync>;

/// What the governor needs from cpufreq
pub trait CpuFreqOps: Send + Sync {
    /// Policy covering `cpu`, if any
    fn policy(&self, cpu: u32) -> Option<CpuFreqPolicy>;
    fn register_policy_notifier(&self, name: &str, callback: PolicyCallback);
    fn unregister_policy_notifier(&self, name: &str);
    fn register_load_notifier(&self, name: &str, callback: LoadCallback);
    fn unregister_load_notifier(&self, name: &str);
}

struct Notifier<C> {
    name: String,
    callback: C,
}

/// CPU frequency manager
pub struct CpuFreqManager {
    policies: RwLock<Vec<CpuFreqPolicy>>,
    policy_notifiers: RwLock<Vec<Notifier<PolicyCallback>>>,
    load_notifiers: RwLock<Vec<Notifier<LoadCallback>>>,
    sampling_rate_us: u32,
}

impl Default for CpuFreqManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuFreqManager {
    pub const fn new() -> Self {
        CpuFreqManager {
            policies: RwLock::new(Vec::new()),
            policy_notifiers: RwLock::new(Vec::new()),
            load_notifiers: RwLock::new(Vec::new()),
            sampling_rate_us: DEFAULT_SAMPLING_RATE_US,
        }
    }

    /// Create a policy over `related_cpus`. Returns the policy CPU.
    pub fn add_policy(&self, related_cpus: CpuMask, governor: Governor) -> KResult<u32> {
        let cpu = related_cpus.first().ok_or(KError::Invalid)?;

        let policy = CpuFreqPolicy { cpu, related_cpus, governor };
        {
            let mut policies = self.policies.write();
            if policies.iter().any(|p| p.related_cpus.intersects(&related_cpus)) {
                return Err(KError::AlreadyExists);
            }
            policies.push(policy.clone());
        }

        log::info!(
            "cpufreq: policy{} created for CPUs {} ({})",
            cpu, related_cpus, governor.as_str()
        );
        self.notify_policy(PolicyEvent::CreatePolicy, &policy);
        Ok(cpu)
    }

    /// Remove the policy owned by `cpu`
    pub fn remove_policy(&self, cpu: u32) -> KResult<()> {
        let policy = {
            let mut policies = self.policies.write();
            let idx = policies.iter().position(|p| p.cpu == cpu).ok_or(KError::NotFound)?;
            policies.remove(idx)
        };

        log::info!("cpufreq: policy{} removed", cpu);
        self.notify_policy(PolicyEvent::RemovePolicy, &policy);
        Ok(())
    }

    /// Policy covering `cpu`
    pub fn policy(&self, cpu: u32) -> Option<CpuFreqPolicy> {
        self.policies
            .read()
            .iter()
            .find(|p| p.related_cpus.test(cpu))
            .cloned()
    }

    pub fn sampling_rate_us(&self) -> u32 {
        self.sampling_rate_us
    }

    /// Governor-side load report for one CPU
    pub fn report_load(&self, cpu: u32, load: u32) -> KResult<()> {
        if load > 100 {
            return Err(KError::OutOfRange);
        }

        let governor = self.policy(cpu).ok_or(KError::NotFound)?.governor;
        if !governor.samples_load() {
            return Ok(());
        }

        let info = GovInfo {
            cpu,
            load,
            sampling_rate_us: self.sampling_rate_us(),
        };
        for notifier in self.load_notifiers.read().iter() {
            (notifier.callback)(&info);
        }
        Ok(())
    }

    fn notify_policy(&self, event: PolicyEvent, policy: &CpuFreqPolicy) {
        for notifier in self.policy_notifiers.read().iter() {
            (notifier.callback)(event, policy);
        }
    }

    pub fn register_policy_notifier(&self, name: &str, callback: PolicyCallback) {
        self.policy_notifiers.write().push(Notifier {
            name: String::from(name),
            callback,
        });
    }

    pub fn unregister_policy_notifier(&self, name: &str) {
        self.policy_notifiers.write().retain(|n| n.name != name);
    }

    pub fn register_load_notifier(&self, name: &str, callback: LoadCallback) {
        self.load_notifiers.write().push(Notifier {
            name: String::from(name),
            callback,
        });
    }

    pub fn unregister_load_notifier(&self, name: &str) {
        self.load_notifiers.write().retain(|n| n.name != name);
    }
}

impl CpuFreqOps for CpuFreqManager {
    fn policy(&self, cpu: u32) -> Option<CpuFreqPolicy> {
        CpuFreqManager::policy(self, cpu)
    }

    fn register_policy_notifier(&self, name: &str, callback: PolicyCallback) {
        CpuFreqManager::register_policy_notifier(self, name, callback);
    }

    fn unregister_policy_notifier(&self, name: &str) {
        CpuFreqManager::unregister_policy_notifier(self, name);
    }

    fn register_load_notifier(&self, name: &str, callback: LoadCallback) {
        CpuFreqManager::register_load_notifier(self, name, callback);
    }

    fn unregister_load_notifier(&self, name: &str) {
        CpuFreqManager::unregister_load_notifier(self, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_governor_names() {
        assert_eq!(Governor::Interactive.as_str(), "interactive");
        assert!(Governor::Interactive.samples_load());
        assert!(!Governor::Performance.samples_load());
    }

    #[test]
    fn test_add_policy_notifies_and_rejects_overlap() {
        let mgr = CpuFreqManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        mgr.register_policy_notifier(
            "test",
            Box::new(move |event, policy| s.lock().push((event, policy.cpu))),
        );

        assert_eq!(mgr.add_policy(CpuMask::from_range(4, 4), Governor::Interactive), Ok(4));
        assert_eq!(
            mgr.add_policy(CpuMask::from_cpus(&[3, 4]), Governor::Interactive),
            Err(KError::AlreadyExists)
        );
        assert_eq!(
            mgr.add_policy(CpuMask::empty(), Governor::Interactive),
            Err(KError::Invalid)
        );
        mgr.remove_policy(4).unwrap();
        assert_eq!(mgr.remove_policy(4), Err(KError::NotFound));

        assert_eq!(
            *seen.lock(),
            vec![(PolicyEvent::CreatePolicy, 4), (PolicyEvent::RemovePolicy, 4)]
        );
    }

    #[test]
    fn test_policy_lookup_by_member_cpu() {
        let mgr = CpuFreqManager::new();
        mgr.add_policy(CpuMask::from_range(0, 4), Governor::Ondemand).unwrap();
        let policy = mgr.policy(2).unwrap();
        assert_eq!(policy.cpu, 0);
        assert_eq!(policy.related_cpus.weight(), 4);
        assert!(mgr.policy(5).is_none());
    }

    #[test]
    fn test_report_load_only_for_sampling_governors() {
        let mgr = CpuFreqManager::new();
        mgr.add_policy(CpuMask::from_range(0, 2), Governor::Interactive).unwrap();
        mgr.add_policy(CpuMask::from_range(2, 2), Governor::Performance).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        mgr.register_load_notifier("test", Box::new(move |info| s.lock().push(*info)));

        mgr.report_load(1, 55).unwrap();
        assert_eq!(mgr.report_load(1, 101), Err(KError::OutOfRange));
        assert_eq!(mgr.report_load(7, 10), Err(KError::NotFound));

        mgr.report_load(3, 70).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], GovInfo { cpu: 1, load: 55, sampling_rate_us: DEFAULT_SAMPLING_RATE_US });
    }

    #[test]
    fn test_unregister_load_notifier() {
        let mgr = CpuFreqManager::new();
        mgr.add_policy(CpuMask::from_range(0, 1), Governor::Ondemand).unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        mgr.register_load_notifier(
            "test",
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        mgr.report_load(0, 10).unwrap();
        mgr.unregister_load_notifier("test");
        mgr.report_load(0, 10).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
