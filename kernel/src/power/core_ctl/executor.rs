//! Hotplug executor
//!
//! Runs on the cluster's `core_ctl/<cpu>` thread. Each pass walks the LRU
//! and requests offline or online transitions until the online count
//! matches the clamped need. Hotplug notifications raised by those requests
//! land on the pending list because the pass holds the LRU lock; they are
//! folded back into the LRU when the pass ends. A CPU queued on the pending
//! list keeps its old LRU position for the walk.

use super::cluster::Cluster;
use super::cpu::LruList;

impl Cluster {
    /// One convergence pass
    pub(super) fn do_hotplug(&self) {
        let lru = self.lru.lock();
        let order: Vec<u32> = lru.iter().copied().collect();

        let (target, max, online) = {
            let st = self.state.lock();
            if st.disabled {
                (st.num_cpus(), st.num_cpus(), st.online_cpus)
            } else {
                (st.apply_limits(st.need_cpus), st.max_cpus, st.online_cpus)
            }
        };

        log::debug!(
            "core_ctl: cluster {} online {} target {}",
            self.first_cpu(), online, target
        );

        if online > target {
            // Idle CPUs first, down to the need
            self.offline_walk(&order, target, true);

            // Busy CPUs only to get under the hard ceiling
            if self.online_cpus() > max {
                self.offline_walk(&order, max, false);
            }
        } else if online < target {
            self.online_walk(&order, target, false);

            if self.online_cpus() < target {
                self.online_walk(&order, target, true);
            }
        }

        drop(lru);
        self.update_lru();
    }

    fn offline_walk(&self, order: &[u32], target: u32, skip_busy: bool) {
        for &cpu in order {
            let Some(slot) = self.slot(cpu) else {
                continue;
            };
            {
                let st = self.state.lock();
                if st.online_cpus <= target {
                    break;
                }
                let c = &st.cpus[slot];
                if !c.online || (skip_busy && c.is_busy) {
                    continue;
                }
            }

            log::debug!("core_ctl: trying to offline CPU{}", cpu);
            if let Err(e) = self.hotplug.cpu_down(cpu) {
                log::debug!("core_ctl: unable to offline CPU{}: {:?}", cpu, e);
            }
        }
    }

    /// First pass skips not-preferred CPUs; the second takes only them
    fn online_walk(&self, order: &[u32], target: u32, not_preferred: bool) {
        for &cpu in order {
            let Some(slot) = self.slot(cpu) else {
                continue;
            };
            {
                let st = self.state.lock();
                if st.online_cpus >= target {
                    break;
                }
                let c = &st.cpus[slot];
                if c.online || c.rejected || c.not_preferred != not_preferred {
                    continue;
                }
            }

            log::debug!("core_ctl: trying to online CPU{}", cpu);
            if let Err(e) = self.hotplug.cpu_up(cpu) {
                log::debug!("core_ctl: unable to online CPU{}: {:?}", cpu, e);
            }
        }
    }

    /// Move CPUs queued on the pending list to the LRU tail, in queue order
    pub(super) fn update_lru(&self) {
        let mut lru = self.lru.lock();
        let mut pending = self.pending_lru.lock();
        if pending.is_empty() {
            return;
        }

        let mut st = self.state.lock();
        while let Some(cpu) = pending.pop_front() {
            lru.retain(|&c| c != cpu);
            lru.push_back(cpu);
            if let Some(slot) = self.slot(cpu) {
                st.cpus[slot].list = LruList::Settled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::cluster::tests::test_cluster;
    use super::super::CoreCtlConfig;
    use super::*;
    use crate::cpu::{HotplugAction, NotifierPriority};
    use crate::util::KError;

    fn tuned() -> CoreCtlConfig {
        CoreCtlConfig {
            busy_up_thres: 90,
            busy_down_thres: 40,
            ..CoreCtlConfig::default()
        }
    }

    /// Drive the cluster to an accepted need of zero
    fn settle_idle(cluster: &Cluster, clock: &crate::time::ManualClock) {
        cluster.update_nrrun(0, 0, false);
        for cpu in cluster.mask() {
            cluster.set_busy(cpu, 10);
        }
        clock.advance(cluster.status().offline_delay_ms);
        cluster.eval_need();
    }

    #[test]
    fn test_offline_to_need_keeps_most_recent() {
        let (hp, clock, cluster) = test_cluster(&tuned());
        settle_idle(&cluster, &clock);

        cluster.do_hotplug();

        let s = cluster.status();
        assert_eq!(s.online_cpus, 1);
        assert!(hp.is_online(7));
        assert!(!hp.is_online(4) && !hp.is_online(5) && !hp.is_online(6));
        // Offlined CPUs moved to the tail in the order they went down
        assert_eq!(s.lru, vec![7, 4, 5, 6]);
        assert!(cluster.pending_lru.lock().is_empty());
    }

    #[test]
    fn test_busy_cpus_protected_until_max() {
        let (hp, clock, cluster) = test_cluster(&tuned());
        settle_idle(&cluster, &clock);
        for cpu in cluster.mask() {
            cluster.set_busy(cpu, 95);
        }
        // All busy: need back to 4, then cap it
        cluster.set_max_cpus(2).unwrap();
        cluster.do_hotplug();

        assert_eq!(cluster.online_cpus(), 2);
        assert!(hp.is_online(6) && hp.is_online(7));
    }

    #[test]
    fn test_online_prefers_preferred_cpus() {
        let (hp, clock, cluster) = test_cluster(&tuned());
        settle_idle(&cluster, &clock);
        cluster.do_hotplug();
        assert_eq!(cluster.online_cpus(), 1);

        // LRU is now 7, 4, 5, 6; mark 4 not preferred
        cluster.set_not_preferred(&[true, false, false, false]).unwrap();
        cluster.set_min_cpus(3).unwrap();
        cluster.do_hotplug();

        assert_eq!(cluster.online_cpus(), 3);
        assert!(hp.is_online(5) && hp.is_online(6));
        assert!(!hp.is_online(4));

        // Not-preferred CPUs are used once the others run out
        cluster.set_min_cpus(4).unwrap();
        cluster.do_hotplug();
        assert!(hp.is_online(4));
    }

    #[test]
    fn test_offline_failure_moves_to_next_candidate() {
        let (hp, clock, cluster) = test_cluster(&tuned());
        hp.set_can_offline(4, false);
        settle_idle(&cluster, &clock);
        cluster.set_min_cpus(2).unwrap();
        cluster.do_hotplug();

        let s = cluster.status();
        assert_eq!(s.online_cpus, 2);
        assert!(hp.is_online(4));
        assert!(!hp.is_online(5) && !hp.is_online(6));
    }

    #[test]
    fn test_rejected_cpu_skipped_when_onlining() {
        let (hp, clock, cluster) = test_cluster(&tuned());
        settle_idle(&cluster, &clock);
        cluster.do_hotplug();

        hp.register_notifier(
            "thermal",
            NotifierPriority::Low,
            Box::new(|cpu, action, _| match (cpu, action) {
                (4, HotplugAction::UpPrepare) => Err(KError::Busy),
                _ => Ok(()),
            }),
        );

        cluster.set_min_cpus(4).unwrap();
        cluster.do_hotplug();
        let s = cluster.status();
        assert_eq!(s.online_cpus, 3);
        assert_eq!(s.avail_cpus, 3);
        assert!(cluster.cpu_status(4).unwrap().rejected);

        // A second pass does not retry it
        cluster.do_hotplug();
        assert_eq!(cluster.status().avail_cpus, 3);
    }

    #[test]
    fn test_cpu_lost_while_lru_held_is_refilled() {
        let (hp, _clock, cluster) = test_cluster(&tuned());
        cluster.update_nrrun(0, 0, false);
        for cpu in cluster.mask() {
            cluster.set_busy(cpu, 95);
        }

        // A diagnostics read holds the LRU while CPU 5 dies
        {
            let _held = cluster.lru.lock();
            hp.cpu_down(5).unwrap();
        }
        assert_eq!(cluster.online_cpus(), 3);
        assert_eq!(cluster.lru_order(), vec![4, 6, 7, 5]);

        cluster.do_hotplug();

        assert_eq!(cluster.online_cpus(), 4);
        assert!(hp.is_online(5));
        assert_eq!(cluster.status().lru, vec![4, 6, 7, 5]);
        assert!(cluster.pending_lru.lock().is_empty());
    }

    #[test]
    fn test_disabled_restores_all_cores() {
        let (hp, clock, cluster) = test_cluster(&tuned());
        settle_idle(&cluster, &clock);
        cluster.do_hotplug();
        assert_eq!(cluster.online_cpus(), 1);

        cluster.set_disabled(true);
        cluster.do_hotplug();
        assert_eq!(cluster.online_cpus(), 4);
        assert_eq!(hp.online_count(), 8);
    }
}
