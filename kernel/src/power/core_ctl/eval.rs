//! Need evaluator
//!
//! Turns per-CPU busy% and the sampled run-queue depth into a target
//! online count. Increases are taken at once; a decrease must hold for
//! `offline_delay_ms` before it is accepted, otherwise the offline-delay
//! timer is armed for the remaining time.

use std::time::Duration;

use super::cluster::{Cluster, ClusterState};
use super::MAX_CPUS_PER_CLUSTER;

/// Bump the busy-CPU count by run-queue pressure
fn apply_task_need(st: &ClusterState, need: u32) -> u32 {
    // Enough tasks to use every CPU
    if st.nrrun >= st.task_thres {
        return st.num_cpus();
    }

    // More tasks than busy CPUs: one more
    if st.nrrun > need {
        return need + 1;
    }

    need
}

impl Cluster {
    /// Re-evaluate `need_cpus`. Returns true when the clamped need changed
    /// and the executor has work to do.
    pub fn eval_need(&self) -> bool {
        let now = self.clock.now_ms();
        let mut st = self.state.lock();

        let thres_idx = (st.online_cpus.saturating_sub(1) as usize).min(MAX_CPUS_PER_CLUSTER - 1);
        let up = st.busy_up_thres[thres_idx];
        let down = st.busy_down_thres[thres_idx];

        let mut need = 0;
        for c in st.cpus.iter_mut() {
            if c.busy >= up {
                c.is_busy = true;
            } else if c.busy < down {
                c.is_busy = false;
            }
            need += c.is_busy as u32;
        }
        let need = apply_task_need(&st, need);
        let last_need = st.need_cpus;

        if need >= last_need {
            // A decrease waiting on the offline delay no longer holds
            if let Some(timer) = self.offline_timer.get() {
                timer.del_timer();
            }
        }

        if need == last_need {
            st.need_ts = now;
            return false;
        }

        if need < last_need {
            let elapsed = now.saturating_sub(st.need_ts);
            if elapsed < st.offline_delay_ms {
                let remaining = st.offline_delay_ms - elapsed;
                drop(st);
                if let Some(timer) = self.offline_timer.get() {
                    timer.mod_timer(Duration::from_millis(remaining));
                }
                return false;
            }
        }

        let changed = st.apply_limits(need) != st.apply_limits(last_need);
        st.need_cpus = need;
        st.need_ts = now;

        log::trace!(
            "core_ctl: cluster {} need {} -> {} (online {}, nrrun {})",
            self.first_cpu(), last_need, need, st.online_cpus, st.nrrun
        );
        changed
    }

    /// Evaluate and wake the executor if the target moved
    pub fn apply_need(&self) {
        if self.eval_need() {
            self.wake();
        }
    }

    /// New busy% for one CPU from the governor load stream
    pub(super) fn set_busy(&self, cpu: u32, busy: u32) {
        let Some(slot) = self.slot(cpu) else {
            return;
        };
        let busy = busy.min(100);
        {
            let mut st = self.state.lock();
            if st.cpus[slot].busy == busy && !st.nrrun_changed {
                return;
            }
            st.cpus[slot].busy = busy;
            st.nrrun_changed = false;
        }
        self.apply_need();
    }

    /// Store a fresh run-queue sample. With `trigger` the evaluator runs
    /// right away, otherwise the next load update picks the change up.
    pub(super) fn update_nrrun(&self, avg: u32, big_avg: u32, trigger: bool) {
        let changed = {
            let mut st = self.state.lock();
            let old = st.nrrun;
            st.nrrun = if st.is_big_cluster { big_avg } else { avg };
            let changed = st.nrrun != old;
            if changed && !trigger {
                st.nrrun_changed = true;
            }
            changed
        };

        if changed && trigger {
            self.apply_need();
        }
    }

    pub(super) fn offline_timer_fired(&self) {
        let disabled = self.state.lock().disabled;
        if self.eval_need() && !disabled {
            self.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::cluster::tests::test_cluster;
    use super::super::CoreCtlConfig;
    use super::*;

    fn tuned() -> CoreCtlConfig {
        CoreCtlConfig {
            busy_up_thres: 90,
            busy_down_thres: 40,
            ..CoreCtlConfig::default()
        }
    }

    fn set_all_busy(cluster: &Cluster, busy: u32) {
        for cpu in cluster.mask() {
            cluster.set_busy(cpu, busy);
        }
    }

    #[test]
    fn test_default_thresholds_keep_all_cores() {
        let (_hp, _clock, cluster) = test_cluster(&CoreCtlConfig::default());
        set_all_busy(&cluster, 0);
        assert!(!cluster.eval_need());
        assert_eq!(cluster.need_cpus(), 4);
    }

    #[test]
    fn test_decrease_waits_for_offline_delay() {
        let (_hp, clock, cluster) = test_cluster(&tuned());
        cluster.update_nrrun(0, 0, false);
        set_all_busy(&cluster, 10);
        assert_eq!(cluster.need_cpus(), 4);

        clock.advance(99);
        assert!(!cluster.eval_need());
        assert_eq!(cluster.need_cpus(), 4);

        clock.advance(1);
        assert!(cluster.eval_need());
        assert_eq!(cluster.need_cpus(), 0);
        assert_eq!(cluster.state.lock().apply_limits(0), 1);
    }

    #[test]
    fn test_shorter_offline_delay_applies_at_once() {
        let (_hp, clock, cluster) = test_cluster(&tuned());
        cluster.update_nrrun(0, 0, false);
        set_all_busy(&cluster, 10);

        clock.advance(50);
        cluster.set_offline_delay_ms(30);
        assert_eq!(cluster.need_cpus(), 0);
    }

    #[test]
    fn test_equal_need_refreshes_timestamp() {
        let (_hp, clock, cluster) = test_cluster(&tuned());
        cluster.update_nrrun(0, 0, false);
        set_all_busy(&cluster, 95);
        assert_eq!(cluster.need_cpus(), 4);

        clock.advance(500);
        assert!(!cluster.eval_need());

        // Stable until now, so the delay counts from here
        set_all_busy(&cluster, 10);
        clock.advance(50);
        assert!(!cluster.eval_need());
        assert_eq!(cluster.need_cpus(), 4);
        clock.advance(50);
        assert!(cluster.eval_need());
    }

    #[test]
    fn test_superseded_decrease_cancels_offline_timer() {
        let (_hp, _clock, cluster) = test_cluster(&tuned());
        cluster.start().unwrap();
        cluster.update_nrrun(0, 0, false);

        set_all_busy(&cluster, 10);
        assert_eq!(cluster.need_cpus(), 4);
        let timer = cluster.offline_timer.get().unwrap();
        assert!(timer.del_timer());

        // Armed again, then the load comes back before the deadline
        cluster.set_busy(4, 20);
        set_all_busy(&cluster, 95);
        assert_eq!(cluster.need_cpus(), 4);
        assert!(!timer.del_timer());
        cluster.stop();
    }

    #[test]
    fn test_increase_is_immediate() {
        let (_hp, clock, cluster) = test_cluster(&tuned());
        cluster.update_nrrun(0, 0, false);
        set_all_busy(&cluster, 10);
        clock.advance(100);
        cluster.eval_need();
        assert_eq!(cluster.need_cpus(), 0);

        cluster.set_busy(4, 95);
        cluster.set_busy(5, 95);
        assert_eq!(cluster.need_cpus(), 2);
    }

    #[test]
    fn test_hysteresis_band() {
        let (_hp, _clock, cluster) = test_cluster(&tuned());
        cluster.set_busy(4, 90);
        assert!(cluster.cpu_status(4).unwrap().is_busy);

        // At the down threshold the CPU stays busy
        cluster.set_busy(4, 40);
        assert!(cluster.cpu_status(4).unwrap().is_busy);

        cluster.set_busy(4, 39);
        assert!(!cluster.cpu_status(4).unwrap().is_busy);

        // Inside the band it stays idle
        cluster.set_busy(4, 89);
        assert!(!cluster.cpu_status(4).unwrap().is_busy);
    }

    #[test]
    fn test_task_pressure() {
        let (_hp, clock, cluster) = test_cluster(&tuned());
        cluster.set_task_thres(4).unwrap();
        cluster.update_nrrun(0, 0, false);
        set_all_busy(&cluster, 10);
        clock.advance(100);
        cluster.eval_need();
        assert_eq!(cluster.need_cpus(), 0);

        // nrrun above the busy count asks for one more CPU
        cluster.update_nrrun(3, 0, true);
        assert_eq!(cluster.need_cpus(), 1);

        // nrrun at task_thres asks for the whole cluster
        cluster.update_nrrun(4, 0, true);
        assert_eq!(cluster.need_cpus(), 4);
    }

    #[test]
    fn test_big_cluster_uses_big_average() {
        let (_hp, _clock, cluster) = test_cluster(&tuned());
        cluster.set_is_big_cluster(true);
        cluster.update_nrrun(3, 1, true);
        assert_eq!(cluster.status().nrrun, 1);
    }

    #[test]
    fn test_nrrun_change_forces_next_load_update() {
        let (_hp, _clock, cluster) = test_cluster(&tuned());
        cluster.set_busy(4, 50);
        cluster.update_nrrun(2, 0, false);
        assert!(cluster.state.lock().nrrun_changed);

        // Same busy% still re-evaluates once
        cluster.set_busy(4, 50);
        assert!(!cluster.state.lock().nrrun_changed);
    }

    #[test]
    fn test_change_absorbed_by_limits_is_not_actionable() {
        let (_hp, clock, cluster) = test_cluster(&tuned());
        cluster.set_min_cpus(4).unwrap();
        cluster.update_nrrun(0, 0, false);
        set_all_busy(&cluster, 10);
        clock.advance(100);
        assert!(!cluster.eval_need());
        assert_eq!(cluster.need_cpus(), 0);
    }

    #[test]
    fn test_busy_clamped_to_100() {
        let (_hp, _clock, cluster) = test_cluster(&tuned());
        cluster.set_busy(6, 250);
        assert_eq!(cluster.cpu_status(6).unwrap().busy, 100);
    }
}
