//! Run-queue average sampler
//!
//! Reads the scheduler's windowed nr-running averages at most once per
//! `rq_avg_period_ms` and hands each cluster its task-pressure estimate:
//! big clusters get the big-task average, the rest the overall one.

use std::time::Duration;

use super::{CoreCtl, NR_RUNNING_TOLERANCE, RQ_AVG_TOLERANCE_MS};
use crate::util::{KError, KResult};

pub(super) struct RqAvgState {
    pub period_ms: u64,
    pub last_sample_ms: Option<u64>,
}

/// Hundredths of a task to whole tasks. Rounds up only within
/// `NR_RUNNING_TOLERANCE` of the next task, so a short-lived task does not
/// count as a full one.
pub(super) fn round_nr_running(avg: u32) -> u32 {
    avg.saturating_add(NR_RUNNING_TOLERANCE) / 100
}

impl CoreCtl {
    /// Take a sample unless one was taken within the current period.
    /// With `trigger` the clusters re-evaluate at once; otherwise the next
    /// load update does it.
    pub fn update_running_avg(&self, trigger: bool) {
        let avg = {
            let mut rq = self.rq_avg.lock();
            let now = self.clock.now_ms();
            if let Some(last) = rq.last_sample_ms {
                if now.saturating_sub(last) < rq.period_ms.saturating_sub(RQ_AVG_TOLERANCE_MS) {
                    return;
                }
            }
            rq.last_sample_ms = Some(now);
            self.rq_stats.nr_running_avg()
        };

        let nrrun = round_nr_running(avg.avg);
        let big_nrrun = round_nr_running(avg.big_avg);

        for cluster in self.clusters() {
            cluster.update_nrrun(nrrun, big_nrrun, trigger);
        }
    }

    pub fn rq_avg_period_ms(&self) -> u64 {
        self.rq_avg.lock().period_ms
    }

    pub fn set_rq_avg_period_ms(&self, period_ms: u64) -> KResult<()> {
        if period_ms <= RQ_AVG_TOLERANCE_MS {
            return Err(KError::Invalid);
        }
        self.rq_avg.lock().period_ms = period_ms;
        Ok(())
    }

    pub(super) fn rq_avg_timer_fired(&self) {
        self.update_running_avg(true);
        self.arm_sampler();
    }

    /// Arm the sampler for the next multiple of the period
    pub(super) fn arm_sampler(&self) {
        let period = self.rq_avg_period_ms();
        let now = self.clock.now_ms();
        let delay = (now / period + 1) * period - now;
        if let Some(timer) = self.sampler.get() {
            timer.mod_timer(Duration::from_millis(delay));
        }
    }
}
