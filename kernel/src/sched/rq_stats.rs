//! Run-queue statistics
//!
//! Time-weighted averages of the number of runnable tasks. The scheduler
//! calls [`RqStats::update`] whenever the counts change; a reader calls
//! [`NrRunningSource::nr_running_avg`] to get the averages over the window
//! since its previous read, in hundredths of a task.
//!
//! Example: one task for 10 ms then three tasks for 10 ms reads as 200.

use std::sync::Arc;

use spin::Mutex;

use crate::time::Clock;

/// Windowed run-queue averages, in hundredths of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NrRunningAvg {
    /// All runnable tasks
    pub avg: u32,
    /// Tasks blocked on I/O
    pub iowait_avg: u32,
    /// Tasks heavy enough to need a big core
    pub big_avg: u32,
}

/// Source of nr-running averages
pub trait NrRunningSource: Send + Sync {
    /// Averages since the previous call; starts a new window
    fn nr_running_avg(&self) -> NrRunningAvg;
}

#[derive(Debug, Default)]
struct RqWindow {
    nr_running: u32,
    nr_iowait: u32,
    nr_big: u32,
    /// Time of the last count change or read
    last_update_ms: u64,
    window_start_ms: u64,
    /// Integrals in task-milliseconds
    run_sum: u64,
    iowait_sum: u64,
    big_sum: u64,
}

impl RqWindow {
    fn accumulate(&mut self, now: u64) {
        let delta = now.saturating_sub(self.last_update_ms);
        self.run_sum += self.nr_running as u64 * delta;
        self.iowait_sum += self.nr_iowait as u64 * delta;
        self.big_sum += self.nr_big as u64 * delta;
        self.last_update_ms = now;
    }
}

/// Global run-queue statistics
pub struct RqStats {
    clock: Arc<dyn Clock>,
    window: Mutex<RqWindow>,
}

impl RqStats {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            window: Mutex::new(RqWindow {
                last_update_ms: now,
                window_start_ms: now,
                ..RqWindow::default()
            }),
        }
    }

    /// Record new instantaneous counts
    pub fn update(&self, nr_running: u32, nr_iowait: u32, nr_big: u32) {
        let now = self.clock.now_ms();
        let mut w = self.window.lock();
        w.accumulate(now);
        w.nr_running = nr_running;
        w.nr_iowait = nr_iowait;
        w.nr_big = nr_big;
    }

    /// Current instantaneous runnable count
    pub fn nr_running(&self) -> u32 {
        self.window.lock().nr_running
    }
}

impl NrRunningSource for RqStats {
    fn nr_running_avg(&self) -> NrRunningAvg {
        let now = self.clock.now_ms();
        let mut w = self.window.lock();
        w.accumulate(now);

        let elapsed = now.saturating_sub(w.window_start_ms);
        let avg = if elapsed == 0 {
            // Empty window: report the instantaneous counts
            NrRunningAvg {
                avg: w.nr_running * 100,
                iowait_avg: w.nr_iowait * 100,
                big_avg: w.nr_big * 100,
            }
        } else {
            NrRunningAvg {
                avg: (w.run_sum * 100 / elapsed) as u32,
                iowait_avg: (w.iowait_sum * 100 / elapsed) as u32,
                big_avg: (w.big_sum * 100 / elapsed) as u32,
            }
        };

        w.run_sum = 0;
        w.iowait_sum = 0;
        w.big_sum = 0;
        w.window_start_ms = now;
        avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn stats() -> (Arc<ManualClock>, RqStats) {
        let clock = Arc::new(ManualClock::new(1000));
        let stats = RqStats::new(clock.clone());
        (clock, stats)
    }

    #[test]
    fn test_time_weighted_average() {
        let (clock, stats) = stats();
        stats.update(1, 0, 0);
        clock.advance(10);
        stats.update(3, 1, 2);
        clock.advance(10);

        let avg = stats.nr_running_avg();
        assert_eq!(avg.avg, 200);
        assert_eq!(avg.iowait_avg, 50);
        assert_eq!(avg.big_avg, 100);
    }

    #[test]
    fn test_window_resets_on_read() {
        let (clock, stats) = stats();
        stats.update(4, 0, 4);
        clock.advance(20);
        assert_eq!(stats.nr_running_avg().avg, 400);

        stats.update(1, 0, 0);
        clock.advance(20);
        let avg = stats.nr_running_avg();
        assert_eq!(avg.avg, 100);
        assert_eq!(avg.big_avg, 0);
    }

    #[test]
    fn test_empty_window_reports_instantaneous() {
        let (_clock, stats) = stats();
        stats.update(2, 0, 1);
        let avg = stats.nr_running_avg();
        assert_eq!(avg, NrRunningAvg { avg: 200, iowait_avg: 0, big_avg: 100 });
        assert_eq!(stats.nr_running(), 2);
    }

    #[test]
    fn test_partial_task_rounds_down() {
        let (clock, stats) = stats();
        stats.update(1, 0, 0);
        clock.advance(19);
        stats.update(0, 0, 0);
        clock.advance(1);
        assert_eq!(stats.nr_running_avg().avg, 95);
    }
}
