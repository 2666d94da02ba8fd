//! Kernel-style timers
//!
//! A [`Timer`] owns one thread that sleeps until the armed expiry and then
//! runs the timer function. Semantics follow the classic kernel API:
//! - `mod_timer` arms or re-arms (the latest call wins)
//! - `del_timer` disarms without waiting
//! - `shutdown` disarms, waits for a running callback and joins the thread
//!
//! The timer function runs with no timer lock held, so it may re-arm its
//! own timer.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::util::{KError, KResult};

struct TimerState {
    expires: Option<Instant>,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl TimerInner {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Timer {
    inner: Arc<TimerInner>,
    handle: spin::Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Timer {
    /// Create a disarmed timer running `function` on expiry
    pub fn new<F>(name: &str, function: F) -> KResult<Self>
    where
        F: Fn() + Send + 'static,
    {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState { expires: None, shutdown: false }),
            cond: Condvar::new(),
        });

        let thread_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(String::from(name))
            .spawn(move || timer_thread(thread_inner, function))
            .map_err(|_| KError::NoMemory)?;
        let thread_id = handle.thread().id();

        Ok(Self {
            inner,
            handle: spin::Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Arm the timer to fire `delay` from now, replacing any pending expiry
    pub fn mod_timer(&self, delay: Duration) {
        let mut state = self.inner.lock();
        if state.shutdown {
            return;
        }
        state.expires = Some(Instant::now() + delay);
        self.inner.cond.notify_all();
    }

    /// Disarm the timer. Returns whether it was pending.
    pub fn del_timer(&self) -> bool {
        let mut state = self.inner.lock();
        let was_pending = state.expires.take().is_some();
        self.inner.cond.notify_all();
        was_pending
    }

    /// Disarm, wait for a running callback to finish and reap the thread.
    ///
    /// Safe to call from the timer function itself; the thread then exits
    /// after the callback returns.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.lock();
            state.expires = None;
            state.shutdown = true;
            self.inner.cond.notify_all();
        }

        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_thread<F: Fn()>(inner: Arc<TimerInner>, function: F) {
    let mut state = inner.lock();
    loop {
        if state.shutdown {
            break;
        }

        match state.expires {
            None => {
                state = inner.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            Some(expires) => {
                let now = Instant::now();
                if now < expires {
                    state = inner
                        .cond
                        .wait_timeout(state, expires - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    continue;
                }

                state.expires = None;
                drop(state);
                function();
                state = inner.lock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_timer_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let timer = Timer::new("test-timer", move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        timer.mod_timer(Duration::from_millis(5));
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.del_timer());
        timer.shutdown();
    }

    #[test]
    fn test_del_timer_cancels() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let timer = Timer::new("test-timer", move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        timer.mod_timer(Duration::from_millis(50));
        assert!(timer.del_timer());
        assert!(!timer.del_timer());
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mod_timer_rearms() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let timer = Timer::new("test-timer", move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        timer.mod_timer(Duration::from_secs(30));
        timer.mod_timer(Duration::from_millis(5));
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_shutdown_disarms() {
        let timer = Timer::new("test-timer", || {}).unwrap();
        timer.mod_timer(Duration::from_secs(30));
        timer.shutdown();
        assert!(!timer.del_timer());
        timer.mod_timer(Duration::from_millis(1));
        assert!(!timer.del_timer());
    }
}
