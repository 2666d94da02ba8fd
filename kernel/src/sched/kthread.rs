//! Kernel-style worker threads
//!
//! A [`KThread`] sleeps until woken, then runs its work function. Wakeups
//! coalesce: any number of `wake` calls while the work is running or
//! pending result in one more run. Stopping is cooperative; the thread
//! checks the stop flag before each run and after every wakeup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread, ThreadId};

use spin::Mutex;

use crate::util::{KError, KResult};

struct KThreadShared {
    pending: AtomicBool,
    should_stop: AtomicBool,
}

pub struct KThread {
    name: String,
    shared: Arc<KThreadShared>,
    thread: Thread,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl KThread {
    /// Spawn a named worker thread running `work` once per wakeup
    pub fn spawn<F>(name: &str, mut work: F) -> KResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(KThreadShared {
            pending: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                loop {
                    if thread_shared.should_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if thread_shared.pending.swap(false, Ordering::SeqCst) {
                        work();
                        continue;
                    }
                    thread::park();
                }
            })
            .map_err(|_| KError::NoMemory)?;

        log::debug!("kthread: started {}", name);

        Ok(Self {
            name: String::from(name),
            shared,
            thread: handle.thread().clone(),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Request one more run of the work function
    pub fn wake(&self) {
        self.shared.pending.store(true, Ordering::SeqCst);
        self.thread.unpark();
    }

    /// Stop the thread and wait for it to exit. A no-op wait when called
    /// from the thread itself.
    pub fn stop(&self) {
        self.shared.should_stop.store(true, Ordering::SeqCst);
        self.thread.unpark();

        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::warn!("kthread: {} panicked", self.name);
            }
            log::debug!("kthread: stopped {}", self.name);
        }
    }
}

impl Drop for KThread {
    fn drop(&mut self) {
        self.stop();
    }
}
