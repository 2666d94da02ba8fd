//! CPU Hotplug support
//!
//! Allows CPUs to be brought online and taken offline dynamically.
//! This includes:
//! - CPU state management (offline/online/transitioning/frozen)
//! - Notifier chains with veto support on the way up and down
//! - Boot CPU and last-CPU protection
//! - Freeze/thaw of secondary CPUs for suspend
//!
//! Notifiers run synchronously on the thread that requested the
//! transition. They must not block and must not request another
//! transition from inside the callback.
//!
//! References:
//! - Linux CPU hotplug documentation

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use super::mask::{CpuMask, NR_CPUS};
use crate::util::{KError, KResult};

/// CPU state during hotplug operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    /// CPU is not present in the system
    NotPresent,
    /// CPU is present but offline
    Offline,
    /// CPU is coming online
    BringingUp,
    /// CPU is online and running
    Online,
    /// CPU is being taken offline
    GoingDown,
    /// CPU was taken down for suspend
    Frozen,
}

/// CPU hotplug action (for notifiers)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    /// CPU is about to come up; a notifier may veto
    UpPrepare,
    /// CPU is now online
    Online,
    /// A later notifier vetoed the bring-up
    UpCanceled,
    /// CPU is about to go down; a notifier may veto
    DownPrepare,
    /// A later notifier vetoed the take-down
    DownFailed,
    /// CPU is gone
    Dead,
}

bitflags! {
    /// Modifiers delivered alongside a [`HotplugAction`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ActionFlags: u32 {
        /// Transition is part of suspend/resume
        const TASKS_FROZEN = 0x0010;
    }
}

/// Priority for hotplug notifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NotifierPriority {
    /// Highest priority (scheduler)
    Scheduler = 0,
    /// High priority (timers, workqueues, core control)
    High = 10,
    /// Normal priority (drivers)
    Normal = 20,
    /// Low priority (thermal, cleanup tasks)
    Low = 30,
}

/// Hotplug notifier callback type. Returning `Err` from a prepare
/// action vetoes the transition.
pub type HotplugCallback =
    Box<dyn Fn(u32, HotplugAction, ActionFlags) -> KResult<()> + Send + Sync>;

/// What the governor needs from the hotplug subsystem
pub trait HotplugOps: Send + Sync {
    /// Bring a CPU online (blocking)
    fn cpu_up(&self, cpu: u32) -> KResult<()>;
    /// Take a CPU offline (blocking)
    fn cpu_down(&self, cpu: u32) -> KResult<()>;
    fn cpu_online(&self, cpu: u32) -> bool;
    fn online_mask(&self) -> CpuMask;
    fn register_notifier(&self, name: &str, priority: NotifierPriority, callback: HotplugCallback);
    fn unregister_notifier(&self, name: &str);
}

/// Hotplug notifier entry
struct HotplugNotifier {
    name: String,
    priority: NotifierPriority,
    callback: HotplugCallback,
}

/// Per-CPU hotplug state
#[derive(Debug, Clone, Copy)]
struct CpuHotplugState {
    /// Current state
    state: CpuState,
    /// Whether CPU can be taken offline
    can_offline: bool,
    /// Boot CPU flag
    is_boot_cpu: bool,
}

impl Default for CpuHotplugState {
    fn default() -> Self {
        Self {
            state: CpuState::NotPresent,
            can_offline: true,
            is_boot_cpu: false,
        }
    }
}

/// CPU Hotplug manager
pub struct CpuHotplugManager {
    /// Per-CPU states
    cpu_states: RwLock<[CpuHotplugState; NR_CPUS]>,
    /// Notifier chain, kept sorted by priority
    notifiers: RwLock<Vec<HotplugNotifier>>,
    /// Hotplug lock (only one operation at a time)
    hotplug_lock: Mutex<()>,
    /// Number of online CPUs
    online_count: AtomicU32,
}

impl CpuHotplugManager {
    /// Create a manager for the `present` CPUs, with `online` already up.
    /// The boot CPU is forced online and can never go offline.
    pub fn new(present: CpuMask, online: CpuMask, boot_cpu: u32) -> Self {
        let mut states = [CpuHotplugState::default(); NR_CPUS];
        let mut count = 0u32;

        for cpu in present.iter() {
            let state = &mut states[cpu as usize];
            state.is_boot_cpu = cpu == boot_cpu;
            state.can_offline = !state.is_boot_cpu;
            if online.test(cpu) || state.is_boot_cpu {
                state.state = CpuState::Online;
                count += 1;
            } else {
                state.state = CpuState::Offline;
            }
        }

        log::info!("cpu_hotplug: initialized, {} of {} CPUs online", count, present.weight());

        Self {
            cpu_states: RwLock::new(states),
            notifiers: RwLock::new(Vec::new()),
            hotplug_lock: Mutex::new(()),
            online_count: AtomicU32::new(count),
        }
    }

    /// Register a hotplug notifier
    pub fn register_notifier(
        &self,
        name: &str,
        priority: NotifierPriority,
        callback: HotplugCallback,
    ) {
        let notifier = HotplugNotifier {
            name: String::from(name),
            priority,
            callback,
        };

        let mut notifiers = self.notifiers.write();
        notifiers.push(notifier);

        // Stable sort keeps registration order within a priority
        notifiers.sort_by_key(|n| n.priority);
    }

    /// Unregister a hotplug notifier
    pub fn unregister_notifier(&self, name: &str) {
        let mut notifiers = self.notifiers.write();
        notifiers.retain(|n| n.name != name);
    }

    /// Call notifiers for a vetoable action. On failure returns how many
    /// notifiers had already accepted, so they can be rolled back.
    fn call_notifiers(
        &self,
        cpu: u32,
        action: HotplugAction,
        flags: ActionFlags,
    ) -> Result<(), (usize, KError)> {
        let notifiers = self.notifiers.read();

        for (i, notifier) in notifiers.iter().enumerate() {
            if let Err(e) = (notifier.callback)(cpu, action, flags) {
                log::debug!(
                    "cpu_hotplug: notifier '{}' failed for CPU{} action {:?}: {:?}",
                    notifier.name, cpu, action, e
                );
                return Err((i, e));
            }
        }

        Ok(())
    }

    /// Deliver a non-vetoable action to the first `count` notifiers
    fn notify_range(&self, cpu: u32, action: HotplugAction, flags: ActionFlags, count: usize) {
        let notifiers = self.notifiers.read();

        for notifier in notifiers.iter().take(count) {
            if let Err(e) = (notifier.callback)(cpu, action, flags) {
                log::warn!(
                    "cpu_hotplug: notifier '{}' returned {:?} for CPU{} action {:?}",
                    notifier.name, e, cpu, action
                );
            }
        }
    }

    fn notify_all(&self, cpu: u32, action: HotplugAction, flags: ActionFlags) {
        self.notify_range(cpu, action, flags, usize::MAX);
    }

    fn set_state(&self, cpu: u32, state: CpuState) {
        self.cpu_states.write()[cpu as usize].state = state;
    }

    fn check_cpu(cpu: u32) -> KResult<()> {
        if cpu as usize >= NR_CPUS {
            return Err(KError::Invalid);
        }
        Ok(())
    }

    fn do_cpu_up(&self, cpu: u32, flags: ActionFlags) -> KResult<()> {
        Self::check_cpu(cpu)?;

        // Take hotplug lock
        let _lock = self.hotplug_lock.lock();

        // Check current state
        let from = self.get_state(cpu);
        match from {
            CpuState::Online => return Ok(()), // Already online
            CpuState::NotPresent => return Err(KError::NotFound),
            CpuState::Offline => {}
            CpuState::Frozen if flags.contains(ActionFlags::TASKS_FROZEN) => {}
            _ => return Err(KError::Busy), // In transition
        }

        self.set_state(cpu, CpuState::BringingUp);
        log::debug!("cpu_hotplug: bringing CPU{} online...", cpu);

        if let Err((accepted, e)) = self.call_notifiers(cpu, HotplugAction::UpPrepare, flags) {
            self.notify_range(cpu, HotplugAction::UpCanceled, flags, accepted);
            self.set_state(cpu, from);
            return Err(e);
        }

        self.set_state(cpu, CpuState::Online);
        self.online_count.fetch_add(1, Ordering::SeqCst);

        self.notify_all(cpu, HotplugAction::Online, flags);

        log::debug!("cpu_hotplug: CPU{} is now online", cpu);
        Ok(())
    }

    fn do_cpu_down(&self, cpu: u32, flags: ActionFlags, dead_state: CpuState) -> KResult<()> {
        Self::check_cpu(cpu)?;

        // Take hotplug lock
        let _lock = self.hotplug_lock.lock();

        // Check current state
        {
            let states = self.cpu_states.read();
            let state = &states[cpu as usize];
            match state.state {
                CpuState::Offline | CpuState::Frozen => return Ok(()), // Already offline
                CpuState::NotPresent => return Err(KError::NotFound),
                CpuState::Online => {}
                _ => return Err(KError::Busy), // In transition
            }

            // Boot CPU or explicitly pinned online
            if !state.can_offline {
                return Err(KError::NotSupported);
            }
        }

        // Must have at least one CPU online
        if self.online_count.load(Ordering::SeqCst) <= 1 {
            return Err(KError::Invalid);
        }

        self.set_state(cpu, CpuState::GoingDown);
        log::debug!("cpu_hotplug: taking CPU{} offline...", cpu);

        if let Err((accepted, e)) = self.call_notifiers(cpu, HotplugAction::DownPrepare, flags) {
            self.notify_range(cpu, HotplugAction::DownFailed, flags, accepted);
            self.set_state(cpu, CpuState::Online);
            return Err(e);
        }

        self.set_state(cpu, dead_state);
        self.online_count.fetch_sub(1, Ordering::SeqCst);

        self.notify_all(cpu, HotplugAction::Dead, flags);

        log::debug!("cpu_hotplug: CPU{} is now offline", cpu);
        Ok(())
    }

    /// Bring a CPU online
    pub fn cpu_up(&self, cpu: u32) -> KResult<()> {
        self.do_cpu_up(cpu, ActionFlags::empty())
    }

    /// Take a CPU offline
    pub fn cpu_down(&self, cpu: u32) -> KResult<()> {
        self.do_cpu_down(cpu, ActionFlags::empty(), CpuState::Offline)
    }

    /// Get CPU state
    pub fn get_state(&self, cpu: u32) -> CpuState {
        if cpu as usize >= NR_CPUS {
            return CpuState::NotPresent;
        }

        self.cpu_states.read()[cpu as usize].state
    }

    /// Check if CPU is online
    pub fn is_online(&self, cpu: u32) -> bool {
        self.get_state(cpu) == CpuState::Online
    }

    /// Get number of online CPUs
    pub fn online_count(&self) -> u32 {
        self.online_count.load(Ordering::SeqCst)
    }

    pub fn online_mask(&self) -> CpuMask {
        let states = self.cpu_states.read();
        states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == CpuState::Online)
            .map(|(cpu, _)| cpu as u32)
            .collect()
    }

    /// Set whether CPU can go offline
    pub fn set_can_offline(&self, cpu: u32, can_offline: bool) {
        if cpu as usize >= NR_CPUS {
            return;
        }

        let mut states = self.cpu_states.write();
        let state = &mut states[cpu as usize];

        // Never allow boot CPU to go offline
        if state.is_boot_cpu {
            return;
        }

        state.can_offline = can_offline;
    }

    /// Take all non-boot CPUs down for suspend
    pub fn freeze_cpus(&self) -> KResult<()> {
        log::info!("cpu_hotplug: freezing secondary CPUs...");

        for cpu in self.online_mask().iter() {
            let is_boot = self.cpu_states.read()[cpu as usize].is_boot_cpu;
            if is_boot {
                continue;
            }
            self.do_cpu_down(cpu, ActionFlags::TASKS_FROZEN, CpuState::Frozen)?;
        }

        log::info!("cpu_hotplug: secondary CPUs frozen");
        Ok(())
    }

    /// Bring frozen CPUs back after resume
    pub fn thaw_cpus(&self) -> KResult<()> {
        log::info!("cpu_hotplug: thawing secondary CPUs...");

        for cpu in 0..NR_CPUS as u32 {
            if self.get_state(cpu) == CpuState::Frozen {
                self.do_cpu_up(cpu, ActionFlags::TASKS_FROZEN)?;
            }
        }

        log::info!("cpu_hotplug: secondary CPUs thawed");
        Ok(())
    }
}

impl HotplugOps for CpuHotplugManager {
    fn cpu_up(&self, cpu: u32) -> KResult<()> {
        CpuHotplugManager::cpu_up(self, cpu)
    }

    fn cpu_down(&self, cpu: u32) -> KResult<()> {
        CpuHotplugManager::cpu_down(self, cpu)
    }

    fn cpu_online(&self, cpu: u32) -> bool {
        self.is_online(cpu)
    }

    fn online_mask(&self) -> CpuMask {
        CpuHotplugManager::online_mask(self)
    }

    fn register_notifier(&self, name: &str, priority: NotifierPriority, callback: HotplugCallback) {
        CpuHotplugManager::register_notifier(self, name, priority, callback);
    }

    fn unregister_notifier(&self, name: &str) {
        CpuHotplugManager::unregister_notifier(self, name);
    }
}
