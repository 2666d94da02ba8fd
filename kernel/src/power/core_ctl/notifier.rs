//! CPU hotplug listener
//!
//! Keeps the cluster counters in step with hotplug transitions and vetoes
//! bring-ups the cluster does not need. Runs inside the hotplug notifier
//! chain, so it never blocks: the LRU is only try-locked, and the move is
//! queued on the pending list when the executor holds it.

use super::cluster::Cluster;
use super::cpu::LruList;
use crate::cpu::HotplugAction;
use crate::util::{KError, KResult};

impl Cluster {
    pub(super) fn cpu_callback(&self, cpu: u32, action: HotplugAction) -> KResult<()> {
        let Some(slot) = self.slot(cpu) else {
            return Ok(());
        };

        match action {
            HotplugAction::UpPrepare => {
                let mut st = self.state.lock();

                if st.cpus[slot].online {
                    log::warn!("core_ctl: CPU{} online when state is offline", cpu);
                    st.cpus[slot].online = false;
                    st.online_cpus = st.online_cpus.saturating_sub(1);
                }

                if st.cpus[slot].rejected {
                    st.cpus[slot].rejected = false;
                    st.avail_cpus += 1;
                }

                // Count the CPU as online now so the executor does not
                // bring up more than needed while this one comes up
                if !st.disabled && st.apply_limits(st.need_cpus) <= st.online_cpus {
                    log::debug!("core_ctl: preventing CPU{} from coming online", cpu);
                    return Err(KError::Busy);
                }
                st.cpus[slot].online = true;
                st.online_cpus += 1;
            }

            HotplugAction::Online => self.move_to_tail(cpu, slot),

            HotplugAction::Dead | HotplugAction::UpCanceled => {
                if action == HotplugAction::Dead {
                    self.move_to_tail(cpu, slot);
                }

                let wake = {
                    let mut st = self.state.lock();

                    if !st.cpus[slot].online {
                        log::warn!("core_ctl: CPU{} offline when state is online", cpu);
                        st.online_cpus += 1;
                    }

                    // Refused by a later notifier
                    if action == HotplugAction::UpCanceled && !st.cpus[slot].rejected {
                        st.cpus[slot].rejected = true;
                        st.avail_cpus = st.avail_cpus.saturating_sub(1);
                    }

                    st.cpus[slot].online = false;
                    st.cpus[slot].busy = 0;
                    st.online_cpus = st.online_cpus.saturating_sub(1);

                    action == HotplugAction::Dead
                        && st.online_cpus < st.apply_limits(st.need_cpus)
                        && st.online_cpus < st.avail_cpus
                };

                if wake {
                    self.wake();
                }
            }

            HotplugAction::DownPrepare | HotplugAction::DownFailed => {}
        }

        Ok(())
    }

    /// Make `cpu` the most recently used CPU
    fn move_to_tail(&self, cpu: u32, slot: usize) {
        if let Some(mut lru) = self.lru.try_lock() {
            lru.retain(|&c| c != cpu);
            lru.push_back(cpu);
            self.pending_lru.lock().retain(|&c| c != cpu);
            self.state.lock().cpus[slot].list = LruList::Settled;
        } else {
            let mut pending = self.pending_lru.lock();
            pending.retain(|&c| c != cpu);
            pending.push_back(cpu);
            self.state.lock().cpus[slot].list = LruList::Pending;
        }
    }
}
