//! Text attributes for the per-cluster tunables
//!
//! Mirrors the files found under `/sys/devices/system/cpu/cpuN/core_ctl/`:
//! `show` renders an attribute the way a read of the file returns it,
//! `store` parses a write and returns the number of bytes consumed.

use super::{Cluster, CoreCtl, MAX_CPUS_PER_CLUSTER};
use crate::cpu::NR_CPUS;
use crate::util::{KError, KResult};

/// Per-cluster attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    MinCpus,
    MaxCpus,
    OfflineDelayMs,
    BusyUpThres,
    BusyDownThres,
    TaskThres,
    IsBigCluster,
    NotPreferred,
    Disable,
    Cpus,
    NeedCpus,
    OnlineCpus,
    GlobalState,
}

impl Attr {
    pub const ALL: [Attr; 13] = [
        Attr::MinCpus,
        Attr::MaxCpus,
        Attr::OfflineDelayMs,
        Attr::BusyUpThres,
        Attr::BusyDownThres,
        Attr::TaskThres,
        Attr::IsBigCluster,
        Attr::NotPreferred,
        Attr::Disable,
        Attr::Cpus,
        Attr::NeedCpus,
        Attr::OnlineCpus,
        Attr::GlobalState,
    ];

    /// File name
    pub fn name(&self) -> &'static str {
        match self {
            Attr::MinCpus => "min_cpus",
            Attr::MaxCpus => "max_cpus",
            Attr::OfflineDelayMs => "offline_delay_ms",
            Attr::BusyUpThres => "busy_up_thres",
            Attr::BusyDownThres => "busy_down_thres",
            Attr::TaskThres => "task_thres",
            Attr::IsBigCluster => "is_big_cluster",
            Attr::NotPreferred => "not_preferred",
            Attr::Disable => "disable",
            Attr::Cpus => "cpus",
            Attr::NeedCpus => "need_cpus",
            Attr::OnlineCpus => "online_cpus",
            Attr::GlobalState => "global_state",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.iter().copied().find(|a| a.name() == name)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(
            self,
            Attr::Cpus | Attr::NeedCpus | Attr::OnlineCpus | Attr::GlobalState
        )
    }

    /// File permission bits
    pub fn mode(&self) -> u16 {
        if self.is_writable() {
            0o644
        } else {
            0o444
        }
    }
}

/// Leading unsigned integers, at most one per cluster slot
fn parse_uints(buf: &str) -> KResult<Vec<u32>> {
    let vals = buf
        .split_whitespace()
        .take(MAX_CPUS_PER_CLUSTER)
        .map(|tok| tok.parse::<u32>().map_err(|_| KError::Invalid))
        .collect::<KResult<Vec<u32>>>()?;

    if vals.is_empty() {
        return Err(KError::Invalid);
    }
    Ok(vals)
}

fn parse_uint(buf: &str) -> KResult<u32> {
    parse_uints(buf).map(|vals| vals[0])
}

fn join(vals: &[u32]) -> String {
    let mut out = vals
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    out.push('\n');
    out
}

pub fn show(ctl: &CoreCtl, cluster: &Cluster, attr: Attr) -> String {
    let s = cluster.status();
    match attr {
        Attr::MinCpus => format!("{}\n", s.min_cpus),
        Attr::MaxCpus => format!("{}\n", s.max_cpus),
        Attr::OfflineDelayMs => format!("{}\n", s.offline_delay_ms),
        Attr::BusyUpThres => join(&s.busy_up_thres),
        Attr::BusyDownThres => join(&s.busy_down_thres),
        Attr::TaskThres => format!("{}\n", s.task_thres),
        Attr::IsBigCluster => format!("{}\n", s.is_big_cluster as u32),
        Attr::Disable => format!("{}\n", s.disabled as u32),
        Attr::NeedCpus => format!("{}\n", s.need_cpus),
        Attr::OnlineCpus => format!("{}\n", s.online_cpus),
        Attr::NotPreferred => {
            let mut out = String::new();
            for cpu in s.cpus {
                if let Some(c) = cluster.cpu_status(cpu) {
                    out.push_str(&format!("CPU{}: {}\n", cpu, c.not_preferred as u32));
                }
            }
            out
        }
        Attr::Cpus => {
            let mut out = String::new();
            for cpu in s.lru {
                if let Some(c) = cluster.cpu_status(cpu) {
                    out.push_str(&format!(
                        "CPU{} ({})\n",
                        cpu,
                        if c.online { "Online" } else { "Offline" }
                    ));
                }
            }
            out
        }
        Attr::GlobalState => global_state(ctl),
    }
}

pub fn store(cluster: &Cluster, attr: Attr, buf: &str) -> KResult<usize> {
    match attr {
        Attr::MinCpus => cluster.set_min_cpus(parse_uint(buf)?)?,
        Attr::MaxCpus => cluster.set_max_cpus(parse_uint(buf)?)?,
        Attr::OfflineDelayMs => cluster.set_offline_delay_ms(parse_uint(buf)? as u64),
        Attr::BusyUpThres => cluster.set_busy_up_thres(&parse_uints(buf)?)?,
        Attr::BusyDownThres => cluster.set_busy_down_thres(&parse_uints(buf)?)?,
        Attr::TaskThres => cluster.set_task_thres(parse_uint(buf)?)?,
        Attr::IsBigCluster => cluster.set_is_big_cluster(parse_uint(buf)? != 0),
        Attr::Disable => cluster.set_disabled(parse_uint(buf)? != 0),
        Attr::NotPreferred => {
            let flags: Vec<bool> = parse_uints(buf)?.into_iter().map(|v| v != 0).collect();
            cluster.set_not_preferred(&flags)?
        }
        Attr::Cpus | Attr::NeedCpus | Attr::OnlineCpus | Attr::GlobalState => {
            return Err(KError::PermissionDenied)
        }
    }
    Ok(buf.len())
}

/// Every managed CPU, with the cluster summary under each first CPU
pub fn global_state(ctl: &CoreCtl) -> String {
    let mut out = String::new();

    for cpu in 0..NR_CPUS as u32 {
        let Some(cluster) = ctl.cluster(cpu) else {
            continue;
        };
        let Some(c) = cluster.cpu_status(cpu) else {
            continue;
        };

        out.push_str(&format!(
            "CPU{}\n\
             \tCPU: {}\n\
             \tOnline: {}\n\
             \tRejected: {}\n\
             \tFirst CPU: {}\n\
             \tBusy%: {}\n\
             \tIs busy: {}\n\
             \tNot preferred: {}\n",
            cpu,
            c.cpu,
            c.online as u32,
            c.rejected as u32,
            c.first_cpu,
            c.busy,
            c.is_busy as u32,
            c.not_preferred as u32,
        ));

        if cpu != cluster.first_cpu() {
            continue;
        }

        let s = cluster.status();
        out.push_str(&format!(
            "\tNr running: {}\n\
             \tOnline CPUs: {}\n\
             \tAvail CPUs: {}\n\
             \tNeed CPUs: {}\n\
             \tMin CPUs: {}\n\
             \tMax CPUs: {}\n\
             \tStatus: {}\n",
            s.nrrun,
            s.online_cpus,
            s.avail_cpus,
            s.need_cpus,
            s.min_cpus,
            s.max_cpus,
            if s.disabled { "disabled" } else { "enabled" },
        ));
    }

    out
}

impl CoreCtl {
    /// Read attribute `attr` of the cluster managing `cpu`
    pub fn show(&self, cpu: u32, attr: Attr) -> KResult<String> {
        let cluster = self.cluster(cpu).ok_or(KError::NotFound)?;
        Ok(show(self, &cluster, attr))
    }

    /// Write attribute `attr` of the cluster managing `cpu`
    pub fn store(&self, cpu: u32, attr: Attr, buf: &str) -> KResult<usize> {
        let cluster = self.cluster(cpu).ok_or(KError::NotFound)?;
        store(&cluster, attr, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::manual_rig;
    use super::*;

    #[test]
    fn test_attr_names_and_modes() {
        for attr in Attr::ALL {
            assert_eq!(Attr::from_name(attr.name()), Some(attr));
        }
        assert_eq!(Attr::from_name("min_cpus\n"), Some(Attr::MinCpus));
        assert_eq!(Attr::from_name("nope"), None);
        assert_eq!(Attr::MaxCpus.mode(), 0o644);
        assert_eq!(Attr::GlobalState.mode(), 0o444);
    }

    #[test]
    fn test_show_defaults() {
        let rig = manual_rig();
        let ctl = &rig.ctl;
        assert_eq!(ctl.show(5, Attr::MinCpus).unwrap(), "1\n");
        assert_eq!(ctl.show(5, Attr::MaxCpus).unwrap(), "4\n");
        assert_eq!(ctl.show(5, Attr::OfflineDelayMs).unwrap(), "100\n");
        assert_eq!(ctl.show(5, Attr::BusyUpThres).unwrap(), "0 0 0 0\n");
        assert_eq!(ctl.show(5, Attr::TaskThres).unwrap(), format!("{}\n", u32::MAX));
        assert_eq!(ctl.show(5, Attr::IsBigCluster).unwrap(), "0\n");
        assert_eq!(ctl.show(5, Attr::Disable).unwrap(), "0\n");
        assert_eq!(
            ctl.show(5, Attr::Cpus).unwrap(),
            "CPU4 (Online)\nCPU5 (Online)\nCPU6 (Online)\nCPU7 (Online)\n"
        );
        assert_eq!(ctl.show(60, Attr::MinCpus), Err(KError::NotFound));
    }

    #[test]
    fn test_store_values() {
        let rig = manual_rig();
        let ctl = &rig.ctl;

        assert_eq!(ctl.store(4, Attr::BusyUpThres, "60 70 80 90\n"), Ok(12));
        assert_eq!(ctl.show(4, Attr::BusyUpThres).unwrap(), "60 70 80 90\n");
        ctl.store(4, Attr::BusyDownThres, "30").unwrap();
        assert_eq!(ctl.show(4, Attr::BusyDownThres).unwrap(), "30 30 30 30\n");

        ctl.store(4, Attr::OfflineDelayMs, "250\n").unwrap();
        assert_eq!(ctl.show(4, Attr::OfflineDelayMs).unwrap(), "250\n");

        ctl.store(4, Attr::IsBigCluster, "1").unwrap();
        assert_eq!(ctl.show(4, Attr::IsBigCluster).unwrap(), "1\n");

        ctl.store(4, Attr::NotPreferred, "0 1 0 1").unwrap();
        assert_eq!(
            ctl.show(4, Attr::NotPreferred).unwrap(),
            "CPU4: 0\nCPU5: 1\nCPU6: 0\nCPU7: 1\n"
        );

        ctl.store(4, Attr::MaxCpus, "3").unwrap();
        ctl.store(4, Attr::MinCpus, "4").unwrap();
        assert_eq!(ctl.show(4, Attr::MinCpus).unwrap(), "3\n");
    }

    #[test]
    fn test_rejected_stores_change_nothing() {
        let rig = manual_rig();
        let ctl = &rig.ctl;

        assert_eq!(ctl.store(4, Attr::MinCpus, "abc"), Err(KError::Invalid));
        assert_eq!(ctl.store(4, Attr::MinCpus, ""), Err(KError::Invalid));
        assert_eq!(ctl.store(4, Attr::MinCpus, "0"), Err(KError::Invalid));
        assert_eq!(ctl.store(4, Attr::TaskThres, "3"), Err(KError::Invalid));
        assert_eq!(ctl.store(4, Attr::BusyUpThres, "10 20"), Err(KError::Invalid));
        assert_eq!(ctl.store(4, Attr::MaxCpus, "-1"), Err(KError::Invalid));
        assert_eq!(ctl.store(4, Attr::NeedCpus, "1"), Err(KError::PermissionDenied));
        assert_eq!(ctl.store(4, Attr::GlobalState, "1"), Err(KError::PermissionDenied));

        let s = ctl.cluster_status(4).unwrap();
        assert_eq!((s.min_cpus, s.max_cpus, s.task_thres), (1, 4, u32::MAX));
        assert_eq!(s.busy_up_thres, vec![0; 4]);
    }

    #[test]
    fn test_global_state_dump() {
        let rig = manual_rig();
        rig.ctl.cluster(4).unwrap().set_disabled(true);
        rig.ctl.set_busy(5, 42);

        let dump = rig.ctl.show(0, Attr::GlobalState).unwrap();
        assert!(dump.starts_with("CPU0\n\tCPU: 0\n\tOnline: 1\n"));
        assert!(dump.contains("CPU5\n\tCPU: 5\n\tOnline: 1\n\tRejected: 0\n\tFirst CPU: 4\n\tBusy%: 42\n"));
        assert!(dump.contains("\tNeed CPUs: 4\n\tMin CPUs: 1\n\tMax CPUs: 4\n\tStatus: disabled\n"));
        assert!(dump.contains("\tStatus: enabled\n"));
        assert_eq!(dump.matches("\tNr running:").count(), 2);
    }
}
