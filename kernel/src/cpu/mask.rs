//! CPU masks
//!
//! Fixed-size bitmap of logical CPU ids. Used for cpufreq `related_cpus`,
//! cluster membership and the online set.

use core::fmt;

/// Maximum number of logical CPUs
pub const NR_CPUS: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CpuMask(u64);

#[inline]
fn bit(cpu: u32) -> u64 {
    if (cpu as usize) < NR_CPUS {
        1u64 << cpu
    } else {
        0
    }
}

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// CPUs `first..first + count`
    pub fn from_range(first: u32, count: u32) -> Self {
        let mut mask = Self::empty();
        for cpu in first..first.saturating_add(count) {
            mask.set(cpu);
        }
        mask
    }

    pub fn from_cpus(cpus: &[u32]) -> Self {
        let mut mask = Self::empty();
        for &cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn set(&mut self, cpu: u32) {
        self.0 |= bit(cpu);
    }

    pub fn clear(&mut self, cpu: u32) {
        self.0 &= !bit(cpu);
    }

    pub fn test(&self, cpu: u32) -> bool {
        self.0 & bit(cpu) != 0
    }

    /// Lowest-numbered CPU in the mask
    pub fn first(&self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    /// Number of CPUs in the mask
    pub fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersects(&self, other: &CpuMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn and(&self, other: &CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    /// Iterate CPUs in ascending order
    pub fn iter(&self) -> CpuMaskIter {
        CpuMaskIter { bits: self.0 }
    }
}

pub struct CpuMaskIter {
    bits: u64,
}

impl Iterator for CpuMaskIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.bits == 0 {
            return None;
        }
        let cpu = self.bits.trailing_zeros();
        self.bits &= self.bits - 1;
        Some(cpu)
    }
}

impl IntoIterator for CpuMask {
    type Item = u32;
    type IntoIter = CpuMaskIter;

    fn into_iter(self) -> CpuMaskIter {
        self.iter()
    }
}

impl FromIterator<u32> for CpuMask {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut mask = CpuMask::empty();
        for cpu in iter {
            mask.set(cpu);
        }
        mask
    }
}

/// cpulist format, e.g. `0-3,6`
impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({})", self)
    }
}
