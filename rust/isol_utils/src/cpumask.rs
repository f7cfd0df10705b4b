// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! Creating, reading, and manipulating CPU sets.
//!
//! A Cpumask is a fixed-width BitVec of u64's along with helpers for
//! parsing the kernel's textual representations: plain hexadecimal masks
//! (optionally grouped with commas, as in `/proc/<pid>/status`) and
//! cpulists (`1-4,7`). It converts to and from `libc::cpu_set_t` for the
//! affinity syscalls.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

/// Capacity of a Cpumask, matching the kernel's `cpu_set_t` width.
pub const NR_CPUS: usize = 1024;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= NR_CPUS {
            bail!("Invalid CPU {} passed, max {}", cpu, NR_CPUS);
        }

        Ok(())
    }

    /// Build a new empty Cpumask object.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; NR_CPUS],
        }
    }

    /// Build a Cpumask object from a hexadecimal string. Accepts an
    /// optional `0x` prefix and the comma-separated 32-bit grouping the
    /// kernel uses for `Cpus_allowed`.
    pub fn from_str(cpumask: &str) -> Result<Cpumask> {
        let hex_str = {
            let mut tmp_str = cpumask
                .trim()
                .strip_prefix("0x")
                .unwrap_or(cpumask.trim())
                .replace([',', '_'], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = bitvec![u64, Lsb0; 0; NR_CPUS];
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= NR_CPUS {
                    bail!(
                        "Found cpu ({}) in cpumask ({}) which is larger than the maximum ({})",
                        cpu,
                        cpumask,
                        NR_CPUS
                    );
                }
                mask.set(cpu, true);
            }
        }

        Ok(Self { mask })
    }

    /// Build a Cpumask from a cpulist string such as `0-3,8,10-11`.
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    /// Build a Cpumask from a `libc::cpu_set_t`.
    pub fn from_cpu_set(set: &libc::cpu_set_t) -> Cpumask {
        let mut mask = Cpumask::new();
        for cpu in 0..NR_CPUS.min(libc::CPU_SETSIZE as usize) {
            if unsafe { libc::CPU_ISSET(cpu, set) } {
                mask.mask.set(cpu, true);
            }
        }
        mask
    }

    /// Convert to a `libc::cpu_set_t` for the affinity syscalls.
    pub fn to_cpu_set(&self) -> libc::cpu_set_t {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for cpu in self.iter() {
            if cpu < libc::CPU_SETSIZE as usize {
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
        }
        set
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. If the CPU
    /// exceeds the capacity, false is returned.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the XOR of the current Cpumask and another.
    pub fn xor(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask ^= other.mask.clone();
        new
    }

    /// Iterate over the indices with bits set.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }
}

impl Default for Cpumask {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < NR_CPUS {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cpu in self.iter() {
            if !first {
                write!(f, ",{cpu}")?;
            } else {
                write!(f, "{cpu}")?;
            }
            first = false;
        }
        if first {
            write!(f, "<empty>")?;
        }
        Ok(())
    }
}

/// Parse a cpulist string (`0-3,8`) into a sorted, deduplicated list of
/// CPU ids.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    let cpu_groups: Vec<&str> = cpulist.split(',').collect();
    let mut cpu_ids = vec![];
    for group in cpu_groups.iter() {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Some((x, y)) => (x, y),
            None => match sscanf!(group.trim(), "{usize}") {
                Some(x) => (x, x),
                None => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }
    cpu_ids.sort_unstable();
    cpu_ids.dedup();

    Ok(cpu_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpulist_ranges() {
        assert_eq!(read_cpulist("1-4,7").unwrap(), vec![1, 2, 3, 4, 7]);
        assert_eq!(read_cpulist("3").unwrap(), vec![3]);
        assert_eq!(read_cpulist(" 2, 1, 2 ").unwrap(), vec![1, 2]);
        assert!(read_cpulist("one").is_err());
    }

    #[test]
    fn test_from_hex_str() {
        let mask = Cpumask::from_str("0xf0").unwrap();
        assert_eq!(mask.weight(), 4);
        assert!(!mask.test_cpu(3));
        assert!(mask.test_cpu(4));
        assert!(mask.test_cpu(7));
        assert!(!mask.test_cpu(8));
    }

    #[test]
    fn test_from_grouped_str() {
        // /proc/<pid>/status style, most significant group first.
        let mask = Cpumask::from_str("00000001,00000003").unwrap();
        assert!(mask.test_cpu(0));
        assert!(mask.test_cpu(1));
        assert!(mask.test_cpu(32));
        assert_eq!(mask.weight(), 3);
    }

    #[test]
    fn test_set_algebra() {
        let a = Cpumask::from_cpulist("0-3").unwrap();
        let b = Cpumask::from_cpulist("2-5").unwrap();
        assert_eq!(a.and(&b), Cpumask::from_cpulist("2-3").unwrap());
        assert_eq!(a.or(&b), Cpumask::from_cpulist("0-5").unwrap());
        assert_eq!(a.xor(&b), Cpumask::from_cpulist("0-1,4-5").unwrap());
        assert!(a.and(&Cpumask::new()).is_empty());
    }

    #[test]
    fn test_cpu_set_round_trip() {
        let mask = Cpumask::from_cpulist("1,5,9").unwrap();
        let set = mask.to_cpu_set();
        assert_eq!(Cpumask::from_cpu_set(&set), mask);
    }
}
