// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU worker slots.
//!
//! One slot exists per isolation-capable CPU, allocated once for the
//! lifetime of the process. The slot holds the state both sides may
//! touch: the atomic claim counter, the isolation tri-state, the signal
//! flag, the registered kernel ids, and the parked worker channel ends
//! waiting for a claimant. Everything only the manager needs lives in
//! the manager's own per-slot control block instead.

use isol_ipc::RingReader;
use isol_ipc::RingWriter;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

/// Values of the isolation tri-state flag.
pub mod isol_flag {
    /// Isolation lost, or no worker present.
    pub const LOST: u8 = 0;
    /// Between states: claimed, entering, or awaiting relaunch.
    pub const TRANSITIONAL: u8 = 1;
    /// Running isolated.
    pub const ISOLATED: u8 = 2;
}

/// The worker's ends of the two ring channels of a slot.
pub struct WorkerEnds {
    /// Manager-to-worker direction, read side.
    pub rx: RingReader,
    /// Worker-to-manager direction, write side.
    pub tx: RingWriter,
}

pub struct Slot {
    pub index: usize,
    pub cpu: usize,
    claim: AtomicI32,
    /// Isolation tri-state, written by the worker, the signal handler
    /// and the manager.
    pub isolated: AtomicU8,
    /// Set by the signal handler in slave-monitor builds, polled by the
    /// worker's suspension check.
    pub signal: AtomicU8,
    pid: AtomicI32,
    tid: AtomicI32,
    ends: Mutex<Option<WorkerEnds>>,
}

impl Slot {
    pub fn new(index: usize, cpu: usize) -> Slot {
        Slot {
            index,
            cpu,
            claim: AtomicI32::new(0),
            isolated: AtomicU8::new(isol_flag::LOST),
            signal: AtomicU8::new(0),
            pid: AtomicI32::new(0),
            tid: AtomicI32::new(0),
            ends: Mutex::new(None),
        }
    }

    /// Claim the slot. The counter transitions 0 to 1 only here; a lost
    /// race backs the increment out.
    pub fn try_claim(&self) -> bool {
        if self.claim.fetch_add(1, Ordering::SeqCst) == 0 {
            true
        } else {
            self.claim.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    /// Release a claimed slot. Must be called exactly once per claim.
    pub fn release(&self) {
        self.claim.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn claimed(&self) -> bool {
        self.claim.load(Ordering::SeqCst) > 0
    }

    /// Record the kernel ids of the bound worker. The tid is what the
    /// signal handler matches against.
    pub fn register_ids(&self, pid: libc::pid_t, tid: libc::pid_t) {
        self.pid.store(pid, Ordering::SeqCst);
        self.tid.store(tid, Ordering::SeqCst);
    }

    pub fn clear_ids(&self) {
        self.pid.store(0, Ordering::SeqCst);
        self.tid.store(0, Ordering::SeqCst);
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn tid(&self) -> libc::pid_t {
        self.tid.load(Ordering::SeqCst)
    }

    /// Take the worker channel ends. They are parked here between
    /// claims; a second taker gets `None` until the previous worker
    /// finishes and parks them back.
    pub fn take_ends(&self) -> Option<WorkerEnds> {
        self.ends.lock().unwrap().take()
    }

    pub fn park_ends(&self, ends: WorkerEnds) {
        *self.ends.lock().unwrap() = Some(ends);
    }
}

/// Claim a specific CPU, or with `None` the first available one.
/// Nothing happens to the calling thread; only the slot is reserved.
pub fn claim_cpu(slots: &[Slot], cpu: Option<usize>) -> Option<&Slot> {
    slots
        .iter()
        .filter(|s| cpu.map_or(true, |c| s.cpu == c))
        .find(|s| s.try_claim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<Slot> {
        vec![Slot::new(0, 2), Slot::new(1, 3)]
    }

    #[test]
    fn test_claim_specific_and_any() {
        let slots = table();
        let s = claim_cpu(&slots, Some(3)).unwrap();
        assert_eq!(s.cpu, 3);
        assert!(claim_cpu(&slots, Some(3)).is_none());

        let s2 = claim_cpu(&slots, None).unwrap();
        assert_eq!(s2.cpu, 2);
        assert!(claim_cpu(&slots, None).is_none());

        s.release();
        assert_eq!(claim_cpu(&slots, None).unwrap().cpu, 3);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let slot = Slot::new(0, 1);
        assert!(slot.try_claim());
        assert!(!slot.try_claim());
        assert!(slot.claimed());
        slot.release();
        assert!(!slot.claimed());
        assert!(slot.try_claim());
    }
}
