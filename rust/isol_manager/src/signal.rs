// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Isolation-loss signal coordination.
//!
//! The kernel delivers SIGUSR1 when an isolated thread violates
//! isolation. The handler does exactly this: find the slot registered
//! for the current thread, store 0 into its isolation flag, and in
//! slave-monitor builds set the signal flag. Atomic stores only; no
//! allocation, locking or logging is permitted here.

use crate::slot::isol_flag;
use crate::slot::Slot;
use anyhow::bail;
use anyhow::Result;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

static SLOTS_PTR: AtomicPtr<Slot> = AtomicPtr::new(std::ptr::null_mut());
static SLOTS_LEN: AtomicUsize = AtomicUsize::new(0);

extern "C" fn sigusr1_handler(_sig: libc::c_int) {
    let ptr = SLOTS_PTR.load(Ordering::SeqCst);
    if ptr.is_null() {
        return;
    }
    let len = SLOTS_LEN.load(Ordering::SeqCst);
    let slots = unsafe { std::slice::from_raw_parts(ptr, len) };
    let tid = unsafe { libc::gettid() };
    for slot in slots {
        if slot.tid() == tid {
            slot.isolated.store(isol_flag::LOST, Ordering::SeqCst);
            #[cfg(feature = "slave-monitor")]
            slot.signal.store(1, Ordering::SeqCst);
            return;
        }
    }
}

/// Publish the slot table to the signal handler and install it.
pub fn register_slots(slots: &'static [Slot]) -> Result<()> {
    SLOTS_PTR.store(slots.as_ptr() as *mut Slot, Ordering::SeqCst);
    SLOTS_LEN.store(slots.len(), Ordering::SeqCst);

    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = sigusr1_handler as extern "C" fn(libc::c_int) as usize;
    sa.sa_flags = libc::SA_RESTART;
    let ret = unsafe { libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut()) };
    if ret != 0 {
        bail!(
            "sigaction(SIGUSR1) failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}
