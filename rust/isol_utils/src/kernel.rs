// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Narrow adapters around the kernel interfaces consumed by the isolation
//! core: the task-isolation prctl, CPU affinity, memory locking and the
//! tid syscall.
//!
//! The prctl values below match the task isolation kernel patch and may be
//! absent from the build environment's headers, so they are defined here.

use crate::Cpumask;
use anyhow::bail;
use anyhow::Result;
use std::sync::Arc;

pub const PR_SET_TASK_ISOLATION: libc::c_int = 48;
pub const PR_GET_TASK_ISOLATION: libc::c_int = 49;
pub const PR_TASK_ISOLATION_ENABLE: libc::c_ulong = 1 << 0;
pub const PR_TASK_ISOLATION_USERSIG: libc::c_ulong = 1 << 1;

pub const fn pr_task_isolation_set_sig(sig: libc::c_int) -> libc::c_ulong {
    ((sig & 0x7f) as libc::c_ulong) << 8
}

/// Kernel thread id of the calling thread.
pub fn gettid() -> libc::pid_t {
    unsafe { libc::gettid() }
}

/// CLOCK_MONOTONIC in nanoseconds.
pub fn now_monotonic_ns() -> i64 {
    let mut time = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut time) };
    assert!(ret == 0);
    time.tv_sec as i64 * 1_000_000_000 + time.tv_nsec as i64
}

/// Current affinity mask of the calling thread.
pub fn current_affinity() -> Result<Cpumask> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if ret != 0 {
        bail!(
            "sched_getaffinity failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(Cpumask::from_cpu_set(&set))
}

/// Set the affinity mask of a thread. `tid` 0 means the calling thread.
pub fn set_thread_affinity(tid: libc::pid_t, mask: &Cpumask) -> Result<()> {
    let set = mask.to_cpu_set();
    let ret = unsafe { libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if ret != 0 {
        bail!(
            "sched_setaffinity({}) failed: {}",
            tid,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// The isolation entry/exit seam between the worker runtime and the
/// kernel. The production implementation is [`TaskIsolation`]; tests use
/// [`NoopIsolation`].
pub trait IsolationDriver: Send + Sync {
    /// Pin the calling thread to `cpu`, lock memory, and enable isolation
    /// mode requesting SIGUSR1 on violation.
    fn enter(&self, cpu: usize) -> Result<()>;

    /// Disable isolation mode without touching affinity.
    fn disable(&self);

    /// Disable isolation mode and move the calling thread onto
    /// `fallback`, letting the vacated CPU go idle so its scheduler timer
    /// stops.
    fn exit(&self, fallback: &Cpumask) {
        self.disable();
        if !fallback.is_empty() {
            let _ = set_thread_affinity(0, fallback);
        }
    }
}

pub type DriverRef = Arc<dyn IsolationDriver>;

/// Production driver speaking the `PR_SET_TASK_ISOLATION` prctl.
pub struct TaskIsolation;

impl IsolationDriver for TaskIsolation {
    fn enter(&self, cpu: usize) -> Result<()> {
        // Leave any previous isolation state before re-pinning.
        unsafe { libc::prctl(PR_SET_TASK_ISOLATION, 0u64, 0u64, 0u64, 0u64) };

        if unsafe { libc::mlockall(libc::MCL_CURRENT) } != 0 {
            bail!("mlockall failed: {}", std::io::Error::last_os_error());
        }

        let mut only = Cpumask::new();
        only.set_cpu(cpu)?;
        set_thread_affinity(0, &only)?;

        let flags = PR_TASK_ISOLATION_ENABLE
            | PR_TASK_ISOLATION_USERSIG
            | pr_task_isolation_set_sig(libc::SIGUSR1);
        let ret = unsafe { libc::prctl(PR_SET_TASK_ISOLATION, flags, 0u64, 0u64, 0u64) };
        if ret != 0 {
            bail!(
                "PR_SET_TASK_ISOLATION failed: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    fn disable(&self) {
        unsafe { libc::prctl(PR_SET_TASK_ISOLATION, 0u64, 0u64, 0u64, 0u64) };
    }
}

/// Driver that performs no kernel calls. Used by tests and by demo runs on
/// kernels without the task isolation patch.
pub struct NoopIsolation;

impl IsolationDriver for NoopIsolation {
    fn enter(&self, _cpu: usize) -> Result<()> {
        Ok(())
    }

    fn disable(&self) {}

    fn exit(&self, _fallback: &Cpumask) {}
}
