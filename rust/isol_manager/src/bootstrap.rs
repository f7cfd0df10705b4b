// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Environment bootstrap: enumerate the isolation-capable CPUs,
//! allocate the slots and their shared-memory channels, install the
//! isolation-loss signal handler, and create the control socket under
//! the `.LCK` flock.

use crate::manager::Manager;
use crate::manager::ManagerOpts;
use crate::observer::ProcTimerSource;
use crate::observer::TimerSource;
use crate::server::lock_path;
use crate::server::server_socket_path;
use crate::server::ControlServer;
use crate::server::LockFile;
use crate::server::SERVER_SOCKET_NAME;
use crate::signal;
use crate::slot::Slot;
use crate::slot::WorkerEnds;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use isol_ipc::area_name;
use isol_ipc::RingReader;
use isol_ipc::RingWriter;
use isol_ipc::SharedRegion;
use isol_ipc::AREA_SIZE;
use isol_utils::kernel;
use isol_utils::kernel::DriverRef;
use isol_utils::read_cpulist;
use isol_utils::resolve_cpu_subset;
use isol_utils::Cpumask;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::sync::OnceLock;

/// Per-process environment shared with worker threads attaching via
/// [`crate::IsolatedTask::attach`].
pub(crate) struct Registry {
    pub slots: &'static [Slot],
    pub nonisol: Cpumask,
    pub driver: DriverRef,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub(crate) fn registry() -> Option<&'static Registry> {
    REGISTRY.get()
}

/// CPUs the kernel reports as isolation-capable.
pub fn isolation_capable_cpulist() -> Result<String> {
    for path in [
        "/sys/devices/system/cpu/task_isolation",
        "/sys/devices/system/cpu/isolated",
    ] {
        if let Ok(text) = std::fs::read_to_string(path) {
            if !text.trim().is_empty() {
                return Ok(text);
            }
        }
    }
    bail!("The kernel reports no isolation-capable CPUs");
}

pub struct Bootstrap {
    /// Explicit cpulist; autodetected from sysfs when absent.
    pub cpulist: Option<String>,
    /// Base name of the control socket; the CPU-subset id is appended
    /// when one is configured.
    pub socket_base: PathBuf,
    /// Back the channels with named POSIX shared memory. Disabled for
    /// hermetic in-process setups.
    pub use_shm: bool,
    pub proc_root: PathBuf,
    pub driver: DriverRef,
    pub timer_source: Option<Box<dyn TimerSource>>,
    pub opts: ManagerOpts,
    pub shutdown: Arc<AtomicBool>,
}

impl Bootstrap {
    pub fn new() -> Bootstrap {
        Bootstrap {
            cpulist: None,
            socket_base: PathBuf::from(SERVER_SOCKET_NAME),
            use_shm: true,
            proc_root: PathBuf::from("/proc"),
            driver: Arc::new(kernel::TaskIsolation),
            timer_source: None,
            opts: ManagerOpts::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build the environment and the manager. Fatal setup errors (no
    /// CPUs, shared memory, socket) surface here, before any worker is
    /// accepted.
    pub fn initialize(self) -> Result<Manager> {
        let list = match &self.cpulist {
            Some(list) => list.clone(),
            None => isolation_capable_cpulist()?,
        };
        let cpus = resolve_cpu_subset(read_cpulist(&list)?)?;
        if cpus.is_empty() {
            bail!("No isolation-capable CPUs configured");
        }

        let mut isol_cpus = Cpumask::new();
        for cpu in &cpus {
            isol_cpus.set_cpu(*cpu)?;
        }
        let affinity = kernel::current_affinity().unwrap_or_default();
        let nonisol_cpus = affinity.xor(&affinity.and(&isol_cpus));

        let mut slots = Vec::with_capacity(cpus.len());
        let mut ends = Vec::with_capacity(cpus.len());
        for (index, cpu) in cpus.iter().copied().enumerate() {
            let regions = if self.use_shm {
                SharedRegion::create_shm(&area_name(cpu), 2, AREA_SIZE)
                    .with_context(|| format!("Failed to create channel areas for CPU {cpu}"))?
            } else {
                vec![SharedRegion::private(AREA_SIZE), SharedRegion::private(AREA_SIZE)]
            };
            let slot = Slot::new(index, cpu);
            slot.park_ends(WorkerEnds {
                rx: RingReader::new(regions[0].clone()),
                tx: RingWriter::new(regions[1].clone()),
            });
            slots.push(slot);
            ends.push((
                RingWriter::new(regions[0].clone()),
                RingReader::new(regions[1].clone()),
            ));
        }

        let slots: &'static [Slot] = Box::leak(slots.into_boxed_slice());
        signal::register_slots(slots)?;
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        let _ = REGISTRY.set(Registry {
            slots,
            nonisol: nonisol_cpus.clone(),
            driver: self.driver.clone(),
        });

        let socket_path = server_socket_path(&self.socket_base);
        let lock = LockFile::acquire(&lock_path(&socket_path))?;
        let server = ControlServer::create_with_recovery(&socket_path)?;
        drop(lock);

        let timer_source = self
            .timer_source
            .unwrap_or_else(|| Box::new(ProcTimerSource::default()));

        Ok(Manager::new(
            slots,
            ends,
            isol_cpus,
            nonisol_cpus,
            server,
            timer_source,
            self.proc_root,
            self.opts,
            self.shutdown,
        ))
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Bootstrap::new()
    }
}
