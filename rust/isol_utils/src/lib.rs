// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utility collection for the task isolation manager
//!
//! Shared building blocks for the userspace side of Linux task isolation:
//! CPU mask handling, CPU-subset configuration, and the narrow adapters
//! around the kernel interfaces (the task-isolation prctl, CPU affinity,
//! and the tid syscall) that the manager and the workers consume.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;
pub use cpumask::NR_CPUS;

pub mod kernel;
pub use kernel::IsolationDriver;
pub use kernel::NoopIsolation;
pub use kernel::TaskIsolation;

mod subsets;
pub use subsets::resolve_cpu_subset;
pub use subsets::subset_id;
pub use subsets::CPU_SUBSETS_FILE;
