// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Task isolation manager core
//!
//! The userspace side of Linux task isolation. A single manager thread
//! owns a pool of isolation-capable CPUs and drives one worker per CPU
//! through the isolation lifecycle: it launches workers once the kernel
//! observer shows their CPUs free of timers, confirms isolation, backs
//! out when interference appears, and relaunches after isolation loss.
//!
//! Manager and workers communicate exclusively over the [`isol_ipc`]
//! ring channels so a worker in isolated mode never has to enter the
//! kernel. External clients drive the manager through a line-oriented
//! control socket.

pub mod slot;
pub use slot::claim_cpu;
pub use slot::isol_flag;
pub use slot::Slot;
pub use slot::WorkerEnds;

mod signal;
pub use signal::register_slots;

pub mod timers;
pub use timers::TimerKind;
pub use timers::TimerRecord;
pub use timers::TimerScan;
pub use timers::KTIME_MAX;

pub mod observer;
pub use observer::ProcTimerSource;
pub use observer::TimerSource;

pub mod threads;
pub use threads::ProcTable;
pub use threads::ThreadInfo;

pub mod server;
pub use server::ControlServer;
pub use server::LockFile;
pub use server::ServerEvent;
pub use server::SERVER_SOCKET_NAME;

pub mod client;

pub mod worker;
pub use worker::IsolatedTask;

pub mod manager;
pub use manager::Manager;
pub use manager::ManagerOpts;
pub use manager::WorkerState;

pub mod bootstrap;
pub use bootstrap::Bootstrap;
