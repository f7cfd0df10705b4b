// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use isol_manager::isol_print;
use isol_manager::Bootstrap;
use isol_manager::IsolatedTask;
use isol_manager::ManagerOpts;
use isol_manager::SERVER_SOCKET_NAME;
use isol_utils::kernel::NoopIsolation;
use isol_utils::kernel::TaskIsolation;
use log::info;
use log::warn;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// isold: the task isolation manager.
///
/// Owns the isolation-capable CPUs of the host, accepts worker tasks
/// over its control socket, launches them into kernel-quiescent
/// isolated mode once their CPUs are free of timers, and backs them
/// out safely when kernel-side interference appears.
///
/// The CPU pool defaults to what the kernel reports as
/// isolation-capable; CPU_SUBSET_ID / CPU_SUBSET restrict it further
/// for multi-application hosts.
#[derive(Debug, Parser)]
struct Opts {
    /// Manage this cpulist instead of the kernel-reported set.
    #[clap(short, long)]
    cpus: Option<String>,

    /// Base path of the control socket.
    #[clap(long, default_value = SERVER_SOCKET_NAME)]
    socket: PathBuf,

    /// Bound, in seconds, on the wait for workers and quiet CPUs
    /// before launches proceed with whatever subset is ready.
    #[clap(long, default_value = "20")]
    startup_timeout: u64,

    /// Delay, in seconds, before relaunching after isolation loss.
    #[clap(long, default_value = "3")]
    restart_delay: u64,

    /// Spawn this many built-in demo workers that spin in isolated
    /// mode and report over the PRINT channel.
    #[clap(long, default_value = "0")]
    demo_workers: usize,

    /// Skip the kernel isolation calls. Lets the full lifecycle run on
    /// kernels without the task isolation patch.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_isolation: bool,

    /// Enable verbose output. Specify multiple times to increase
    /// verbosity.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn demo_worker(index: usize) {
    let mut task = match IsolatedTask::attach(None) {
        Ok(task) => task,
        Err(e) => {
            warn!("Demo worker {index} could not attach: {e:#}");
            return;
        }
    };
    if let Ok(true) = task.enter() {
        let mut passes: u64 = 0;
        let mut messages: u64 = 0;
        let mut failed: u64 = 0;
        while task.pass() {
            passes += 1;
            if passes % 100_000_000 == 0 {
                match isol_print!(
                    task,
                    "Demo worker output, pass {passes}, message number {messages}, \
                     could not write {failed} times\n"
                ) {
                    Ok(_) => {
                        messages += 1;
                        failed = 0;
                    }
                    Err(_) => failed += 1,
                }
            }
        }
    }
    task.exit();
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut boot = Bootstrap::new();
    boot.cpulist = opts.cpus.clone();
    boot.socket_base = opts.socket.clone();
    boot.opts = ManagerOpts {
        startup_timeout: Duration::from_secs(opts.startup_timeout),
        restart_delay: Duration::from_secs(opts.restart_delay),
        ..ManagerOpts::default()
    };
    boot.shutdown = shutdown;
    if opts.no_isolation {
        boot.driver = Arc::new(NoopIsolation);
    } else {
        boot.driver = Arc::new(TaskIsolation);
    }

    let mut manager = boot.initialize()?;
    info!("Control socket at {}", manager.socket_path().display());

    let demos: Vec<_> = (0..opts.demo_workers)
        .map(|index| std::thread::spawn(move || demo_worker(index)))
        .collect();

    manager.run()?;

    for demo in demos {
        let _ = demo.join();
    }
    Ok(())
}
