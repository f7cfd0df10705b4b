// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! End-to-end lifecycle scenarios: manager and workers wired through
//! real ring channels and a real control socket, with a scripted timer
//! observer and a no-op isolation driver.

use anyhow::Result;
use isol_manager::isol_flag;
use isol_manager::isol_print;
use isol_manager::server::lock_path;
use isol_manager::Bootstrap;
use isol_manager::IsolatedTask;
use isol_manager::LockFile;
use isol_manager::Manager;
use isol_manager::ManagerOpts;
use isol_manager::TimerKind;
use isol_manager::TimerRecord;
use isol_manager::TimerScan;
use isol_manager::TimerSource;
use isol_manager::WorkerState;
use isol_utils::kernel::NoopIsolation;
use isol_utils::Cpumask;
use std::io::BufReader;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Observer script. With `busy` 0 every scan is clean. Otherwise the
/// named CPU keeps a pending timer on every scan until the script is
/// armed, and for the first `busy` counted scans after that; `calls`
/// counts the scans since arming.
struct ScriptedTimers {
    calls: Arc<AtomicUsize>,
    armed: Arc<AtomicBool>,
    busy: usize,
    cpu: usize,
    ticks: i64,
}

impl TimerSource for ScriptedTimers {
    fn scan(&mut self) -> Result<TimerScan> {
        self.ticks += 1;
        let now = 1_000_000_i64 * self.ticks;
        let busy_now = if self.busy == 0 {
            false
        } else if self.armed.load(Ordering::SeqCst) {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 <= self.busy
        } else {
            true
        };
        let mut scan = TimerScan::empty(now);
        if busy_now {
            scan.records.push(TimerRecord {
                cpu: self.cpu,
                kind: TimerKind::HrTimer,
                expires: now + 1_000_000,
            });
        }
        Ok(scan)
    }
}

fn clean_timers() -> ScriptedTimers {
    ScriptedTimers {
        calls: Arc::new(AtomicUsize::new(0)),
        armed: Arc::new(AtomicBool::new(false)),
        busy: 0,
        cpu: 0,
        ticks: 0,
    }
}

fn build_manager(
    dir: &tempfile::TempDir,
    cpus: &str,
    source: ScriptedTimers,
    shutdown: Arc<AtomicBool>,
) -> Manager {
    std::fs::create_dir_all(dir.path().join("proc")).unwrap();
    let mut boot = Bootstrap::new();
    boot.cpulist = Some(cpus.to_string());
    boot.socket_base = dir.path().join("isol_server");
    boot.use_shm = false;
    boot.proc_root = dir.path().join("proc");
    boot.driver = Arc::new(NoopIsolation);
    boot.timer_source = Some(Box::new(source));
    boot.opts = ManagerOpts {
        startup_timeout: Duration::from_secs(20),
        restart_delay: Duration::ZERO,
        idle_poll: Duration::from_millis(10),
        rescan_period: Duration::from_secs(3600),
    };
    boot.shutdown = shutdown;
    boot.initialize().unwrap()
}

/// A bootstrap with the hermetic test defaults and no manager-loop
/// tuning, for setup-path scenarios.
fn plain_bootstrap(socket_base: PathBuf, proc_root: PathBuf) -> Bootstrap {
    let mut boot = Bootstrap::new();
    boot.cpulist = Some("2".to_string());
    boot.socket_base = socket_base;
    boot.use_shm = false;
    boot.proc_root = proc_root;
    boot.driver = Arc::new(NoopIsolation);
    boot.timer_source = Some(Box::new(clean_timers()));
    boot
}

fn noop_driver() -> Arc<NoopIsolation> {
    Arc::new(NoopIsolation)
}

fn nonisol() -> Cpumask {
    Cpumask::from_cpulist("0-1").unwrap()
}

fn drive_until(
    mgr: &mut Manager,
    limit: usize,
    mut pred: impl FnMut(&Manager) -> bool,
) -> bool {
    for _ in 0..limit {
        mgr.run_pass(Duration::from_millis(1)).unwrap();
        if pred(mgr) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_single_worker_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = build_manager(&dir, "2", clean_timers(), Arc::new(AtomicBool::new(false)));
    let slots = mgr.slots();

    let worker = std::thread::spawn(move || {
        let mut task =
            IsolatedTask::attach_to(slots, Some(2), nonisol(), noop_driver()).unwrap();
        assert_eq!(task.cpu(), 2);
        assert!(task.enter().unwrap());
        while isol_print!(task, "hello\n").is_err() {
            std::hint::spin_loop();
        }
        task.exit();
    });

    mgr.run().unwrap();
    worker.join().unwrap();

    assert_eq!(mgr.slot_state(0), WorkerState::Off);
    assert!(!slots[0].claimed());
    // The channel ends are parked again for the next claimant.
    let ends = slots[0].take_ends();
    assert!(ends.is_some());
}

#[test]
fn test_timer_contention_delays_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let armed = Arc::new(AtomicBool::new(false));
    let mut mgr = build_manager(
        &dir,
        "2",
        ScriptedTimers {
            calls: calls.clone(),
            armed: armed.clone(),
            busy: 5,
            cpu: 2,
            ticks: 0,
        },
        Arc::new(AtomicBool::new(false)),
    );
    let slots = mgr.slots();
    let stop = Arc::new(AtomicBool::new(false));

    let worker = std::thread::spawn({
        let stop = stop.clone();
        move || {
            let mut task =
                IsolatedTask::attach_to(slots, None, nonisol(), noop_driver()).unwrap();
            assert!(task.enter().unwrap());
            while task.pass() && !stop.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            task.exit();
        }
    });

    // The worker checks in but its CPU keeps a pending timer, so the
    // launch is held back.
    assert!(drive_until(&mut mgr, 5000, |m| {
        m.slot_state(0) == WorkerState::Ready
    }));
    for _ in 0..20 {
        mgr.run_pass(Duration::from_millis(1)).unwrap();
        assert_ne!(mgr.slot_state(0), WorkerState::Running);
    }

    // From here the observer reports the timer for five more scans,
    // then a clean CPU.
    armed.store(true, Ordering::SeqCst);
    let reached = drive_until(&mut mgr, 5000, |m| {
        let state = m.slot_state(0);
        if calls.load(Ordering::SeqCst) <= 5 {
            assert_ne!(state, WorkerState::Running);
        }
        state == WorkerState::Running
    });
    assert!(reached, "worker never reached the running state");
    assert!(calls.load(Ordering::SeqCst) >= 6);

    stop.store(true, Ordering::Relaxed);
    assert!(drive_until(&mut mgr, 5000, |m| m.slot_state(0) == WorkerState::Off));
    worker.join().unwrap();
}

#[test]
fn test_isolation_loss_relaunches() {
    static DISPATCHES: AtomicU32 = AtomicU32::new(0);

    let dir = tempfile::tempdir().unwrap();
    let mut mgr = build_manager(&dir, "2", clean_timers(), Arc::new(AtomicBool::new(false)));
    let slots = mgr.slots();
    let stop = Arc::new(AtomicBool::new(false));

    let worker = std::thread::spawn({
        let stop = stop.clone();
        move || {
            let mut task =
                IsolatedTask::attach_to(slots, Some(2), nonisol(), noop_driver()).unwrap();
            assert!(task.enter_with_counter(&DISPATCHES).unwrap());
            while task.pass() && !stop.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            task.exit();
        }
    });

    assert!(drive_until(&mut mgr, 5000, |m| m.slot_state(0) == WorkerState::Running));
    let dispatched_before = DISPATCHES.load(Ordering::Relaxed);

    // The isolation-lost signal path stores 0 into the isolation flag.
    slots[0].isolated.store(isol_flag::LOST, Ordering::SeqCst);
    mgr.run_pass(Duration::from_millis(1)).unwrap();
    let state = mgr.slot_state(0);
    assert_ne!(state, WorkerState::Off);
    assert!(
        matches!(
            state,
            WorkerState::LostIsolation
                | WorkerState::Launching
                | WorkerState::Launched
                | WorkerState::Running
        ),
        "unexpected state after isolation loss: {state}"
    );

    // The relaunch reaches the worker and isolation is confirmed again.
    assert!(drive_until(&mut mgr, 5000, |m| m.slot_state(0) == WorkerState::Running));
    assert!(DISPATCHES.load(Ordering::Relaxed) > dispatched_before);

    stop.store(true, Ordering::Relaxed);
    assert!(drive_until(&mut mgr, 5000, |m| m.slot_state(0) == WorkerState::Off));
    worker.join().unwrap();
}

#[test]
fn test_terminate_propagates_to_all_workers() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = build_manager(&dir, "2-3", clean_timers(), Arc::new(AtomicBool::new(false)));
    let slots = mgr.slots();

    let workers: Vec<_> = (0..2)
        .map(|_| {
            std::thread::spawn(move || {
                let mut task =
                    IsolatedTask::attach_to(slots, None, nonisol(), noop_driver()).unwrap();
                assert!(task.enter().unwrap());
                while task.pass() {
                    std::hint::spin_loop();
                }
                assert!(task.terminated());
                task.exit();
            })
        })
        .collect();

    assert!(drive_until(&mut mgr, 5000, |m| {
        m.slot_state(0) == WorkerState::Running && m.slot_state(1) == WorkerState::Running
    }));

    let socket = mgr.socket_path().to_path_buf();
    let client = std::thread::spawn(move || {
        let stream = isol_manager::client::connect(&socket).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let banner = isol_manager::client::read_response(&mut reader).unwrap();
        assert_eq!(banner.code, Some(220));
        let mut w = stream.try_clone().unwrap();
        w.write_all(b"terminate\n").unwrap();
        let resp = isol_manager::client::read_response(&mut reader).unwrap();
        assert_eq!(resp.code, Some(221));
    });

    mgr.run().unwrap();
    client.join().unwrap();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(mgr.slot_state(0), WorkerState::Off);
    assert_eq!(mgr.slot_state(1), WorkerState::Off);
    assert!(!slots[0].claimed());
    assert!(!slots[1].claimed());
}

#[test]
fn test_second_manager_blocks_on_creation_lock() {
    let dir = tempfile::tempdir().unwrap();
    let proc_root = dir.path().join("proc");
    std::fs::create_dir_all(&proc_root).unwrap();
    let socket_base = dir.path().join("isol_server");

    // Hold the flock exactly as a peer manager does for its whole
    // socket-creation window.
    let lock = LockFile::acquire(&lock_path(&socket_base)).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let second = std::thread::spawn({
        let socket_base = socket_base.clone();
        let proc_root = proc_root.clone();
        move || {
            let result = plain_bootstrap(socket_base, proc_root).initialize();
            done_tx.send(()).unwrap();
            result
        }
    });

    // While the window is open, the second manager's setup must sit in
    // the lock: no completion, no socket file.
    assert!(done_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(!socket_base.exists());

    // The lock holder goes away without having created its socket, as a
    // manager that died mid-setup would; the blocked bootstrap must now
    // complete and take the socket over.
    drop(lock);
    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("bootstrap still blocked after the lock was released");
    let mgr = second.join().unwrap().unwrap();
    assert!(socket_base.exists());

    // Against the now-live manager, one more full bootstrap on the same
    // path is refused.
    let err = plain_bootstrap(socket_base.clone(), proc_root)
        .initialize()
        .unwrap_err();
    assert!(err.to_string().contains("already running"));
    drop(mgr);
    assert!(!socket_base.exists());
}
