// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The manager: a single thread driving every worker slot through the
//! isolation lifecycle.
//!
//! Each pass accepts control-socket traffic, drains one inbound request
//! per claimed slot, re-reads the kernel observer, and re-evaluates the
//! launch/confirm subset of states. Launches are held back until every
//! claimed worker has checked in (or the startup timeout expires) and
//! until the observer shows the reserved CPUs free of timers; a timer
//! appearing on a launched CPU forces a temporary isolation exit with a
//! rate-limited relaunch.

use crate::observer::TimerSource;
use crate::server::ControlServer;
use crate::server::ServerEvent;
use crate::slot::claim_cpu;
use crate::slot::isol_flag;
use crate::slot::Slot;
use crate::threads::ProcTable;
use crate::timers::update_last_timer;
use crate::timers::TimerKind;
use crate::timers::KTIME_MAX;
use anyhow::Result;
use isol_ipc::ReqType;
use isol_ipc::RingReader;
use isol_ipc::RingWriter;
use isol_ipc::AREA_SIZE;
use isol_utils::kernel;
use isol_utils::Cpumask;
use log::debug;
use log::info;
use log::trace;
use log::warn;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Off,
    Started,
    Ready,
    Launching,
    Launched,
    Running,
    TmpExitingIsolation,
    ExitingIsolation,
    LostIsolation,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WorkerState::Off => "Off",
            WorkerState::Started => "Started",
            WorkerState::Ready => "Ready",
            WorkerState::Launching => "Launching",
            WorkerState::Launched => "Launched",
            WorkerState::Running => "Running",
            WorkerState::TmpExitingIsolation => "Temporarily exiting isolation",
            WorkerState::ExitingIsolation => "Exiting isolation",
            WorkerState::LostIsolation => "Lost isolation",
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ManagerOpts {
    /// Bound on the total wait for workers and timer-free CPUs before
    /// launches proceed with whatever subset is ready.
    pub startup_timeout: Duration,
    /// Rate limit on relaunch after isolation loss or a temporary exit.
    pub restart_delay: Duration,
    /// Control-socket poll timeout while no slot expects traffic.
    pub idle_poll: Duration,
    /// Cadence of the foreign-thread rescan and push-away.
    pub rescan_period: Duration,
}

impl Default for ManagerOpts {
    fn default() -> Self {
        ManagerOpts {
            startup_timeout: Duration::from_secs(20),
            restart_delay: Duration::from_secs(3),
            idle_poll: Duration::from_millis(200),
            rescan_period: Duration::from_secs(3),
        }
    }
}

/// Manager-private per-slot state. Only the manager thread touches
/// this; everything shared with the worker lives in [`Slot`].
struct SlotCtl {
    tx: RingWriter,
    rx: RingReader,
    state: WorkerState,
    exit_request: bool,
    isol_exit_time: Option<Instant>,
    /// Address of a worker-supplied dispatch counter, 0 when absent.
    counter_addr: usize,
    pid: libc::pid_t,
    tid: libc::pid_t,
    /// Latest relevant timer expiration on this CPU, `KTIME_MAX` when
    /// none.
    lasttimer: i64,
    updatetimer: i64,
    /// Timer records from the last observer pass, for diagnostics.
    timers: Vec<(TimerKind, i64, i64)>,
}

pub struct Manager {
    slots: &'static [Slot],
    ctl: Vec<SlotCtl>,
    isol_cpus: Cpumask,
    nonisol_cpus: Cpumask,
    /// CPUs reserved by a checked-in worker.
    running_cpus: Cpumask,
    opts: ManagerOpts,
    start_time: Instant,
    timeout_started: bool,
    timer_source: Box<dyn TimerSource>,
    proc_table: ProcTable,
    proc_root: PathBuf,
    last_thread_scan: Option<Instant>,
    server: ControlServer,
    client_tasks: HashMap<u32, usize>,
    my_pid: libc::pid_t,
    shutdown: Arc<AtomicBool>,
    threads_were_running: bool,
    print_last_cpu: i32,
    print_last_newline: bool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slots: &'static [Slot],
        ends: Vec<(RingWriter, RingReader)>,
        isol_cpus: Cpumask,
        nonisol_cpus: Cpumask,
        server: ControlServer,
        timer_source: Box<dyn TimerSource>,
        proc_root: PathBuf,
        opts: ManagerOpts,
        shutdown: Arc<AtomicBool>,
    ) -> Manager {
        let ctl = ends
            .into_iter()
            .map(|(tx, rx)| SlotCtl {
                tx,
                rx,
                state: WorkerState::Off,
                exit_request: false,
                isol_exit_time: None,
                counter_addr: 0,
                pid: 0,
                tid: 0,
                lasttimer: KTIME_MAX,
                updatetimer: KTIME_MAX,
                timers: Vec::new(),
            })
            .collect();
        Manager {
            slots,
            ctl,
            isol_cpus,
            nonisol_cpus,
            running_cpus: Cpumask::new(),
            opts,
            start_time: Instant::now(),
            timeout_started: true,
            timer_source,
            proc_table: ProcTable::new(),
            proc_root,
            last_thread_scan: None,
            server,
            client_tasks: HashMap::new(),
            my_pid: unsafe { libc::getpid() },
            shutdown,
            threads_were_running: false,
            print_last_cpu: -1,
            print_last_newline: true,
        }
    }

    pub fn socket_path(&self) -> &Path {
        self.server.path()
    }

    pub fn slots(&self) -> &'static [Slot] {
        self.slots
    }

    pub fn slot_state(&self, index: usize) -> WorkerState {
        self.ctl[index].state
    }

    /// Request cooperative termination of every bound worker.
    pub fn terminate_all(&mut self) {
        for (i, ctl) in self.ctl.iter_mut().enumerate() {
            if self.slots[i].claimed() {
                ctl.exit_request = true;
            }
        }
    }

    /// The manager loop: runs until every slot has drained back to Off
    /// after having hosted a worker (or after a shutdown request) and
    /// no client output is pending.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "Managing {} isolation-capable CPUs: {}",
            self.ctl.len(),
            self.isol_cpus
        );
        let mut timeout = Duration::ZERO;
        loop {
            self.run_pass(timeout)?;
            let all_off = self.ctl.iter().all(|c| c.state == WorkerState::Off);
            if all_off
                && !self.server.pending_data()
                && (self.threads_were_running || self.shutdown.load(Ordering::Relaxed))
            {
                break;
            }
            timeout = if self.io_expected() == 0 {
                self.opts.idle_poll
            } else {
                Duration::ZERO
            };
        }
        info!("All workers exited");
        Ok(())
    }

    /// One pass of the manager loop.
    pub fn run_pass(&mut self, timeout: Duration) -> Result<()> {
        let events = self.server.poll_pass(timeout)?;
        for ev in events {
            self.handle_server_event(ev);
        }

        if self.shutdown.load(Ordering::Relaxed) {
            self.terminate_all();
        }

        #[cfg(not(feature = "slave-monitor"))]
        self.monitor_pass();

        for i in 0..self.ctl.len() {
            if !self.slots[i].claimed() {
                continue;
            }
            let mut buf = [0u8; AREA_SIZE];
            if let Ok((ty, size)) = self.ctl[i].rx.get_req(&mut buf) {
                self.handle_req(i, ty, &buf[..size]);
            }
        }

        if self.ctl.iter().any(|c| c.state != WorkerState::Off) {
            self.threads_were_running = true;
        }

        if self.timeout_started {
            match self.timer_source.scan() {
                Ok(scan) => {
                    let (cpus, now) = self.fold_scan(scan);
                    self.process_ready_launch(&cpus, now);
                }
                Err(e) => debug!("timer observer pass failed: {e:#}"),
            }
        }
        Ok(())
    }

    /// Slots whose state makes socket or ring traffic imminent.
    fn io_expected(&self) -> usize {
        self.ctl
            .iter()
            .filter(|c| {
                !matches!(c.state, WorkerState::Off | WorkerState::Running) || c.exit_request
            })
            .count()
    }

    /// Master-monitor check: a slot whose isolation flag dropped to 0
    /// outside the exiting states lost isolation and gets relaunched.
    #[cfg(not(feature = "slave-monitor"))]
    fn monitor_pass(&mut self) {
        for i in 0..self.ctl.len() {
            if !self.slots[i].claimed() {
                continue;
            }
            if matches!(
                self.ctl[i].state,
                WorkerState::Off
                    | WorkerState::TmpExitingIsolation
                    | WorkerState::ExitingIsolation
            ) {
                continue;
            }
            if self.slots[i].isolated.load(Ordering::SeqCst) != isol_flag::LOST {
                continue;
            }
            self.slots[i]
                .isolated
                .store(isol_flag::TRANSITIONAL, Ordering::SeqCst);
            warn!("Isolation failure on CPU {}", self.slots[i].cpu);
            self.ctl[i].state = WorkerState::LostIsolation;
            self.ctl[i].isol_exit_time = Some(Instant::now());
            if self.send_to(i, ReqType::StartLaunch) {
                self.ctl[i].state = WorkerState::Launching;
                debug!("Re-launching worker on CPU {}", self.slots[i].cpu);
            }
        }
    }

    fn handle_server_event(&mut self, ev: ServerEvent) {
        match ev {
            ServerEvent::Connected(id) => {
                self.server
                    .send(id, "220-Task Manager.\n220 Session started.\n");
            }
            ServerEvent::Line(id, line) => self.handle_command(id, &line),
            ServerEvent::Disconnected(id) => {
                if let Some(i) = self.client_tasks.remove(&id) {
                    self.slot_exited(i);
                }
            }
        }
    }

    fn handle_command(&mut self, id: u32, line: &str) {
        let line = line.trim();
        let (cmd, arg) = match line.split_once(char::is_whitespace) {
            Some((c, a)) => (c, Some(a.trim())),
            None => (line, None),
        };
        match cmd {
            "quit" => {
                self.server.send(id, "221 End of session.\n");
                self.server.close_session(id);
            }
            "terminate" => {
                self.server
                    .send(id, "200-Terminating threads.\n221 End of session.\n");
                self.terminate_all();
                self.server.close_session(id);
            }
            "newtask" => self.cmd_newtask(id, arg),
            "taskisolfail" => match self.client_tasks.get(&id).copied() {
                Some(i) => {
                    debug!(
                        "Socket message: isolation failure on CPU {}",
                        self.slots[i].cpu
                    );
                    self.launch_failure(i);
                    self.server.send(id, "220 Ok\n");
                }
                None => self.server.send(id, "500 No task connected.\n"),
            },
            "taskisolfinish" => match self.client_tasks.remove(&id) {
                Some(i) => {
                    self.slot_exited(i);
                    self.server.send(id, "221 End of session.\n");
                    self.server.close_session(id);
                }
                None => self.server.send(id, "500 No task connected.\n"),
            },
            _ => {
                self.server.send(id, "500 Invalid command.\n");
            }
        }
    }

    fn cmd_newtask(&mut self, id: u32, arg: Option<&str>) {
        let Some((cpu, pid, tid)) = arg.and_then(parse_newtask_arg) else {
            self.server.send(id, "500 Invalid command.\n");
            return;
        };
        if self.client_tasks.contains_key(&id) {
            self.server.send(id, "500 Already connected.\n");
            return;
        }
        let want = (cpu >= 0).then_some(cpu as usize);
        let Some(slot) = claim_cpu(self.slots, want) else {
            self.server.send(id, "500 Can't allocate CPU.\n");
            return;
        };
        let i = slot.index;
        slot.register_ids(pid, tid);
        slot.isolated
            .store(isol_flag::TRANSITIONAL, Ordering::SeqCst);
        self.ctl[i].pid = pid;
        self.ctl[i].tid = tid;
        self.ctl[i].counter_addr = 0;
        self.ctl[i].state = WorkerState::Started;
        let _ = self.running_cpus.set_cpu(slot.cpu);
        self.client_tasks.insert(id, i);

        let mut resp = String::from("200-Task allocated\n");
        if pid == self.my_pid {
            resp.push_str("200-MODE=THREAD\n");
            resp.push_str(&format!("200-INDEX={i}\n"));
        } else {
            resp.push_str("200-MODE=PROCESS\n");
        }
        resp.push_str(&format!("200-CPU={}\n200 OK\n", slot.cpu));
        self.server.send(id, &resp);
    }

    fn handle_req(&mut self, i: usize, ty: ReqType, payload: &[u8]) {
        let cpu = self.slots[i].cpu;
        match ty {
            ReqType::None => {
                warn!("Manager received an invalid request from the worker on CPU {cpu}");
            }
            ReqType::Init => {
                let _ = self.running_cpus.set_cpu(cpu);
                if self.ctl[i].state == WorkerState::Off {
                    self.ctl[i].state = WorkerState::Started;
                }
                self.ctl[i].pid = self.slots[i].pid();
                self.ctl[i].tid = self.slots[i].tid();
            }
            ReqType::StartReady => {
                if payload.len() >= 8 {
                    let addr = u64::from_le_bytes(payload[..8].try_into().unwrap()) as usize;
                    self.ctl[i].counter_addr = addr;
                }
                self.ctl[i].pid = self.slots[i].pid();
                self.ctl[i].tid = self.slots[i].tid();
                self.ctl[i].state = WorkerState::Ready;
                debug!("Worker on CPU {cpu} ready");
            }
            ReqType::StartLaunchDone => {
                if matches!(
                    self.ctl[i].state,
                    WorkerState::TmpExitingIsolation | WorkerState::ExitingIsolation
                ) {
                    debug!("Launch message arrived too late, CPU {cpu}");
                } else {
                    self.ctl[i].state = WorkerState::Launched;
                    debug!("Worker launch OK, CPU {cpu}");
                }
            }
            ReqType::StartLaunchFailure => {
                debug!("Message: isolation failure on CPU {cpu}");
                self.launch_failure(i);
            }
            ReqType::Exiting => self.slot_exited(i),
            ReqType::LeaveIsolation => {
                if self.send_to(i, ReqType::OkLeaveIsolation) {
                    self.ctl[i].counter_addr = 0;
                    self.ctl[i].state = WorkerState::ExitingIsolation;
                    debug!("Worker on CPU {cpu} leaving isolation");
                }
            }
            ReqType::Print => self.forward_print(i, payload),
            ReqType::Pong => {}
            // Manager-to-worker types looping back, and PING until a
            // watchdog exists.
            _ => {}
        }
    }

    /// Reaction to `START_LAUNCH_FAILURE`, from the ring or from the
    /// `taskisolfail` command.
    fn launch_failure(&mut self, i: usize) {
        #[cfg(not(feature = "slave-monitor"))]
        if self.slots[i].isolated.load(Ordering::SeqCst) != isol_flag::LOST {
            return;
        }
        if matches!(
            self.ctl[i].state,
            WorkerState::TmpExitingIsolation | WorkerState::ExitingIsolation
        ) {
            return;
        }
        self.ctl[i].state = WorkerState::LostIsolation;
        self.ctl[i].isol_exit_time = Some(Instant::now());
        if self.send_to(i, ReqType::StartLaunch) {
            self.ctl[i].state = WorkerState::Launching;
            debug!("Re-launching worker on CPU {}", self.slots[i].cpu);
        }
    }

    /// Return a slot to Off: on `EXITING`, `taskisolfinish`, or client
    /// disconnect.
    fn slot_exited(&mut self, i: usize) {
        if self.ctl[i].state == WorkerState::Off && !self.slots[i].claimed() {
            return;
        }
        info!("Worker on CPU {} exited", self.slots[i].cpu);
        self.ctl[i].state = WorkerState::Off;
        self.ctl[i].exit_request = false;
        self.ctl[i].counter_addr = 0;
        self.ctl[i].pid = 0;
        self.ctl[i].tid = 0;
        self.ctl[i].lasttimer = KTIME_MAX;
        self.ctl[i].updatetimer = KTIME_MAX;
        self.ctl[i].timers.clear();
        let _ = self.running_cpus.clear_cpu(self.slots[i].cpu);
        self.proc_table.unlink_slot(i);
        self.slots[i].isolated.store(isol_flag::LOST, Ordering::SeqCst);
        self.slots[i].clear_ids();
        self.slots[i].release();
        self.threads_were_running = true;

        if let Some(id) = self
            .client_tasks
            .iter()
            .find_map(|(id, slot)| (*slot == i).then_some(*id))
        {
            self.client_tasks.remove(&id);
            self.server.close_session(id);
        }
    }

    /// Forward worker output, prefixing the originating CPU whenever it
    /// changes.
    fn forward_print(&mut self, i: usize, payload: &[u8]) {
        let cpu = self.slots[i].cpu as i32;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        if self.print_last_cpu != cpu {
            self.print_last_cpu = cpu;
            let prefix = format!("\r\nCPU {cpu:2}: ");
            let skip = if self.print_last_newline { 2 } else { 0 };
            let _ = out.write_all(&prefix.as_bytes()[skip..]);
        }
        let _ = out.write_all(payload);
        if let Some(&last) = payload.last() {
            self.print_last_newline = last == b'\n';
        }
        let _ = out.flush();
    }

    /// Enqueue an argument-less request toward a worker, crediting its
    /// dispatch counter on success.
    fn send_to(&mut self, i: usize, ty: ReqType) -> bool {
        if self.ctl[i].tx.add_req(ty, &[]).is_err() {
            return false;
        }
        let addr = self.ctl[i].counter_addr;
        if addr != 0 && self.ctl[i].pid == self.my_pid {
            // Same trust domain: the worker registered the address of a
            // live counter in this process over START_READY.
            let counter = unsafe { &*(addr as *const AtomicU32) };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Fold one observer pass into the per-slot accumulators; returns
    /// the contaminated-CPU set and the observed now.
    fn fold_scan(&mut self, scan: crate::timers::TimerScan) -> (Cpumask, i64) {
        for ctl in &mut self.ctl {
            ctl.timers.clear();
        }
        let now = scan.now;
        let mut cpus = Cpumask::new();
        for rec in scan.records {
            let Some(i) = self.slots.iter().position(|s| s.cpu == rec.cpu) else {
                continue;
            };
            self.ctl[i].lasttimer = update_last_timer(self.ctl[i].lasttimer, rec.expires, now);
            self.ctl[i].updatetimer = now;
            self.ctl[i].timers.push((rec.kind, rec.expires, now));
            let _ = cpus.set_cpu(rec.cpu);
        }
        if now != KTIME_MAX {
            for ctl in &mut self.ctl {
                if ctl.lasttimer != KTIME_MAX && ctl.lasttimer.wrapping_sub(now) < 0 {
                    ctl.lasttimer = KTIME_MAX;
                    ctl.updatetimer = now;
                }
            }
        }
        (cpus, now)
    }

    /// Longest remaining time before the last relevant timer on any
    /// active slot expires, `KTIME_MAX` when none is pending.
    fn remaining_before_expiration(&self, now: i64) -> i64 {
        let mut remaining = KTIME_MAX;
        let mut found = false;
        for ctl in self.ctl.iter() {
            if matches!(ctl.state, WorkerState::Off | WorkerState::Started) {
                continue;
            }
            if ctl.lasttimer == KTIME_MAX {
                continue;
            }
            let current = ctl.lasttimer.wrapping_sub(now);
            if !found || current > remaining {
                remaining = current;
                found = true;
            }
        }
        if found {
            remaining
        } else {
            KTIME_MAX
        }
    }

    /// Launch workers when they should be isolated, confirm once no
    /// timers are left on the reserved CPUs.
    fn process_ready_launch(&mut self, timers_cpus: &Cpumask, now: i64) {
        let needs_start = self
            .ctl
            .iter()
            .filter(|c| {
                matches!(
                    c.state,
                    WorkerState::Ready
                        | WorkerState::Launched
                        | WorkerState::TmpExitingIsolation
                        | WorkerState::LostIsolation
                ) || c.exit_request
            })
            .count();
        let ready_count = self
            .ctl
            .iter()
            .filter(|c| {
                !matches!(c.state, WorkerState::Off | WorkerState::Started)
            })
            .count();

        if needs_start == 0 {
            self.push_away_pass(false);
            return;
        }

        let startup_expired = self.start_time.elapsed() >= self.opts.startup_timeout;
        // Hold launches until every slot's worker has checked in, or
        // the startup timeout has run out.
        if ready_count < self.ctl.len() && !startup_expired {
            self.push_away_pass(false);
            return;
        }

        let contaminated = !timers_cpus.and(&self.running_cpus).is_empty();
        let mut contaminated_wait = false;

        for i in 0..self.ctl.len() {
            if self.ctl[i].exit_request && self.send_to(i, ReqType::Terminate) {
                self.ctl[i].exit_request = false;
            }

            match self.ctl[i].state {
                WorkerState::TmpExitingIsolation | WorkerState::LostIsolation => {
                    let waited = self.ctl[i]
                        .isol_exit_time
                        .map_or(true, |t| t.elapsed() > self.opts.restart_delay);
                    if waited && self.send_to(i, ReqType::StartLaunch) {
                        self.ctl[i].state = WorkerState::Launching;
                        debug!(
                            "Re-launching worker after exit and delay, CPU {}",
                            self.slots[i].cpu
                        );
                    }
                }
                WorkerState::Ready => {
                    if (!contaminated || startup_expired) && self.send_to(i, ReqType::StartLaunch)
                    {
                        self.ctl[i].state = WorkerState::Launching;
                    }
                }
                WorkerState::Launched => {
                    if !contaminated {
                        // No timers left on any reserved CPU, safe to
                        // let the worker run.
                        if self.send_to(i, ReqType::StartConfirmed) {
                            self.ctl[i].state = WorkerState::Running;
                            info!(
                                "Worker on CPU {} is running in isolated mode",
                                self.slots[i].cpu
                            );
                        }
                    } else if timers_cpus.test_cpu(self.slots[i].cpu) {
                        debug!(
                            "Timers are present on CPU {}, requesting exit from isolation",
                            self.slots[i].cpu
                        );
                        if self.send_to(i, ReqType::ExitIsolation) {
                            self.ctl[i].state = WorkerState::TmpExitingIsolation;
                            self.ctl[i].isol_exit_time = Some(Instant::now());
                        }
                        contaminated_wait = true;
                    } else {
                        let remaining = self.remaining_before_expiration(now);
                        if remaining != KTIME_MAX {
                            trace!(
                                "CPUs with timers: {}, {} ns left, worker on CPU {} should wait",
                                timers_cpus,
                                remaining,
                                self.slots[i].cpu
                            );
                        } else {
                            trace!(
                                "CPUs with timers: {}, worker on CPU {} should wait",
                                timers_cpus,
                                self.slots[i].cpu
                            );
                        }
                        contaminated_wait = true;
                    }
                }
                _ => {}
            }
        }

        self.push_away_pass(contaminated_wait);
    }

    /// Rescan the host's threads and narrow foreign affinity masks away
    /// from the isolation CPUs. Runs on its own cadence, and always
    /// when a reserved CPU was just seen contaminated.
    fn push_away_pass(&mut self, force: bool) {
        let due = force
            || self
                .last_thread_scan
                .map_or(true, |t| t.elapsed() > self.opts.rescan_period);
        if !due {
            return;
        }
        self.last_thread_scan = Some(Instant::now());

        let root = self.proc_root.clone();
        {
            let ctl = &self.ctl;
            let slots = self.slots;
            let table = &mut self.proc_table;
            if let Err(e) = table.rescan(&root, |pid, tid| {
                ctl.iter().enumerate().find_map(|(i, c)| {
                    (slots[i].claimed() && pid > 0 && c.pid == pid && c.tid == tid).then_some(i)
                })
            }) {
                debug!("Thread scan failed: {e:#}");
                return;
            }
        }

        let plan =
            self.proc_table
                .push_away_plan(&self.isol_cpus, &self.nonisol_cpus, self.my_pid);
        for (tid, mask) in plan {
            debug!("Pushing thread {tid} away from the isolation CPUs");
            if let Err(e) = kernel::set_thread_affinity(tid, &mask) {
                trace!("Push-away of thread {tid} failed: {e}");
            }
        }
    }
}

fn parse_newtask_arg(arg: &str) -> Option<(i32, libc::pid_t, libc::pid_t)> {
    let (cpu_s, rest) = arg.split_once(',')?;
    let (pid_s, tid_s) = rest.split_once('/')?;
    let cpu = cpu_s.trim().parse().ok()?;
    let pid: libc::pid_t = pid_s.trim().parse().ok()?;
    let tid: libc::pid_t = tid_s.trim().parse().ok()?;
    if pid <= 0 || tid <= 0 {
        return None;
    }
    Some((cpu, pid, tid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_newtask_arg() {
        assert_eq!(parse_newtask_arg("2,100/101"), Some((2, 100, 101)));
        assert_eq!(parse_newtask_arg("-1,100/101"), Some((-1, 100, 101)));
        assert_eq!(parse_newtask_arg("2,0/101"), None);
        assert_eq!(parse_newtask_arg("2,100"), None);
        assert_eq!(parse_newtask_arg("nope"), None);
    }
}
