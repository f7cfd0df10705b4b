// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Worker-side runtime.
//!
//! A worker thread binds to a slot, announces readiness, and from then
//! on may only talk to the rest of the system through its ring
//! channels. The hot loop's sole suspension point is [`IsolatedTask::pass`],
//! whose fast path reads a single byte; everything else happens in the
//! drain path outside isolation-critical iterations. Workers never
//! block on kernel primitives: a request that must be delivered is
//! spun until the ring accepts it.

use crate::bootstrap;
use crate::client;
use crate::slot::isol_flag;
use crate::slot::Slot;
use crate::slot::WorkerEnds;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use isol_ipc::area_name;
use isol_ipc::ChannelError;
use isol_ipc::ReqType;
use isol_ipc::RingReader;
use isol_ipc::RingWriter;
use isol_ipc::SharedRegion;
use isol_ipc::AREA_SIZE;
use isol_utils::kernel;
use isol_utils::kernel::DriverRef;
use isol_utils::Cpumask;
use std::io::BufReader;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Unacknowledged `LEAVE_ISOLATION` is re-emitted after this many drain
/// passes, in case the manager lost the first one.
pub const LEAVE_RETRY_PASSES: u32 = 1_000_000;

const PRINT_BUF_SIZE: usize = 2048;

/// A thread's handle on its claimed CPU slot.
pub struct IsolatedTask {
    slot: &'static Slot,
    rx: RingReader,
    tx: RingWriter,
    driver: DriverRef,
    nonisol: Cpumask,
    sock: Option<UnixStream>,
    continue_flag: bool,
    launch_confirmed: bool,
    ok_leave: bool,
}

impl IsolatedTask {
    fn bind(
        slot: &'static Slot,
        ends: WorkerEnds,
        nonisol: Cpumask,
        driver: DriverRef,
        sock: Option<UnixStream>,
    ) -> IsolatedTask {
        slot.register_ids(unsafe { libc::getpid() }, kernel::gettid());
        slot.signal.store(0, Ordering::SeqCst);
        slot.isolated.store(isol_flag::TRANSITIONAL, Ordering::SeqCst);
        IsolatedTask {
            slot,
            rx: ends.rx,
            tx: ends.tx,
            driver,
            nonisol,
            sock,
            continue_flag: true,
            launch_confirmed: false,
            ok_leave: false,
        }
    }

    /// Attach the calling thread to a slot of `slots`, claiming the
    /// given CPU (or the first available one) and announcing `INIT` to
    /// the manager.
    pub fn attach_to(
        slots: &'static [Slot],
        cpu: Option<usize>,
        nonisol: Cpumask,
        driver: DriverRef,
    ) -> Result<IsolatedTask> {
        let slot = crate::slot::claim_cpu(slots, cpu)
            .ok_or_else(|| anyhow!("No isolation CPU available"))?;
        let Some(ends) = slot.take_ends() else {
            slot.release();
            bail!("CPU {} has no free channel ends", slot.cpu);
        };
        let mut task = Self::bind(slot, ends, nonisol, driver, None);
        task.send_spin(ReqType::Init, &[]);
        Ok(task)
    }

    /// Attach the calling thread through the environment initialized in
    /// this process.
    pub fn attach(cpu: Option<usize>) -> Result<IsolatedTask> {
        let reg = bootstrap::registry()
            .ok_or_else(|| anyhow!("Isolation environment is not initialized"))?;
        Self::attach_to(reg.slots, cpu, reg.nonisol.clone(), reg.driver.clone())
    }

    /// Attach via the manager's control socket with the `newtask`
    /// handshake. Same-process callers are routed to their slot by
    /// index; foreign processes map the slot's shared-memory areas by
    /// name.
    pub fn connect_with(socket: &Path, cpu: Option<usize>, driver: DriverRef) -> Result<IsolatedTask> {
        let stream = client::connect(socket)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let banner = client::read_response(&mut reader)?;
        if banner.code != Some(220) {
            bail!("Unexpected greeting from manager: {:?}", banner.code);
        }

        let pid = unsafe { libc::getpid() };
        let tid = kernel::gettid();
        let mut stream_w = stream.try_clone()?;
        let cpu_arg = cpu.map(|c| c as i64).unwrap_or(-1);
        writeln!(stream_w, "newtask {cpu_arg},{pid}/{tid}")?;
        let resp = client::read_response(&mut reader)?;
        if resp.code != Some(200) {
            bail!("Manager refused the task: {:?}", resp.code);
        }
        let mode = resp
            .kv
            .get("MODE")
            .ok_or_else(|| anyhow!("Manager reply carries no MODE"))?
            .clone();
        let granted_cpu: usize = resp
            .kv
            .get("CPU")
            .ok_or_else(|| anyhow!("Manager reply carries no CPU"))?
            .parse()
            .context("Bad CPU in manager reply")?;

        match mode.as_str() {
            "THREAD" => {
                let index: usize = resp
                    .kv
                    .get("INDEX")
                    .ok_or_else(|| anyhow!("THREAD reply carries no INDEX"))?
                    .parse()
                    .context("Bad INDEX in manager reply")?;
                let reg = bootstrap::registry()
                    .ok_or_else(|| anyhow!("Isolation environment is not initialized"))?;
                let slot = reg
                    .slots
                    .get(index)
                    .ok_or_else(|| anyhow!("Manager referenced unknown slot {index}"))?;
                let Some(ends) = slot.take_ends() else {
                    bail!("CPU {} has no free channel ends", slot.cpu);
                };
                Ok(Self::bind(slot, ends, reg.nonisol.clone(), driver, Some(stream)))
            }
            "PROCESS" => {
                let regions = SharedRegion::open_shm(&area_name(granted_cpu), 2, AREA_SIZE)?;
                let ends = WorkerEnds {
                    rx: RingReader::new(regions[0].clone()),
                    tx: RingWriter::new(regions[1].clone()),
                };
                // Local mirror slot so the isolation-loss signal has
                // something to land on in this process.
                let slot: &'static Slot = Box::leak(Box::new(Slot::new(0, granted_cpu)));
                crate::signal::register_slots(std::slice::from_ref(slot))?;
                let mut nonisol = kernel::current_affinity().unwrap_or_default();
                let _ = nonisol.clear_cpu(granted_cpu);
                Ok(Self::bind(slot, ends, nonisol, driver, Some(stream)))
            }
            other => bail!("Manager reported unknown mode {other}"),
        }
    }

    /// [`Self::connect_with`] using the production isolation driver.
    pub fn connect(socket: &Path, cpu: Option<usize>) -> Result<IsolatedTask> {
        Self::connect_with(socket, cpu, std::sync::Arc::new(kernel::TaskIsolation))
    }

    pub fn cpu(&self) -> usize {
        self.slot.cpu
    }

    /// True once `TERMINATE` was received.
    pub fn terminated(&self) -> bool {
        !self.continue_flag
    }

    /// The suspension check. Call at every iteration boundary of the
    /// hot loop; the fast path is a single byte load (plus the signal
    /// flag in slave-monitor builds) and returns whether the worker
    /// should keep running.
    #[inline]
    pub fn pass(&mut self) -> bool {
        #[cfg(feature = "slave-monitor")]
        if self.slot.signal.load(Ordering::Relaxed) & 1 == 1 {
            return self.drain_pass();
        }
        if self.rx.data_ready() {
            return self.drain_pass();
        }
        self.continue_flag
    }

    /// Drain and handle one pending request.
    fn drain_pass(&mut self) -> bool {
        #[cfg(feature = "slave-monitor")]
        self.notify_isolation_lost();

        let mut buf = [0u8; AREA_SIZE];
        if let Ok((ty, size)) = self.rx.get_req(&mut buf) {
            self.handle_request(ty, &buf[..size]);
        }
        self.continue_flag
    }

    fn handle_request(&mut self, ty: ReqType, _payload: &[u8]) {
        match ty {
            ReqType::StartLaunch => {
                self.launch_confirmed = false;
                self.slot
                    .isolated
                    .store(isol_flag::TRANSITIONAL, Ordering::SeqCst);
                self.slot.signal.store(0, Ordering::SeqCst);
                match self.driver.enter(self.slot.cpu) {
                    Ok(()) => {
                        self.slot
                            .isolated
                            .store(isol_flag::ISOLATED, Ordering::SeqCst);
                        self.send_spin(ReqType::StartLaunchDone, &[]);
                    }
                    Err(_) => {
                        self.slot.isolated.store(isol_flag::LOST, Ordering::SeqCst);
                        self.send_spin(ReqType::StartLaunchFailure, &[]);
                    }
                }
            }
            ReqType::StartConfirmed => self.launch_confirmed = true,
            ReqType::Terminate => self.continue_flag = false,
            ReqType::ExitIsolation => self.driver.exit(&self.nonisol),
            ReqType::OkLeaveIsolation => self.ok_leave = true,
            // Everything else is manager-bound or unused at the worker.
            _ => {}
        }
    }

    /// Slave-monitor reaction to the isolation-lost signal: report the
    /// failure and wait for the manager's relaunch. A connected worker
    /// reports over the control socket; if that fails for any reason
    /// the failure is queued on the ring instead, so the retry is never
    /// dropped.
    #[cfg(feature = "slave-monitor")]
    fn notify_isolation_lost(&mut self) {
        if self.slot.isolated.load(Ordering::SeqCst) != isol_flag::LOST || !self.launch_confirmed {
            return;
        }
        self.launch_confirmed = false;
        self.slot
            .isolated
            .store(isol_flag::TRANSITIONAL, Ordering::SeqCst);
        self.driver.disable();

        let reported = self
            .sock
            .as_mut()
            .map(|sock| {
                let mut reader = BufReader::new(match sock.try_clone() {
                    Ok(s) => s,
                    Err(_) => return false,
                });
                sock.write_all(b"taskisolfail\n").is_ok()
                    && client::read_response(&mut reader)
                        .map(|r| r.code == Some(220))
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if !reported {
            self.send_spin(ReqType::StartLaunchFailure, &[]);
        }
    }

    /// Announce readiness and converse with the manager until isolation
    /// is confirmed. Returns false when the manager terminated the
    /// worker instead; the caller still finishes with [`Self::exit`].
    pub fn enter(&mut self) -> Result<bool> {
        self.request_launch(0)
    }

    /// Like [`Self::enter`], also handing the manager a counter it
    /// increments for every request it dispatches to this worker.
    pub fn enter_with_counter(&mut self, counter: &'static AtomicU32) -> Result<bool> {
        self.request_launch(counter as *const AtomicU32 as usize)
    }

    fn request_launch(&mut self, counter_addr: usize) -> Result<bool> {
        self.launch_confirmed = false;
        self.continue_flag = true;
        if counter_addr != 0 {
            let payload = (counter_addr as u64).to_le_bytes();
            self.send_spin(ReqType::StartReady, &payload);
        } else {
            self.send_spin(ReqType::StartReady, &[]);
        }

        while !self.launch_confirmed && self.continue_flag {
            self.drain_pass();
        }
        Ok(self.continue_flag)
    }

    /// Leave isolation in coordination with the manager and give the
    /// slot back. When already terminated, this just announces the
    /// exit.
    pub fn exit(mut self) {
        self.ok_leave = false;
        if self.continue_flag {
            self.send_spin(ReqType::LeaveIsolation, &[]);
        }
        let mut passes: u32 = 0;
        while !self.ok_leave && self.continue_flag {
            self.drain_pass();
            passes += 1;
            if passes > LEAVE_RETRY_PASSES {
                passes = 0;
                let _ = self.tx.add_req(ReqType::LeaveIsolation, &[]);
            }
        }

        self.driver.disable();
        #[cfg(feature = "slave-monitor")]
        self.slot.isolated.store(isol_flag::LOST, Ordering::SeqCst);
        self.send_spin(ReqType::Exiting, &[]);

        let IsolatedTask {
            slot, rx, tx, sock, ..
        } = self;
        slot.park_ends(WorkerEnds { rx, tx });
        drop(sock);
    }

    /// `printf` replacement for isolated mode: the formatted bytes
    /// travel to the manager as a `PRINT` request. Returns the channel
    /// error when the ring is full; retry if necessary. Output longer
    /// than the internal buffer is truncated.
    pub fn print_fmt(&mut self, args: std::fmt::Arguments<'_>) -> Result<usize, ChannelError> {
        let mut buf = [0u8; PRINT_BUF_SIZE];
        let mut cursor = std::io::Cursor::new(&mut buf[..]);
        let _ = cursor.write_fmt(args);
        let len = cursor.position() as usize;
        self.tx.add_req(ReqType::Print, &buf[..len])?;
        Ok(len)
    }

    fn send_spin(&mut self, ty: ReqType, payload: &[u8]) {
        while self.tx.add_req(ty, payload).is_err() {
            std::hint::spin_loop();
        }
    }
}

/// Format and send worker output through the `PRINT` path.
#[macro_export]
macro_rules! isol_print {
    ($task:expr, $($arg:tt)*) => {
        $task.print_fmt(::core::format_args!($($arg)*))
    };
}
