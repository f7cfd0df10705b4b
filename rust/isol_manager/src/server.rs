// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Line-oriented control socket.
//!
//! A non-blocking AF_UNIX stream server polled from the manager's
//! single thread. Clients send newline-terminated commands; responses
//! are buffered and flushed as the socket drains, so a slow client
//! never stalls the manager. Socket creation binds a per-pid temporary
//! name and renames it into place without replacement, guarded by an
//! exclusively flocked `.LCK` companion against racing peer servers.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use isol_utils::subset_id;
use log::debug;
use log::info;
use std::collections::VecDeque;
use std::ffi::CString;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

pub const SERVER_SOCKET_NAME: &str = "/var/run/isol_server";
pub const MAX_CLIENTS: usize = 50;

/// Control socket path for this instance: the base name plus the CPU
/// subset id, when one is configured.
pub fn server_socket_path(base: &Path) -> PathBuf {
    match subset_id() {
        Some(id) => PathBuf::from(format!("{}.{}", base.display(), id)),
        None => base.to_path_buf(),
    }
}

/// The `.LCK` companion guarding the socket creation window.
pub fn lock_path(socket: &Path) -> PathBuf {
    PathBuf::from(format!("{}.LCK", socket.display()))
}

/// An exclusively flocked file, held for the duration of socket
/// creation or stale-socket recovery. Dropping releases the lock.
pub struct LockFile {
    fd: libc::c_int,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<LockFile> {
        let cpath = CString::new(path.as_os_str().as_bytes()).context("lock path contains NUL")?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_CREAT | libc::O_RDONLY, 0o600) };
        if fd < 0 {
            bail!(
                "Can't open lock file {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            );
        }
        if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("Can't lock {}: {}", path.display(), err);
        }
        Ok(LockFile { fd })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(u32),
    Line(u32, String),
    Disconnected(u32),
}

struct Client {
    id: u32,
    stream: UnixStream,
    inbuf: Vec<u8>,
    outbuf: VecDeque<u8>,
    close_after_flush: bool,
    dead: bool,
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    clients: Vec<Client>,
    next_id: u32,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer").finish_non_exhaustive()
    }
}

impl ControlServer {
    /// Bind a fresh listener. The socket is bound under a per-pid
    /// temporary name and renamed atomically onto `path`; an existing
    /// socket file makes this fail.
    pub fn create(path: &Path) -> Result<ControlServer> {
        let tmp = PathBuf::from(format!("{}.{}", path.display(), std::process::id()));
        let listener = UnixListener::bind(&tmp)
            .with_context(|| format!("Failed to bind {}", tmp.display()))?;
        listener.set_nonblocking(true)?;

        let old = CString::new(tmp.as_os_str().as_bytes()).context("socket path contains NUL")?;
        let new = CString::new(path.as_os_str().as_bytes()).context("socket path contains NUL")?;
        let ret = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                old.as_ptr(),
                libc::AT_FDCWD,
                new.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            let _ = std::fs::remove_file(&tmp);
            bail!("Failed to rename socket to {}: {}", path.display(), err);
        }

        Ok(ControlServer {
            listener,
            path: path.to_path_buf(),
            clients: Vec::new(),
            next_id: 1,
        })
    }

    /// Bind, recovering from a stale socket file: when the bind fails, a
    /// connect probe distinguishes a live peer server from a leftover
    /// file, which is unlinked before one more attempt. The caller holds
    /// the `.LCK` flock around this whole window.
    pub fn create_with_recovery(path: &Path) -> Result<ControlServer> {
        match Self::create(path) {
            Ok(server) => Ok(server),
            Err(_) => match UnixStream::connect(path) {
                Ok(_) => bail!("A manager is already running at {}", path.display()),
                Err(_) => {
                    info!(
                        "Removing stale socket {} and creating a new one",
                        path.display()
                    );
                    let _ = std::fs::remove_file(path);
                    Self::create(path)
                }
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True while any client still has buffered output.
    pub fn pending_data(&self) -> bool {
        self.clients.iter().any(|c| !c.outbuf.is_empty())
    }

    /// Queue data for a client, sending as much as the socket takes
    /// right away.
    pub fn send(&mut self, id: u32, data: &str) {
        let Some(client) = self.clients.iter_mut().find(|c| c.id == id) else {
            return;
        };
        let mut data = data.as_bytes();
        if client.outbuf.is_empty() {
            loop {
                match client.stream.write(data) {
                    Ok(n) => {
                        data = &data[n..];
                        if data.is_empty() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        client.dead = true;
                        return;
                    }
                }
            }
        }
        client.outbuf.extend(data.iter());
    }

    /// Close the session once all buffered output has been sent.
    pub fn close_session(&mut self, id: u32) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.id == id) {
            client.close_after_flush = true;
        }
    }

    /// One pass of the socket loop: accept, read lines, flush output,
    /// reap closed sessions.
    pub fn poll_pass(&mut self, timeout: Duration) -> Result<Vec<ServerEvent>> {
        let mut events = Vec::new();
        let accepting = self.clients.len() < MAX_CLIENTS;

        let mut fds = Vec::with_capacity(self.clients.len() + 1);
        fds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: if accepting { libc::POLLIN } else { 0 },
            revents: 0,
        });
        for client in &self.clients {
            let mut ev = libc::POLLIN;
            if !client.outbuf.is_empty() {
                ev |= libc::POLLOUT;
            }
            fds.push(libc::pollfd {
                fd: client.stream.as_raw_fd(),
                events: ev,
                revents: 0,
            });
        }

        let ret = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout.as_millis() as libc::c_int,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(events);
            }
            bail!("poll failed: {}", err);
        }
        if ret == 0 {
            return Ok(events);
        }

        if fds[0].revents & libc::POLLIN != 0 {
            loop {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        if self.clients.len() >= MAX_CLIENTS {
                            drop(stream);
                            break;
                        }
                        stream.set_nonblocking(true)?;
                        let id = self.next_id;
                        self.next_id = self.next_id.wrapping_add(1);
                        debug!("control client {} connected", id);
                        self.clients.push(Client {
                            id,
                            stream,
                            inbuf: Vec::new(),
                            outbuf: VecDeque::new(),
                            close_after_flush: false,
                            dead: false,
                        });
                        events.push(ServerEvent::Connected(id));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => bail!("accept failed: {}", e),
                }
            }
        }

        for (slot, client) in self.clients.iter_mut().enumerate() {
            let revents = fds.get(slot + 1).map_or(0, |f| f.revents);

            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                let mut buf = [0u8; 4096];
                match client.stream.read(&mut buf) {
                    Ok(0) => {
                        client.outbuf.clear();
                        client.dead = true;
                    }
                    Ok(n) => {
                        client.inbuf.extend_from_slice(&buf[..n]);
                        while let Some(pos) = client.inbuf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = client.inbuf.drain(..=pos).collect();
                            if !client.close_after_flush {
                                let text =
                                    String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                                events.push(ServerEvent::Line(client.id, text));
                            }
                        }
                    }
                    Err(e)
                        if e.kind() == ErrorKind::WouldBlock
                            || e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => {
                        client.outbuf.clear();
                        client.dead = true;
                    }
                }
            }

            if !client.dead && revents & libc::POLLOUT != 0 {
                while !client.outbuf.is_empty() {
                    let (head, _) = client.outbuf.as_slices();
                    match client.stream.write(head) {
                        Ok(n) => {
                            client.outbuf.drain(..n);
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(_) => {
                            client.outbuf.clear();
                            client.dead = true;
                            break;
                        }
                    }
                }
            }
        }

        let mut removed = Vec::new();
        self.clients.retain(|c| {
            if c.dead || (c.close_after_flush && c.outbuf.is_empty()) {
                removed.push(c.id);
                false
            } else {
                true
            }
        });
        for id in removed {
            debug!("control client {} disconnected", id);
            events.push(ServerEvent::Disconnected(id));
        }

        Ok(events)
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::io::BufReader;

    fn poll_until(
        server: &mut ControlServer,
        mut pred: impl FnMut(&ServerEvent) -> bool,
    ) -> ServerEvent {
        for _ in 0..100 {
            let events = server.poll_pass(Duration::from_millis(50)).unwrap();
            for ev in events {
                if pred(&ev) {
                    return ev;
                }
            }
        }
        panic!("expected server event did not arrive");
    }

    #[test]
    fn test_line_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");
        let mut server = ControlServer::create(&path).unwrap();

        let client = UnixStream::connect(&path).unwrap();
        let id = match poll_until(&mut server, |e| matches!(e, ServerEvent::Connected(_))) {
            ServerEvent::Connected(id) => id,
            _ => unreachable!(),
        };

        let mut half = client.try_clone().unwrap();
        half.write_all(b"hel").unwrap();
        half.write_all(b"lo\nwo").unwrap();
        assert_eq!(
            poll_until(&mut server, |e| matches!(e, ServerEvent::Line(..))),
            ServerEvent::Line(id, "hello".to_string())
        );
        half.write_all(b"rld\n").unwrap();
        assert_eq!(
            poll_until(&mut server, |e| matches!(e, ServerEvent::Line(..))),
            ServerEvent::Line(id, "world".to_string())
        );

        server.send(id, "221 End of session.\n");
        server.close_session(id);
        poll_until(&mut server, |e| matches!(e, ServerEvent::Disconnected(_)));

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "221 End of session.\n");
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
    }

    #[test]
    fn test_stale_socket_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");

        // A dead server leaves its socket file behind.
        let stale = UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        assert!(ControlServer::create(&path).is_err());
        let _lock = LockFile::acquire(&lock_path(&path)).unwrap();
        let server = ControlServer::create_with_recovery(&path).unwrap();
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_server_refused_while_first_lives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");
        let _first = ControlServer::create(&path).unwrap();
        let err = ControlServer::create_with_recovery(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }
}
