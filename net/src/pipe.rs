//! Process-local loopback connection over a `pipe(2)` pair.
//!
//! Anything written with [`Connection::send`] becomes readable on the same
//! connection.  This is the transport behind [`Protocol::Pipe`] and the
//! self-signal connection inside every
//! [`ConnectionSet`](crate::connection_set::ConnectionSet): the read end is
//! always part of the wait set, so writing a single byte from any thread
//! wakes a blocked readiness wait promptly.

use {
    crate::{
        connection::{
            fd_has_pending_data, Connection, ConnectionDescription, ConnectionState,
        },
        error::{NetError, Result},
    },
    log::debug,
    std::{
        io,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        sync::Mutex,
    },
};

struct PipeInner {
    state: ConnectionState,
    read_fd: Option<OwnedFd>,
    write_fd: Option<OwnedFd>,
}

/// A loopback pipe connection.
pub struct PipeConnection {
    inner: Mutex<PipeInner>,
}

impl PipeConnection {
    /// Create an unconnected pipe connection.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PipeInner {
                state: ConnectionState::Closed,
                read_fd: None,
                write_fd: None,
            }),
        }
    }

    fn create_pair() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: pipe(2) just handed us ownership of both fds.
        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        for fd in [&read_fd, &write_fd] {
            unsafe {
                libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok((read_fd, write_fd))
    }
}

impl Default for PipeConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for PipeConnection {
    fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    /// The description is ignored: a pipe connection is always loopback.
    fn connect(&self, _description: &ConnectionDescription) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnectionState::Connected {
            return Ok(());
        }
        let (read_fd, write_fd) = Self::create_pair()?;
        debug!(
            "pipe connection established (r={}, w={})",
            read_fd.as_raw_fd(),
            write_fd.as_raw_fd()
        );
        inner.read_fd = Some(read_fd);
        inner.write_fd = Some(write_fd);
        inner.state = ConnectionState::Connected;
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_fd = None;
        inner.write_fd = None;
        inner.state = ConnectionState::Closed;
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        // Clone the fd under the lock and write without it: a writer
        // blocked on a full pipe must not stall state() or read_notifier().
        let fd = {
            let inner = self.inner.lock().unwrap();
            let Some(fd) = &inner.write_fd else {
                return Err(NetError::InvalidState {
                    expected: "connected",
                    actual: inner.state,
                });
            };
            fd.try_clone()?
        };
        let mut written = 0usize;
        while written < data.len() {
            let remaining = &data[written..];
            let rc = unsafe {
                libc::write(fd.as_raw_fd(), remaining.as_ptr().cast(), remaining.len())
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            written = written.saturating_add(rc as usize);
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = {
            let inner = self.inner.lock().unwrap();
            let Some(fd) = &inner.read_fd else {
                return Err(NetError::InvalidState {
                    expected: "connected",
                    actual: inner.state,
                });
            };
            fd.try_clone()?
        };
        loop {
            let rc = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            return Ok(rc as usize);
        }
    }

    fn read_notifier(&self) -> Option<RawFd> {
        self.inner
            .lock()
            .unwrap()
            .read_fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
    }

    fn has_pending_data(&self) -> bool {
        match self.read_notifier() {
            Some(fd) => fd_has_pending_data(fd),
            None => false,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{
            sync::Arc,
            thread,
            time::{Duration, Instant},
        },
    };

    #[test]
    fn test_connect_and_close() {
        let conn = PipeConnection::new();
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.connect(&ConnectionDescription::pipe()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.read_notifier().is_some());
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.read_notifier().is_none());
    }

    #[test]
    fn test_loopback_roundtrip() {
        let conn = PipeConnection::new();
        conn.connect(&ConnectionDescription::pipe()).unwrap();
        assert!(!conn.has_pending_data());

        conn.send(b"ping").unwrap();
        assert!(conn.has_pending_data());

        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(!conn.has_pending_data());
    }

    #[test]
    fn test_send_on_closed_pipe_fails() {
        let conn = PipeConnection::new();
        assert!(conn.send(b"x").is_err());
    }

    #[test]
    fn test_read_notifier_available_while_send_is_blocked() {
        let conn = Arc::new(PipeConnection::new());
        conn.connect(&ConnectionDescription::pipe()).unwrap();

        // Far beyond the kernel pipe buffer, so the sender blocks in
        // write(2) until the payload is drained.
        let payload = vec![0u8; 4 * 1024 * 1024];
        let sender = {
            let conn = conn.clone();
            thread::spawn(move || conn.send(&payload).unwrap())
        };
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        assert!(conn.read_notifier().is_some());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.has_pending_data());
        assert!(started.elapsed() < Duration::from_millis(500));

        let mut buf = vec![0u8; 65536];
        let mut total = 0usize;
        while total < 4 * 1024 * 1024 {
            total = total.saturating_add(conn.recv(&mut buf).unwrap());
        }
        sender.join().unwrap();
    }
}
