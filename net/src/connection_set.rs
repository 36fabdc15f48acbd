//! Thread-safe readiness multiplexer over a dynamic set of connections.
//!
//! A [`ConnectionSet`] lets one reactor thread block in [`select`] across
//! every registered connection while other threads add, remove, or
//! [`interrupt`] concurrently.  A blocking `poll(2)` over a fixed fd list
//! cannot observe mutations made after it was entered, so the set carries
//! an internal self-signal [`PipeConnection`] that is always part of the
//! wait set: every mutation writes one wake byte to it, which makes the
//! blocked wait return promptly and rebuild its fd list.
//!
//! The rebuild is driven by a dirty flag so an unchanged set does not pay
//! the snapshot cost on every call.  At most one wake byte is outstanding
//! per dirtying event; duplicate wakes are harmless and drain as extra
//! [`Event::Interrupt`]s.
//!
//! [`select`]: ConnectionSet::select
//! [`interrupt`]: ConnectionSet::interrupt

use {
    crate::{
        connection::{Connection, ConnectionDescription, ConnectionRef, ConnectionState},
        error::{NetError, Result},
        pipe::PipeConnection,
    },
    log::{debug, error, info, warn},
    std::{
        fmt, io,
        os::fd::RawFd,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
};

/// Wake byte written to the self-signal pipe; the only recognized payload.
const SELF_INTERRUPT: u8 = b'i';

// ── Events ──────────────────────────────────────────────────────────────────

/// Outcome of one [`ConnectionSet::select`] call.
///
/// Spurious wake-ups and signal interruptions of the underlying wait are
/// retried internally; callers only ever observe these variants.
pub enum Event {
    /// No connection became ready within the timeout.
    Timeout,
    /// The set was deliberately woken, either by
    /// [`interrupt`](ConnectionSet::interrupt) or by a concurrent mutation
    /// of the wait set.
    Interrupt,
    /// A listening connection has an inbound peer ready to accept.
    Connect(ConnectionRef),
    /// A connected connection has bytes ready to read.
    Data(ConnectionRef),
    /// The peer closed or the handle was invalidated.
    Disconnect(ConnectionRef),
    /// The readiness wait reported an error condition on this connection.
    Error(ConnectionRef),
    /// The wait primitive itself failed.
    SelectError(io::Error),
    /// The wait set could not be built because this connection provides no
    /// read handle.  The set stays usable once the offender is removed.
    InvalidHandle(ConnectionRef),
}

impl Event {
    /// Human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Interrupt => "interrupt",
            Self::Connect(_) => "connect",
            Self::Data(_) => "data",
            Self::Disconnect(_) => "disconnect",
            Self::Error(_) => "error",
            Self::SelectError(_) => "select error",
            Self::InvalidHandle(_) => "invalid handle",
        }
    }

    /// The connection this event names, if any.
    pub fn connection(&self) -> Option<&ConnectionRef> {
        match self {
            Self::Connect(c)
            | Self::Data(c)
            | Self::Disconnect(c)
            | Self::Error(c)
            | Self::InvalidHandle(c) => Some(c),
            Self::Timeout | Self::Interrupt | Self::SelectError(_) => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SelectError(err) => write!(f, "SelectError({err})"),
            other => f.write_str(other.kind()),
        }
    }
}

// ── The set ─────────────────────────────────────────────────────────────────

/// Scratch state owned by the select caller; holding its lock also
/// serializes `select` (one waiter at a time).
struct PollState {
    fds: Vec<libc::pollfd>,
    /// Parallel to `fds`; slot 0 is always the self-signal connection.
    watched: Vec<ConnectionRef>,
}

/// A dynamic set of connections with a single blocking readiness wait.
pub struct ConnectionSet {
    /// Registered connections; locked only for mutation and snapshot,
    /// never across the blocking wait.
    connections: Mutex<Vec<ConnectionRef>>,
    /// Internal loopback used to wake a blocked wait from other threads.
    self_pipe: Arc<PipeConnection>,
    /// The wait set must be rebuilt before the next wait.
    dirty: AtomicBool,
    /// Serializes the pending-byte check with the wake-byte write.
    signal: Mutex<()>,
    poll_state: Mutex<PollState>,
}

impl ConnectionSet {
    /// Create an empty set with its self-signal connection.
    pub fn new() -> Result<Self> {
        let self_pipe = Arc::new(PipeConnection::new());
        self_pipe.connect(&ConnectionDescription::pipe())?;
        Ok(Self {
            connections: Mutex::new(Vec::new()),
            self_pipe,
            dirty: AtomicBool::new(true),
            signal: Mutex::new(()),
            poll_state: Mutex::new(PollState {
                fds: Vec::new(),
                watched: Vec::new(),
            }),
        })
    }

    /// Register a connection.
    ///
    /// The connection must be `Connected` or `Listening`.  If another
    /// thread is blocked in [`select`](Self::select) it is woken so the new
    /// connection is included in the next wait.
    pub fn add_connection(&self, connection: ConnectionRef) -> Result<()> {
        let state = connection.state();
        if state != ConnectionState::Connected && state != ConnectionState::Listening {
            return Err(NetError::InvalidState {
                expected: "connected or listening",
                actual: state,
            });
        }
        self.connections.lock().unwrap().push(connection);
        self.mark_dirty();
        Ok(())
    }

    /// Unregister a connection; returns whether it was present.
    ///
    /// After this returns, the connection will not be reported by any
    /// subsequent `select` call.
    pub fn remove_connection(&self, connection: &ConnectionRef) -> bool {
        let removed = {
            let mut connections = self.connections.lock().unwrap();
            match connections.iter().position(|c| Arc::ptr_eq(c, connection)) {
                Some(index) => {
                    connections.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Remove every registered connection (the self-signal stays).
    pub fn clear(&self) {
        self.connections.lock().unwrap().clear();
        self.mark_dirty();
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().unwrap().is_empty()
    }

    /// Snapshot of the registered connections.
    pub fn connections(&self) -> Vec<ConnectionRef> {
        self.connections.lock().unwrap().clone()
    }

    /// Force a pending or future [`select`](Self::select) to return
    /// [`Event::Interrupt`] promptly, independent of set dirtiness.
    ///
    /// Idempotent: concurrent interrupts collapse into at least one
    /// observed event, not one per call.
    pub fn interrupt(&self) {
        let _signal = self.signal.lock().unwrap();
        if !self.self_pipe.has_pending_data() {
            if let Err(err) = self.self_pipe.send(&[SELF_INTERRUPT]) {
                error!("failed to signal connection set: {err}");
            }
        }
    }

    /// Mark the wait set stale and wake a blocked wait, sending at most
    /// one wake byte per dirtying event.
    fn mark_dirty(&self) {
        if self.dirty.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("wait set modified, restarting select");
        let _signal = self.signal.lock().unwrap();
        if !self.self_pipe.has_pending_data() {
            if let Err(err) = self.self_pipe.send(&[SELF_INTERRUPT]) {
                error!("failed to signal connection set: {err}");
            }
        }
    }

    /// Block until one registered connection becomes ready, the timeout
    /// expires, or the set is interrupted.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` polls and returns
    /// immediately.  One caller at a time: a concurrent `select` blocks
    /// until the first returns.  The connection list lock is held only
    /// while the wait set is rebuilt, so mutators never wait behind the
    /// blocking poll.
    pub fn select(&self, timeout: Option<Duration>) -> Event {
        let mut poll_state = self.poll_state.lock().unwrap();
        let timeout_ms = match timeout {
            None => -1i32,
            Some(duration) => duration.as_millis().min(i32::MAX as u128) as i32,
        };

        loop {
            if let Some(event) = self.rebuild_if_dirty(&mut poll_state) {
                return event;
            }
            for pollfd in poll_state.fds.iter_mut() {
                pollfd.revents = 0;
            }

            let rc = unsafe {
                libc::poll(
                    poll_state.fds.as_mut_ptr(),
                    poll_state.fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if rc == 0 {
                return Event::Timeout;
            }
            if rc < 0 {
                let err = io::Error::last_os_error();
                // Interrupted system call (e.g. an attached debugger).
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("error during select: {err}");
                return Event::SelectError(err);
            }

            let Some((index, revents)) = poll_state
                .fds
                .iter()
                .enumerate()
                .find_map(|(i, fd)| (fd.revents != 0).then_some((i, fd.revents)))
            else {
                // Spurious wake: ready count without ready fds.
                continue;
            };

            if index == 0 {
                return self.handle_self_signal();
            }

            let connection = poll_state.watched[index].clone();
            if revents & libc::POLLERR != 0 {
                info!("error condition on connection during poll");
                return Event::Error(connection);
            }
            if revents & (libc::POLLHUP | libc::POLLNVAL) != 0 {
                // Disconnect takes precedence over read-readiness: at least
                // on macOS both arrive together and no more data can be
                // read anyway.
                return Event::Disconnect(connection);
            }
            if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                // Readable on a listening endpoint means acceptable.
                if connection.state() == ConnectionState::Listening {
                    return Event::Connect(connection);
                }
                return Event::Data(connection);
            }

            warn!("unhandled poll events {revents:#x} on connection");
            return Event::Error(connection);
        }
    }

    /// Drain exactly one byte from the self-signal pipe and evaluate it.
    fn handle_self_signal(&self) -> Event {
        let mut byte = [0u8; 1];
        match self.self_pipe.recv(&mut byte) {
            Ok(1) => {}
            Ok(n) => panic!("self-signal drain read {n} bytes"),
            Err(err) => panic!("failed to drain self-signal connection: {err}"),
        }
        match byte[0] {
            SELF_INTERRUPT => Event::Interrupt,
            other => panic!("unrecognized self-signal payload {other:#x}"),
        }
    }

    /// Rebuild the fd list from the current connections if the set is
    /// dirty.  Returns an event only when the rebuild fails.
    fn rebuild_if_dirty(&self, poll_state: &mut PollState) -> Option<Event> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return None;
        }
        poll_state.fds.clear();
        poll_state.watched.clear();

        let self_fd = self
            .self_pipe
            .read_notifier()
            .expect("self-signal connection lost its read end");
        poll_state.fds.push(readable_pollfd(self_fd));
        let self_connection: ConnectionRef = self.self_pipe.clone();
        poll_state.watched.push(self_connection);

        let connections = self.connections.lock().unwrap();
        for connection in connections.iter() {
            let Some(fd) = connection.read_notifier() else {
                warn!("cannot select connection, it provides no read handle");
                // Stay dirty so the next call rebuilds after the caller
                // removes the offender.
                self.dirty.store(true, Ordering::SeqCst);
                return Some(Event::InvalidHandle(connection.clone()));
            };
            poll_state.fds.push(readable_pollfd(fd));
            poll_state.watched.push(connection.clone());
        }
        debug!(
            "wait set rebuilt with {} connections",
            connections.len()
        );
        None
    }
}

fn readable_pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
