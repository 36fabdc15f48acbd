//! TCP stream transport.
//!
//! [`SocketConnection`] covers both roles of the socket transport: an
//! outbound/accepted stream (`Connected`) and an acceptor (`Listening`).
//! A listening connection that is reported read-ready by the multiplexer
//! has a peer waiting in its accept queue; call [`Connection::accept`] to
//! obtain the new stream connection.

use {
    crate::{
        config::NetConfig,
        connection::{
            fd_has_pending_data, Connection, ConnectionDescription, ConnectionRef,
            ConnectionState,
        },
        error::{NetError, Result},
    },
    log::debug,
    std::{
        io::{self, Read, Write},
        net::{Shutdown, SocketAddr, TcpListener, TcpStream},
        os::fd::{AsRawFd, RawFd},
        sync::{Arc, Mutex},
        time::Duration,
    },
};

struct SocketInner {
    state: ConnectionState,
    stream: Option<TcpStream>,
    listener: Option<TcpListener>,
}

/// A TCP connection or acceptor.
pub struct SocketConnection {
    connect_timeout: Duration,
    inner: Mutex<SocketInner>,
}

impl SocketConnection {
    /// Create an unconnected socket connection.
    pub fn new(config: &NetConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            inner: Mutex::new(SocketInner {
                state: ConnectionState::Closed,
                stream: None,
                listener: None,
            }),
        }
    }

    fn from_stream(stream: TcpStream, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            inner: Mutex::new(SocketInner {
                state: ConnectionState::Connected,
                stream: Some(stream),
                listener: None,
            }),
        }
    }

    /// The locally bound address, once connected or listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        if let Some(listener) = &inner.listener {
            return listener.local_addr().ok();
        }
        inner.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn required_addr(description: &ConnectionDescription) -> Result<SocketAddr> {
        description
            .addr
            .ok_or(NetError::InvalidDescription("socket address required"))
    }

    /// Clone the stream handle for I/O outside the lock: a send blocked
    /// on socket backpressure must not stall state() or read_notifier().
    fn io_stream(&self) -> Result<TcpStream> {
        let inner = self.inner.lock().unwrap();
        let Some(stream) = &inner.stream else {
            return Err(NetError::InvalidState {
                expected: "connected",
                actual: inner.state,
            });
        };
        Ok(stream.try_clone()?)
    }
}

impl Connection for SocketConnection {
    fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    fn connect(&self, description: &ConnectionDescription) -> Result<()> {
        let addr = Self::required_addr(description)?;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnectionState::Closed {
                return Err(NetError::InvalidState {
                    expected: "closed",
                    actual: inner.state,
                });
            }
            inner.state = ConnectionState::Connecting;
        }

        // The lock is not held across the blocking connect so that state()
        // and close() stay responsive.
        match TcpStream::connect_timeout(&addr, self.connect_timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!("connected to {}", addr);
                let mut inner = self.inner.lock().unwrap();
                inner.stream = Some(stream);
                inner.state = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                let mut inner = self.inner.lock().unwrap();
                inner.state = ConnectionState::Closed;
                Err(err.into())
            }
        }
    }

    fn listen(&self, description: &ConnectionDescription) -> Result<()> {
        let addr = Self::required_addr(description)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectionState::Closed {
            return Err(NetError::InvalidState {
                expected: "closed",
                actual: inner.state,
            });
        }
        let listener = TcpListener::bind(addr)?;
        debug!("listening on {}", listener.local_addr()?);
        inner.listener = Some(listener);
        inner.state = ConnectionState::Listening;
        Ok(())
    }

    fn accept(&self) -> Result<ConnectionRef> {
        let inner = self.inner.lock().unwrap();
        let Some(listener) = &inner.listener else {
            return Err(NetError::InvalidState {
                expected: "listening",
                actual: inner.state,
            });
        };
        let (stream, peer) = listener.accept()?;
        let _ = stream.set_nodelay(true);
        debug!("accepted connection from {}", peer);
        Ok(Arc::new(Self::from_stream(stream, self.connect_timeout)))
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stream) = inner.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        inner.listener = None;
        inner.state = ConnectionState::Closed;
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let mut stream = self.io_stream()?;
        stream.write_all(data)?;
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut stream = self.io_stream()?;
        loop {
            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn read_notifier(&self) -> Option<RawFd> {
        let inner = self.inner.lock().unwrap();
        if let Some(stream) = &inner.stream {
            return Some(stream.as_raw_fd());
        }
        inner.listener.as_ref().map(|l| l.as_raw_fd())
    }

    fn has_pending_data(&self) -> bool {
        match self.read_notifier() {
            Some(fd) => fd_has_pending_data(fd),
            None => false,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
