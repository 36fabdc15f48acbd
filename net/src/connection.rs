//! The transport-polymorphic connection capability.
//!
//! A [`Connection`] is one communication endpoint: a connected stream to a
//! peer node, a listening acceptor, or a process-local loopback pipe.  The
//! node layer and the readiness multiplexer consume connections only
//! through this trait; the concrete transport is chosen by
//! [`Protocol`] tag at construction time.
//!
//! Connections are shared, not exclusively owned: the same
//! [`ConnectionRef`] may be held by a [`Network`](crate::network::Network)
//! and registered in a [`ConnectionSet`](crate::connection_set::ConnectionSet)
//! at the same time.  Registration is a non-owning association — removal
//! must be explicit, and connection identity is `Arc` pointer identity.

use {
    crate::{
        config::NetConfig,
        error::{NetError, Result},
        pipe::PipeConnection,
        socket::SocketConnection,
    },
    std::{fmt, net::SocketAddr, os::fd::RawFd, sync::Arc},
};

/// Shared handle to a connection.
pub type ConnectionRef = Arc<dyn Connection>;

// ── State and protocol tags ─────────────────────────────────────────────────

/// Lifecycle state of a connection.
///
/// The lifecycle is linear: `Closed → Connecting → Connected → Closed`,
/// with `Listening` as the alternate post-`Closed` state for acceptor
/// endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No endpoint established.
    Closed,
    /// An outbound connection attempt is in progress.
    Connecting,
    /// The connection is established and can send/receive.
    Connected,
    /// The endpoint accepts inbound connections.
    Listening,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
        })
    }
}

/// Transport protocol tag.
///
/// Fixed per [`Network`](crate::network::Network) at construction; also
/// selects the connection implementation instantiated for new peer links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP stream socket.
    Socket,
    /// Process-local pipe pair.
    Pipe,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Socket => "socket",
            Self::Pipe => "pipe",
        })
    }
}

// ── Connection description ──────────────────────────────────────────────────

/// Immutable parameters describing how to reach or launch a node.
///
/// Stored against a node ID by
/// [`Network::add_node`](crate::network::Network::add_node) and never
/// modified afterwards.
#[derive(Debug, Clone)]
pub struct ConnectionDescription {
    /// Transport used to reach the node.
    pub protocol: Protocol,
    /// Peer address, for address-based transports.
    pub addr: Option<SocketAddr>,
    /// Template for the command that launches the remote process.
    ///
    /// The token `%c` stands for "program name plus arguments"; see
    /// [`build_launch_command`](crate::launch::build_launch_command).
    pub launch_command: Option<String>,
}

impl ConnectionDescription {
    /// Description for a TCP peer at `addr`.
    pub fn socket(addr: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Socket,
            addr: Some(addr),
            launch_command: None,
        }
    }

    /// Description for a process-local pipe peer.
    pub fn pipe() -> Self {
        Self {
            protocol: Protocol::Pipe,
            addr: None,
            launch_command: None,
        }
    }

    /// Attach a launch-command template.
    pub fn with_launch_command(mut self, template: impl Into<String>) -> Self {
        self.launch_command = Some(template.into());
        self
    }
}

// ── The capability trait ────────────────────────────────────────────────────

/// A communication endpoint, polymorphic over transport.
///
/// All methods take `&self`; implementations synchronize internally so a
/// connection can be driven from the reactor thread while other threads
/// send on it.
pub trait Connection: Send + Sync {
    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Establish an outbound connection as described.
    fn connect(&self, description: &ConnectionDescription) -> Result<()>;

    /// Start accepting inbound connections as described.
    fn listen(&self, _description: &ConnectionDescription) -> Result<()> {
        Err(NetError::Unsupported("listen"))
    }

    /// Accept one pending inbound connection.
    ///
    /// Valid on a `Listening` connection that was reported read-ready.
    fn accept(&self) -> Result<ConnectionRef> {
        Err(NetError::Unsupported("accept"))
    }

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Write the whole buffer.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes; returns the number read (0 on EOF).
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// The waitable read handle, or `None` if this connection cannot
    /// participate in a readiness wait.
    fn read_notifier(&self) -> Option<RawFd>;

    /// Whether unread inbound bytes are currently available.
    fn has_pending_data(&self) -> bool;
}

/// Construct an unconnected connection for `protocol`.
///
/// Each protocol maps to exactly one transport type; the branches are
/// mutually exclusive by construction.
pub fn new_connection(protocol: Protocol, config: &NetConfig) -> ConnectionRef {
    match protocol {
        Protocol::Socket => Arc::new(SocketConnection::new(config)),
        Protocol::Pipe => Arc::new(PipeConnection::new()),
    }
}

/// Poll a single fd for readability without blocking.
pub(crate) fn fd_has_pending_data(fd: RawFd) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
    rc > 0 && pollfd.revents & libc::POLLIN != 0
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_constructors() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let desc = ConnectionDescription::socket(addr);
        assert_eq!(desc.protocol, Protocol::Socket);
        assert_eq!(desc.addr, Some(addr));
        assert!(desc.launch_command.is_none());

        let desc = ConnectionDescription::pipe().with_launch_command("ssh %c host");
        assert_eq!(desc.protocol, Protocol::Pipe);
        assert_eq!(desc.launch_command.as_deref(), Some("ssh %c host"));
    }

    #[test]
    fn test_protocol_factory_is_exclusive() {
        let config = NetConfig::dev_default();
        // Every protocol yields an unconnected endpoint of its own type.
        for protocol in [Protocol::Socket, Protocol::Pipe] {
            let conn = new_connection(protocol, &config);
            assert_eq!(conn.state(), ConnectionState::Closed);
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Listening.to_string(), "listening");
        assert_eq!(Protocol::Socket.to_string(), "socket");
    }
}
