//! Node lifecycle tracking and packet dispatch.
//!
//! A [`Network`] is the per-session coordination object for one transport
//! protocol.  Control code registers nodes with [`add_node`], marks them
//! started with [`set_started`] / [`set_started_with_connection`], and
//! dispatches packets with [`send`]; a separate reactor thread drives the
//! shared [`ConnectionSet`] to discover inbound traffic, new peers,
//! disconnects, and wake-ups.
//!
//! Outbound links are established lazily: the first `send` to a node
//! without an existing connection constructs one for the network's
//! protocol, connects it using the node's stored description, and
//! registers it for reuse by later sends and by the reactor's wait.
//!
//! [`add_node`]: Network::add_node
//! [`set_started`]: Network::set_started
//! [`set_started_with_connection`]: Network::set_started_with_connection
//! [`send`]: Network::send

use {
    crate::{
        config::NetConfig,
        connection::{
            new_connection, Connection, ConnectionDescription, ConnectionRef, ConnectionState,
            Protocol,
        },
        connection_set::ConnectionSet,
        error::{NetError, Result},
        launch::build_launch_command,
    },
    dashmap::{mapref::entry::Entry, DashMap},
    log::{debug, info, warn},
    std::sync::Arc,
};

/// Opaque node identifier, unique within one [`Network`].
pub type NodeId = u64;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Registered but not started.
    Stopped,
    /// Started; packets may be dispatched to it.
    Running,
}

/// Per-session node coordination, bound to one transport protocol.
///
/// All methods take `&self`; the node maps are concurrent and the
/// connection set synchronizes internally, so a `Network` can be shared
/// across threads behind an `Arc`.
pub struct Network {
    /// Transport protocol; fixed for the lifetime of the network.
    protocol: Protocol,
    config: NetConfig,
    descriptions: DashMap<NodeId, ConnectionDescription>,
    node_states: DashMap<NodeId, NodeState>,
    /// Established link per node; every entry is also registered in
    /// `connection_set`.
    node_connections: DashMap<NodeId, ConnectionRef>,
    connection_set: Arc<ConnectionSet>,
}

impl Network {
    /// Create a network for `protocol`.
    pub fn new(protocol: Protocol, config: NetConfig) -> Result<Self> {
        Ok(Self {
            protocol,
            config,
            descriptions: DashMap::new(),
            node_states: DashMap::new(),
            node_connections: DashMap::new(),
            connection_set: Arc::new(ConnectionSet::new()?),
        })
    }

    /// The protocol this network dispatches over.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The shared connection set, for the reactor thread.
    pub fn connection_set(&self) -> &Arc<ConnectionSet> {
        &self.connection_set
    }

    /// Current lifecycle state of a node, if registered.
    pub fn node_state(&self, node_id: NodeId) -> Option<NodeState> {
        self.node_states.get(&node_id).map(|state| *state)
    }

    /// The established connection to a node, if any.
    pub fn connection(&self, node_id: NodeId) -> Option<ConnectionRef> {
        self.node_connections
            .get(&node_id)
            .map(|conn| conn.clone())
    }

    // ── Node lifecycle ──────────────────────────────────────────────────

    /// Register a node with the parameters needed to reach or launch it.
    ///
    /// The description is immutable once stored.  Registering an already
    /// known ID is rejected: replacing a description under a running node
    /// would silently redirect its traffic.
    pub fn add_node(&self, node_id: NodeId, description: ConnectionDescription) -> Result<()> {
        if self.descriptions.contains_key(&node_id) {
            return Err(NetError::DuplicateNode(node_id));
        }
        debug!("adding node {node_id} ({})", description.protocol);
        self.descriptions.insert(node_id, description);
        self.node_states.insert(node_id, NodeState::Stopped);
        Ok(())
    }

    /// Mark a node running without an established connection.
    ///
    /// Used when the remote side will initiate the link; the connection
    /// will be registered when it arrives, or established lazily by
    /// [`send`](Self::send).
    pub fn set_started(&self, node_id: NodeId) -> Result<()> {
        if !self.descriptions.contains_key(&node_id) {
            return Err(NetError::UnknownNode(node_id));
        }
        self.node_states.insert(node_id, NodeState::Running);
        Ok(())
    }

    /// Mark a node running and register its established connection.
    ///
    /// The connection must be `Connected`; it is added to the shared
    /// connection set and associated with the node for later dispatch.
    pub fn set_started_with_connection(
        &self,
        node_id: NodeId,
        connection: ConnectionRef,
    ) -> Result<()> {
        if !self.descriptions.contains_key(&node_id) {
            return Err(NetError::UnknownNode(node_id));
        }
        let state = connection.state();
        if state != ConnectionState::Connected {
            return Err(NetError::InvalidState {
                expected: "connected",
                actual: state,
            });
        }
        self.connection_set.add_connection(connection.clone())?;
        self.node_connections.insert(node_id, connection);
        self.node_states.insert(node_id, NodeState::Running);
        Ok(())
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Dispatch an opaque packet to a running node.
    ///
    /// If no connection to the node exists yet, one is constructed for
    /// this network's protocol and connected using the stored description.
    /// A failed connection attempt is logged and the packet silently
    /// dropped (`Ok(())`) — the documented fire-and-forget policy for
    /// unreachable nodes.  Precondition violations and send-side I/O
    /// errors on an established link are returned.
    pub fn send(&self, node_id: NodeId, packet: &[u8]) -> Result<()> {
        match self.node_state(node_id) {
            None => return Err(NetError::UnknownNode(node_id)),
            Some(NodeState::Stopped) => return Err(NetError::NodeNotRunning(node_id)),
            Some(NodeState::Running) => {}
        }
        if packet.len() > self.config.max_packet_size {
            return Err(NetError::PacketTooLarge {
                size: packet.len(),
                max: self.config.max_packet_size,
            });
        }

        let connection = match self.connection(node_id) {
            Some(connection) => connection,
            None => {
                let Some(connection) = self.connect_node(node_id)? else {
                    // Unreachable node: packet dropped, already logged.
                    return Ok(());
                };
                connection
            }
        };
        connection.send(packet)
    }

    /// Lazily establish the link to `node_id`.
    ///
    /// Returns `Ok(None)` when the connection attempt fails — the
    /// silent-drop path of [`send`](Self::send).
    fn connect_node(&self, node_id: NodeId) -> Result<Option<ConnectionRef>> {
        // A running node always has a description (invariant of add_node).
        let description = self
            .descriptions
            .get(&node_id)
            .map(|desc| desc.clone())
            .ok_or(NetError::UnknownNode(node_id))?;

        let connection = new_connection(self.protocol, &self.config);
        if let Err(err) = connection.connect(&description) {
            warn!("cannot connect to node {node_id}: {err}; dropping packet");
            return Ok(None);
        }
        // Concurrent first sends race to establish the link; the entry's
        // shard lock makes registration atomic per node. The loser closes
        // its connection and dispatches over the winner's, so the set
        // never holds a connection with no owning node.
        match self.node_connections.entry(node_id) {
            Entry::Occupied(entry) => {
                debug!("node {node_id} already connected by another sender");
                connection.close();
                Ok(Some(entry.get().clone()))
            }
            Entry::Vacant(entry) => {
                info!("connected to node {node_id}");
                self.connection_set.add_connection(connection.clone())?;
                entry.insert(connection.clone());
                Ok(Some(connection))
            }
        }
    }

    // ── Launch commands ─────────────────────────────────────────────────

    /// Build the command that launches the worker process for `node_id`,
    /// passing `args` to the configured program.
    ///
    /// Returns `None` when the node is unknown or its description carries
    /// no launch-command template.
    pub fn launch_command(&self, node_id: NodeId, args: &str) -> Option<String> {
        let description = self.descriptions.get(&node_id)?;
        let template = description.launch_command.as_deref()?;
        Some(build_launch_command(
            template,
            &self.config.program_name,
            args,
        ))
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Tear the whole network down: close and unregister every
    /// established connection and stop every node.
    pub fn shutdown(&self) {
        info!("shutting down network ({})", self.protocol);
        for entry in self.node_connections.iter() {
            self.connection_set.remove_connection(entry.value());
            entry.value().close();
        }
        self.node_connections.clear();
        for mut state in self.node_states.iter_mut() {
            *state = NodeState::Stopped;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{connection_set::Event, pipe::PipeConnection},
        assert_matches::assert_matches,
        std::{
            io::Read,
            net::{SocketAddr, TcpListener},
            sync::Barrier,
            thread,
            time::Duration,
        },
    };

    fn socket_network() -> Network {
        Network::new(Protocol::Socket, NetConfig::dev_default()).unwrap()
    }

    fn loopback_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_add_node_duplicate_rejected() {
        let network = socket_network();
        let (_listener, addr) = loopback_listener();
        network
            .add_node(7, ConnectionDescription::socket(addr))
            .unwrap();
        assert_matches!(
            network.add_node(7, ConnectionDescription::socket(addr)),
            Err(NetError::DuplicateNode(7))
        );
        assert_eq!(network.node_state(7), Some(NodeState::Stopped));
    }

    #[test]
    fn test_send_requires_running_node() {
        let network = socket_network();
        let (_listener, addr) = loopback_listener();
        network
            .add_node(1, ConnectionDescription::socket(addr))
            .unwrap();
        assert_matches!(
            network.send(1, b"packet"),
            Err(NetError::NodeNotRunning(1))
        );
        assert_matches!(network.send(99, b"packet"), Err(NetError::UnknownNode(99)));
    }

    #[test]
    fn test_set_started_requires_description() {
        let network = socket_network();
        assert_matches!(network.set_started(5), Err(NetError::UnknownNode(5)));
    }

    #[test]
    fn test_set_started_with_unconnected_connection_rejected() {
        let network = socket_network();
        let (_listener, addr) = loopback_listener();
        network
            .add_node(1, ConnectionDescription::socket(addr))
            .unwrap();
        let unconnected: ConnectionRef = Arc::new(PipeConnection::new());
        assert_matches!(
            network.set_started_with_connection(1, unconnected),
            Err(NetError::InvalidState { .. })
        );
        assert_eq!(network.node_state(1), Some(NodeState::Stopped));
    }

    #[test]
    fn test_set_started_with_connection_registers_it() {
        let network = socket_network();
        let (_listener, addr) = loopback_listener();
        network
            .add_node(1, ConnectionDescription::socket(addr))
            .unwrap();

        let pipe = PipeConnection::new();
        pipe.connect(&ConnectionDescription::pipe()).unwrap();
        let connection: ConnectionRef = Arc::new(pipe);

        network
            .set_started_with_connection(1, connection.clone())
            .unwrap();
        assert_eq!(network.node_state(1), Some(NodeState::Running));
        assert_eq!(network.connection_set().len(), 1);
        assert!(Arc::ptr_eq(&network.connection(1).unwrap(), &connection));
    }

    #[test]
    fn test_send_lazily_connects_and_reuses_the_link() {
        let network = socket_network();
        let (listener, addr) = loopback_listener();
        network
            .add_node(1, ConnectionDescription::socket(addr))
            .unwrap();
        network.set_started(1).unwrap();
        assert!(network.connection(1).is_none());

        let server = thread::spawn(move || {
            let (mut stream, _peer) = listener.accept().unwrap();
            let mut buf = vec![0u8; 10];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        network.send(1, b"hello").unwrap();
        // The lazily created connection is registered for reuse.
        assert_eq!(network.connection_set().len(), 1);
        let first = network.connection(1).unwrap();

        network.send(1, b"world").unwrap();
        assert_eq!(network.connection_set().len(), 1);
        assert!(Arc::ptr_eq(&network.connection(1).unwrap(), &first));

        assert_eq!(server.join().unwrap(), b"helloworld");
    }

    #[test]
    fn test_concurrent_first_sends_share_one_link() {
        let network = Arc::new(socket_network());
        // Connections stay queued in the accept backlog; nothing reads the
        // one-byte packets, which is fine for this test.
        let mut listeners = Vec::new();

        for node_id in 0..20u64 {
            let (listener, addr) = loopback_listener();
            listeners.push(listener);
            network
                .add_node(node_id, ConnectionDescription::socket(addr))
                .unwrap();
            network.set_started(node_id).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let network = network.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        network.send(node_id, b"x").unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            // Exactly one connection per node ends up registered; a racing
            // loser must not leave an orphan in the set.
            let expected = usize::try_from(node_id).unwrap().saturating_add(1);
            assert_eq!(network.connection_set().len(), expected);
            assert_eq!(
                network.connection(node_id).unwrap().state(),
                ConnectionState::Connected
            );
        }
    }

    #[test]
    fn test_send_to_unreachable_node_drops_packet_silently() {
        let network = socket_network();
        // Bind then drop to get an address that refuses connections.
        let refused = {
            let (listener, addr) = loopback_listener();
            drop(listener);
            addr
        };
        network
            .add_node(1, ConnectionDescription::socket(refused))
            .unwrap();
        network.set_started(1).unwrap();

        assert_matches!(network.send(1, b"lost"), Ok(()));
        assert_eq!(network.node_state(1), Some(NodeState::Running));
        assert!(network.connection(1).is_none());
        assert_eq!(network.connection_set().len(), 0);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let network = socket_network();
        let (_listener, addr) = loopback_listener();
        network
            .add_node(1, ConnectionDescription::socket(addr))
            .unwrap();
        network.set_started(1).unwrap();
        let max = NetConfig::dev_default().max_packet_size;
        let packet = vec![0u8; max.saturating_add(1)];
        assert_matches!(
            network.send(1, &packet),
            Err(NetError::PacketTooLarge { .. })
        );
    }

    #[test]
    fn test_launch_command_uses_configured_program() {
        let network = socket_network();
        let (_listener, addr) = loopback_listener();
        network
            .add_node(
                1,
                ConnectionDescription::socket(addr).with_launch_command("ssh %c host"),
            )
            .unwrap();
        network
            .add_node(2, ConnectionDescription::socket(addr))
            .unwrap();

        assert_eq!(
            network.launch_command(1, "--id 3").as_deref(),
            Some("ssh worker --id 3 host")
        );
        // No template, no command.
        assert_eq!(network.launch_command(2, "--id 3"), None);
        assert_eq!(network.launch_command(42, ""), None);
    }

    #[test]
    fn test_shutdown_stops_nodes_and_clears_connections() {
        let network = socket_network();
        let (_listener, addr) = loopback_listener();
        network
            .add_node(1, ConnectionDescription::socket(addr))
            .unwrap();

        let pipe = PipeConnection::new();
        pipe.connect(&ConnectionDescription::pipe()).unwrap();
        let connection: ConnectionRef = Arc::new(pipe);
        network
            .set_started_with_connection(1, connection.clone())
            .unwrap();

        network.shutdown();
        assert_eq!(network.node_state(1), Some(NodeState::Stopped));
        assert!(network.connection(1).is_none());
        assert_eq!(network.connection_set().len(), 0);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_reactor_sees_inbound_data_after_lazy_connect() {
        let network = socket_network();
        let (listener, addr) = loopback_listener();
        network
            .add_node(1, ConnectionDescription::socket(addr))
            .unwrap();
        network.set_started(1).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _peer) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            // Echo back so the reactor has something to observe.
            use std::io::Write;
            stream.write_all(b"pong").unwrap();
        });

        network.send(1, b"ping").unwrap();

        let set = network.connection_set();
        // Drain the registration wake, then expect inbound data.
        let mut event = set.select(Some(Duration::from_secs(5)));
        while matches!(event, Event::Interrupt) {
            event = set.select(Some(Duration::from_secs(5)));
        }
        assert_matches!(&event, Event::Data(conn) => {
            let mut buf = [0u8; 4];
            let n = conn.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"pong");
        });
        server.join().unwrap();
    }
}
