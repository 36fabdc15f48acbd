//! Gridway node communication layer
//!
//! This crate is the connection-multiplexing and node-coordination core of
//! the Gridway cluster-computing framework: a control process coordinates a
//! set of remote worker nodes, each reachable over a pluggable transport,
//! and must wait for activity across all of them while other threads add,
//! remove, or reconfigure connections concurrently.  It provides:
//!
//! - **Readiness multiplexing** — [`ConnectionSet`] blocks one reactor
//!   thread until any registered connection becomes ready, and can be
//!   safely mutated and woken from other threads while blocked (self-pipe
//!   wake, dirty-flag rebuild).
//! - **Node coordination** — [`Network`] tracks node reachability state,
//!   lazily establishes outbound links, and dispatches opaque packets,
//!   selecting the concrete transport by protocol.
//! - **Transports** — a TCP stream connection and a process-local pipe
//!   connection behind the [`Connection`] trait.
//!
//! Packet framing, authentication, and session/RPC semantics live above
//! this layer; packets are opaque byte buffers.
//!
//! ## Architecture
//!
//! ```text
//!  control threads                     reactor thread
//!  ───────────────                     ──────────────
//!  Network::add_node                   loop {
//!  Network::set_started                    match set.select(timeout) {
//!  Network::send ──┐                           Data | Connect |
//!                  │ register / wake           Disconnect | ... => …
//!                  ▼                       }
//!  ┌─────────────────────────────┐     }
//!  │ ConnectionSet               │◄────────┘
//!  │ • connection list + dirty   │
//!  │ • self-signal pipe          │
//!  │ • poll(2) wait              │
//!  └─────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]         | `NetConfig` defaults and dev overrides |
//! | [`connection`]     | `Connection` trait, states, descriptions, protocol factory |
//! | [`connection_set`] | Blocking readiness multiplexer and `Event` |
//! | [`launch`]         | Launch-command template expansion |
//! | [`network`]        | Node lifecycle and packet dispatch |
//! | [`pipe`]           | Process-local pipe transport |
//! | [`socket`]         | TCP stream transport |
//! | [`error`]          | Crate-wide error enum |

pub mod config;
pub mod connection;
pub mod connection_set;
pub mod error;
pub mod launch;
pub mod network;
pub mod pipe;
pub mod socket;

pub use {
    config::NetConfig,
    connection::{Connection, ConnectionDescription, ConnectionRef, ConnectionState, Protocol},
    connection_set::{ConnectionSet, Event},
    error::{NetError, Result},
    network::{Network, NodeId, NodeState},
};
