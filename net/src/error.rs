//! Error types for the node communication layer.

use {crate::connection::ConnectionState, thiserror::Error};

/// Errors that can occur in the node communication layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A node with this ID is already registered.
    #[error("node {0} is already registered")]
    DuplicateNode(u64),

    /// The node ID has no registered description.
    #[error("unknown node: {0}")]
    UnknownNode(u64),

    /// The operation requires the node to be in the running state.
    #[error("node {0} is not running")]
    NodeNotRunning(u64),

    /// A connection was in the wrong state for the requested operation.
    #[error("connection is {actual}, expected {expected}")]
    InvalidState {
        /// State the operation requires.
        expected: &'static str,
        /// State the connection was actually in.
        actual: ConnectionState,
    },

    /// The connection description is missing a required field.
    #[error("invalid connection description: {0}")]
    InvalidDescription(&'static str),

    /// Packet exceeds the maximum allowed size.
    #[error("packet too large: {size} bytes (max {max} bytes)")]
    PacketTooLarge {
        /// Actual packet size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The transport does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Convenience result type for node communication operations.
pub type Result<T> = std::result::Result<T, NetError>;
