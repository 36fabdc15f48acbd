//! Configuration for the node communication layer.

/// Configuration shared by a [`Network`](crate::network::Network) and the
/// connections it creates.
///
/// The program name is carried here rather than in process-global state so
/// that launch-command construction is a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Name of the worker executable substituted into launch-command
    /// templates.
    pub program_name: String,

    /// How long an outbound connection attempt may take before it is
    /// considered failed (ms).
    pub connect_timeout_ms: u64,

    /// Maximum size of a single outbound packet in bytes.
    ///
    /// Packets are opaque to this layer; the cap only guards against a
    /// runaway caller, it is not a framing limit.
    pub max_packet_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            program_name: "gridway-worker".to_string(),
            connect_timeout_ms: 5_000,
            max_packet_size: 16 * 1024 * 1024,
        }
    }
}

impl NetConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            program_name: "worker".to_string(),
            connect_timeout_ms: 1_000,
            max_packet_size: 1_048_576,
        }
    }
}
