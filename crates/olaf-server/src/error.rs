use thiserror::Error;

/// Failures that stop the server state from being built at startup.
///
/// Per-message failures are [`olaf_protocol::ProtocolError`] and never reach
/// this type.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid server key: {0}")]
    ServerKey(String),

    #[error("invalid key for neighbour {address}: {reason}")]
    NeighbourKey { address: String, reason: String },
}
