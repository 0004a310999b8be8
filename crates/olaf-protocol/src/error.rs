use thiserror::Error;

/// Every way a single inbound message can be refused.
///
/// All variants are per-message: the connection that sent the message gets an
/// error status and stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("stale counter: got {received}, last accepted {last}")]
    StaleCounter { received: u64, last: u64 },

    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),

    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    CryptoError(String),
}

impl From<olaf_crypto::CryptoError> for ProtocolError {
    fn from(e: olaf_crypto::CryptoError) -> Self {
        match e {
            olaf_crypto::CryptoError::VerificationError(msg) => Self::InvalidSignature(msg),
            other => Self::CryptoError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedEnvelope(e.to_string())
    }
}
