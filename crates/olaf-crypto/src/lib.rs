pub mod error;
pub mod hybrid;
pub mod identity;

pub use error::CryptoError;
pub use hybrid::{open, seal, SealedMessage};
pub use identity::{fingerprint, parse_public_key, Identity};
