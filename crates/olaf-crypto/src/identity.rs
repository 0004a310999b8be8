use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// A client's (or server's) cryptographic identity.
///
/// The Ed25519 keypair is the whole identity. The exported public key is the
/// lowercase hex of the 32-byte verifying key, and the routable client id is
/// the [`fingerprint`] of that string.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Restore an identity from a hex-encoded 32-byte secret key.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("secret key hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("secret key must be 32 bytes".into()))?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The exported public key string carried in `hello` and directory lists.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// This identity's routable client id.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_hex())
    }

    /// Sign a message with this identity's private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature against a public key.
    pub fn verify(
        public_key: &VerifyingKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        public_key
            .verify(message, signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }

    /// Derive an X25519 static secret from this Ed25519 key.
    ///
    /// Uses the SHA-512-expanded scalar so that the result pairs with
    /// [`Identity::peer_ed25519_to_x25519`] applied to our public key.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        let scalar_bytes = self.signing_key.to_scalar_bytes();
        x25519_dalek::StaticSecret::from(scalar_bytes)
    }

    pub fn to_x25519_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.to_x25519_secret())
    }

    /// Convert a peer's Ed25519 public key to X25519 (Edwards→Montgomery, RFC 7748).
    pub fn peer_ed25519_to_x25519(public_key: &VerifyingKey) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(public_key.to_montgomery().to_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Derive the client id for an exported public key string.
///
/// SHA-256 over the standard base64 encoding of the key string, rendered as
/// lowercase hex. Pure: the same key always yields the same id.
pub fn fingerprint(public_key: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(public_key.as_bytes());
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

/// Parse an exported public key string into an Ed25519 verifying key.
pub fn parse_public_key(public_key: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(public_key)
        .map_err(|e| CryptoError::InvalidKey(format!("public key hex: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))
}
