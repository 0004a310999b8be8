//! Hybrid encryption for private chat bodies.
//!
//! Every message gets a fresh random AES-256-GCM session key and nonce. The
//! session key is wrapped for the recipient with an ephemeral X25519 exchange
//! against the recipient's Ed25519 key (mapped to Montgomery form), HKDF-SHA256,
//! and XChaCha20-Poly1305:
//!
//! ```text
//! wrapped_key = ephemeral_pub (32) || wrap_nonce (24) || sealed session key (32 + 16)
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::Identity;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const SESSION_KEY_LEN: usize = 32;
const WRAP_NONCE_LEN: usize = 24;
const WRAPPED_KEY_LEN: usize = 32 + WRAP_NONCE_LEN + SESSION_KEY_LEN + TAG_LEN;
const WRAP_INFO: &[u8] = b"olaf-neighbourhood-wrap-v1";

/// A private chat body after [`seal`]: exactly the four fields that travel
/// inside a `chat` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
    pub wrapped_key: Vec<u8>,
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret key can read it.
pub fn seal(recipient: &VerifyingKey, plaintext: &[u8]) -> Result<SealedMessage, CryptoError> {
    let mut session_key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    OsRng.fill_bytes(&mut session_key[..]);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&session_key[..])
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    // aes-gcm appends the tag; the wire format carries it separately.
    let tag_bytes = sealed.split_off(sealed.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    let wrapped_key = wrap_session_key(recipient, &session_key)?;

    Ok(SealedMessage {
        nonce,
        ciphertext: sealed,
        tag,
        wrapped_key,
    })
}

/// Decrypt a [`SealedMessage`] addressed to `identity`.
pub fn open(identity: &Identity, message: &SealedMessage) -> Result<Vec<u8>, CryptoError> {
    let session_key = unwrap_session_key(identity, &message.wrapped_key)?;

    let cipher = Aes256Gcm::new_from_slice(&session_key[..])
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

    let mut combined = Vec::with_capacity(message.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&message.ciphertext);
    combined.extend_from_slice(&message.tag);

    cipher
        .decrypt(Nonce::from_slice(&message.nonce), combined.as_slice())
        .map_err(|e| {
            tracing::debug!(len = message.ciphertext.len(), "chat body failed authentication");
            CryptoError::DecryptionError(e.to_string())
        })
}

fn wrap_session_key(
    recipient: &VerifyingKey,
    session_key: &[u8; SESSION_KEY_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let recipient_x25519 = Identity::peer_ed25519_to_x25519(recipient);
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient_x25519);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "recipient key yields a non-contributory exchange".into(),
        ));
    }
    let kek = derive_wrap_key(shared.as_bytes(), &ephemeral_public, &recipient_x25519);

    let cipher = XChaCha20Poly1305::new_from_slice(&kek[..])
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let mut wrap_nonce = [0u8; WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut wrap_nonce);
    let sealed_key = cipher
        .encrypt(XNonce::from_slice(&wrap_nonce), session_key.as_slice())
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&wrap_nonce);
    out.extend_from_slice(&sealed_key);
    Ok(out)
}

fn unwrap_session_key(
    identity: &Identity,
    wrapped: &[u8],
) -> Result<Zeroizing<[u8; SESSION_KEY_LEN]>, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::DecryptionError(format!(
            "wrapped key must be {WRAPPED_KEY_LEN} bytes, got {}",
            wrapped.len()
        )));
    }
    let (ephemeral_bytes, rest) = wrapped.split_at(32);
    let (wrap_nonce, sealed_key) = rest.split_at(WRAP_NONCE_LEN);

    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(ephemeral);

    let secret = identity.to_x25519_secret();
    let own_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    let kek = derive_wrap_key(shared.as_bytes(), &ephemeral_public, &own_public);

    let cipher = XChaCha20Poly1305::new_from_slice(&kek[..])
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
    let plain = Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(wrap_nonce), sealed_key)
            .map_err(|e| CryptoError::DecryptionError(format!("unwrap session key: {e}")))?,
    );

    let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    key.copy_from_slice(&plain);
    Ok(key)
}

/// HKDF-SHA256 over the shared secret, bound to both exchange public keys.
fn derive_wrap_key(
    shared: &[u8; 32],
    ephemeral_public: &PublicKey,
    recipient_public: &PublicKey,
) -> Zeroizing<[u8; 32]> {
    let mut info = Vec::with_capacity(WRAP_INFO.len() + 64);
    info.extend_from_slice(WRAP_INFO);
    info.extend_from_slice(ephemeral_public.as_bytes());
    info.extend_from_slice(recipient_public.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut key[..])
        .expect("32-byte output is valid for HKDF-SHA256");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let bob = Identity::generate();
        let sealed = seal(&bob.public_key(), b"meet at the usual place").unwrap();

        assert_eq!(sealed.wrapped_key.len(), WRAPPED_KEY_LEN);
        assert_eq!(sealed.ciphertext.len(), b"meet at the usual place".len());

        let opened = open(&bob, &sealed).unwrap();
        assert_eq!(opened, b"meet at the usual place");
    }

    #[test]
    fn fresh_key_and_nonce_per_message() {
        let bob = Identity::generate();
        let a = seal(&bob.public_key(), b"same text").unwrap();
        let b = seal(&bob.public_key(), b"same text").unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.wrapped_key, b.wrapped_key);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let bob = Identity::generate();
        let eve = Identity::generate();
        let sealed = seal(&bob.public_key(), b"for bob only").unwrap();

        assert!(open(&eve, &sealed).is_err());
    }

    #[test]
    fn tampered_tag_rejected() {
        let bob = Identity::generate();
        let mut sealed = seal(&bob.public_key(), b"integrity").unwrap();
        sealed.tag[0] ^= 0x01;

        assert!(open(&bob, &sealed).is_err());
    }

    #[test]
    fn tampered_wrapped_key_rejected() {
        let bob = Identity::generate();
        let mut sealed = seal(&bob.public_key(), b"integrity").unwrap();
        let last = sealed.wrapped_key.len() - 1;
        sealed.wrapped_key[last] ^= 0x01;

        assert!(open(&bob, &sealed).is_err());
    }

    #[test]
    fn short_wrapped_key_rejected() {
        let bob = Identity::generate();
        let mut sealed = seal(&bob.public_key(), b"x").unwrap();
        sealed.wrapped_key.truncate(10);

        assert!(open(&bob, &sealed).is_err());
    }

    #[test]
    fn empty_plaintext_round_trip() {
        let bob = Identity::generate();
        let sealed = seal(&bob.public_key(), b"").unwrap();
        assert!(sealed.ciphertext.is_empty());
        assert!(open(&bob, &sealed).unwrap().is_empty());
    }
}
