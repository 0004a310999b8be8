//! Client side of the protocol.
//!
//! A [`ClientSession`] owns the client's identity and outbound counter, signs
//! every outbound envelope through the same codec the server verifies with,
//! and opens private chats addressed to it.

use std::collections::HashMap;

use olaf_crypto::{fingerprint, parse_public_key, Identity};

use crate::error::ProtocolError;
use crate::messaging::envelope::{
    ChatMessage, DirectoryEntry, Frame, Hello, Payload, PublicChat, SignedEnvelope,
};
use crate::messaging::receiver::{classify, verify_envelope};
use crate::messaging::sender::signed_frame;
use crate::replay::ReplayGuard;

/// A decrypted private message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedChat {
    pub sender: String,
    pub plaintext: Vec<u8>,
}

pub struct ClientSession {
    identity: Identity,
    counter: u64,
    /// Fingerprint → exported public key, learned from `client_list` responses.
    known_keys: HashMap<String, String>,
    /// Per-sender replay state for inbound private chats.
    inbound: HashMap<String, ReplayGuard>,
}

impl ClientSession {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            counter: 0,
            known_keys: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    /// The counter the next outbound envelope will carry.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn sign_next(&mut self, payload: &Payload) -> Result<Frame, ProtocolError> {
        let frame = signed_frame(&self.identity, payload, self.counter)?;
        self.counter += 1;
        Ok(frame)
    }

    pub fn hello(&mut self) -> Result<Frame, ProtocolError> {
        let payload = Payload::Hello(Hello {
            public_key: self.identity.public_key_hex(),
        });
        self.sign_next(&payload)
    }

    pub fn public_chat(&mut self, message: impl Into<String>) -> Result<Frame, ProtocolError> {
        let payload = Payload::PublicChat(PublicChat {
            sender: self.fingerprint(),
            message: message.into(),
        });
        self.sign_next(&payload)
    }

    /// Encrypt `plaintext` for the client that owns `recipient_public_key`.
    pub fn chat(
        &mut self,
        recipient_public_key: &str,
        plaintext: &[u8],
    ) -> Result<Frame, ProtocolError> {
        let recipient_key = parse_public_key(recipient_public_key)?;
        let sealed = olaf_crypto::seal(&recipient_key, plaintext)?;
        let payload = Payload::Chat(ChatMessage::from_sealed(
            self.fingerprint(),
            fingerprint(recipient_public_key),
            &sealed,
        ));
        self.sign_next(&payload)
    }

    pub fn client_list_request() -> Frame {
        Frame::ClientListRequest
    }

    /// Remember every key in a `client_list` so later chats can be verified.
    pub fn learn_directory(&mut self, servers: &[DirectoryEntry]) {
        for entry in servers {
            for key in &entry.clients {
                self.known_keys.insert(fingerprint(key), key.clone());
            }
        }
    }

    /// Public key for a fingerprint learned from the directory.
    pub fn public_key_of(&self, fingerprint: &str) -> Option<&str> {
        self.known_keys.get(fingerprint).map(String::as_str)
    }

    /// Verify, replay-check and decrypt a relayed private chat.
    ///
    /// The sender's key must already be known from a directory listing.
    pub fn open_chat(&mut self, envelope: &SignedEnvelope) -> Result<ReceivedChat, ProtocolError> {
        let sender = envelope
            .data
            .get("sender")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedEnvelope("chat without sender".into()))?;
        let sender_key = self.known_keys.get(sender).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!("unknown sender {sender}"))
        })?;
        let sender_key = parse_public_key(sender_key)?;

        verify_envelope(envelope, &sender_key)?;
        if let Some(guard) = self.inbound.get(sender) {
            guard.check(envelope.counter)?;
        }

        let Payload::Chat(chat) = classify(&envelope.data)? else {
            return Err(ProtocolError::ProtocolViolation(
                "expected a private chat".into(),
            ));
        };
        if chat.recipient != self.fingerprint() {
            return Err(ProtocolError::ProtocolViolation(
                "chat is addressed to another client".into(),
            ));
        }

        let plaintext = olaf_crypto::open(&self.identity, &chat.to_sealed()?)?;
        self.inbound
            .entry(chat.sender.clone())
            .or_default()
            .accept(envelope.counter)?;

        Ok(ReceivedChat {
            sender: chat.sender,
            plaintext,
        })
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("fingerprint", &self.fingerprint())
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_of(sessions: &[&ClientSession]) -> Vec<DirectoryEntry> {
        vec![DirectoryEntry {
            address: "ws://localhost:8001".into(),
            clients: sessions
                .iter()
                .map(|s| s.identity().public_key_hex())
                .collect(),
        }]
    }

    fn envelope(frame: Frame) -> SignedEnvelope {
        match frame {
            Frame::SignedData(envelope) => envelope,
            other => panic!("expected signed_data, got {other:?}"),
        }
    }

    #[test]
    fn counters_increase_per_envelope() {
        let mut session = ClientSession::new(Identity::generate());
        assert_eq!(envelope(session.hello().unwrap()).counter, 0);
        assert_eq!(envelope(session.public_chat("hi").unwrap()).counter, 1);
        assert_eq!(session.counter(), 2);
    }

    #[test]
    fn chat_round_trip_between_sessions() {
        let mut alice = ClientSession::new(Identity::generate());
        let mut bob = ClientSession::new(Identity::generate());
        bob.learn_directory(&directory_of(&[&alice, &bob]));

        let bob_key = bob.identity().public_key_hex();
        let frame = alice.chat(&bob_key, b"hello bob").unwrap();
        let received = bob.open_chat(&envelope(frame)).unwrap();

        assert_eq!(received.sender, alice.fingerprint());
        assert_eq!(received.plaintext, b"hello bob");
    }

    #[test]
    fn replayed_chat_is_stale() {
        let mut alice = ClientSession::new(Identity::generate());
        let mut bob = ClientSession::new(Identity::generate());
        bob.learn_directory(&directory_of(&[&alice, &bob]));

        let bob_key = bob.identity().public_key_hex();
        let env = envelope(alice.chat(&bob_key, b"once").unwrap());
        bob.open_chat(&env).unwrap();

        assert!(matches!(
            bob.open_chat(&env),
            Err(ProtocolError::StaleCounter { .. })
        ));
    }

    #[test]
    fn chat_from_unknown_sender_refused() {
        let mut alice = ClientSession::new(Identity::generate());
        let mut bob = ClientSession::new(Identity::generate());

        let bob_key = bob.identity().public_key_hex();
        let env = envelope(alice.chat(&bob_key, b"who am i").unwrap());
        assert!(matches!(
            bob.open_chat(&env),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn chat_for_someone_else_refused() {
        let mut alice = ClientSession::new(Identity::generate());
        let carol = ClientSession::new(Identity::generate());
        let mut bob = ClientSession::new(Identity::generate());
        bob.learn_directory(&directory_of(&[&alice, &bob, &carol]));

        let carol_key = carol.identity().public_key_hex();
        let env = envelope(alice.chat(&carol_key, b"for carol").unwrap());
        assert!(bob.open_chat(&env).is_err());
    }
}
