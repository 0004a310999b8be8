use base64::Engine as _;
use olaf_crypto::SealedMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Every JSON document that crosses a client or peer connection and carries a
/// `type` discriminator.
///
/// Status responses are the one untyped document; see [`StatusResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// The authenticated path: a signed inner payload.
    SignedData(SignedEnvelope),
    /// Unsigned request for the neighbourhood directory.
    ClientListRequest,
    /// Neighbourhood directory, local server first.
    ClientList { servers: Vec<DirectoryEntry> },
    /// Peer link: ask the other server for its local client keys.
    ClientUpdateRequest,
    /// Peer link: one server's complete local client key list.
    ClientUpdate { clients: Vec<String> },
    /// Server to client: a public broadcast re-wrapped with the sender's fingerprint.
    PublicChat { data: PublicChatDelivery },
}

/// Outer discriminators accepted by [`crate::messaging::receiver::parse_frame`].
pub const FRAME_TYPES: &[&str] = &[
    "signed_data",
    "client_list_request",
    "client_list",
    "client_update_request",
    "client_update",
    "public_chat",
];

/// The signed wrapper around one protocol message.
///
/// `data` stays an untyped JSON value until the signature and counter have
/// been checked: the signature covers the canonical form of exactly what was
/// received, including any fields this implementation does not know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: Value,
    pub counter: u64,
    /// Standard base64 Ed25519 signature over `canonical(data) || counter`.
    pub signature: String,
}

/// Inner payload of a [`SignedEnvelope`], interpreted after verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Hello(Hello),
    PublicChat(PublicChat),
    Chat(ChatMessage),
    /// Peer link handshake; `sender` is the dialing server's address.
    ServerHello(ServerHello),
}

/// Inner discriminators accepted by [`crate::messaging::receiver::classify`].
pub const PAYLOAD_TYPES: &[&str] = &["hello", "public_chat", "chat", "server_hello"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicChat {
    pub sender: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub sender: String,
}

/// A private message. The body is hybrid-encrypted for the recipient; servers
/// route on `recipient` and never touch the other fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub recipient: String,
    pub nonce: String,
    pub ciphertext: String,
    pub tag: String,
    pub wrapped_key: String,
}

impl ChatMessage {
    pub fn from_sealed(sender: String, recipient: String, sealed: &SealedMessage) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Self {
            sender,
            recipient,
            nonce: b64.encode(sealed.nonce),
            ciphertext: b64.encode(&sealed.ciphertext),
            tag: b64.encode(sealed.tag),
            wrapped_key: b64.encode(&sealed.wrapped_key),
        }
    }

    /// Decode the base64 body fields back into a [`SealedMessage`].
    pub fn to_sealed(&self) -> Result<SealedMessage, ProtocolError> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let decode = |field: &str, value: &str| {
            b64.decode(value)
                .map_err(|e| ProtocolError::MalformedEnvelope(format!("{field}: {e}")))
        };

        let nonce = decode("nonce", &self.nonce)?
            .try_into()
            .map_err(|_| ProtocolError::MalformedEnvelope("nonce has wrong length".into()))?;
        let tag = decode("tag", &self.tag)?
            .try_into()
            .map_err(|_| ProtocolError::MalformedEnvelope("tag has wrong length".into()))?;

        Ok(SealedMessage {
            nonce,
            ciphertext: decode("ciphertext", &self.ciphertext)?,
            tag,
            wrapped_key: decode("wrapped_key", &self.wrapped_key)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicChatDelivery {
    pub sender: String,
    pub message: String,
}

/// One server's published client list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub address: String,
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Unsigned server→client acknowledgement or rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl StatusResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            client_id: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

impl From<&ProtocolError> for StatusResponse {
    fn from(e: &ProtocolError) -> Self {
        Self::error(e.to_string())
    }
}

/// Anything a client can receive from its server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Frame(Frame),
    Status(StatusResponse),
}
