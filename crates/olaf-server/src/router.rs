//! Per-connection dispatch of inbound frames.
//!
//! Signed client traffic is checked in a fixed order: signature, then the
//! replay counter, then the payload type. Every refusal is a per-message
//! error status; the connection stays open.

use olaf_crypto::parse_public_key;
use olaf_protocol::messaging::{
    classify, encode_frame, parse_frame, verify_envelope, ChatMessage, Frame, Payload,
    PublicChatDelivery, ServerMessage, SignedEnvelope, StatusResponse,
};
use olaf_protocol::ProtocolError;

use crate::federation;
use crate::registry::{ConnectionHandle, Delivery};
use crate::server_state::ServerState;

/// What the remote end of a connection has proven itself to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Nothing accepted yet; only `hello`, `server_hello` and unsigned
    /// directory requests are allowed.
    Unidentified,
    /// A registered client. Its fingerprint lives in the registry.
    Client,
    /// A neighbour server.
    Peer { address: String },
}

/// Handle one inbound text frame and queue any reply on `handle`.
pub fn handle_text(state: &ServerState, handle: &ConnectionHandle, role: &mut Role, text: &str) {
    if let Role::Peer { address } = role {
        let address = address.clone();
        let reply = parse_frame(text)
            .and_then(|frame| federation::handle_peer_frame(state, &address, frame));
        match reply {
            Ok(Some(reply)) => queue(handle, &reply),
            Ok(None) => {}
            // Peers are never answered with an error status, so two servers
            // cannot bounce errors back and forth.
            Err(e) => tracing::warn!(
                server = %address,
                connection = handle.id(),
                error = %e,
                "peer frame refused"
            ),
        }
        return;
    }

    match dispatch(state, handle, role, text) {
        Ok(Some(reply)) => queue(handle, &reply),
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(connection = handle.id(), error = %e, "message refused");
            queue(handle, &ServerMessage::Status(StatusResponse::from(&e)));
        }
    }
}

fn queue<T: serde::Serialize>(handle: &ConnectionHandle, reply: &T) {
    match encode_frame(reply) {
        Ok(text) => {
            handle.send(text);
        }
        Err(e) => tracing::error!(connection = handle.id(), error = %e, "failed to encode reply"),
    }
}

fn dispatch(
    state: &ServerState,
    handle: &ConnectionHandle,
    role: &mut Role,
    text: &str,
) -> Result<Option<ServerMessage>, ProtocolError> {
    match parse_frame(text)? {
        Frame::ClientListRequest => Ok(Some(ServerMessage::Frame(Frame::ClientList {
            servers: state.directory.aggregate(),
        }))),
        Frame::ClientUpdateRequest => Ok(Some(ServerMessage::Frame(Frame::ClientUpdate {
            clients: state.registry.local_keys(),
        }))),
        Frame::SignedData(envelope) => match role {
            Role::Unidentified => on_first_envelope(state, handle, role, &envelope),
            Role::Client => on_client_envelope(state, handle, &envelope),
            Role::Peer { .. } => Err(ProtocolError::ProtocolViolation(
                "peer traffic on a client path".into(),
            )),
        },
        Frame::ClientList { .. } | Frame::ClientUpdate { .. } | Frame::PublicChat { .. } => Err(
            ProtocolError::ProtocolViolation("frame type is server-to-client only".into()),
        ),
    }
}

/// The first signed message on a connection must be `hello` or, from a
/// neighbour, `server_hello`.
fn on_first_envelope(
    state: &ServerState,
    handle: &ConnectionHandle,
    role: &mut Role,
    envelope: &SignedEnvelope,
) -> Result<Option<ServerMessage>, ProtocolError> {
    let kind = envelope
        .data
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedEnvelope("missing 'type' field".into()))?;

    match kind {
        "hello" => {
            let public_key = envelope
                .data
                .get("public_key")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| {
                    ProtocolError::MalformedEnvelope("hello without public_key".into())
                })?;
            let verifying_key = parse_public_key(public_key)
                .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
            verify_envelope(envelope, &verifying_key)?;

            let Payload::Hello(hello) = classify(&envelope.data)? else {
                return Err(ProtocolError::ProtocolViolation("expected hello".into()));
            };
            let fingerprint = state.registry.register(
                &hello.public_key,
                verifying_key,
                handle,
                envelope.counter,
            )?;
            *role = Role::Client;
            Ok(Some(ServerMessage::Status(
                StatusResponse::success("hello received").with_client_id(fingerprint),
            )))
        }
        "server_hello" => {
            let address = federation::accept_server_hello(state, handle, envelope)?;
            *role = Role::Peer { address };
            Ok(Some(ServerMessage::Frame(Frame::ClientUpdateRequest)))
        }
        other => Err(ProtocolError::ProtocolViolation(format!(
            "'{other}' before hello"
        ))),
    }
}

fn on_client_envelope(
    state: &ServerState,
    handle: &ConnectionHandle,
    envelope: &SignedEnvelope,
) -> Result<Option<ServerMessage>, ProtocolError> {
    let client = state.registry.client_on(handle.id()).ok_or_else(|| {
        ProtocolError::ProtocolViolation("connection has not sent hello".into())
    })?;

    verify_envelope(envelope, &client.verifying_key)?;
    state.registry.accept_counter(handle.id(), envelope.counter)?;

    match classify(&envelope.data)? {
        Payload::PublicChat(chat) => {
            check_sender(&chat.sender, &client.fingerprint)?;
            let delivery = Frame::PublicChat {
                data: PublicChatDelivery {
                    sender: client.fingerprint.clone(),
                    message: chat.message,
                },
            };
            let delivered = state
                .registry
                .broadcast_except(&client.fingerprint, &encode_frame(&delivery)?);
            tracing::debug!(sender = %client.fingerprint, delivered, "public chat broadcast");
            Ok(None)
        }
        Payload::Chat(chat) => {
            check_sender(&chat.sender, &client.fingerprint)?;
            route_chat(state, &chat, envelope)?;
            Ok(None)
        }
        Payload::Hello(_) => Err(ProtocolError::ProtocolViolation(
            "hello already received on this connection".into(),
        )),
        Payload::ServerHello(_) => Err(ProtocolError::ProtocolViolation(
            "server_hello from a client".into(),
        )),
    }
}

fn check_sender(claimed: &str, authenticated: &str) -> Result<(), ProtocolError> {
    if claimed == authenticated {
        Ok(())
    } else {
        Err(ProtocolError::ProtocolViolation(
            "sender does not match the signing identity".into(),
        ))
    }
}

/// Forward the original signed envelope to a local recipient, or one hop to
/// the server whose directory entry lists the recipient.
fn route_chat(
    state: &ServerState,
    chat: &ChatMessage,
    envelope: &SignedEnvelope,
) -> Result<(), ProtocolError> {
    let text = encode_frame(&Frame::SignedData(envelope.clone()))?;

    match state.registry.send_to(&chat.recipient, &text) {
        Delivery::Queued => {
            tracing::debug!(
                sender = %chat.sender,
                recipient = %chat.recipient,
                "chat delivered locally"
            );
            return Ok(());
        }
        // The recipient is connected but cannot take the frame; the sender
        // must not treat the chat as delivered.
        Delivery::Dropped => {
            return Err(ProtocolError::RecipientNotFound(chat.recipient.clone()));
        }
        Delivery::Absent => {}
    }

    let remote = state
        .directory
        .resolve(&chat.recipient)
        .filter(|address| *address != state.address);
    match remote {
        Some(address) if state.peers.send(&address, &text) => {
            tracing::debug!(
                recipient = %chat.recipient,
                server = %address,
                "chat relayed to peer"
            );
            Ok(())
        }
        Some(address) => {
            tracing::warn!(
                recipient = %chat.recipient,
                server = %address,
                "no live link to recipient's server"
            );
            Err(ProtocolError::RecipientNotFound(chat.recipient.clone()))
        }
        None => Err(ProtocolError::RecipientNotFound(chat.recipient.clone())),
    }
}
