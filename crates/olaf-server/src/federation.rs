//! Server-to-server links.
//!
//! Each server dials its configured neighbours, proves its identity with a
//! signed `server_hello`, and from then on pulls the neighbour's client list
//! every refresh interval. Private chats for clients hosted elsewhere are
//! forwarded one hop over the owning server's link; public chat is never
//! relayed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use olaf_crypto::parse_public_key;
use olaf_protocol::messaging::{
    decode_and_verify, encode_frame, signed_frame, Frame, Payload, ServerHello, SignedEnvelope,
};
use olaf_protocol::{ProtocolError, ReplayGuard};
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::connection::run_connection;
use crate::directory::Directory;
use crate::registry::{ConnectionHandle, ConnectionId, Delivery};
use crate::router::Role;
use crate::server_state::ServerState;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A server this one is configured to federate with.
#[derive(Debug, Clone)]
pub struct Neighbour {
    pub address: String,
    pub url: String,
    pub public_key: VerifyingKey,
}

#[derive(Default)]
struct LinksInner {
    /// Live links per neighbour, newest last. Mutual dialing leaves two.
    links: HashMap<String, Vec<ConnectionHandle>>,
    /// `server_hello` counters per neighbour, kept across reconnects.
    hello_guards: HashMap<String, ReplayGuard>,
}

/// Live peer links keyed by neighbour address. Traffic goes over the newest
/// link; a neighbour counts as gone only once its last link closes.
pub struct PeerLinks {
    directory: Arc<Directory>,
    inner: RwLock<LinksInner>,
}

impl PeerLinks {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self {
            directory,
            inner: RwLock::new(LinksInner::default()),
        }
    }

    pub fn insert(&self, address: &str, handle: ConnectionHandle) {
        let connection = handle.id();
        let mut inner = self.inner.write();
        let links = inner.links.entry(address.to_string()).or_default();
        if links.iter().any(|h| h.id() == connection) {
            return;
        }
        links.push(handle);
        tracing::info!(server = %address, connection, links = links.len(), "peer link up");
    }

    /// Queue `text` on the newest link to `address` that accepts it.
    pub fn send(&self, address: &str, text: &str) -> bool {
        self.inner
            .read()
            .links
            .get(address)
            .is_some_and(|links| links.iter().rev().any(|h| h.send(text.to_string())))
    }

    pub fn is_linked(&self, address: &str) -> bool {
        self.inner.read().links.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.inner.read().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the link carried by `connection`. A neighbour's directory entry
    /// is forgotten once it has no link left.
    pub fn remove_connection(&self, connection: ConnectionId) {
        let mut inner = self.inner.write();
        let mut gone = Vec::new();
        inner.links.retain(|address, links| {
            let before = links.len();
            links.retain(|h| h.id() != connection);
            if links.len() < before {
                tracing::info!(
                    server = %address,
                    connection,
                    remaining = links.len(),
                    "peer link closed"
                );
                if links.is_empty() {
                    gone.push(address.clone());
                }
            }
            !links.is_empty()
        });
        // Peer-links lock before directory lock.
        for address in gone {
            self.directory.forget(&address);
            tracing::info!(server = %address, "peer link down");
        }
    }

    fn accept_hello_counter(&self, address: &str, counter: u64) -> Result<(), ProtocolError> {
        self.inner
            .write()
            .hello_guards
            .entry(address.to_string())
            .or_default()
            .accept(counter)
    }
}

impl std::fmt::Debug for PeerLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLinks")
            .field("links", &self.len())
            .finish_non_exhaustive()
    }
}

/// Removes a connection's peer link when dropped.
pub struct LinkGuard {
    peers: Arc<PeerLinks>,
    connection: ConnectionId,
}

impl LinkGuard {
    pub fn new(peers: Arc<PeerLinks>, connection: ConnectionId) -> Self {
        Self { peers, connection }
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.peers.remove_connection(self.connection);
    }
}

/// Authenticate an inbound `server_hello` and register the connection as the
/// link to that neighbour. Returns the neighbour's address.
pub fn accept_server_hello(
    state: &ServerState,
    handle: &ConnectionHandle,
    envelope: &SignedEnvelope,
) -> Result<String, ProtocolError> {
    let claimed = envelope
        .data
        .get("sender")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedEnvelope("server_hello without sender".into()))?;
    let neighbour = state.neighbours.get(claimed).ok_or_else(|| {
        tracing::warn!(server = %claimed, "server_hello from unconfigured server");
        ProtocolError::ProtocolViolation(format!("{claimed} is not a configured neighbour"))
    })?;

    let Payload::ServerHello(hello) = decode_and_verify(envelope, &neighbour.public_key)? else {
        return Err(ProtocolError::ProtocolViolation(
            "expected server_hello".into(),
        ));
    };
    state
        .peers
        .accept_hello_counter(&hello.sender, envelope.counter)?;
    state.peers.insert(&hello.sender, handle.clone());
    Ok(hello.sender)
}

/// Handle one frame arriving on an established peer link.
pub fn handle_peer_frame(
    state: &ServerState,
    address: &str,
    frame: Frame,
) -> Result<Option<Frame>, ProtocolError> {
    match frame {
        Frame::ClientUpdate { clients } => {
            let (valid, invalid): (Vec<String>, Vec<String>) = clients
                .into_iter()
                .partition(|key| parse_public_key(key).is_ok());
            if !invalid.is_empty() {
                tracing::warn!(
                    server = %address,
                    skipped = invalid.len(),
                    "ignoring malformed keys in client_update"
                );
            }
            tracing::debug!(server = %address, clients = valid.len(), "client_update received");
            state.directory.publish(address, valid);
            Ok(None)
        }
        Frame::ClientUpdateRequest => Ok(Some(Frame::ClientUpdate {
            clients: state.registry.local_keys(),
        })),
        Frame::ClientListRequest => Ok(Some(Frame::ClientList {
            servers: state.directory.aggregate(),
        })),
        Frame::SignedData(envelope) => {
            deliver_relayed(state, address, &envelope)?;
            Ok(None)
        }
        Frame::ClientList { .. } | Frame::PublicChat { .. } => Err(
            ProtocolError::ProtocolViolation("unexpected frame on a peer link".into()),
        ),
    }
}

/// Deliver a chat forwarded by a neighbour to the local recipient. Chats for
/// clients that are not here are dropped; relays are never chained.
fn deliver_relayed(
    state: &ServerState,
    address: &str,
    envelope: &SignedEnvelope,
) -> Result<(), ProtocolError> {
    let Payload::Chat(chat) = olaf_protocol::messaging::classify(&envelope.data)? else {
        return Err(ProtocolError::ProtocolViolation(
            "only chat may be relayed between servers".into(),
        ));
    };

    let text = encode_frame(&Frame::SignedData(envelope.clone()))?;
    match state.registry.send_to(&chat.recipient, &text) {
        Delivery::Queued => {
            tracing::debug!(
                server = %address,
                recipient = %chat.recipient,
                "relayed chat delivered"
            );
        }
        Delivery::Dropped => {
            tracing::warn!(
                server = %address,
                recipient = %chat.recipient,
                "relayed chat dropped, recipient queue full"
            );
        }
        Delivery::Absent => {
            tracing::warn!(
                server = %address,
                recipient = %chat.recipient,
                "relayed chat for unknown recipient dropped"
            );
        }
    }
    Ok(())
}

/// Start one dial loop per configured neighbour.
pub fn spawn_neighbour_links(state: &Arc<ServerState>) -> Vec<JoinHandle<()>> {
    state
        .neighbours
        .values()
        .cloned()
        .map(|neighbour| tokio::spawn(dial_loop(Arc::clone(state), neighbour)))
        .collect()
}

/// Keep an outbound link to `neighbour` open, reconnecting with exponential
/// backoff.
async fn dial_loop(state: Arc<ServerState>, neighbour: Neighbour) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match tokio_tungstenite::connect_async(neighbour.url.as_str()).await {
            Ok((ws, _response)) => {
                backoff = INITIAL_BACKOFF;
                tracing::info!(
                    server = %neighbour.address,
                    url = %neighbour.url,
                    "connected to neighbour"
                );

                let (handle, rx) = state.open_connection();
                match open_link(&state, &handle) {
                    Ok(()) => {
                        state.peers.insert(&neighbour.address, handle.clone());
                        run_connection(
                            ws,
                            Arc::clone(&state),
                            handle,
                            rx,
                            Role::Peer {
                                address: neighbour.address.clone(),
                            },
                            Some(state.refresh_interval),
                        )
                        .await;
                        tracing::info!(server = %neighbour.address, "outbound peer link closed");
                    }
                    Err(e) => {
                        tracing::error!(
                            server = %neighbour.address,
                            error = %e,
                            "failed to build server_hello"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    server = %neighbour.address,
                    error = %e,
                    retry_secs = backoff.as_secs(),
                    "failed to connect to neighbour"
                );
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Queue the handshake for a freshly dialed link: a signed `server_hello`
/// followed by a request for the neighbour's client list.
fn open_link(state: &ServerState, handle: &ConnectionHandle) -> Result<(), ProtocolError> {
    let hello = signed_frame(
        &state.identity,
        &Payload::ServerHello(ServerHello {
            sender: state.address.clone(),
        }),
        state.next_counter(),
    )?;
    handle.send(encode_frame(&hello)?);
    handle.send(encode_frame(&Frame::ClientUpdateRequest)?);
    Ok(())
}
