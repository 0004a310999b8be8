use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use olaf_crypto::{parse_public_key, Identity};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::directory::Directory;
use crate::error::ServerError;
use crate::federation::{Neighbour, PeerLinks};
use crate::registry::{ConnectionHandle, ConnectionId, Registry};

/// Central state shared by every connection task.
pub struct ServerState {
    /// Address published in `client_list` and signed into `server_hello`.
    pub address: String,
    /// Server identity used to sign `server_hello` on outbound peer links.
    pub identity: Identity,
    pub directory: Arc<Directory>,
    pub registry: Arc<Registry>,
    pub peers: Arc<PeerLinks>,
    /// Configured neighbours keyed by the address they announce.
    pub neighbours: HashMap<String, Neighbour>,
    /// Bound on each connection's outbound queue.
    pub outbound_queue: usize,
    pub ping_interval: Duration,
    /// How often outbound peer links pull the peer's client list.
    pub refresh_interval: Duration,
    next_connection_id: AtomicU64,
    /// Counter for envelopes this server signs. Seeded from the clock so it
    /// keeps increasing across restarts.
    counter: AtomicU64,
}

impl ServerState {
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        let identity = match config.server.server_key.as_deref() {
            Some(secret) => Identity::from_secret_hex(secret)
                .map_err(|e| ServerError::ServerKey(e.to_string()))?,
            None => {
                let identity = Identity::generate();
                tracing::warn!(
                    public_key = %identity.public_key_hex(),
                    "no server key configured, generated an ephemeral one"
                );
                identity
            }
        };

        let mut neighbours = HashMap::new();
        for n in &config.federation.neighbours {
            let public_key =
                parse_public_key(&n.public_key).map_err(|e| ServerError::NeighbourKey {
                    address: n.address.clone(),
                    reason: e.to_string(),
                })?;
            neighbours.insert(
                n.address.clone(),
                Neighbour {
                    address: n.address.clone(),
                    url: n.dial_url().to_string(),
                    public_key,
                },
            );
        }

        let address = config.server.address.clone();
        let directory = Arc::new(Directory::new(address.clone()));
        let registry = Arc::new(Registry::new(Arc::clone(&directory)));
        let peers = Arc::new(PeerLinks::new(Arc::clone(&directory)));

        Ok(Self {
            address,
            identity,
            directory,
            registry,
            peers,
            neighbours,
            outbound_queue: config.server.outbound_queue,
            ping_interval: Duration::from_secs(config.server.ping_interval_secs.max(1)),
            refresh_interval: Duration::from_secs(config.federation.refresh_secs),
            next_connection_id: AtomicU64::new(1),
            counter: AtomicU64::new(timestamp_now_millis()),
        })
    }

    /// Allocate an id and a bounded outbound queue for a new connection.
    pub fn open_connection(&self) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.outbound_queue);
        (ConnectionHandle::new(self.next_connection_id(), tx), rx)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Next counter for an envelope signed by this server.
    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("address", &self.address)
            .field("registry", &self.registry)
            .field("neighbours", &self.neighbours.len())
            .finish_non_exhaustive()
    }
}

fn timestamp_now_millis() -> u64 {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn builds_from_defaults() {
        let state = ServerState::new(&Config::default()).unwrap();
        assert_eq!(state.address, "ws://127.0.0.1:8001");
        assert!(state.neighbours.is_empty());
        assert!(state.registry.is_empty());
        assert_eq!(state.directory.aggregate().len(), 1);
    }

    #[test]
    fn configured_key_is_used() {
        let secret = hex::encode([7u8; 32]);
        let config = parse_config(&format!("[server]\nserver_key = \"{secret}\"")).unwrap();
        let state = ServerState::new(&config).unwrap();
        assert_eq!(
            state.identity.public_key_hex(),
            Identity::from_secret_bytes(&[7u8; 32]).public_key_hex()
        );
    }

    #[test]
    fn bad_neighbour_key_fails_startup() {
        let config = parse_config(
            r#"
            [[federation.neighbours]]
            address = "ws://s2:8002"
            public_key = "not-a-key"
            "#,
        )
        .unwrap();
        assert!(matches!(
            ServerState::new(&config),
            Err(ServerError::NeighbourKey { .. })
        ));
    }

    #[test]
    fn counters_and_ids_increase() {
        let state = ServerState::new(&Config::default()).unwrap();
        let first = state.next_counter();
        assert!(state.next_counter() > first);

        let (a, _rx_a) = state.open_connection();
        let (b, _rx_b) = state.open_connection();
        assert_ne!(a.id(), b.id());
    }
}
