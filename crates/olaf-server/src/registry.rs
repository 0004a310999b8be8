//! Locally connected clients, keyed by fingerprint.
//!
//! One `parking_lot` lock covers the client map and the connection index, so
//! a broadcast never sees a half-removed client. The local directory entry is
//! republished while that lock is held (registry lock before directory lock).

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use olaf_crypto::fingerprint;
use olaf_protocol::{ProtocolError, ReplayGuard};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::directory::Directory;

pub type ConnectionId = u64;

/// Sending half of one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a text frame without waiting. Returns `false` if it was dropped.
    pub fn send(&self, text: String) -> bool {
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection = self.id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection = self.id, "connection closed, dropping frame");
                false
            }
        }
    }
}

/// Outcome of a unicast to a local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The client is registered but its queue refused the frame.
    Dropped,
    /// No local client has that fingerprint.
    Absent,
}

struct ClientRecord {
    public_key: String,
    verifying_key: VerifyingKey,
    handle: ConnectionHandle,
    replay: ReplayGuard,
    /// Registration order, used to keep the published key list stable.
    joined: u64,
}

/// Read-only copy of a registered client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub fingerprint: String,
    pub public_key: String,
    pub verifying_key: VerifyingKey,
    pub connection: ConnectionId,
    pub last_counter: Option<u64>,
    pub home_server_address: String,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<String, ClientRecord>,
    by_connection: HashMap<ConnectionId, String>,
    next_join: u64,
}

impl Inner {
    fn local_keys(&self) -> Vec<String> {
        let mut records: Vec<&ClientRecord> = self.clients.values().collect();
        records.sort_by_key(|r| r.joined);
        records.into_iter().map(|r| r.public_key.clone()).collect()
    }
}

pub struct Registry {
    directory: Arc<Directory>,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self {
            directory,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register the client behind `handle` and seed its replay guard with the
    /// `hello` counter.
    pub fn register(
        &self,
        public_key: &str,
        verifying_key: VerifyingKey,
        handle: &ConnectionHandle,
        counter: u64,
    ) -> Result<String, ProtocolError> {
        let fp = fingerprint(public_key);
        let mut inner = self.inner.write();

        if inner.by_connection.contains_key(&handle.id()) {
            return Err(ProtocolError::ProtocolViolation(
                "connection already sent hello".into(),
            ));
        }
        if inner.clients.contains_key(&fp) {
            tracing::info!(fingerprint = %fp, "rejected duplicate identity");
            return Err(ProtocolError::DuplicateIdentity(fp));
        }

        let joined = inner.next_join;
        inner.next_join += 1;
        inner.clients.insert(
            fp.clone(),
            ClientRecord {
                public_key: public_key.to_string(),
                verifying_key,
                handle: handle.clone(),
                replay: ReplayGuard::seeded(counter),
                joined,
            },
        );
        inner.by_connection.insert(handle.id(), fp.clone());

        self.directory
            .publish(self.directory.local_address(), inner.local_keys());
        tracing::info!(
            fingerprint = %fp,
            connection = handle.id(),
            clients = inner.clients.len(),
            "client registered"
        );
        Ok(fp)
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<ClientInfo> {
        let inner = self.inner.read();
        inner
            .clients
            .get(fingerprint)
            .map(|record| self.info(fingerprint, record))
    }

    pub fn fingerprint_of(&self, connection: ConnectionId) -> Option<String> {
        self.inner.read().by_connection.get(&connection).cloned()
    }

    /// Snapshot of the client registered on `connection`.
    pub fn client_on(&self, connection: ConnectionId) -> Option<ClientInfo> {
        let inner = self.inner.read();
        let fp = inner.by_connection.get(&connection)?;
        inner.clients.get(fp).map(|record| self.info(fp, record))
    }

    /// Apply the replay guard of the client on `connection`.
    pub fn accept_counter(
        &self,
        connection: ConnectionId,
        counter: u64,
    ) -> Result<(), ProtocolError> {
        let mut inner = self.inner.write();
        let Inner {
            clients,
            by_connection,
            ..
        } = &mut *inner;
        let record = by_connection
            .get(&connection)
            .and_then(|fp| clients.get_mut(fp))
            .ok_or_else(|| {
                ProtocolError::ProtocolViolation("connection has not sent hello".into())
            })?;
        record.replay.accept(counter)
    }

    /// Remove whatever client is registered on `connection`. Safe to call
    /// more than once.
    pub fn unregister(&self, connection: ConnectionId) -> Option<String> {
        let mut inner = self.inner.write();
        let fp = inner.by_connection.remove(&connection)?;
        inner.clients.remove(&fp);

        self.directory
            .publish(self.directory.local_address(), inner.local_keys());
        tracing::info!(
            fingerprint = %fp,
            connection,
            clients = inner.clients.len(),
            "client unregistered"
        );
        Some(fp)
    }

    /// Queue `text` for every local client except `sender`.
    pub fn broadcast_except(&self, sender: &str, text: &str) -> usize {
        let inner = self.inner.read();
        inner
            .clients
            .iter()
            .filter(|(fp, _)| fp.as_str() != sender)
            .filter(|(_, record)| record.handle.send(text.to_string()))
            .count()
    }

    pub fn send_to(&self, fingerprint: &str, text: &str) -> Delivery {
        let inner = self.inner.read();
        match inner.clients.get(fingerprint) {
            Some(record) if record.handle.send(text.to_string()) => Delivery::Queued,
            Some(_) => Delivery::Dropped,
            None => Delivery::Absent,
        }
    }

    /// Public keys of local clients in registration order.
    pub fn local_keys(&self) -> Vec<String> {
        self.inner.read().local_keys()
    }

    pub fn len(&self) -> usize {
        self.inner.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn info(&self, fingerprint: &str, record: &ClientRecord) -> ClientInfo {
        ClientInfo {
            fingerprint: fingerprint.to_string(),
            public_key: record.public_key.clone(),
            verifying_key: record.verifying_key,
            connection: record.handle.id(),
            last_counter: record.replay.last(),
            home_server_address: self.directory.local_address().to_string(),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("clients", &self.len())
            .finish_non_exhaustive()
    }
}

/// Unregisters a connection when dropped, whichever way the connection task
/// exits.
pub struct RegistrationGuard {
    registry: Arc<Registry>,
    connection: ConnectionId,
}

impl RegistrationGuard {
    pub fn new(registry: Arc<Registry>, connection: ConnectionId) -> Self {
        Self {
            registry,
            connection,
        }
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use olaf_crypto::Identity;

    const LOCAL: &str = "ws://s1:8001";

    fn registry() -> (Arc<Directory>, Arc<Registry>) {
        let directory = Arc::new(Directory::new(LOCAL));
        let registry = Arc::new(Registry::new(Arc::clone(&directory)));
        (directory, registry)
    }

    fn connection(id: ConnectionId) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(id, tx), rx)
    }

    fn register(registry: &Registry, identity: &Identity, handle: &ConnectionHandle) -> String {
        registry
            .register(&identity.public_key_hex(), identity.public_key(), handle, 0)
            .unwrap()
    }

    #[test]
    fn register_publishes_local_entry() {
        let (directory, registry) = registry();
        let alice = Identity::generate();
        let (handle, _rx) = connection(1);

        let fp = register(&registry, &alice, &handle);
        assert_eq!(fp, alice.fingerprint());
        assert_eq!(directory.aggregate()[0].clients, vec![alice.public_key_hex()]);
        assert_eq!(directory.resolve(&fp).as_deref(), Some(LOCAL));

        let info = registry.lookup(&fp).unwrap();
        assert_eq!(info.connection, 1);
        assert_eq!(info.last_counter, Some(0));
        assert_eq!(info.home_server_address, LOCAL);
    }

    #[test]
    fn duplicate_identity_rejected() {
        let (_, registry) = registry();
        let alice = Identity::generate();
        let (first, _rx1) = connection(1);
        let (second, _rx2) = connection(2);

        register(&registry, &alice, &first);
        let err = registry
            .register(&alice.public_key_hex(), alice.public_key(), &second, 0)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateIdentity(_)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.fingerprint_of(2), None);
    }

    #[test]
    fn second_hello_on_same_connection_rejected() {
        let (_, registry) = registry();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (handle, _rx) = connection(1);

        register(&registry, &alice, &handle);
        let err = registry
            .register(&bob.public_key_hex(), bob.public_key(), &handle, 0)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }

    #[test]
    fn unregister_is_idempotent_and_republishes() {
        let (directory, registry) = registry();
        let alice = Identity::generate();
        let (handle, _rx) = connection(1);
        let fp = register(&registry, &alice, &handle);

        assert_eq!(registry.unregister(1), Some(fp.clone()));
        assert_eq!(registry.unregister(1), None);
        assert!(registry.is_empty());
        assert!(directory.aggregate()[0].clients.is_empty());
        assert_eq!(directory.resolve(&fp), None);
    }

    #[test]
    fn identity_can_reconnect_after_unregister() {
        let (_, registry) = registry();
        let alice = Identity::generate();
        let (first, _rx1) = connection(1);
        let (second, _rx2) = connection(2);

        register(&registry, &alice, &first);
        registry.unregister(1);
        register(&registry, &alice, &second);
        assert_eq!(registry.fingerprint_of(2), Some(alice.fingerprint()));
    }

    #[test]
    fn counters_are_per_connection_client() {
        let (_, registry) = registry();
        let alice = Identity::generate();
        let (handle, _rx) = connection(1);
        register(&registry, &alice, &handle);

        assert!(matches!(
            registry.accept_counter(1, 0),
            Err(ProtocolError::StaleCounter { received: 0, last: 0 })
        ));
        assert!(registry.accept_counter(1, 1).is_ok());
        assert!(registry.accept_counter(1, 1).is_err());
        assert!(matches!(
            registry.accept_counter(9, 1),
            Err(ProtocolError::ProtocolViolation(_))
        ));
        assert_eq!(registry.client_on(1).unwrap().last_counter, Some(1));
    }

    #[test]
    fn broadcast_skips_sender() {
        let (_, registry) = registry();
        let ids: Vec<Identity> = (0..3).map(|_| Identity::generate()).collect();
        let mut receivers = Vec::new();
        for (id, identity) in (0..).zip(&ids) {
            let (handle, rx) = connection(id);
            register(&registry, identity, &handle);
            receivers.push(rx);
        }

        let delivered = registry.broadcast_except(&ids[0].fingerprint(), "frame");
        assert_eq!(delivered, 2);
        assert!(receivers[0].try_recv().is_err());
        assert_eq!(receivers[1].try_recv().unwrap(), "frame");
        assert_eq!(receivers[2].try_recv().unwrap(), "frame");
    }

    #[test]
    fn send_to_reports_delivery() {
        let (_, registry) = registry();
        let alice = Identity::generate();
        let (tx, mut rx) = mpsc::channel(1);
        register(&registry, &alice, &ConnectionHandle::new(1, tx));

        let fp = alice.fingerprint();
        assert_eq!(registry.send_to(&fp, "one"), Delivery::Queued);
        assert_eq!(registry.send_to(&fp, "two"), Delivery::Dropped);
        assert_eq!(registry.send_to("nobody", "three"), Delivery::Absent);
        assert_eq!(rx.try_recv().unwrap(), "one");
    }

    #[test]
    fn local_keys_follow_registration_order() {
        let (_, registry) = registry();
        let ids: Vec<Identity> = (0..4).map(|_| Identity::generate()).collect();
        let mut receivers = Vec::new();
        for (id, identity) in (0..).zip(&ids) {
            let (handle, rx) = connection(id);
            register(&registry, identity, &handle);
            receivers.push(rx);
        }
        registry.unregister(1);

        let expected: Vec<String> = [0, 2, 3].iter().map(|&i| ids[i].public_key_hex()).collect();
        assert_eq!(registry.local_keys(), expected);
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let (_, registry) = registry();
        let alice = Identity::generate();
        let (handle, _rx) = connection(7);
        {
            let _guard = RegistrationGuard::new(Arc::clone(&registry), 7);
            register(&registry, &alice, &handle);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
