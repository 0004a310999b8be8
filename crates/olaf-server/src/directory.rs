//! The neighbourhood directory: which server hosts which client keys.
//!
//! The local server's entry always sits first. Remote entries are replaced
//! wholesale by each `client_update` from a peer. The fingerprint index used
//! for routing is rebuilt lazily after any change.

use std::collections::HashMap;

use olaf_crypto::fingerprint;
use olaf_protocol::DirectoryEntry;
use parking_lot::Mutex;

pub struct Directory {
    local_address: String,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Index 0 is the local server.
    entries: Vec<DirectoryEntry>,
    /// Fingerprint → hosting server address. `None` when stale.
    index: Option<HashMap<String, String>>,
}

impl Directory {
    pub fn new(local_address: impl Into<String>) -> Self {
        let local_address = local_address.into();
        Self {
            inner: Mutex::new(Inner {
                entries: vec![DirectoryEntry {
                    address: local_address.clone(),
                    clients: Vec::new(),
                }],
                index: None,
            }),
            local_address,
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Replace the client list published for `address`.
    pub fn publish(&self, address: &str, clients: Vec<String>) {
        let mut inner = self.inner.lock();
        match inner.entries.iter_mut().find(|e| e.address == address) {
            Some(entry) => entry.clients = clients,
            None => inner.entries.push(DirectoryEntry {
                address: address.to_string(),
                clients,
            }),
        }
        inner.index = None;
        tracing::debug!(server = %address, "directory entry published");
    }

    /// Drop a remote server's entry. The local entry cannot be forgotten.
    pub fn forget(&self, address: &str) {
        if address == self.local_address {
            return;
        }
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.address != address);
        if inner.entries.len() != before {
            inner.index = None;
            tracing::debug!(server = %address, "directory entry forgotten");
        }
    }

    /// Snapshot of every entry, local server first.
    pub fn aggregate(&self) -> Vec<DirectoryEntry> {
        self.inner.lock().entries.clone()
    }

    /// The server address hosting `fingerprint`, if any.
    ///
    /// When the same key is listed by several servers the earliest entry
    /// wins, so a local registration shadows a remote one.
    pub fn resolve(&self, fingerprint: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.index.is_none() {
            let index = build_index(&inner.entries);
            inner.index = Some(index);
        }
        inner
            .index
            .as_ref()
            .and_then(|index| index.get(fingerprint).cloned())
    }
}

fn build_index(entries: &[DirectoryEntry]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for entry in entries {
        for key in &entry.clients {
            index
                .entry(fingerprint(key))
                .or_insert_with(|| entry.address.clone());
        }
    }
    index
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("local_address", &self.local_address)
            .field("servers", &self.inner.lock().entries.len())
            .finish()
    }
}
