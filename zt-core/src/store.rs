// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The state-store capability (component C2). Grounded on
//! `zerotier-system-service/src/datadir.rs`'s `DataDir`, generalized from a
//! concrete filesystem type into a trait so `zt-service` can supply a real
//! on-disk implementation while tests and embedders can supply an in-memory
//! one (spec.md §3's "the core never assumes a filesystem exists").

use zt_utils::error::Result;

/// The object kinds the core persists or restores, mirrored from the
/// `STORE_*` event codes so a `put`/`get` call and the event it produces
/// share one vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKind {
    IdentityPublic,
    IdentitySecret,
    /// World/planet definition: the root set. Corresponds to `planet.d/` /
    /// `roots` in the original on-disk layout.
    Planet,
    /// A cached peer record, keyed by the peer's overlay address.
    Peer(u64),
    /// A joined network's last-known configuration, keyed by network ID.
    Network(u64),
}

/// Implemented by the embedder. `put`/`get`/`erase` are synchronous and are
/// called from the node-service thread's housekeeping tick, never from a
/// hot packet path — callers that need async I/O should buffer internally
/// rather than block the caller indefinitely.
pub trait StateStore: Send + Sync {
    fn put(&self, kind: StoreKind, data: &[u8]) -> Result<()>;

    /// Returns `Ok(None)` if nothing is stored for `kind`, distinct from an
    /// I/O error.
    fn get(&self, kind: StoreKind) -> Result<Option<Vec<u8>>>;

    fn erase(&self, kind: StoreKind) -> Result<()>;

    /// List every network ID with a cached configuration, used at startup
    /// to restore previously-joined networks (spec.md §4.8 "cached network
    /// rejoin").
    fn cached_network_ids(&self) -> Result<Vec<u64>>;

    /// List every peer address with a cached record, used by the
    /// peers.d-pruning housekeeping pass (spec.md Design Note 9).
    fn cached_peer_ids(&self) -> Result<Vec<u64>>;
}

/// An in-memory `StateStore`, used by zt-core's own tests and suitable for
/// embedders that don't want on-disk persistence at all.
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    identity_public: Option<Vec<u8>>,
    identity_secret: Option<Vec<u8>>,
    planet: Option<Vec<u8>>,
    peers: std::collections::BTreeMap<u64, Vec<u8>>,
    networks: std::collections::BTreeMap<u64, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: parking_lot::Mutex::new(MemoryStoreInner::default()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn put(&self, kind: StoreKind, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        match kind {
            StoreKind::IdentityPublic => inner.identity_public = Some(data.to_vec()),
            StoreKind::IdentitySecret => inner.identity_secret = Some(data.to_vec()),
            StoreKind::Planet => inner.planet = Some(data.to_vec()),
            StoreKind::Peer(id) => {
                inner.peers.insert(id, data.to_vec());
            }
            StoreKind::Network(id) => {
                inner.networks.insert(id, data.to_vec());
            }
        }
        Ok(())
    }

    fn get(&self, kind: StoreKind) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(match kind {
            StoreKind::IdentityPublic => inner.identity_public.clone(),
            StoreKind::IdentitySecret => inner.identity_secret.clone(),
            StoreKind::Planet => inner.planet.clone(),
            StoreKind::Peer(id) => inner.peers.get(&id).cloned(),
            StoreKind::Network(id) => inner.networks.get(&id).cloned(),
        })
    }

    fn erase(&self, kind: StoreKind) -> Result<()> {
        let mut inner = self.inner.lock();
        match kind {
            StoreKind::IdentityPublic => inner.identity_public = None,
            StoreKind::IdentitySecret => inner.identity_secret = None,
            StoreKind::Planet => inner.planet = None,
            StoreKind::Peer(id) => {
                inner.peers.remove(&id);
            }
            StoreKind::Network(id) => {
                inner.networks.remove(&id);
            }
        }
        Ok(())
    }

    fn cached_network_ids(&self) -> Result<Vec<u64>> {
        Ok(self.inner.lock().networks.keys().copied().collect())
    }

    fn cached_peer_ids(&self) -> Result<Vec<u64>> {
        Ok(self.inner.lock().peers.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_store_kind() {
        let s = MemoryStore::new();
        s.put(StoreKind::IdentityPublic, b"pub").unwrap();
        s.put(StoreKind::IdentitySecret, b"sec").unwrap();
        s.put(StoreKind::Planet, b"planet").unwrap();
        s.put(StoreKind::Peer(7), b"peer7").unwrap();
        s.put(StoreKind::Network(9), b"net9").unwrap();

        assert_eq!(s.get(StoreKind::IdentityPublic).unwrap().as_deref(), Some(&b"pub"[..]));
        assert_eq!(s.get(StoreKind::Peer(7)).unwrap().as_deref(), Some(&b"peer7"[..]));
        assert_eq!(s.cached_network_ids().unwrap(), vec![9]);
        assert_eq!(s.cached_peer_ids().unwrap(), vec![7]);
    }

    #[test]
    fn missing_key_is_none_not_an_error() {
        let s = MemoryStore::new();
        assert!(s.get(StoreKind::Network(123)).unwrap().is_none());
    }

    #[test]
    fn erase_removes_the_entry() {
        let s = MemoryStore::new();
        s.put(StoreKind::Network(1), b"x").unwrap();
        s.erase(StoreKind::Network(1)).unwrap();
        assert!(s.get(StoreKind::Network(1)).unwrap().is_none());
        assert!(s.cached_network_ids().unwrap().is_empty());
    }
}
