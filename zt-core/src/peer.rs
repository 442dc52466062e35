// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Peer snapshot types (spec.md §3). These are ephemeral view objects
//! reconstructed from the Node facade on demand and on peer-change events;
//! nothing here is persisted or owned long-term by the core.

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Leaf,
    Moon,
    Planet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerPath {
    pub address: SocketAddr,
    pub last_send: i64,
    pub last_recv: i64,
    pub trusted_path_id: u64,
    pub expired: bool,
    pub preferred: bool,
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub node_id: u64,
    pub role: PeerRole,
    pub version_major: u8,
    pub version_minor: u8,
    pub version_rev: u16,
    pub latency_ms: i32,
    pub paths: Vec<PeerPath>,
}

impl PeerSnapshot {
    /// The "best" path is the non-expired path marked preferred, or else the
    /// one with the most recent receive timestamp.
    pub fn best_path(&self) -> Option<&PeerPath> {
        self.paths
            .iter()
            .filter(|p| !p.expired)
            .max_by_key(|p| (p.preferred as i64, p.last_recv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(recv: i64, preferred: bool, expired: bool) -> PeerPath {
        PeerPath { address: "127.0.0.1:9993".parse().unwrap(), last_send: 0, last_recv: recv, trusted_path_id: 0, expired, preferred }
    }

    #[test]
    fn best_path_prefers_the_preferred_flag_over_recency() {
        let snap = PeerSnapshot {
            node_id: 1,
            role: PeerRole::Leaf,
            version_major: 1,
            version_minor: 0,
            version_rev: 0,
            latency_ms: 10,
            paths: vec![path(100, false, false), path(10, true, false)],
        };
        assert!(snap.best_path().unwrap().preferred);
    }

    #[test]
    fn best_path_ignores_expired_paths() {
        let snap = PeerSnapshot {
            node_id: 1,
            role: PeerRole::Leaf,
            version_major: 1,
            version_minor: 0,
            version_rev: 0,
            latency_ms: 10,
            paths: vec![path(100, true, true), path(10, false, false)],
        };
        assert_eq!(snap.best_path().unwrap().last_recv, 10);
    }
}
