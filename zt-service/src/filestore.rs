// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The file-backed [`zt_core::store::StateStore`] implementation, for the
//! on-disk layout of spec.md §6. Grounded directly on
//! `zerotier-system-service::datadir::DataDir`: same directory layout, same
//! "read-with-a-size-cap, create-if-missing" discipline and the same
//! owner-read-only restriction on the secret identity file — adapted from
//! `DataDir`'s `tokio::fs`/async-`RwLock` style to plain `std::fs` behind a
//! `parking_lot::Mutex`, matching the rest of this workspace's
//! `std::thread`-based concurrency model.

use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;

use zt_core::store::{StateStore, StoreKind};
use zt_utils::error::{Result, ZtError};

use crate::util::{fs_restrict_permissions, read_limit, DEFAULT_FILE_IO_READ_LIMIT};

const IDENTITY_PUBLIC_FILENAME: &str = "identity.public";
const IDENTITY_SECRET_FILENAME: &str = "identity.secret";
const IDENTITY_SECRET_COLLISION_FILENAME: &str = "identity.secret.saved_after_collision";
const ROOTS_FILENAME: &str = "roots";
const NETWORKS_DIR: &str = "networks.d";
const PEERS_DIR: &str = "peers.d";

/// Mirrors of the most recently written identity/planet objects, so a `get`
/// right after a `put` never has to round-trip through the filesystem
/// (spec.md §3: "the core additionally mirrors the most recently written
/// identity_public, identity_secret and planet into in-memory buffers").
#[derive(Default)]
struct Mirror {
    identity_public: Option<Vec<u8>>,
    identity_secret: Option<Vec<u8>>,
    planet: Option<Vec<u8>>,
}

pub struct FileStore {
    base_path: PathBuf,
    mirror: Mutex<Mirror>,
}

fn network_path(base: &std::path::Path, net_id: u64) -> PathBuf {
    base.join(NETWORKS_DIR).join(format!("{:016x}.conf", net_id))
}

fn peer_path(base: &std::path::Path, node_id: u64) -> PathBuf {
    base.join(PEERS_DIR).join(format!("{:010x}.peer", node_id & 0xff_ffff_ffff))
}

impl FileStore {
    /// Open (creating if necessary) a file-backed store rooted at `path`,
    /// the `init_from_storage(path)` entry point of spec.md §6.
    pub fn open<P: Into<PathBuf>>(path: P) -> std::io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path)?;
        fs::create_dir_all(base_path.join(NETWORKS_DIR))?;
        fs::create_dir_all(base_path.join(PEERS_DIR))?;
        Ok(Self { base_path, mirror: Mutex::new(Mirror::default()) })
    }

    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    /// Restore a previously-saved identity, if one exists on disk.
    pub fn load_identity(&self) -> Option<crate::identity::NodeIdentity> {
        let public = read_limit(self.base_path.join(IDENTITY_PUBLIC_FILENAME), 4096).ok()?;
        let secret = read_limit(self.base_path.join(IDENTITY_SECRET_FILENAME), 4096).ok()?;
        crate::identity::NodeIdentity::from_ascii(&String::from_utf8_lossy(&public), &String::from_utf8_lossy(&secret))
    }

    /// Persist an identity to `identity.public`/`identity.secret`,
    /// restricting the secret file to owner-read-only where the platform
    /// supports it (spec.md §6: "the stored object must be restricted to
    /// owner-read permissions when the implementer supports it").
    pub fn save_identity(&self, id: &crate::identity::NodeIdentity) -> std::io::Result<()> {
        let secret_path = self.base_path.join(IDENTITY_SECRET_FILENAME);
        fs::write(&secret_path, id.secret_ascii().as_bytes())?;
        let _ = fs_restrict_permissions(&secret_path);
        fs::write(self.base_path.join(IDENTITY_PUBLIC_FILENAME), id.public_ascii().as_bytes())?;
        let mut mirror = self.mirror.lock();
        mirror.identity_public = Some(id.public_ascii().into_bytes());
        mirror.identity_secret = Some(id.secret_ascii().into_bytes());
        Ok(())
    }

    /// Identity-collision recovery (spec.md §9 Open Question, resolved as a
    /// single retry): rename the current secret aside so a fresh identity
    /// can be generated in its place, matching the original's
    /// `identity.secret.saved_after_collision` behavior.
    pub fn save_secret_after_collision(&self) -> std::io::Result<()> {
        let secret_path = self.base_path.join(IDENTITY_SECRET_FILENAME);
        if secret_path.is_file() {
            fs::rename(&secret_path, self.base_path.join(IDENTITY_SECRET_COLLISION_FILENAME))?;
        }
        self.mirror.lock().identity_secret = None;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn put(&self, kind: StoreKind, data: &[u8]) -> Result<()> {
        let result = match kind {
            StoreKind::IdentityPublic => {
                self.mirror.lock().identity_public = Some(data.to_vec());
                fs::write(self.base_path.join(IDENTITY_PUBLIC_FILENAME), data)
            }
            StoreKind::IdentitySecret => {
                let path = self.base_path.join(IDENTITY_SECRET_FILENAME);
                let r = fs::write(&path, data);
                if r.is_ok() {
                    let _ = fs_restrict_permissions(&path);
                    self.mirror.lock().identity_secret = Some(data.to_vec());
                }
                r
            }
            StoreKind::Planet => {
                self.mirror.lock().planet = Some(data.to_vec());
                fs::write(self.base_path.join(ROOTS_FILENAME), data)
            }
            StoreKind::Peer(id) => fs::write(peer_path(&self.base_path, id), data),
            StoreKind::Network(id) => fs::write(network_path(&self.base_path, id), data),
        };
        result.map_err(|_| ZtError::General)
    }

    fn get(&self, kind: StoreKind) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = match kind {
            StoreKind::IdentityPublic => self.mirror.lock().identity_public.clone(),
            StoreKind::IdentitySecret => self.mirror.lock().identity_secret.clone(),
            StoreKind::Planet => self.mirror.lock().planet.clone(),
            _ => None,
        } {
            return Ok(Some(cached));
        }

        let path = match kind {
            StoreKind::IdentityPublic => self.base_path.join(IDENTITY_PUBLIC_FILENAME),
            StoreKind::IdentitySecret => self.base_path.join(IDENTITY_SECRET_FILENAME),
            StoreKind::Planet => self.base_path.join(ROOTS_FILENAME),
            StoreKind::Peer(id) => peer_path(&self.base_path, id),
            StoreKind::Network(id) => network_path(&self.base_path, id),
        };
        if !path.is_file() {
            return Ok(None);
        }
        match read_limit(&path, DEFAULT_FILE_IO_READ_LIMIT) {
            Ok(data) => Ok(Some(data)),
            Err(_) => Err(ZtError::General),
        }
    }

    fn erase(&self, kind: StoreKind) -> Result<()> {
        let path = match kind {
            StoreKind::IdentityPublic => self.base_path.join(IDENTITY_PUBLIC_FILENAME),
            StoreKind::IdentitySecret => self.base_path.join(IDENTITY_SECRET_FILENAME),
            StoreKind::Planet => self.base_path.join(ROOTS_FILENAME),
            StoreKind::Peer(id) => peer_path(&self.base_path, id),
            StoreKind::Network(id) => network_path(&self.base_path, id),
        };
        match kind {
            StoreKind::IdentityPublic => self.mirror.lock().identity_public = None,
            StoreKind::IdentitySecret => self.mirror.lock().identity_secret = None,
            StoreKind::Planet => self.mirror.lock().planet = None,
            _ => {}
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(ZtError::General),
        }
    }

    fn cached_network_ids(&self) -> Result<Vec<u64>> {
        list_hex_stems(&self.base_path.join(NETWORKS_DIR), ".conf")
    }

    fn cached_peer_ids(&self) -> Result<Vec<u64>> {
        list_hex_stems(&self.base_path.join(PEERS_DIR), ".peer")
    }
}

fn list_hex_stems(dir: &std::path::Path, suffix: &str) -> Result<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(Vec::new()),
    };
    let mut ids = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(suffix) {
            if let Ok(id) = u64::from_str_radix(stem, 16) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> FileStore {
        let dir = std::env::temp_dir().join(format!("zt-service-filestore-test-{}-{}", std::process::id(), zt_utils::ms_monotonic()));
        FileStore::open(dir).unwrap()
    }

    #[test]
    fn round_trips_every_store_kind() {
        let s = temp_store();
        s.put(StoreKind::IdentityPublic, b"pub").unwrap();
        s.put(StoreKind::Network(0x8056c2e21c000001), b"netcfg").unwrap();
        s.put(StoreKind::Peer(7), b"peerdata").unwrap();

        assert_eq!(s.get(StoreKind::IdentityPublic).unwrap().as_deref(), Some(&b"pub"[..]));
        assert_eq!(s.get(StoreKind::Network(0x8056c2e21c000001)).unwrap().as_deref(), Some(&b"netcfg"[..]));
        assert_eq!(s.cached_network_ids().unwrap(), vec![0x8056c2e21c000001]);
        assert_eq!(s.cached_peer_ids().unwrap(), vec![7]);
    }

    #[test]
    fn missing_key_is_none_not_an_error() {
        let s = temp_store();
        assert!(s.get(StoreKind::Network(123)).unwrap().is_none());
    }

    #[test]
    fn erase_removes_the_file_and_is_idempotent() {
        let s = temp_store();
        s.put(StoreKind::Network(1), b"x").unwrap();
        s.erase(StoreKind::Network(1)).unwrap();
        assert!(s.get(StoreKind::Network(1)).unwrap().is_none());
        s.erase(StoreKind::Network(1)).unwrap();
    }

    #[test]
    fn identity_save_and_load_round_trips() {
        let s = temp_store();
        let id = crate::identity::NodeIdentity::generate();
        s.save_identity(&id).unwrap();
        let restored = s.load_identity().unwrap();
        assert_eq!(id.id, restored.id);
    }

    #[test]
    fn collision_recovery_renames_the_secret_aside() {
        let s = temp_store();
        let id = crate::identity::NodeIdentity::generate();
        s.save_identity(&id).unwrap();
        s.save_secret_after_collision().unwrap();
        assert!(s.base_path().join(IDENTITY_SECRET_COLLISION_FILENAME).is_file());
        assert!(!s.base_path().join(IDENTITY_SECRET_FILENAME).is_file());
    }
}
