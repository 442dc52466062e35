// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! A placeholder node identity, standing in for the overlay core's real
//! cryptographic identity (key generation, signing, fingerprinting) which
//! §1's Non-goals keep out of this workspace. `zt-service` still needs
//! *something* to write to `identity.public`/`identity.secret` and to hand
//! to [`zt_core::node::NodeId`], so this generates an opaque 40-bit address
//! and an opaque keypair-shaped byte blob the same way `FakeNode` stands in
//! for the rest of the overlay core.

use zt_utils::random::fill_secure;

pub const IDENTITY_SECRET_LEN: usize = 32;
pub const IDENTITY_PUBLIC_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub id: u64,
    pub public: Vec<u8>,
    pub secret: Vec<u8>,
}

impl NodeIdentity {
    /// Generate a fresh identity: a random 40-bit address plus opaque
    /// public/secret byte blobs, hex-encoded the way `identity.public`/
    /// `identity.secret` are ASCII on disk (spec.md §6).
    pub fn generate() -> Self {
        let mut addr_bytes = [0u8; 8];
        fill_secure(&mut addr_bytes);
        let id = u64::from_be_bytes(addr_bytes) & 0xff_ffff_ffff;

        let mut public = vec![0u8; IDENTITY_PUBLIC_LEN];
        fill_secure(&mut public);
        let mut secret = vec![0u8; IDENTITY_SECRET_LEN];
        fill_secure(&mut secret);

        Self { id, public, secret }
    }

    pub fn public_ascii(&self) -> String {
        format!("{:010x}:{}", self.id, hex_encode(&self.public))
    }

    pub fn secret_ascii(&self) -> String {
        format!("{:010x}:{}", self.id, hex_encode(&self.secret))
    }

    pub fn from_ascii(public_ascii: &str, secret_ascii: &str) -> Option<Self> {
        let (id_str, public_hex) = public_ascii.split_once(':')?;
        let id = u64::from_str_radix(id_str, 16).ok()?;
        let public = hex_decode(public_hex)?;
        let (_, secret_hex) = secret_ascii.split_once(':')?;
        let secret = hex_decode(secret_hex)?;
        Some(Self { id, public, secret })
    }
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trips() {
        let id = NodeIdentity::generate();
        let restored = NodeIdentity::from_ascii(&id.public_ascii(), &id.secret_ascii()).unwrap();
        assert_eq!(id.id, restored.id);
        assert_eq!(id.public, restored.public);
        assert_eq!(id.secret, restored.secret);
    }
}
