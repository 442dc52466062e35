// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! `local.conf`-equivalent on-disk configuration, loaded and saved with
//! `serde`/`serde_json` the way `zerotier-system-service::datadir::DataDir`
//! loads `local.conf`. Command-line flags (`-p`, `set port`, ...) layer on
//! top of whatever this struct loads, mirroring `main.rs`'s `Flags`/`Config`
//! split in the teacher.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogSettings {
    pub path: Option<String>,
    pub max_size: i64,
    pub stderr: bool,
    pub debug: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { path: None, max_size: 100 * 1024 * 1024, stderr: false, debug: false }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub primary_port: u16,
    pub secondary_port: Option<u16>,
    pub portmap: bool,
    pub blacklist_cidrs: Vec<String>,
    pub blacklist_interface_prefixes: Vec<String>,
    pub allow_network_caching: bool,
    pub allow_peer_caching: bool,
    pub allow_roots_caching: bool,
    pub allow_identity_caching: bool,
    pub peer_prune_max_age_ms: i64,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            primary_port: 9993,
            secondary_port: None,
            portmap: false,
            blacklist_cidrs: Vec::new(),
            blacklist_interface_prefixes: Vec::new(),
            allow_network_caching: true,
            allow_peer_caching: true,
            allow_roots_caching: true,
            allow_identity_caching: true,
            peer_prune_max_age_ms: zt_core::config::DEFAULT_PEER_PRUNE_MAX_AGE_MS,
            log: LogSettings::default(),
        }
    }
}

/// Per-network overrides, keyed by 16-hex-digit network ID string, mirroring
/// `zt_core::network::NetworkSettings` (the in-core representation) but
/// expressed as a plain serde-friendly struct for the on-disk format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLocalSettings {
    pub allow_managed: bool,
    pub allow_global: bool,
    pub allow_default: bool,
    pub allow_dns: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct LocalConfig {
    pub settings: Settings,
    pub network: BTreeMap<String, NetworkLocalSettings>,
}
