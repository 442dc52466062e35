// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Node Service tunables. Grounded on the commented-out `Service` struct and
//! `CONFIG_CHECK_INTERVAL` constant in
//! `zerotier-system-service/src/service.rs`, generalized into an explicit,
//! embedder-constructed config value rather than a global read off disk —
//! the core itself stays storage-agnostic (spec.md §3's [`crate::store`]
//! capability split); only `zt-service`'s `LocalConfig` layer (ambient
//! stack) knows how to load one of these from `local.conf`.

use crate::binder::BindPolicy;

/// Default cadence at which the Node Service re-binds UDP ports, re-scans
/// multicast groups, reconciles routes and checks for identity collisions.
/// Mirrors `CONFIG_CHECK_INTERVAL = 5000` from the teacher's service loop.
pub const DEFAULT_HOUSEKEEPING_INTERVAL_MS: i64 = 5000;

/// `MAX_GUARDED_RX_BUF_SZ`-equivalent bound named in spec.md §4.5: how many
/// not-yet-dispatched inbound frames the stack driver's rx queue holds
/// before it starts dropping.
pub const DEFAULT_RX_QUEUE_CAPACITY: usize = 256;

/// `FRAMES_HANDLED_PER_CORE_CALL` from spec.md §4.6: how many queued rx
/// frames a single stack-thread wakeup will drain before yielding, so one
/// congested network can't starve the others sharing the stack thread.
pub const DEFAULT_FRAMES_PER_CORE_CALL: usize = 16;

/// How long a cached peer record may go unused before the peers.d-pruning
/// housekeeping pass (spec.md Design Note 9) erases it from the state
/// store. Grounded on the original's "coma" eviction heuristic for stale
/// secondary-port bindings, generalized to cached peer records.
pub const DEFAULT_PEER_PRUNE_MAX_AGE_MS: i64 = 60 * 60 * 1000;

/// How often the Node Service re-derives the local-interface-address list it
/// reports to the overlay core from the UDP binder's currently-bound
/// sockets. Mirrors `ZT_LOCAL_INTERFACE_CHECK_INTERVAL` from
/// `original_source/src/NodeService.cpp`.
pub const LOCAL_INTERFACE_CHECK_INTERVAL_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct NodeServiceConfig {
    /// UDP ports the binder always tries to keep bound, in addition to one
    /// automatically-chosen secondary port.
    pub fixed_ports: Vec<u16>,
    pub bind_policy: BindPolicy,
    pub housekeeping_interval_ms: i64,
    pub rx_queue_capacity: usize,
    pub frames_per_core_call: usize,
    /// Rejoin every network found in the state store's cache at startup,
    /// before any explicit `join_network` call (spec.md §4.8).
    pub cached_network_rejoin_on_start: bool,
    /// If the loaded secret identity doesn't match the overlay core's
    /// expectation of what's already claimed (an identity collision), save
    /// the old secret under a `.saved_after_collision` suffix and generate
    /// a fresh one rather than refusing to start (spec.md Design Note 9,
    /// grounded on `original_source` `NodeService.cpp`'s collision path).
    pub identity_collision_recovery: bool,
    pub peer_prune_max_age_ms: i64,
}

impl Default for NodeServiceConfig {
    fn default() -> Self {
        Self {
            fixed_ports: vec![9993],
            bind_policy: BindPolicy::default(),
            housekeeping_interval_ms: DEFAULT_HOUSEKEEPING_INTERVAL_MS,
            rx_queue_capacity: DEFAULT_RX_QUEUE_CAPACITY,
            frames_per_core_call: DEFAULT_FRAMES_PER_CORE_CALL,
            cached_network_rejoin_on_start: true,
            identity_collision_recovery: true,
            peer_prune_max_age_ms: DEFAULT_PEER_PRUNE_MAX_AGE_MS,
        }
    }
}
