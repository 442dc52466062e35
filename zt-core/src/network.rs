// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Network state (spec.md §3): the mapping from a 64-bit `net_id` to its
//! `NetworkState`, plus the route type shared by the virtual tap and the
//! event pipeline.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::tap::VirtualTap;

/// A route pushed by the overlay controller, or implied by an assigned CIDR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: IpNet,
    pub via: Option<IpAddr>,
    pub flags: u32,
    pub metric: u16,
}

impl Route {
    /// A route with `via` unset is interface-local and is ignored during
    /// reconciliation, per spec.md §4.5.
    #[inline(always)]
    pub fn is_interface_local(&self) -> bool {
        self.via.is_none()
    }
}

/// Per-network policy toggles the local operator controls independent of
/// what the overlay controller pushes.
#[derive(Debug, Clone, Copy)]
pub struct NetworkSettings {
    pub allow_managed: bool,
    pub allow_global: bool,
    pub allow_default: bool,
    pub allow_managed_whitelist: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { allow_managed: true, allow_global: false, allow_default: false, allow_managed_whitelist: false }
    }
}

/// Opaque configuration blob pushed by the overlay controller on
/// `NETWORK_CONFIG_UP`/`CONFIG_UPDATE`. The core does not interpret its
/// contents beyond the fields it needs (MTU, assigned addresses, managed
/// routes); everything else is retained as opaque bytes for higher layers.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub mtu: u16,
    pub assigned_addresses: Vec<IpNet>,
    pub managed_routes: Vec<Route>,
    pub raw: Vec<u8>,
}

/// Implemented by the Node Service (C8) and installed on the Node facade
/// (C4) before the service starts, mirroring spec.md §4.8's "Virtual
/// network config callback": the overlay core calls back through this
/// whenever a joined network's configuration changes, the same role played
/// by `ZT_VirtualNetworkConfigFunction` in the original C API.
pub trait NetworkConfigSink: Send + Sync {
    /// `NETWORK_CONFIG_UP`: create the tap if absent, using the assigned
    /// MAC/MTU, then apply `config` as if it were the first `CONFIG_UPDATE`.
    fn network_up(&self, net_id: u64, mac: crate::tap::Mac, config: NetworkConfig);
    /// `CONFIG_UPDATE`: diff `assigned_addresses`/`managed_routes` against
    /// the tap's current state and reconcile.
    fn network_config_update(&self, net_id: u64, config: NetworkConfig);
    /// `NETWORK_DOWN`: tear down the tap but keep the cached configuration.
    fn network_down(&self, net_id: u64);
    /// `NETWORK_DESTROY`: tear down the tap and forget any cached
    /// configuration for `net_id`.
    fn network_destroy(&self, net_id: u64);
}

/// `NetworkState { config, tap, managed_ips, settings }` from spec.md §3.
///
/// Invariant: a `NetworkState` with `tap == None` is transient and exists
/// only during configuration-up, before the tap has been created.
pub struct NetworkState {
    pub net_id: u64,
    pub config: NetworkConfig,
    pub tap: Option<VirtualTap>,
    pub managed_ips: Vec<IpNet>,
    pub settings: NetworkSettings,
    /// Whether `NET_READY_V4`/`NET_READY_V6`/`NET_OK` have already been
    /// emitted since the last `NET_DOWN` (spec.md §8: "at most one
    /// NET_READY_V4 between any NET_DOWN/initial and the next NET_DOWN").
    pub ready_v4_sent: bool,
    pub ready_v6_sent: bool,
    pub ok_sent: bool,
}

impl NetworkState {
    pub fn new(net_id: u64) -> Self {
        Self {
            net_id,
            config: NetworkConfig::default(),
            tap: None,
            managed_ips: Vec::new(),
            settings: NetworkSettings::default(),
            ready_v4_sent: false,
            ready_v6_sent: false,
            ok_sent: false,
        }
    }

    /// Insert `cidr` into `managed_ips`, keeping the list sorted and
    /// deduplicated as required by spec.md §3's tap invariant.
    pub fn note_managed_ip(&mut self, cidr: IpNet) {
        if let Err(pos) = self.managed_ips.binary_search_by(|probe| cmp_ipnet(probe, &cidr)) {
            self.managed_ips.insert(pos, cidr);
        }
    }

    pub fn forget_managed_ip(&mut self, cidr: &IpNet) {
        if let Ok(pos) = self.managed_ips.binary_search_by(|probe| cmp_ipnet(probe, cidr)) {
            self.managed_ips.remove(pos);
        }
    }
}

fn cmp_ipnet(a: &IpNet, b: &IpNet) -> std::cmp::Ordering {
    (a.addr(), a.prefix_len()).cmp(&(b.addr(), b.prefix_len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_ips_stay_sorted_and_deduplicated() {
        let mut ns = NetworkState::new(1);
        let a: IpNet = "10.0.0.2/24".parse().unwrap();
        let b: IpNet = "10.0.0.1/24".parse().unwrap();
        ns.note_managed_ip(a);
        ns.note_managed_ip(b);
        ns.note_managed_ip(a); // duplicate insert must be a no-op
        assert_eq!(ns.managed_ips, vec![b, a]);
        ns.forget_managed_ip(&b);
        assert_eq!(ns.managed_ips, vec![a]);
    }
}
