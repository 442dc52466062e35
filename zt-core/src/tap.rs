// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The virtual tap (component C5): a per-network L2 endpoint. To the TCP/IP
//! stack it looks like an Ethernet NIC; to the overlay core it is a frame
//! sink/source. Grounded on `original_source/include/VirtualTap.h` and
//! `src/VirtualTap.cpp`, and on the trait-based host/inner-protocol split in
//! `network-hypervisor/src/vl2/switch.rs`.

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::network::Route;

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    /// Derive a locally-administered MAC from a node ID and network ID, the
    /// way the original VirtualTap derives a tap's hardware address from the
    /// node's ZeroTier address plus the network ID so it never collides
    /// across joined networks.
    pub fn derive(node_id: u64, net_id: u64) -> Mac {
        let mut b = [0u8; 6];
        b[0] = 0x02 | (((net_id >> 56) & 0x3f) as u8) << 2;
        b[1] = (node_id >> 32) as u8;
        b[2] = (node_id >> 24) as u8;
        b[3] = (node_id >> 16) as u8;
        b[4] = (node_id >> 8) as u8;
        b[5] = node_id as u8;
        Mac(b)
    }
}

/// An Ethernet frame, either inbound (about to enter the stack) or outbound
/// (already stripped of its synthesized header by the stack's TX callback).
#[derive(Debug, Clone)]
pub struct EthernetFrame {
    pub src: Mac,
    pub dst: Mac,
    pub ethertype: u16,
    pub vlan: u16,
    pub payload: Vec<u8>,
}

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// An address-resolution multicast group derived from an assigned IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MulticastGroup {
    pub mac: Mac,
    pub adi: u32,
}

/// Implemented by the stack driver (C6). The tap calls this to hand inbound
/// overlay frames to the single rx queue; returns `false` if the queue was
/// full and the frame was dropped (spec.md §4.5 `MAX_GUARDED_RX_BUF_SZ`).
pub trait FrameSink: Send + Sync {
    fn submit_inbound_frame(&self, net_id: u64, frame: EthernetFrame) -> bool;
}

/// Implemented by the Node facade (C4). The stack driver's netif TX path
/// calls this to push an outbound frame onto the overlay wire.
pub trait OutboundFrameSink: Send + Sync {
    fn send_virtual_network_frame(&self, net_id: u64, src: Mac, dst: Mac, ethertype: u16, vlan: u16, payload: &[u8]) -> bool;
}

/// Implemented by the stack driver (C6) and installed on the Node facade by
/// the orchestrator (C8) before the service starts (spec.md §4.5 "inbound:
/// the tap receives ... and enqueues the buffer onto the stack driver's
/// single rx queue"). This is the C4→C5→C6 handoff for frames the overlay
/// core decodes off the wire for a joined network.
pub trait NetifManager: Send + Sync {
    /// Create (or recreate) the netif(s) backing `net_id`'s tap.
    fn netif_up(&self, net_id: u64, mac: Mac, mtu: u16);
    fn netif_set_mtu(&self, net_id: u64, mtu: u16);
    fn netif_down(&self, net_id: u64);
    /// Mirror an authoritative tap address onto the stack's netif address
    /// list (spec.md §3: "netif assigned addresses are a mirror").
    fn add_ip(&self, net_id: u64, cidr: IpNet);
    fn remove_ip(&self, net_id: u64, cidr: IpNet);
}

/// Opaque handle to a stack-owned netif. The tap holds this purely as a
/// back-reference (spec.md §3: "a tap holds back-references, not owning,
/// to its netifs") — ownership of the netif lives entirely in the stack
/// driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetifHandle(pub u64);

pub const HOUSEKEEPING_INTERVAL_MS: i64 = 1000;

/// `VirtualTap { net_id, mac, mtu, ips, routes, multicast_groups, netif_v4,
/// netif_v6, housekeeping_ts, network_status }` from spec.md §3.
pub struct VirtualTap {
    pub net_id: u64,
    pub mac: Mac,
    pub mtu: u16,
    ips: Vec<IpNet>,
    routes: Vec<Route>,
    multicast_groups: BTreeSet<MulticastGroup>,
    pub netif_v4: Option<NetifHandle>,
    pub netif_v6: Option<NetifHandle>,
    housekeeping_ts: i64,
    pub network_status: NetworkStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    RequestingConfig,
    Ok,
    AccessDenied,
    NotFound,
    ClientTooOld,
}

impl VirtualTap {
    pub fn new(net_id: u64, mac: Mac, mtu: u16) -> Self {
        Self {
            net_id,
            mac,
            mtu,
            ips: Vec::new(),
            routes: Vec::new(),
            multicast_groups: BTreeSet::new(),
            netif_v4: None,
            netif_v6: None,
            housekeeping_ts: 0,
            network_status: NetworkStatus::RequestingConfig,
        }
    }

    pub fn ips(&self) -> &[IpNet] {
        &self.ips
    }

    /// `true` once at least `HOUSEKEEPING_INTERVAL_MS` has elapsed since the
    /// last call to [`Self::mark_housekeeping`]. The Node Service's
    /// housekeeping tick uses this to decide whether to re-scan multicast
    /// groups and reconcile routes on this tap this cycle.
    pub fn due_for_housekeeping(&self, now: i64) -> bool {
        now.saturating_sub(self.housekeeping_ts) >= HOUSEKEEPING_INTERVAL_MS
    }

    pub fn mark_housekeeping(&mut self, now: i64) {
        self.housekeeping_ts = now;
    }

    /// Returns `true` if the address was newly added (it becomes the
    /// authoritative entry immediately; netif assignment on the stack side
    /// is a mirror maintained separately by the orchestrator).
    pub fn add_ip(&mut self, cidr: IpNet) -> bool {
        match self.ips.binary_search_by(|p| cmp(p, &cidr)) {
            Ok(_) => false,
            Err(pos) => {
                self.ips.insert(pos, cidr);
                true
            }
        }
    }

    pub fn remove_ip(&mut self, cidr: &IpNet) -> bool {
        match self.ips.binary_search_by(|p| cmp(p, cidr)) {
            Ok(pos) => {
                self.ips.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Derive the set of address-resolution multicast groups implied by the
    /// tap's currently assigned IPs: IPv4 addresses imply the standard
    /// all-hosts groups used for ARP-equivalent resolution; IPv6 addresses
    /// imply the solicited-node multicast address plus all-nodes.
    fn derive_multicast_groups(&self) -> BTreeSet<MulticastGroup> {
        let mut groups = BTreeSet::new();
        for net in &self.ips {
            match net.addr() {
                IpAddr::V4(_) => {
                    groups.insert(MulticastGroup { mac: Mac([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]), adi: 0 });
                }
                IpAddr::V6(v6) => {
                    let o = v6.octets();
                    groups.insert(MulticastGroup { mac: Mac([0x33, 0x33, 0xff, o[13], o[14], o[15]]), adi: 0 });
                    groups.insert(MulticastGroup { mac: Mac([0x33, 0x33, 0x00, 0x00, 0x00, 0x01]), adi: 0 });
                }
            }
        }
        groups
    }

    /// `scan_multicast_groups() → (added, removed)` per spec.md §4.5. Updates
    /// the tap's internal set so a subsequent call only reports the delta.
    pub fn scan_multicast_groups(&mut self) -> (Vec<MulticastGroup>, Vec<MulticastGroup>) {
        let desired = self.derive_multicast_groups();
        let added: Vec<MulticastGroup> = desired.difference(&self.multicast_groups).cloned().collect();
        let removed: Vec<MulticastGroup> = self.multicast_groups.difference(&desired).cloned().collect();
        self.multicast_groups = desired;
        (added, removed)
    }

    /// Full diff of `routes` against `pushed`, per spec.md §4.5: routes in
    /// `pushed` but not held locally are to be added; routes held locally
    /// but not in `pushed` are to be removed. Routes with `via = None` are
    /// interface-local and ignored by both sides of the diff.
    pub fn reconcile_routes(&mut self, pushed: &[Route]) -> (Vec<Route>, Vec<Route>) {
        let relevant: Vec<&Route> = pushed.iter().filter(|r| !r.is_interface_local()).collect();
        let to_add: Vec<Route> = relevant.iter().filter(|r| !self.routes.contains(r)).map(|r| (*r).clone()).collect();
        let to_remove: Vec<Route> = self.routes.iter().filter(|r| !relevant.iter().any(|p| *p == r)).cloned().collect();
        self.routes.retain(|r| relevant.iter().any(|p| *p == r));
        for r in &to_add {
            self.routes.push(r.clone());
        }
        (to_add, to_remove)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn multicast_groups(&self) -> impl Iterator<Item = &MulticastGroup> {
        self.multicast_groups.iter()
    }
}

fn cmp(a: &IpNet, b: &IpNet) -> std::cmp::Ordering {
    (a.addr(), a.prefix_len()).cmp(&(b.addr(), b.prefix_len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_list_stays_sorted_and_deduplicated_across_add_and_remove() {
        let mut tap = VirtualTap::new(1, Mac::derive(1, 1), 2800);
        let a: IpNet = "10.1.0.2/24".parse().unwrap();
        let b: IpNet = "10.1.0.1/24".parse().unwrap();
        assert!(tap.add_ip(a));
        assert!(tap.add_ip(b));
        assert!(!tap.add_ip(a), "duplicate add must be a no-op");
        assert_eq!(tap.ips(), &[b, a]);
        assert!(tap.remove_ip(&b));
        assert_eq!(tap.ips(), &[a]);
    }

    #[test]
    fn multicast_scan_reports_only_the_delta() {
        let mut tap = VirtualTap::new(1, Mac::derive(1, 1), 2800);
        tap.add_ip("10.1.0.2/24".parse().unwrap());
        let (added, removed) = tap.scan_multicast_groups();
        assert_eq!(added.len(), 1);
        assert!(removed.is_empty());
        let (added2, removed2) = tap.scan_multicast_groups();
        assert!(added2.is_empty());
        assert!(removed2.is_empty());
        tap.remove_ip(&"10.1.0.2/24".parse().unwrap());
        let (added3, removed3) = tap.scan_multicast_groups();
        assert!(added3.is_empty());
        assert_eq!(removed3.len(), 1);
    }

    #[test]
    fn route_reconciliation_adds_and_removes_by_full_diff() {
        let mut tap = VirtualTap::new(1, Mac::derive(1, 1), 2800);
        let r1 = Route { target: "10.2.0.0/24".parse().unwrap(), via: Some("10.1.0.1".parse().unwrap()), flags: 0, metric: 0 };
        let local = Route { target: "10.1.0.0/24".parse().unwrap(), via: None, flags: 0, metric: 0 };
        let (added, removed) = tap.reconcile_routes(&[r1.clone(), local.clone()]);
        assert_eq!(added, vec![r1.clone()]);
        assert!(removed.is_empty());
        assert_eq!(tap.routes(), &[r1.clone()]);

        let (added2, removed2) = tap.reconcile_routes(&[]);
        assert!(added2.is_empty());
        assert_eq!(removed2, vec![r1]);
        assert!(tap.routes().is_empty());
    }

    #[test]
    fn mac_derivation_is_deterministic_and_locally_administered() {
        let m = Mac::derive(0x1234567890, 0xfeedfacecafef00d);
        assert_eq!(m, Mac::derive(0x1234567890, 0xfeedfacecafef00d));
        assert_eq!(m.0[0] & 0x01, 0, "must not be a multicast address");
        assert_eq!(m.0[0] & 0x02, 0x02, "must be locally administered");
    }
}
