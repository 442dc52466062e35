// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The Node facade (component C4). Per spec.md §1, the overlay's identity,
//! consensus and path-discovery machinery is explicitly out of scope and is
//! treated as an opaque collaborator — the role played by `Node` in the
//! teacher's `zerotier-network-hypervisor::vl1::Node`, but inverted: there we
//! found a concrete struct that calls out to a `SystemInterface` the host
//! implements; here the orchestrator (C8) is the caller and the overlay core
//! is the thing behind a trait object, so any real ZeroTier-protocol engine
//! (or a test double) can be plugged in without this crate knowing its guts.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use zt_utils::error::Result;

use crate::network::NetworkConfigSink;
use crate::peer::PeerSnapshot;
use crate::tap::{FrameSink, Mac};

/// A 40-bit ZeroTier-style overlay address, newtyped so it can't be confused
/// with a network ID or any other bare `u64` floating around the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:010x}", self.0 & 0xff_ffff_ffff)
    }
}

/// Outcome of a join/leave/frame-submission call into the overlay core,
/// mirrored from `ZtError` so FFI callers get the same numeric space
/// regardless of which layer produced the failure.
pub type NodeResult<T> = Result<T>;

/// The capability the Node Service (C8) depends on. A production build
/// plugs in a real overlay-protocol engine; tests plug in a fake that only
/// tracks which networks were joined, matching the teacher's pattern of
/// testing `Switch`/`InnerProtocol` consumers against trait objects rather
/// than the concrete VL1 engine.
pub trait Node: Send + Sync {
    /// This node's own overlay address.
    fn id(&self) -> NodeId;

    /// Join a network by its 64-bit ID. Idempotent: joining an
    /// already-joined network is not an error.
    fn join_network(&self, net_id: u64) -> NodeResult<()>;

    /// Leave a network. Idempotent: leaving a network that was never
    /// joined is not an error.
    fn leave_network(&self, net_id: u64) -> NodeResult<()>;

    /// Add a root-set ("moon") to this node's orbit, per spec.md §6's
    /// `moon_orbit(world_id, seed)`. `seed` is an optional bootstrap address
    /// hint, opaque to this crate.
    fn orbit(&self, world_id: u64, seed: u64) -> NodeResult<()>;

    /// Remove a previously-orbited root set.
    fn deorbit(&self, world_id: u64) -> NodeResult<()>;

    /// Hand a UDP datagram received on a bound socket to the overlay core
    /// for decoding. `local` is the address the packet arrived on (a node
    /// may have several bound UDP ports); `remote` is the packet's source.
    fn process_wire_packet(&self, local: SocketAddr, remote: SocketAddr, data: &[u8]) -> NodeResult<()>;

    /// Hand an outbound Ethernet frame from a joined network's tap/stack to
    /// the overlay core for encapsulation and transmission to the
    /// appropriate peer(s).
    fn process_virtual_network_frame(&self, net_id: u64, src: Mac, dst: Mac, ethertype: u16, vlan: u16, payload: &[u8]) -> NodeResult<()>;

    /// Run one round of background housekeeping (path re-verification,
    /// peer aging, root rotation, whois retries — all internal to the
    /// opaque core). Returns the monotonic-clock deadline (ms) by which
    /// this must be called again at the latest.
    fn process_background_tasks(&self, now: i64) -> NodeResult<i64>;

    fn multicast_subscribe(&self, net_id: u64, mac: Mac, adi: u32) -> NodeResult<()>;
    fn multicast_unsubscribe(&self, net_id: u64, mac: Mac, adi: u32) -> NodeResult<()>;

    /// Currently joined network IDs.
    fn networks(&self) -> Vec<u64>;

    /// A point-in-time snapshot of every known peer. Expensive; called only
    /// on demand (status queries) and on a slow housekeeping cadence, never
    /// per-packet.
    fn peers(&self) -> Vec<PeerSnapshot>;

    /// `true` once the overlay core believes it has at least one reachable
    /// root/moon and can be considered online (drives `NODE_ONLINE` /
    /// `NODE_OFFLINE`).
    fn is_online(&self) -> bool;

    /// Tell the overlay core about one of this node's currently-bound local
    /// UDP addresses, a candidate path for peers reaching this node
    /// directly (spec.md:184). The Node Service (C8) calls this from its
    /// periodic local-interface-address refresh, always preceded in the
    /// same pass by [`Node::clear_local_interface_addresses`].
    fn add_local_interface_address(&self, addr: IpAddr) -> NodeResult<()>;

    /// Drop every local interface address previously reported via
    /// [`Node::add_local_interface_address`], so a stale address whose
    /// interface has gone away isn't offered to peers past its refresh.
    fn clear_local_interface_addresses(&self) -> NodeResult<()>;

    /// Install the sink that receives frames the overlay core decodes off
    /// the wire for a joined network (spec.md §4.5 inbound path). The Node
    /// Service (C8) calls this once during [`crate::service::NodeService::run`],
    /// before any UDP reader thread starts, so every inbound frame the
    /// opaque core ever produces has somewhere to go. A real overlay engine
    /// stores this and calls it from whatever internal callback it already
    /// invokes on frame receipt; `FakeNode` stores it only so tests can
    /// assert it was wired.
    fn set_frame_sink(&self, sink: Arc<dyn FrameSink>);

    /// Install the sink that receives `NETWORK_CONFIG_UP`/`CONFIG_UPDATE`/
    /// `DOWN`/`DESTROY` notifications (spec.md §4.8). Called once during
    /// `NodeService::run`, same as [`Node::set_frame_sink`].
    fn set_network_config_sink(&self, sink: Arc<dyn NetworkConfigSink>);
}

/// A `Node` implementation with nowhere to go: it tracks joined networks and
/// nothing else, never becomes `online`, and never exchanges a packet with
/// anyone. Used by this crate's own tests, and by `zt-service` as the
/// default when no real overlay-protocol engine has been linked in (spec.md
/// §1 treats that engine as an external collaborator this workspace does
/// not implement) — the same "plug in a real engine or a test double" role
/// described on the [`Node`] trait above.
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    pub struct FakeNode {
        pub id: NodeId,
        pub online: std::sync::atomic::AtomicBool,
        joined: Mutex<BTreeSet<u64>>,
        pub frame_sink: Mutex<Option<Arc<dyn FrameSink>>>,
        pub network_config_sink: Mutex<Option<Arc<dyn NetworkConfigSink>>>,
        pub local_interface_addresses: Mutex<Vec<IpAddr>>,
        /// Test-injectable stand-in for whatever the real overlay core would
        /// report from [`Node::peers`]; empty by default.
        pub peers: Mutex<Vec<PeerSnapshot>>,
    }

    impl FakeNode {
        pub fn new(id: u64) -> Self {
            Self {
                id: NodeId(id),
                online: std::sync::atomic::AtomicBool::new(false),
                joined: Mutex::new(BTreeSet::new()),
                frame_sink: Mutex::new(None),
                network_config_sink: Mutex::new(None),
                local_interface_addresses: Mutex::new(Vec::new()),
                peers: Mutex::new(Vec::new()),
            }
        }
    }

    impl Node for FakeNode {
        fn id(&self) -> NodeId {
            self.id
        }

        fn join_network(&self, net_id: u64) -> NodeResult<()> {
            self.joined.lock().insert(net_id);
            Ok(())
        }

        fn leave_network(&self, net_id: u64) -> NodeResult<()> {
            self.joined.lock().remove(&net_id);
            Ok(())
        }

        fn orbit(&self, _world_id: u64, _seed: u64) -> NodeResult<()> {
            Ok(())
        }

        fn deorbit(&self, _world_id: u64) -> NodeResult<()> {
            Ok(())
        }

        fn process_wire_packet(&self, _local: SocketAddr, _remote: SocketAddr, _data: &[u8]) -> NodeResult<()> {
            Ok(())
        }

        fn process_virtual_network_frame(&self, _net_id: u64, _src: Mac, _dst: Mac, _ethertype: u16, _vlan: u16, _payload: &[u8]) -> NodeResult<()> {
            Ok(())
        }

        fn process_background_tasks(&self, now: i64) -> NodeResult<i64> {
            Ok(now + 1000)
        }

        fn multicast_subscribe(&self, _net_id: u64, _mac: Mac, _adi: u32) -> NodeResult<()> {
            Ok(())
        }

        fn multicast_unsubscribe(&self, _net_id: u64, _mac: Mac, _adi: u32) -> NodeResult<()> {
            Ok(())
        }

        fn networks(&self) -> Vec<u64> {
            self.joined.lock().iter().copied().collect()
        }

        fn peers(&self) -> Vec<PeerSnapshot> {
            self.peers.lock().clone()
        }

        fn is_online(&self) -> bool {
            self.online.load(std::sync::atomic::Ordering::Relaxed)
        }

        fn add_local_interface_address(&self, addr: IpAddr) -> NodeResult<()> {
            self.local_interface_addresses.lock().push(addr);
            Ok(())
        }

        fn clear_local_interface_addresses(&self) -> NodeResult<()> {
            self.local_interface_addresses.lock().clear();
            Ok(())
        }

        fn set_frame_sink(&self, sink: Arc<dyn FrameSink>) {
            *self.frame_sink.lock() = Some(sink);
        }

        fn set_network_config_sink(&self, sink: Arc<dyn NetworkConfigSink>) {
            *self.network_config_sink.lock() = Some(sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeNode;
    use super::*;

    #[test]
    fn join_and_leave_are_idempotent() {
        let n = FakeNode::new(1);
        assert!(n.join_network(42).is_ok());
        assert!(n.join_network(42).is_ok());
        assert_eq!(n.networks(), vec![42]);
        assert!(n.leave_network(42).is_ok());
        assert!(n.leave_network(42).is_ok());
        assert!(n.networks().is_empty());
    }

    #[test]
    fn node_id_formats_as_ten_hex_digits() {
        assert_eq!(NodeId(0xabcdef0123).to_string(), "abcdef0123");
    }

    #[test]
    fn local_interface_addresses_accumulate_and_clear() {
        let n = FakeNode::new(1);
        n.add_local_interface_address("10.0.0.1".parse().unwrap()).unwrap();
        n.add_local_interface_address("10.0.0.2".parse().unwrap()).unwrap();
        assert_eq!(n.local_interface_addresses.lock().len(), 2);
        n.clear_local_interface_addresses().unwrap();
        assert!(n.local_interface_addresses.lock().is_empty());
    }
}
