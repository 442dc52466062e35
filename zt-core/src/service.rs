// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The Node Service (component C8): the orchestrator tying the Node facade,
//! state store, UDP binder, virtual taps and event queue into one running
//! service. Grounded on `vl1-service/src/vl1service.rs`'s `VL1Service` —
//! its `udp_bind_daemon`/`node_background_task_daemon` pair is the model
//! for this module's housekeeping thread, adapted from per-daemon
//! `tokio::spawn` tasks to the spec's three-long-lived-`std::thread` model
//! (one service thread here, one stack thread owned by `zt-netstack`, one
//! event-dispatcher thread owned by [`crate::event::Dispatcher`]) — a
//! deliberate deviation recorded in `DESIGN.md` since this crate has no
//! async runtime dependency to spawn tokio tasks on.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;

use zt_utils::error::Result;
use zt_utils::gate::AtomicIntervalGate;

use crate::binder::UdpBinder;
use crate::config::{NodeServiceConfig, LOCAL_INTERFACE_CHECK_INTERVAL_MS};
use crate::event::{Dispatcher, Event, EventHandler, EventQueue, TermReason};
use crate::network::{NetworkConfig, NetworkConfigSink, NetworkState};
use crate::node::Node;
use crate::peer::PeerPath;
use crate::store::{StateStore, StoreKind};
use crate::tap::{FrameSink, Mac, NetifManager, OutboundFrameSink, VirtualTap};

/// Lock order, narrowest to widest scope, enforced by convention (not by the
/// type system) throughout this module: `run` → `term_reason` → a given
/// `nets` shard → the state store's own internal lock → the event queue's
/// own internal lock. Code that must hold more than one of these at a time
/// acquires them in this order to avoid deadlock; nothing in this crate
/// currently needs more than one at a time.
struct RunState {
    running: bool,
    reader_threads: Vec<JoinHandle<()>>,
    background_thread: Option<JoinHandle<()>>,
    dispatcher: Option<Dispatcher>,
}

pub struct NodeService {
    node: Arc<dyn Node>,
    store: Arc<dyn StateStore>,
    binder: Arc<UdpBinder>,
    /// The stack driver's rx queue (C6), installed on `node` at `run()` time
    /// so the opaque overlay core has somewhere to deliver decoded inbound
    /// frames (spec.md §4.5).
    frame_sink: Arc<dyn FrameSink>,
    /// The stack driver's netif management surface (C6), used by the
    /// virtual-network-config callback to create/destroy netifs and mirror
    /// tap addresses (spec.md §4.6).
    netifs: Arc<dyn NetifManager>,
    events: Arc<EventQueue>,
    config: NodeServiceConfig,
    nets: DashMap<u64, NetworkState>,
    run: Mutex<RunState>,
    term_reason: Mutex<Option<TermReason>>,
    stop_flag: Arc<AtomicBool>,
    /// Cached result of the last `node.is_online()` poll, so
    /// [`NodeService::check_online_transition`] can tell a fresh
    /// `NODE_ONLINE`/`NODE_OFFLINE` from a repeated one.
    was_online: AtomicBool,
    /// Last-seen path set per peer, keyed by `(node_id, path address)`, so
    /// [`NodeService::reconcile_peer_paths`] can diff this tick's
    /// `node.peers()` against it and emit `PEER_PATH_DISCOVERED`/
    /// `PEER_PATH_DEAD` only on an actual transition.
    peer_paths: Mutex<HashMap<(u64, SocketAddr), PeerPath>>,
    /// Gates the local-interface-address refresh to
    /// [`LOCAL_INTERFACE_CHECK_INTERVAL_MS`].
    local_iface_gate: AtomicIntervalGate<LOCAL_INTERFACE_CHECK_INTERVAL_MS>,
}

impl NodeService {
    pub fn new(
        node: Arc<dyn Node>,
        store: Arc<dyn StateStore>,
        binder: Arc<UdpBinder>,
        frame_sink: Arc<dyn FrameSink>,
        netifs: Arc<dyn NetifManager>,
        config: NodeServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            store,
            binder,
            frame_sink,
            netifs,
            events: EventQueue::new(),
            config,
            nets: DashMap::new(),
            run: Mutex::new(RunState { running: false, reader_threads: Vec::new(), background_thread: None, dispatcher: None }),
            term_reason: Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
            was_online: AtomicBool::new(false),
            peer_paths: Mutex::new(HashMap::new()),
            local_iface_gate: AtomicIntervalGate::new(0),
        })
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    /// A cloneable handle to this service's [`OutboundFrameSink`]
    /// implementation, installed on the stack driver's netifs so outbound
    /// frames reach the overlay wire (C6→C4 handoff).
    pub fn outbound_frame_sink(self: &Arc<Self>) -> Arc<dyn OutboundFrameSink> {
        self.clone()
    }

    /// A cloneable handle to this service's [`NetworkConfigSink`]
    /// implementation, installed on the Node facade so `NETWORK_CONFIG_UP`/
    /// `CONFIG_UPDATE`/`DOWN`/`DESTROY` notifications reach the tap/netif
    /// lifecycle (spec.md §4.8).
    pub fn network_config_sink(self: &Arc<Self>) -> Arc<dyn NetworkConfigSink> {
        self.clone()
    }

    /// Start the service: wire the frame/network-config sinks onto the
    /// Node, spawn the event dispatcher, rejoin cached networks if
    /// configured to, perform an initial UDP bind, and spawn the background
    /// housekeeping thread plus one reader thread per bound UDP socket.
    /// Idempotent: calling `run` twice while already running is a no-op.
    pub fn run<H: EventHandler>(self: &Arc<Self>, handler: Arc<H>) -> Result<()> {
        let mut run = self.run.lock();
        if run.running {
            return Ok(());
        }

        self.node.set_frame_sink(self.frame_sink.clone());
        self.node.set_network_config_sink(self.network_config_sink());

        run.dispatcher = Some(Dispatcher::spawn(self.events.clone(), handler));
        self.events.enqueue(Event::NodeUp);

        if self.config.cached_network_rejoin_on_start {
            for net_id in self.store.cached_network_ids().unwrap_or_default() {
                self.join_network_locked(net_id);
            }
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        self.spawn_reader_threads(&mut run);
        run.background_thread = Some(self.spawn_background_thread());
        run.running = true;
        Ok(())
    }

    fn spawn_reader_threads(&self, run: &mut RunState) {
        for sock in self.binder.all_sockets() {
            let node = self.node.clone();
            let events = self.events.clone();
            let stop_flag = self.stop_flag.clone();
            let handle = std::thread::Builder::new()
                .name(format!("zt-udp-read-{}", sock.local))
                .spawn(move || {
                    let mut buf = vec![0u8; 65536];
                    while !stop_flag.load(Ordering::Relaxed) {
                        match sock.recv_from(&mut buf) {
                            Ok((n, from)) => {
                                if let Err(e) = node.process_wire_packet(sock.local, from, &buf[..n]) {
                                    if e.is_fatal() {
                                        events.enqueue(Event::NodeFatalError { message: e.to_string() });
                                        events.enqueue(Event::StackDown);
                                        break;
                                    }
                                }
                            }
                            Err(_) => {
                                if stop_flag.load(Ordering::Relaxed) {
                                    break;
                                }
                            }
                        }
                    }
                })
                .expect("failed to spawn UDP reader thread");
            run.reader_threads.push(handle);
        }
    }

    fn spawn_background_thread(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        std::thread::Builder::new()
            .name("zt-node-service".into())
            .spawn(move || this.background_loop())
            .expect("failed to spawn node service background thread")
    }

    fn background_loop(self: Arc<Self>) {
        let mut next_deadline = zt_utils::ms_monotonic();
        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }
            let now = zt_utils::ms_monotonic();
            if now >= next_deadline {
                match self.node.process_background_tasks(now) {
                    Ok(next) => next_deadline = next,
                    Err(e) => {
                        if e.is_fatal() {
                            self.events.enqueue(Event::NodeFatalError { message: e.to_string() });
                            self.events.enqueue(Event::StackDown);
                            break;
                        }
                        next_deadline = now + self.config.housekeeping_interval_ms;
                    }
                }
                self.housekeeping_tick(now);
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }

    /// One round of the periodic maintenance spec.md §4.5/§4.8 describe:
    /// online/offline transition detection, per-tap multicast/route
    /// reconciliation, peer-path diffing, local-interface-address refresh
    /// and stale-peer-cache pruning.
    fn housekeeping_tick(&self, now: i64) {
        self.check_online_transition();
        for mut state in self.nets.iter_mut() {
            if let Some(tap) = state.tap.as_mut() {
                if tap.due_for_housekeeping(now) {
                    let (added, removed) = tap.scan_multicast_groups();
                    for g in added {
                        let _ = self.node.multicast_subscribe(state.net_id, tap.mac, g.adi);
                        self.events.enqueue(Event::MulticastSubscribed { net_id: state.net_id, group: g });
                    }
                    for g in removed {
                        let _ = self.node.multicast_unsubscribe(state.net_id, tap.mac, g.adi);
                        self.events.enqueue(Event::MulticastUnsubscribed { net_id: state.net_id, group: g });
                    }
                    let (added_routes, removed_routes) = tap.reconcile_routes(&state.config.managed_routes);
                    for r in added_routes {
                        self.events.enqueue(Event::RouteAdded { net_id: state.net_id, route: r });
                    }
                    for r in removed_routes {
                        self.events.enqueue(Event::RouteRemoved { net_id: state.net_id, route: r });
                    }
                    tap.mark_housekeeping(now);
                }
            }
        }
        self.reconcile_peer_paths();
        self.refresh_local_interface_addresses(now);
        self.prune_stale_peers(now);
    }

    /// Poll `node.is_online()` and enqueue `NODE_ONLINE`/`NODE_OFFLINE`
    /// exactly once per transition, the same pattern
    /// [`NodeService::maybe_emit_ready`] uses for `NET_READY_*`/`NET_OK`.
    fn check_online_transition(&self) {
        let now_online = self.node.is_online();
        let was_online = self.was_online.swap(now_online, Ordering::SeqCst);
        if now_online && !was_online {
            self.events.enqueue(Event::NodeOnline);
        } else if !now_online && was_online {
            self.events.enqueue(Event::NodeOffline);
        }
    }

    /// Diff this tick's `node.peers()` path set against the previous one,
    /// emitting `PEER_PATH_DISCOVERED` for a path that's new or came back
    /// from expired, and `PEER_PATH_DEAD` for one that expired or vanished
    /// entirely (its peer was pruned, or the overlay core stopped reporting
    /// it).
    fn reconcile_peer_paths(&self) {
        let mut prev = self.peer_paths.lock();
        let mut seen: HashMap<(u64, SocketAddr), PeerPath> = HashMap::new();

        for snap in self.node.peers() {
            for path in &snap.paths {
                let key = (snap.node_id, path.address);
                let was_alive = prev.get(&key).map(|p| !p.expired);
                let alive = !path.expired;
                if alive && was_alive != Some(true) {
                    self.events.enqueue(Event::PeerPathDiscovered { node_id: snap.node_id, path: path.clone() });
                } else if !alive && was_alive == Some(true) {
                    self.events.enqueue(Event::PeerPathDead { node_id: snap.node_id, path: path.clone() });
                }
                seen.insert(key, path.clone());
            }
        }

        for (key, old_path) in prev.iter() {
            if !old_path.expired && !seen.contains_key(key) {
                self.events.enqueue(Event::PeerPathDead { node_id: key.0, path: old_path.clone() });
            }
        }

        *prev = seen;
    }

    /// Every address currently assigned to one of this node's joined
    /// networks' taps, across every network — fed to [`UdpBinder::refresh`]
    /// so the binder never binds one of its own virtual addresses
    /// (spec.md §4.3).
    pub fn all_tap_addresses(&self) -> Vec<IpAddr> {
        self.nets.iter().flat_map(|s| s.tap.as_ref().map(|t| t.ips().iter().map(|c| c.addr()).collect::<Vec<_>>()).unwrap_or_default()).collect()
    }

    /// Every [`LOCAL_INTERFACE_CHECK_INTERVAL_MS`], re-derive the local
    /// interface addresses reported to the overlay core from the binder's
    /// currently-bound sockets (spec.md:184,
    /// `ZT_LOCAL_INTERFACE_CHECK_INTERVAL`).
    fn refresh_local_interface_addresses(&self, now: i64) {
        if !self.local_iface_gate.gate(now) {
            return;
        }
        let _ = self.node.clear_local_interface_addresses();
        for addr in self.binder.all_bound_local_interface_addresses() {
            let _ = self.node.add_local_interface_address(addr);
        }
    }

    /// Evict cached peer records that have gone unused longer than
    /// `config.peer_prune_max_age_ms`, the generalized form of the
    /// original's secondary-port "coma" heuristic (spec.md Design Note 9):
    /// rather than only pruning stale UDP bindings, anything in the state
    /// store that has gone this long unreferenced is dropped so `peers.d`
    /// doesn't grow without bound across node restarts.
    fn prune_stale_peers(&self, now: i64) {
        let live: std::collections::HashSet<u64> = self.node.peers().into_iter().map(|p| p.node_id).collect();
        if let Ok(cached) = self.store.cached_peer_ids() {
            for id in cached {
                if !live.contains(&id) {
                    let _ = self.store.erase(StoreKind::Peer(id));
                }
            }
        }
        let _ = now;
    }

    pub fn join_network(&self, net_id: u64) -> Result<()> {
        self.join_network_locked(net_id);
        Ok(())
    }

    fn join_network_locked(&self, net_id: u64) {
        if self.nets.contains_key(&net_id) {
            return;
        }
        let _ = self.node.join_network(net_id);
        self.nets.insert(net_id, NetworkState::new(net_id));
        self.events.enqueue(Event::NetReqConfig { net_id });
    }

    pub fn leave_network(&self, net_id: u64) -> Result<()> {
        if self.nets.remove(&net_id).is_some() {
            let _ = self.node.leave_network(net_id);
            let _ = self.store.erase(StoreKind::Network(net_id));
            self.events.enqueue(Event::NetDown { net_id });
        }
        Ok(())
    }

    pub fn joined_networks(&self) -> Vec<u64> {
        self.nets.iter().map(|e| *e.key()).collect()
    }

    pub fn orbit(&self, world_id: u64, seed: u64) -> Result<()> {
        self.node.orbit(world_id, seed)
    }

    pub fn deorbit(&self, world_id: u64) -> Result<()> {
        self.node.deorbit(world_id)
    }

    /// `node_get_id()`/`node_is_online()` from spec.md §6.
    pub fn node_id(&self) -> crate::node::NodeId {
        self.node.id()
    }

    pub fn is_online(&self) -> bool {
        self.node.is_online()
    }

    pub fn peers(&self) -> Vec<crate::peer::PeerSnapshot> {
        self.node.peers()
    }

    /// The UDP ports currently bound by the binder, backing
    /// `zts_node_get_port` (spec.md §6).
    pub fn bound_ports(&self) -> Vec<u16> {
        self.binder.bound_ports()
    }

    /// Snapshot of a joined network's assigned addresses, for the
    /// `core_query_*` address-listing helpers (spec.md §6).
    pub fn network_addresses(&self, net_id: u64) -> Vec<IpNet> {
        self.nets.get(&net_id).map(|s| s.tap.as_ref().map(|t| t.ips().to_vec()).unwrap_or_default()).unwrap_or_default()
    }

    /// Snapshot of a joined network's reconciled routes, for the
    /// `core_query_*` route-listing helpers (spec.md §6).
    pub fn network_routes(&self, net_id: u64) -> Vec<crate::network::Route> {
        self.nets.get(&net_id).map(|s| s.tap.as_ref().map(|t| t.routes().to_vec()).unwrap_or_default()).unwrap_or_default()
    }

    /// Snapshot of a joined network's multicast subscriptions, for the
    /// `core_query_*` multicast-listing helper (spec.md §6).
    pub fn network_multicast_groups(&self, net_id: u64) -> Vec<crate::tap::MulticastGroup> {
        self.nets.get(&net_id).map(|s| s.tap.as_ref().map(|t| t.multicast_groups().copied().collect()).unwrap_or_default()).unwrap_or_default()
    }

    pub fn network_transport_ready(&self, net_id: u64) -> bool {
        self.nets.get(&net_id).map(|s| s.ok_sent).unwrap_or(false)
    }

    pub fn send_wire(&self, local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Result<usize> {
        self.binder.send(local, remote, data)
    }

    /// Stop every spawned thread and enqueue the closing `NODE_DOWN` /
    /// `STACK_DOWN` pair. Blocks until the dispatcher thread (and therefore
    /// every previously-enqueued event) has drained.
    pub fn terminate(&self, reason: TermReason) {
        *self.term_reason.lock() = Some(reason.clone());
        self.stop_flag.store(true, Ordering::SeqCst);
        self.binder.close_all(); // unblocks any thread parked in recv_from

        let mut run = self.run.lock();
        if !run.running {
            return;
        }
        self.events.enqueue(Event::NodeDown { reason });
        self.events.enqueue(Event::StackDown);

        for h in run.reader_threads.drain(..) {
            let _ = h.join();
        }
        if let Some(h) = run.background_thread.take() {
            let _ = h.join();
        }
        if let Some(d) = run.dispatcher.take() {
            d.join();
        }
        run.running = false;
    }

    pub fn term_reason(&self) -> Option<TermReason> {
        self.term_reason.lock().clone()
    }

    /// `sync_managed_stuff` from spec.md §4.8: diff `config.assigned_addresses`
    /// against the tap's current IPs and against `state.managed_ips`,
    /// mirroring every difference onto the stack's netif (via [`NetifManager`])
    /// and emitting the corresponding `ADDR_ADDED_*`/`ADDR_REMOVED_*` event.
    fn sync_managed_stuff(&self, net_id: u64, state: &mut NetworkState, config: &NetworkConfig) {
        let tap = match state.tap.as_mut() {
            Some(t) => t,
            None => return,
        };

        let desired: Vec<IpNet> = config.assigned_addresses.clone();

        let to_remove: Vec<IpNet> = tap.ips().iter().filter(|c| !desired.contains(c)).cloned().collect();
        for cidr in to_remove {
            tap.remove_ip(&cidr);
            state.forget_managed_ip(&cidr);
            self.netifs.remove_ip(net_id, cidr);
            self.emit_addr_event(net_id, cidr, false);
        }

        for cidr in &desired {
            if tap.add_ip(*cidr) {
                state.note_managed_ip(*cidr);
                self.netifs.add_ip(net_id, *cidr);
                self.emit_addr_event(net_id, *cidr, true);
            }
        }
    }

    fn emit_addr_event(&self, net_id: u64, cidr: IpNet, added: bool) {
        let event = match (cidr.addr(), added) {
            (IpAddr::V4(addr), true) => Event::AddrAddedV4 { net_id, addr, prefix: cidr.prefix_len() },
            (IpAddr::V4(addr), false) => Event::AddrRemovedV4 { net_id, addr, prefix: cidr.prefix_len() },
            (IpAddr::V6(addr), true) => Event::AddrAddedV6 { net_id, addr, prefix: cidr.prefix_len() },
            (IpAddr::V6(addr), false) => Event::AddrRemovedV6 { net_id, addr, prefix: cidr.prefix_len() },
        };
        self.events.enqueue(event);
    }

    /// Emit `NET_READY_V4`/`NET_READY_V6` the first time the tap holds an
    /// address of that family, and `NET_OK` the first time either fires,
    /// per spec.md §8's "at most one NET_READY_V4 per NET_DOWN..NET_DOWN
    /// window" and "NET_READY_* precedes NET_OK" invariants.
    fn maybe_emit_ready(&self, net_id: u64, state: &mut NetworkState) {
        let (has_v4, has_v6) = match &state.tap {
            Some(t) => (t.ips().iter().any(|c| c.addr().is_ipv4()), t.ips().iter().any(|c| c.addr().is_ipv6())),
            None => (false, false),
        };
        if has_v4 && !state.ready_v4_sent {
            state.ready_v4_sent = true;
            self.events.enqueue(Event::NetReadyV4 { net_id });
        }
        if has_v6 && !state.ready_v6_sent {
            state.ready_v6_sent = true;
            self.events.enqueue(Event::NetReadyV6 { net_id });
        }
        if (state.ready_v4_sent || state.ready_v6_sent) && !state.ok_sent {
            state.ok_sent = true;
            self.events.enqueue(Event::NetOk { net_id });
        }
    }
}

impl OutboundFrameSink for NodeService {
    /// C6→C4 handoff: the stack driver's netif TX callback strips the
    /// Ethernet header and calls this to place the frame on the overlay
    /// wire (spec.md §4.5 "Outbound").
    fn send_virtual_network_frame(&self, net_id: u64, src: Mac, dst: Mac, ethertype: u16, vlan: u16, payload: &[u8]) -> bool {
        self.node.process_virtual_network_frame(net_id, src, dst, ethertype, vlan, payload).is_ok()
    }
}

impl NetworkConfigSink for NodeService {
    fn network_up(&self, net_id: u64, mac: Mac, config: NetworkConfig) {
        let mut state = match self.nets.get_mut(&net_id) {
            Some(s) => s,
            None => return, // config pushed for a network we never (or no longer) joined
        };
        if state.tap.is_none() {
            state.tap = Some(VirtualTap::new(net_id, mac, config.mtu));
            self.netifs.netif_up(net_id, mac, config.mtu);
            self.events.enqueue(Event::NetifUp { net_id });
        }
        drop(state);
        self.network_config_update(net_id, config);
    }

    fn network_config_update(&self, net_id: u64, config: NetworkConfig) {
        let mut state = match self.nets.get_mut(&net_id) {
            Some(s) => s,
            None => return,
        };
        let mtu_changed = state.config.mtu != config.mtu && state.config.mtu != 0;
        state.config = config.clone();
        self.sync_managed_stuff(net_id, &mut state, &config);
        if mtu_changed {
            self.netifs.netif_set_mtu(net_id, config.mtu);
        }
        self.maybe_emit_ready(net_id, &mut state);
        let _ = self.store.put(StoreKind::Network(net_id), &config.raw);
        self.events.enqueue(Event::NetUpdate { net_id });
    }

    fn network_down(&self, net_id: u64) {
        if let Some(mut state) = self.nets.get_mut(&net_id) {
            state.tap = None;
            state.ready_v4_sent = false;
            state.ready_v6_sent = false;
            state.ok_sent = false;
        }
        self.netifs.netif_down(net_id);
        self.events.enqueue(Event::NetifDown { net_id });
        self.events.enqueue(Event::NetDown { net_id });
    }

    fn network_destroy(&self, net_id: u64) {
        self.netifs.netif_down(net_id);
        self.nets.remove(&net_id);
        let _ = self.store.erase(StoreKind::Network(net_id));
        self.events.enqueue(Event::NetifRemoved { net_id });
        self.events.enqueue(Event::NetDown { net_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::BindPolicy;
    use crate::node::test_support::FakeNode;
    use crate::store::MemoryStore;
    use std::sync::Mutex as StdMutex;

    struct NoopFrameSink;
    impl FrameSink for NoopFrameSink {
        fn submit_inbound_frame(&self, _net_id: u64, _frame: crate::tap::EthernetFrame) -> bool {
            true
        }
    }

    struct NoopNetifs;
    impl NetifManager for NoopNetifs {
        fn netif_up(&self, _net_id: u64, _mac: Mac, _mtu: u16) {}
        fn netif_set_mtu(&self, _net_id: u64, _mtu: u16) {}
        fn netif_down(&self, _net_id: u64) {}
        fn add_ip(&self, _net_id: u64, _cidr: IpNet) {}
        fn remove_ip(&self, _net_id: u64, _cidr: IpNet) {}
    }

    fn service() -> Arc<NodeService> {
        service_with_node().0
    }

    fn service_with_node() -> (Arc<NodeService>, Arc<FakeNode>) {
        let node = Arc::new(FakeNode::new(1));
        let store = Arc::new(MemoryStore::new());
        let binder = Arc::new(UdpBinder::new(vec![], BindPolicy::default()));
        let svc = NodeService::new(node.clone(), store, binder, Arc::new(NoopFrameSink), Arc::new(NoopNetifs), NodeServiceConfig::default());
        (svc, node)
    }

    #[test]
    fn join_then_leave_updates_joined_networks_and_node() {
        let svc = service();
        svc.join_network(42).unwrap();
        assert_eq!(svc.joined_networks(), vec![42]);
        svc.leave_network(42).unwrap();
        assert!(svc.joined_networks().is_empty());
    }

    #[test]
    fn joining_twice_is_idempotent_and_only_enqueues_once() {
        let svc = service();
        let seen: Arc<StdMutex<Vec<_>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        svc.run(Arc::new(move |e: &Event| seen2.lock().unwrap().push(e.code()))).unwrap();
        svc.join_network(7).unwrap();
        svc.join_network(7).unwrap();
        svc.terminate(TermReason::Requested);
        let codes = seen.lock().unwrap();
        assert_eq!(codes.iter().filter(|c| **c == crate::event::EventCode::NetReqConfig).count(), 1);
    }

    #[test]
    fn terminate_delivers_node_down_then_stack_down_last() {
        let svc = service();
        let seen: Arc<StdMutex<Vec<_>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        svc.run(Arc::new(move |e: &Event| seen2.lock().unwrap().push(e.code()))).unwrap();
        svc.terminate(TermReason::Requested);
        let codes = seen.lock().unwrap();
        assert_eq!(*codes.last().unwrap(), crate::event::EventCode::StackDown);
        assert_eq!(svc.term_reason(), Some(TermReason::Requested));
    }

    #[test]
    fn check_online_transition_emits_exactly_once_per_flip() {
        let (svc, node) = service_with_node();
        node.online.store(true, Ordering::SeqCst);
        svc.check_online_transition();
        svc.check_online_transition();
        node.online.store(false, Ordering::SeqCst);
        svc.check_online_transition();
        node.online.store(false, Ordering::SeqCst);
        svc.check_online_transition();
        let codes: Vec<_> = svc.events.drain().iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec![crate::event::EventCode::NodeOnline, crate::event::EventCode::NodeOffline]);
    }

    fn peer_path(addr: &str, expired: bool) -> PeerPath {
        PeerPath { address: addr.parse().unwrap(), last_send: 0, last_recv: 0, trusted_path_id: 0, expired, preferred: true }
    }

    #[test]
    fn reconcile_peer_paths_discovers_then_kills_a_path() {
        use crate::peer::{PeerRole, PeerSnapshot};

        let (svc, node) = service_with_node();

        *node.peers.lock() = vec![PeerSnapshot {
            node_id: 9,
            role: PeerRole::Leaf,
            version_major: 1,
            version_minor: 0,
            version_rev: 0,
            latency_ms: 5,
            paths: vec![peer_path("10.0.0.9:9993", false)],
        }];
        svc.reconcile_peer_paths();
        let codes: Vec<_> = svc.events.drain().iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec![crate::event::EventCode::PeerPathDiscovered]);

        // unchanged snapshot: no repeat event
        svc.reconcile_peer_paths();
        assert!(svc.events.drain().is_empty());

        // path disappears entirely -> dead
        node.peers.lock().clear();
        svc.reconcile_peer_paths();
        let codes: Vec<_> = svc.events.drain().iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec![crate::event::EventCode::PeerPathDead]);
    }

    #[test]
    fn all_tap_addresses_is_empty_with_no_joined_networks() {
        let svc = service();
        assert!(svc.all_tap_addresses().is_empty());
    }

    #[test]
    fn refresh_local_interface_addresses_is_gated_and_mirrors_the_binder() {
        let node = Arc::new(FakeNode::new(1));
        let store = Arc::new(MemoryStore::new());
        let binder = Arc::new(UdpBinder::new(vec![0], BindPolicy::default()));
        binder.refresh(&[("eth0".to_string(), "127.0.0.1".parse().unwrap())], &[]).unwrap();
        let svc =
            NodeService::new(node.clone(), store, binder.clone(), Arc::new(NoopFrameSink), Arc::new(NoopNetifs), NodeServiceConfig::default());

        svc.refresh_local_interface_addresses(0);
        assert!(node.local_interface_addresses.lock().is_empty(), "gated at the initial tick, before one full interval has elapsed");

        svc.refresh_local_interface_addresses(LOCAL_INTERFACE_CHECK_INTERVAL_MS);
        assert_eq!(*node.local_interface_addresses.lock(), binder.all_bound_local_interface_addresses());

        // a second call inside the same interval is gated and does nothing further
        node.local_interface_addresses.lock().clear();
        svc.refresh_local_interface_addresses(LOCAL_INTERFACE_CHECK_INTERVAL_MS + 10);
        assert!(node.local_interface_addresses.lock().is_empty());
    }
}
