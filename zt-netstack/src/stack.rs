// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The stack driver (component C6): owns the single TCP/IP stack thread,
//! one `smoltcp::iface::Interface`/`SocketSet` pair per joined network, and
//! the hibernation-multiplier poll cadence of spec.md §4.6. Generalizes
//! `vl1-service/src/vl1service.rs`'s single-background-thread-per-daemon
//! shape to a stack-thread-per-process instead of per-socket, since §4.6
//! requires exactly one thread servicing every tap.
//!
//! `SmolStack` implements both [`zt_core::tap::FrameSink`] (the tap's
//! inbound handoff) and [`zt_core::tap::NetifManager`] (netif lifecycle),
//! and is installed on a [`zt_core::service::NodeService`] as both. Its own
//! outbound path needs the `NodeService`'s [`OutboundFrameSink`]
//! implementation, which doesn't exist until `NodeService::new` has already
//! consumed this stack's `Arc`s — so, like [`zt_core::node::Node`]'s
//! frame/config sinks, it is wired late via [`SmolStack::set_outbound_sink`]
//! rather than threaded through the constructor.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::{Condvar, Mutex};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpCidr};

use zt_core::tap::{EthernetFrame, FrameSink, Mac, NetifManager, OutboundFrameSink};

use crate::device::{TapDevice, DEFAULT_DEVICE_RX_CAPACITY};

/// `GUARDED_BUF_CHECK_INTERVAL` from spec.md §4.6: the base cadence, in
/// milliseconds, at which the stack thread drains queued rx frames and
/// polls every live netif.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// `FRAMES_HANDLED_PER_CORE_CALL` from spec.md §4.6.
pub const DEFAULT_FRAMES_PER_CORE_CALL: usize = 16;

/// `HIBERNATION_MULTIPLIER` from spec.md §4.6: scales the poll interval up
/// when no tap is present, to avoid spinning the stack thread for nothing.
pub const DEFAULT_HIBERNATION_MULTIPLIER: u64 = 50;

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub poll_interval_ms: u64,
    pub frames_per_core_call: usize,
    pub hibernation_multiplier: u64,
    pub device_rx_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            frames_per_core_call: DEFAULT_FRAMES_PER_CORE_CALL,
            hibernation_multiplier: DEFAULT_HIBERNATION_MULTIPLIER,
            device_rx_capacity: DEFAULT_DEVICE_RX_CAPACITY,
        }
    }
}

/// One joined network's stack-side state: its device, its smoltcp
/// interface, and the socket set backing every façade socket bound to it.
pub struct Net {
    pub device: TapDevice,
    pub interface: Interface,
    pub sockets: SocketSet<'static>,
}

pub struct SmolStack {
    config: StackConfig,
    nets: DashMap<u64, Mutex<Net>>,
    outbound: Mutex<Option<Arc<dyn OutboundFrameSink>>>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    hibernating: AtomicBool,
    poll_tick: AtomicU32,
    /// Bumped and broadcast once per poll tick so the socket façade's
    /// blocking operations can wait on real stack progress (spec.md Design
    /// Note 9.5) instead of a fixed-interval sleep loop.
    activity_gen: Mutex<u64>,
    activity_cv: Condvar,
}

impl SmolStack {
    pub fn new(config: StackConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            nets: DashMap::new(),
            outbound: Mutex::new(None),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            hibernating: AtomicBool::new(true),
            poll_tick: AtomicU32::new(0),
            activity_gen: Mutex::new(0),
            activity_cv: Condvar::new(),
        })
    }

    /// Wire the overlay core's outbound sink. Must be called once before the
    /// stack thread is started (spec.md §4.5's outbound path has nowhere to
    /// go otherwise).
    pub fn set_outbound_sink(&self, sink: Arc<dyn OutboundFrameSink>) {
        *self.outbound.lock() = Some(sink);
    }

    fn outbound_sink(&self) -> Arc<dyn OutboundFrameSink> {
        self.outbound.lock().clone().expect("SmolStack::set_outbound_sink must be called before the stack runs")
    }

    /// Spawn the single stack thread (spec.md §5's "stack thread"). Call once
    /// after [`Self::set_outbound_sink`].
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        std::thread::Builder::new()
            .name("zt-stack".into())
            .spawn(move || this.poll_loop())
            .expect("failed to spawn stack thread")
    }

    pub fn terminate(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.thread.lock().take() {
            let _ = h.join();
        }
    }

    fn poll_loop(self: Arc<Self>) {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.poll_tick.fetch_add(1, Ordering::Relaxed);
            self.hibernating.store(self.nets.is_empty(), Ordering::Relaxed);
            self.poll_all();
            *self.activity_gen.lock() += 1;
            self.activity_cv.notify_all();
            let multiplier = if self.hibernating.load(Ordering::Relaxed) { self.config.hibernation_multiplier } else { 1 };
            std::thread::sleep(std::time::Duration::from_millis(self.config.poll_interval_ms * multiplier));
        }
    }

    /// Drain up to `frames_per_core_call` already-queued frames per network
    /// by polling its interface, then hand every live netif one more chance
    /// to make progress on its sockets even with no new input (timers,
    /// retransmits).
    fn poll_all(&self) {
        for entry in self.nets.iter() {
            let net_id = *entry.key();
            let mut net = entry.value().lock();
            let now = Instant::from_millis(zt_utils::ms_monotonic());
            let mut drained = 0;
            while drained < self.config.frames_per_core_call && net.device.pending_rx() > 0 {
                let Net { device, interface, sockets } = &mut *net;
                interface.poll(now, device, sockets);
                drained += 1;
            }
            let Net { device, interface, sockets } = &mut *net;
            interface.poll(now, device, sockets);
            let _ = net_id;
        }
    }

    /// Used by the socket façade to operate on a network's interface/socket
    /// set under its per-network lock.
    pub fn with_net<R>(&self, net_id: u64, f: impl FnOnce(&mut Net) -> R) -> Option<R> {
        self.nets.get(&net_id).map(|entry| f(&mut entry.value().lock()))
    }

    pub fn joined_net_ids(&self) -> Vec<u64> {
        self.nets.iter().map(|e| *e.key()).collect()
    }

    /// First assigned address of the requested family on any joined
    /// network, used by `bind`'s any-address resolution (spec.md §4.7).
    pub fn first_address(&self, want_v4: bool) -> Option<(u64, IpAddr)> {
        for entry in self.nets.iter() {
            let net = entry.value().lock();
            for cidr in net.interface.ip_addrs() {
                let addr = cidr_to_ipaddr(*cidr);
                if addr.is_ipv4() == want_v4 {
                    return Some((*entry.key(), addr));
                }
            }
        }
        None
    }

    pub fn allocate_socket_handle(&self, net_id: u64, handle: SocketHandle) -> Option<(u64, SocketHandle)> {
        self.nets.get(&net_id).map(|_| (net_id, handle))
    }

    /// Which joined network currently holds `addr`, used to resolve an
    /// explicit (non-wildcard) bind address to a netif (spec.md §4.7).
    pub fn net_for_address(&self, addr: IpAddr) -> Option<u64> {
        for entry in self.nets.iter() {
            let net = entry.value().lock();
            if net.interface.ip_addrs().iter().any(|c| cidr_to_ipaddr(*c) == addr) {
                return Some(*entry.key());
            }
        }
        None
    }

    /// `(rx_bytes, tx_bytes)` for a joined network, the data behind the
    /// `zts_get_all_stats`-equivalent `core_query_*` counters (spec.md §6
    /// expansion). `None` if `net_id` isn't currently joined.
    pub fn netif_stats(&self, net_id: u64) -> Option<(u64, u64)> {
        self.nets.get(&net_id).map(|entry| {
            let net = entry.value().lock();
            let stats = net.device.stats_handle();
            (stats.rx_bytes.load(Ordering::Relaxed), stats.tx_bytes.load(Ordering::Relaxed))
        })
    }

    pub fn activity_generation(&self) -> u64 {
        *self.activity_gen.lock()
    }

    /// Block the calling thread until the stack thread finishes another poll
    /// tick or `timeout` elapses, whichever is first, returning the
    /// generation observed afterwards. Used by the socket façade's blocking
    /// operations (spec.md Design Note 9.5) in place of a fixed sleep loop.
    pub fn wait_activity(&self, since: u64, timeout: Duration) -> u64 {
        let mut gen = self.activity_gen.lock();
        if *gen == since {
            self.activity_cv.wait_for(&mut gen, timeout);
        }
        *gen
    }
}

fn cidr_to_ipaddr(cidr: IpCidr) -> IpAddr {
    match cidr {
        IpCidr::Ipv4(c) => IpAddr::V4(c.address().into()),
        IpCidr::Ipv6(c) => IpAddr::V6(c.address().into()),
    }
}

fn ipnet_to_cidr(net: IpNet) -> IpCidr {
    match net {
        IpNet::V4(v4) => IpCidr::Ipv4(smoltcp::wire::Ipv4Cidr::new(v4.network().into(), v4.prefix_len())),
        IpNet::V6(v6) => IpCidr::Ipv6(smoltcp::wire::Ipv6Cidr::new(v6.network().into(), v6.prefix_len())),
    }
}

impl FrameSink for SmolStack {
    /// Inbound handoff (spec.md §4.5): synthesize the 14-byte Ethernet
    /// header the tap describes and push the resulting frame onto this
    /// network's device queue, dropping it if the queue is already at
    /// `MAX_GUARDED_RX_BUF_SZ`.
    fn submit_inbound_frame(&self, net_id: u64, frame: EthernetFrame) -> bool {
        let entry = match self.nets.get(&net_id) {
            Some(e) => e,
            None => return false,
        };
        let net = entry.value().lock();
        let rx = net.device.rx_handle();
        let mut queue = rx.lock();
        if queue.len() >= self.config.device_rx_capacity {
            return false;
        }
        let mut buf = Vec::with_capacity(14 + frame.payload.len());
        buf.extend_from_slice(&frame.dst.0);
        buf.extend_from_slice(&frame.src.0);
        buf.extend_from_slice(&frame.ethertype.to_be_bytes());
        buf.extend_from_slice(&frame.payload);
        queue.push_back(buf);
        true
    }
}

impl NetifManager for SmolStack {
    fn netif_up(&self, net_id: u64, mac: Mac, mtu: u16) {
        if self.nets.contains_key(&net_id) {
            return;
        }
        let mut device = TapDevice::new(net_id, mac, mtu, self.outbound_sink());
        let hw = HardwareAddress::Ethernet(EthernetAddress(mac.0));
        let config = Config::new(hw);
        let now = Instant::from_millis(zt_utils::ms_monotonic());
        let interface = Interface::new(config, &mut device, now);
        let sockets = SocketSet::new(Vec::new());
        self.nets.insert(net_id, Mutex::new(Net { device, interface, sockets }));
    }

    fn netif_set_mtu(&self, net_id: u64, mtu: u16) {
        if let Some(entry) = self.nets.get(&net_id) {
            entry.value().lock().device.set_mtu(mtu);
        }
    }

    fn netif_down(&self, net_id: u64) {
        self.nets.remove(&net_id);
    }

    fn add_ip(&self, net_id: u64, cidr: IpNet) {
        if let Some(entry) = self.nets.get(&net_id) {
            let mut net = entry.value().lock();
            let smol_cidr = ipnet_to_cidr(cidr);
            net.interface.update_ip_addrs(|addrs| {
                let _ = addrs.push(smol_cidr);
            });
        }
    }

    fn remove_ip(&self, net_id: u64, cidr: IpNet) {
        if let Some(entry) = self.nets.get(&net_id) {
            let mut net = entry.value().lock();
            let smol_cidr = ipnet_to_cidr(cidr);
            net.interface.update_ip_addrs(|addrs| {
                addrs.retain(|c| *c != smol_cidr);
            });
        }
    }
}
