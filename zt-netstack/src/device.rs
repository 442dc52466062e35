// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! A `smoltcp::phy::Device` over one network's rx queue, grounded on the
//! `Device`/`RxToken`/`TxToken` GAT pattern used throughout the retrieval
//! pack's `smoltcp`-based drivers (e.g. the VirtIO device wrapper in
//! `other_examples`'s `netoneko-akuma` smoltcp driver): `receive` pops a
//! frame off a queue, `transmit` hands back a scratch buffer whose `consume`
//! forwards the finished frame to whatever sits downstream.
//!
//! Unlike the original C++ stack driver, which fed every joined network's
//! frames through a single rx queue and then dispatched each to the right
//! netif by inspecting its Ethernet type and destination address (spec.md
//! §4.6), this driver gives each network its own [`TapDevice`]: the tap
//! already knows which `net_id` a frame belongs to at enqueue time, so the
//! ethertype/dst-based routing step the original needed is unnecessary here
//! — see `DESIGN.md`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;

use zt_core::tap::{Mac, OutboundFrameSink};

/// Per-netif byte counters, the `zts_get_all_stats`-equivalent counters
/// `core_query_*` exposes read-only (spec.md §6 expansion). Shared with the
/// [`TapTxToken`] so transmitted bytes are counted from inside
/// `phy::TxToken::consume`, which runs without access to `&mut TapDevice`.
#[derive(Default)]
pub struct DeviceStats {
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
}

/// Bound on how many not-yet-processed inbound frames a single network's
/// device may hold, the per-network analogue of spec.md §4.5's
/// `MAX_GUARDED_RX_BUF_SZ`. Enforced by the caller that pushes frames in
/// ([`crate::stack::SmolStack::submit_inbound_frame`]), not by this type.
pub const DEFAULT_DEVICE_RX_CAPACITY: usize = 256;

/// One network's half of the stack/tap boundary: an inbound frame queue the
/// tap feeds and an outbound path that hands finished frames to the overlay
/// core via [`OutboundFrameSink`].
pub struct TapDevice {
    net_id: u64,
    mac: Mac,
    mtu: usize,
    rx: Arc<Mutex<VecDeque<Vec<u8>>>>,
    sink: Arc<dyn OutboundFrameSink>,
    stats: Arc<DeviceStats>,
}

impl TapDevice {
    pub fn new(net_id: u64, mac: Mac, mtu: u16, sink: Arc<dyn OutboundFrameSink>) -> Self {
        Self { net_id, mac, mtu: mtu as usize, rx: Arc::new(Mutex::new(VecDeque::new())), sink, stats: Arc::new(DeviceStats::default()) }
    }

    pub fn stats_handle(&self) -> Arc<DeviceStats> {
        self.stats.clone()
    }

    /// A cloneable handle to this device's rx queue, retained by the stack
    /// driver so it can push frames in without holding a `&mut TapDevice`
    /// (the device itself is borrowed mutably only for the duration of
    /// `Interface::poll`).
    pub fn rx_handle(&self) -> Arc<Mutex<VecDeque<Vec<u8>>>> {
        self.rx.clone()
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu as usize;
    }

    pub fn pending_rx(&self) -> usize {
        self.rx.lock().len()
    }
}

impl Device for TapDevice {
    type RxToken<'a> = TapRxToken;
    type TxToken<'a> = TapTxToken;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.lock().pop_front()?;
        self.stats.rx_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Some((
            TapRxToken { frame },
            TapTxToken { net_id: self.net_id, src: self.mac, sink: self.sink.clone(), stats: self.stats.clone() },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TapTxToken { net_id: self.net_id, src: self.mac, sink: self.sink.clone(), stats: self.stats.clone() })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

pub struct TapRxToken {
    frame: Vec<u8>,
}

impl phy::RxToken for TapRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.frame)
    }
}

/// Hands a finished Ethernet frame to the overlay core's outbound path,
/// stripping the 14-byte header the way spec.md §4.5's "outbound" step
/// describes: extract `src_mac`, `dst_mac`, `ethertype`, then forward only
/// the payload.
pub struct TapTxToken {
    net_id: u64,
    src: Mac,
    sink: Arc<dyn OutboundFrameSink>,
    stats: Arc<DeviceStats>,
}

impl phy::TxToken for TapTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        if buf.len() >= 14 {
            let mut dst = [0u8; 6];
            dst.copy_from_slice(&buf[0..6]);
            let ethertype = u16::from_be_bytes([buf[12], buf[13]]);
            self.stats.tx_bytes.fetch_add((buf.len() - 14) as u64, Ordering::Relaxed);
            self.sink.send_virtual_network_frame(self.net_id, self.src, Mac(dst), ethertype, 0, &buf[14..]);
        }
        result
    }
}
