// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The `core_query_*` read-only snapshot helpers (spec.md §6), plus the
//! `zts_get_all_network_routes` and per-netif byte-counter query dropped by
//! the distillation and reintroduced per `original_source`'s
//! `ZT1Service.h` (SPEC_FULL.md §6 expansion). Every query call takes the
//! same `RUNTIME` lock the lifecycle ABI does, so `core_lock_obtain`/
//! `core_lock_release` wrap a *separate* advisory lock a host can hold
//! across several query calls to get a consistent multi-call snapshot
//! without blocking `zts_node_start`/`zts_node_stop` on some other thread.

use parking_lot::{Mutex, MutexGuard};

use zt_utils::error::ZtError;

use crate::errno::fail;
use crate::runtime::RUNTIME;
use crate::types::{write_sockaddr, ZtsSockaddrStorage, ZtsSocklenT};

lazy_static::lazy_static! {
    static ref QUERY_LOCK: Mutex<()> = Mutex::new(());
    /// Holds the obtained guard between `zts_core_lock_obtain` and
    /// `zts_core_lock_release`; a C caller has no way to express a scoped
    /// guard, so this stands in for the stack frame that would otherwise
    /// hold it.
    static ref QUERY_GUARD: Mutex<Option<MutexGuard<'static, ()>>> = Mutex::new(None);
}

/// `core_lock_obtain`/`core_lock_release`: a manual (non-RAII) advisory
/// lock a host holds across a run of `core_query_*` calls to see a
/// consistent snapshot, mirroring the C API's lock/unlock pair rather than
/// a scoped guard a C caller has no way to express. Re-entrant calls from
/// the same thread without a matching release will deadlock, exactly like
/// the underlying mutex would.
#[no_mangle]
pub extern "C" fn zts_core_lock_obtain() {
    let lock: &'static Mutex<()> = &QUERY_LOCK;
    let guard = lock.lock();
    *QUERY_GUARD.lock() = Some(guard);
}

#[no_mangle]
pub extern "C" fn zts_core_lock_release() {
    QUERY_GUARD.lock().take();
}

#[no_mangle]
pub extern "C" fn zts_core_query_addr_count(net_id: u64) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => live.service.network_addresses(net_id).len() as i32,
        None => fail(ZtError::Service),
    }
}

/// Writes the `index`-th assigned address of `net_id` into `out`.
///
/// # Safety
/// `out` must point to at least `size_of::<ZtsSockaddrStorage>()` writable
/// bytes; `out_len`, if non-null, must point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn zts_core_query_addr(net_id: u64, index: usize, out: *mut ZtsSockaddrStorage, out_len: *mut ZtsSocklenT) -> i32 {
    if out.is_null() {
        return fail(ZtError::InvalidArg);
    }
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    let addrs = live.service.network_addresses(net_id);
    match addrs.get(index) {
        Some(cidr) => {
            write_sockaddr(std::net::SocketAddr::new(cidr.addr(), 0), out, out_len);
            0
        }
        None => fail(ZtError::NoResult),
    }
}

#[no_mangle]
pub extern "C" fn zts_core_query_route_count(net_id: u64) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => live.service.network_routes(net_id).len() as i32,
        None => fail(ZtError::Service),
    }
}

/// Writes the `index`-th reconciled route of `net_id`: `target`/`target_len`
/// describe the destination CIDR (port always `0`), `via` is written only
/// if the route has a gateway (`has_via` reports which).
///
/// # Safety
/// `target`/`via` must each point to at least one `ZtsSockaddrStorage` of
/// writable memory; `target_prefix`, `has_via`, `flags` and `metric` must
/// each point to writable memory of their respective type, or be null.
#[no_mangle]
pub unsafe extern "C" fn zts_core_query_route(
    net_id: u64,
    index: usize,
    target: *mut ZtsSockaddrStorage,
    target_prefix: *mut u8,
    via: *mut ZtsSockaddrStorage,
    has_via: *mut u8,
    flags: *mut u32,
    metric: *mut u16,
) -> i32 {
    if target.is_null() || via.is_null() {
        return fail(ZtError::InvalidArg);
    }
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    let routes = live.service.network_routes(net_id);
    let route = match routes.get(index) {
        Some(r) => r,
        None => return fail(ZtError::NoResult),
    };
    write_sockaddr(std::net::SocketAddr::new(route.target.addr(), 0), target, std::ptr::null_mut());
    if !target_prefix.is_null() {
        *target_prefix = route.target.prefix_len();
    }
    if let Some(gw) = route.via {
        write_sockaddr(std::net::SocketAddr::new(gw, 0), via, std::ptr::null_mut());
        if !has_via.is_null() {
            *has_via = 1;
        }
    } else if !has_via.is_null() {
        *has_via = 0;
    }
    if !flags.is_null() {
        *flags = route.flags;
    }
    if !metric.is_null() {
        *metric = route.metric;
    }
    0
}

/// The expanded `zts_get_all_network_routes`: writes up to `max` routes at
/// once, returning the number written (not the total count — call
/// `core_query_route_count` first if the caller needs to know whether it
/// was truncated).
///
/// # Safety
/// `targets`/`vias` must each point to at least `max` `ZtsSockaddrStorage`
/// slots; `has_vias` to at least `max` bytes.
#[no_mangle]
pub unsafe extern "C" fn zts_get_all_network_routes(
    net_id: u64,
    targets: *mut ZtsSockaddrStorage,
    has_vias: *mut u8,
    vias: *mut ZtsSockaddrStorage,
    max: usize,
) -> i32 {
    if targets.is_null() || vias.is_null() || has_vias.is_null() {
        return fail(ZtError::InvalidArg);
    }
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    let routes = live.service.network_routes(net_id);
    let n = routes.len().min(max);
    for (i, route) in routes.iter().take(n).enumerate() {
        write_sockaddr(std::net::SocketAddr::new(route.target.addr(), 0), targets.add(i), std::ptr::null_mut());
        if let Some(gw) = route.via {
            write_sockaddr(std::net::SocketAddr::new(gw, 0), vias.add(i), std::ptr::null_mut());
            *has_vias.add(i) = 1;
        } else {
            *has_vias.add(i) = 0;
        }
    }
    n as i32
}

#[no_mangle]
pub extern "C" fn zts_core_query_multicast_count(net_id: u64) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => live.service.network_multicast_groups(net_id).len() as i32,
        None => fail(ZtError::Service),
    }
}

/// Writes the `index`-th multicast subscription's 6-byte MAC and 32-bit ADI.
///
/// # Safety
/// `mac_out` must point to at least 6 writable bytes; `adi_out`, if
/// non-null, to 4 writable bytes.
#[no_mangle]
pub unsafe extern "C" fn zts_core_query_multicast(net_id: u64, index: usize, mac_out: *mut u8, adi_out: *mut u32) -> i32 {
    if mac_out.is_null() {
        return fail(ZtError::InvalidArg);
    }
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    let groups = live.service.network_multicast_groups(net_id);
    match groups.get(index) {
        Some(g) => {
            std::ptr::copy_nonoverlapping(g.mac.0.as_ptr(), mac_out, 6);
            if !adi_out.is_null() {
                *adi_out = g.adi;
            }
            0
        }
        None => fail(ZtError::NoResult),
    }
}

#[no_mangle]
pub extern "C" fn zts_core_query_peer_count() -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => live.service.peers().len() as i32,
        None => fail(ZtError::Service),
    }
}

#[no_mangle]
pub extern "C" fn zts_core_query_peer_path_count(node_id: u64) -> i32 {
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    match live.service.peers().into_iter().find(|p| p.node_id == node_id) {
        Some(p) => p.paths.len() as i32,
        None => fail(ZtError::NoResult),
    }
}

/// Writes the `index`-th path of the peer identified by `node_id`.
///
/// # Safety
/// `addr` must point to at least one `ZtsSockaddrStorage` of writable
/// memory; the remaining out-params, if non-null, to writable memory of
/// their respective type.
#[no_mangle]
pub unsafe extern "C" fn zts_core_query_peer_path(
    node_id: u64,
    index: usize,
    addr: *mut ZtsSockaddrStorage,
    last_send: *mut i64,
    last_recv: *mut i64,
    preferred: *mut u8,
    expired: *mut u8,
) -> i32 {
    if addr.is_null() {
        return fail(ZtError::InvalidArg);
    }
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    let peer = match live.service.peers().into_iter().find(|p| p.node_id == node_id) {
        Some(p) => p,
        None => return fail(ZtError::NoResult),
    };
    let path = match peer.paths.get(index) {
        Some(p) => p,
        None => return fail(ZtError::NoResult),
    };
    write_sockaddr(path.address, addr, std::ptr::null_mut());
    if !last_send.is_null() {
        *last_send = path.last_send;
    }
    if !last_recv.is_null() {
        *last_recv = path.last_recv;
    }
    if !preferred.is_null() {
        *preferred = path.preferred as u8;
    }
    if !expired.is_null() {
        *expired = path.expired as u8;
    }
    0
}

/// The `zts_get_all_stats`-equivalent counters SPEC_FULL.md §6 reintroduces
/// from `original_source`: bytes received/transmitted on a joined
/// network's virtual netif since it came up.
///
/// # Safety
/// `rx_bytes`/`tx_bytes`, if non-null, must each point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn zts_get_all_stats(net_id: u64, rx_bytes: *mut u64, tx_bytes: *mut u64) -> i32 {
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    match live.stack.netif_stats(net_id) {
        Some((rx, tx)) => {
            if !rx_bytes.is_null() {
                *rx_bytes = rx;
            }
            if !tx_bytes.is_null() {
                *tx_bytes = tx;
            }
            0
        }
        None => fail(ZtError::NoResult),
    }
}
