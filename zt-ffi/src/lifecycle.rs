// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The lifecycle ABI (spec.md §6): pre-start configuration setters, then
//! `zts_node_start`/`zts_node_stop`/`zts_node_free`, network join/leave and
//! moon orbit/deorbit. Every setter below checks `!rt.is_started()` and
//! fails with `invalid_op` otherwise, per spec.md §6's "return `invalid_op`
//! if called after `node_start`".

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::PathBuf;
use std::slice;

use zt_utils::error::ZtError;

use crate::errno::fail;
use crate::runtime::{self, ZtsEventHandler, RUNTIME};

unsafe fn path_from_c(path: *const c_char) -> Option<PathBuf> {
    if path.is_null() {
        return None;
    }
    CStr::from_ptr(path).to_str().ok().map(PathBuf::from)
}

/// `init_from_storage(path)`: root a file-backed state store at `path`.
///
/// # Safety
/// `path` must be a valid, NUL-terminated C string, or null.
#[no_mangle]
pub unsafe extern "C" fn zts_init_from_storage(path: *const c_char) -> i32 {
    let home = match path_from_c(path) {
        Some(p) => p,
        None => return fail(ZtError::InvalidArg),
    };
    let mut rt = RUNTIME.lock();
    if rt.is_started() {
        return fail(ZtError::InvalidOp);
    }
    rt.pre_start.home_path = Some(home);
    0
}

/// `init_set_event_handler(cb)`: register the callback the dispatcher
/// invokes for every event once the node starts.
#[no_mangle]
pub extern "C" fn zts_init_set_event_handler(cb: ZtsEventHandler) -> i32 {
    let mut rt = RUNTIME.lock();
    if rt.is_started() {
        return fail(ZtError::InvalidOp);
    }
    rt.pre_start.event_handler = Some(cb);
    0
}

#[no_mangle]
pub extern "C" fn zts_init_set_port(port: u16) -> i32 {
    let mut rt = RUNTIME.lock();
    if rt.is_started() {
        return fail(ZtError::InvalidOp);
    }
    rt.pre_start.port = Some(port);
    0
}

/// `init_set_roots(data, len)`: stage the planet/moon root definition blob
/// to be written into the state store at start time.
///
/// # Safety
/// `data` must point to at least `len` readable bytes, or be null with
/// `len == 0`.
#[no_mangle]
pub unsafe extern "C" fn zts_init_set_roots(data: *const u8, len: usize) -> i32 {
    let mut rt = RUNTIME.lock();
    if rt.is_started() {
        return fail(ZtError::InvalidOp);
    }
    if data.is_null() || len == 0 {
        return fail(ZtError::InvalidArg);
    }
    rt.pre_start.roots = Some(slice::from_raw_parts(data, len).to_vec());
    0
}

/// `init_blacklist_if(prefix, len)`: exclude interfaces whose name starts
/// with `prefix` from UDP binding.
///
/// # Safety
/// `prefix` must point to at least `len` readable, UTF-8 bytes.
#[no_mangle]
pub unsafe extern "C" fn zts_init_blacklist_if(prefix: *const c_char, len: usize) -> i32 {
    let mut rt = RUNTIME.lock();
    if rt.is_started() {
        return fail(ZtError::InvalidOp);
    }
    if prefix.is_null() {
        return fail(ZtError::InvalidArg);
    }
    let bytes = slice::from_raw_parts(prefix as *const u8, len);
    let s = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => return fail(ZtError::InvalidArg),
    };
    rt.pre_start.blacklist_if_prefixes.push(s);
    0
}

macro_rules! cache_setter {
    ($name:ident, $field:ident) => {
        #[no_mangle]
        pub extern "C" fn $name(allow: bool) -> i32 {
            let mut rt = RUNTIME.lock();
            if rt.is_started() {
                return fail(ZtError::InvalidOp);
            }
            rt.pre_start.$field = allow;
            0
        }
    };
}

cache_setter!(zts_init_allow_net_cache, allow_network_caching);
cache_setter!(zts_init_allow_peer_cache, allow_peer_caching);
cache_setter!(zts_init_allow_roots_cache, allow_roots_caching);
cache_setter!(zts_init_allow_id_cache, allow_identity_caching);

/// Build and start the node, stack and socket table from whatever the
/// `zts_init_*` calls staged. Idempotent: returns `invalid_op` if already
/// started, matching `NodeService::run`'s own idempotency.
#[no_mangle]
pub extern "C" fn zts_node_start() -> i32 {
    let mut rt = RUNTIME.lock();
    match runtime::start(&mut rt) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// `node_stop()`: terminate the running node service and stack thread.
/// Idempotent the way [`zt_core::service::NodeService::terminate`] is.
#[no_mangle]
pub extern "C" fn zts_node_stop() -> i32 {
    let mut rt = RUNTIME.lock();
    match runtime::stop(&mut rt) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// `node_free()`: stop if still running and drop every staged pre-start
/// setting, returning the process-local singleton to its pristine state.
#[no_mangle]
pub extern "C" fn zts_node_free() -> i32 {
    let mut rt = RUNTIME.lock();
    if rt.is_started() {
        let _ = runtime::stop(&mut rt);
    }
    *rt = runtime::Runtime::new();
    0
}

#[no_mangle]
pub extern "C" fn zts_node_is_online() -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => live.service.is_online() as i32,
        None => 0,
    }
}

/// Returns `0` if the node hasn't started, since a real node id is never
/// zero (spec.md's 40-bit address space excludes it).
#[no_mangle]
pub extern "C" fn zts_node_get_id() -> u64 {
    let rt = RUNTIME.lock();
    rt.live.as_ref().map_or(0, |live| live.service.node_id().0)
}

#[no_mangle]
pub extern "C" fn zts_node_get_port() -> u16 {
    let rt = RUNTIME.lock();
    rt.live.as_ref().and_then(|live| live.service.bound_ports().first().copied()).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn zts_net_join(net_id: u64) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.service.join_network(net_id) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

#[no_mangle]
pub extern "C" fn zts_net_leave(net_id: u64) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.service.leave_network(net_id) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

#[no_mangle]
pub extern "C" fn zts_net_transport_is_ready(net_id: u64) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => live.service.network_transport_ready(net_id) as i32,
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn zts_moon_orbit(world_id: u64, seed: u64) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.service.orbit(world_id, seed) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

#[no_mangle]
pub extern "C" fn zts_moon_deorbit(world_id: u64) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.service.deorbit(world_id) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

