// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The process-local default handle (spec.md §9's "Global service
//! singleton" note): pre-start configuration gathered by the `init_*`
//! calls, and the live service/stack/socket-table trio once `node_start`
//! has run. Guarded by a single `parking_lot::Mutex` rather than the
//! per-field lock hierarchy spec.md §5 prescribes for the core itself — the
//! FFI layer only ever touches this struct for short, non-blocking
//! start/stop/query bookkeeping, never while holding it across a socket
//! call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use zt_core::binder::{BindPolicy, UdpBinder};
use zt_core::config::NodeServiceConfig;
use zt_core::event::{Event, TermReason};
use zt_core::node::Node;
use zt_core::service::NodeService;
use zt_core::FakeNode;
use zt_netstack::{SmolStack, SocketTable, StackConfig};
use zt_service::identity::NodeIdentity;
use zt_service::FileStore;
use zt_utils::error::{Result, ZtError};

/// An `extern "C" fn` the host registers via `zts_init_set_event_handler`,
/// invoked directly from the event dispatcher thread for every event
/// (spec.md §4.1). No payload pointer is freed by the callee: `msg` is only
/// valid for the duration of the call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ZtsEventMsg {
    pub event_code: i32,
    pub node_id: u64,
    pub net_id: u64,
}

pub type ZtsEventHandler = extern "C" fn(*const ZtsEventMsg);

#[derive(Default)]
pub(crate) struct PreStartConfig {
    pub home_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub roots: Option<Vec<u8>>,
    pub blacklist_if_prefixes: Vec<String>,
    pub allow_network_caching: bool,
    pub allow_peer_caching: bool,
    pub allow_roots_caching: bool,
    pub allow_identity_caching: bool,
    pub event_handler: Option<ZtsEventHandler>,
}

impl PreStartConfig {
    fn new() -> Self {
        Self { allow_network_caching: true, allow_peer_caching: true, allow_roots_caching: true, allow_identity_caching: true, ..Default::default() }
    }
}

pub(crate) struct Live {
    pub store: Arc<FileStore>,
    pub identity: NodeIdentity,
    pub binder: Arc<UdpBinder>,
    pub stack: Arc<SmolStack>,
    pub sockets: Arc<SocketTable>,
    pub service: Arc<NodeService>,
    pub stack_thread: Option<std::thread::JoinHandle<()>>,
}

pub(crate) struct Runtime {
    pub pre_start: PreStartConfig,
    pub live: Option<Live>,
}

impl Runtime {
    pub(crate) fn new() -> Self {
        Self { pre_start: PreStartConfig::new(), live: None }
    }

    pub fn is_started(&self) -> bool {
        self.live.is_some()
    }
}

lazy_static::lazy_static! {
    pub(crate) static ref RUNTIME: Mutex<Runtime> = Mutex::new(Runtime::new());
}

/// Whether `node_stop`'s loop should keep running; flipped by `terminate`.
static RUNNING: AtomicBool = AtomicBool::new(false);

pub(crate) fn running_flag() -> &'static AtomicBool {
    &RUNNING
}

/// Set once this process has attempted one identity-collision recovery, so
/// [`start`]'s event handler never retries a second time in the same
/// process — mirrors `zt-service::main`'s `retried` local, promoted to a
/// static since there is only ever one embedded node per process (spec.md
/// §9's global-singleton note).
static IDENTITY_COLLISION_RETRIED: AtomicBool = AtomicBool::new(false);

/// Build and start the overlay node, the socket façade's backing stack, and
/// the UDP binder, wiring them exactly as `zt-service`'s `run_once` does
/// (late-bind the stack's outbound sink after the service exists).
pub(crate) fn start(rt: &mut Runtime) -> Result<()> {
    IDENTITY_COLLISION_RETRIED.store(false, Ordering::SeqCst);
    start_inner(rt)
}

/// The actual startup sequence, shared by [`start`] and
/// [`recover_from_identity_collision`] — the latter must NOT reset
/// [`IDENTITY_COLLISION_RETRIED`], or a second collision after recovery
/// would retry forever instead of giving up like `zt-service::main`'s
/// `run_service` does.
fn start_inner(rt: &mut Runtime) -> Result<()> {
    if rt.is_started() {
        return Err(ZtError::InvalidOp);
    }

    let home = rt.pre_start.home_path.clone().ok_or(ZtError::InvalidOp)?;
    let store = Arc::new(FileStore::open(&home).map_err(|_| ZtError::Unrecoverable)?);

    let identity = match store.load_identity() {
        Some(id) => id,
        None => {
            let id = NodeIdentity::generate();
            let _ = store.save_identity(&id);
            id
        }
    };

    if let Some(roots) = &rt.pre_start.roots {
        use zt_core::store::StoreKind;
        let _ = store.put(StoreKind::Planet, roots);
    }

    let node: Arc<dyn Node> = Arc::new(FakeNode::new(identity.id));

    let fixed_ports = vec![rt.pre_start.port.unwrap_or(9993)];
    let policy = BindPolicy { exclude_interface_prefixes: rt.pre_start.blacklist_if_prefixes.clone(), exclude_cidrs: Vec::new() };
    let binder = Arc::new(UdpBinder::new(fixed_ports, policy));
    // No service exists yet to report joined-network tap addresses; the
    // housekeeping loop's own refresh (`NodeService::refresh_local_interface_addresses`)
    // picks up any tap IPs acquired after this point.
    let _ = binder.refresh(&zt_service::netif::local_addresses(), &[]);

    let stack = SmolStack::new(StackConfig::default());
    let sockets = SocketTable::new(stack.clone());

    let recovery_enabled = rt.pre_start.allow_identity_caching;
    let mut config = NodeServiceConfig::default();
    config.cached_network_rejoin_on_start = rt.pre_start.allow_network_caching;
    config.identity_collision_recovery = recovery_enabled;

    let frame_sink: Arc<dyn zt_core::tap::FrameSink> = stack.clone();
    let netif_manager: Arc<dyn zt_core::tap::NetifManager> = stack.clone();
    let service = NodeService::new(node, store.clone(), binder.clone(), frame_sink, netif_manager, config);
    stack.set_outbound_sink(service.outbound_frame_sink());
    let stack_thread = stack.run();

    let handler_fn = rt.pre_start.event_handler;
    let node_id = identity.id;
    let handler = Arc::new(move |e: &Event| {
        if let Some(cb) = handler_fn {
            let msg = ZtsEventMsg { event_code: e.code() as i32, node_id, net_id: net_id_of(e) };
            cb(&msg);
        }
        if recovery_enabled {
            if let Event::NodeDown { reason: TermReason::IdentityCollision } = e {
                if !IDENTITY_COLLISION_RETRIED.swap(true, Ordering::SeqCst) {
                    std::thread::spawn(recover_from_identity_collision);
                }
            }
        }
    });

    if service.run(handler).is_err() {
        stack.terminate();
        let _ = stack_thread.join();
        return Err(ZtError::Unrecoverable);
    }

    if rt.pre_start.allow_network_caching {
        for net_id in store.cached_network_ids().unwrap_or_default() {
            let _ = service.join_network(net_id);
        }
    }

    RUNNING.store(true, Ordering::SeqCst);
    rt.live = Some(Live { store, identity, binder, stack, sockets, service, stack_thread: Some(stack_thread) });
    Ok(())
}

/// Every event that carries a `net_id`, so [`start`]'s handler can surface
/// it to the host without re-deriving the whole `Event` shape across the C
/// boundary; everything else reports `0`.
fn net_id_of(e: &Event) -> u64 {
    match e {
        Event::NetNotFound { net_id }
        | Event::NetClientTooOld { net_id }
        | Event::NetReqConfig { net_id }
        | Event::NetAccessDenied { net_id }
        | Event::NetDown { net_id }
        | Event::NetUpdate { net_id }
        | Event::NetReadyV4 { net_id }
        | Event::NetReadyV6 { net_id }
        | Event::NetOk { net_id }
        | Event::NetifUp { net_id }
        | Event::NetifDown { net_id }
        | Event::NetifRemoved { net_id }
        | Event::NetifLinkUp { net_id }
        | Event::NetifLinkDown { net_id }
        | Event::RouteAdded { net_id, .. }
        | Event::RouteRemoved { net_id, .. }
        | Event::AddrAddedV4 { net_id, .. }
        | Event::AddrAddedV6 { net_id, .. }
        | Event::AddrRemovedV4 { net_id, .. }
        | Event::AddrRemovedV6 { net_id, .. }
        | Event::MulticastSubscribed { net_id, .. }
        | Event::MulticastUnsubscribed { net_id, .. }
        | Event::StoreNetwork { net_id, .. } => *net_id,
        _ => 0,
    }
}

pub(crate) fn stop(rt: &mut Runtime) -> Result<()> {
    let mut live = rt.live.take().ok_or(ZtError::Service)?;
    RUNNING.store(false, Ordering::SeqCst);
    live.service.terminate(TermReason::Requested);
    live.stack.terminate();
    if let Some(h) = live.stack_thread.take() {
        let _ = h.join();
    }
    Ok(())
}

/// Single-retry identity-collision recovery (spec.md Design Note 9): tear
/// down the running node, rename the old secret aside, generate a fresh
/// identity, and start over with it — the same recovery `zt-service::main`'s
/// `run_service` performs inline in its blocking retry loop, adapted to
/// `node_start`'s synchronous, non-blocking calling convention by running
/// reactively off the event dispatcher thread instead. Runs on its own
/// thread (spawned by the handler in [`start`]) so it never joins the
/// dispatcher thread it was called from.
fn recover_from_identity_collision() {
    let mut rt = RUNTIME.lock();
    let live = match rt.live.take() {
        Some(l) => l,
        None => return,
    };
    RUNNING.store(false, Ordering::SeqCst);
    live.service.terminate(TermReason::IdentityCollision);
    live.stack.terminate();
    if let Some(h) = live.stack_thread {
        let _ = h.join();
    }

    let _ = live.store.save_secret_after_collision();
    let new_identity = NodeIdentity::generate();
    let _ = live.store.save_identity(&new_identity);

    let _ = start_inner(&mut rt);
}
