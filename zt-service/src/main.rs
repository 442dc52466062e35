// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Arg, Command};

use zt_core::binder::{BindPolicy, UdpBinder};
use zt_core::config::NodeServiceConfig;
use zt_core::event::{Event, TermReason};
use zt_core::node::Node;
use zt_core::service::NodeService;
use zt_core::FakeNode;
use zt_netstack::{SmolStack, SocketTable, StackConfig};

use zt_service::identity::NodeIdentity;
use zt_service::localconfig::LocalConfig;
use zt_service::log::{d, l, Log};
use zt_service::{exitcode, netif, util, FileStore};

const VERSION_MAJOR: u32 = 0;
const VERSION_MINOR: u32 = 1;
const VERSION_REVISION: u32 = 0;

/// How often the main loop re-scans local interface addresses and
/// reconciles UDP bindings against them, mirroring `vl1service.rs`'s
/// periodic `udp_bind_daemon` reconciliation cadence.
const BINDER_REFRESH_INTERVAL_MS: i64 = 5000;

fn make_help() -> String {
    format!(
        r###"Overlay Socket Runtime Service Version {}.{}.{}

Usage: zt-service [-...] <command> [command args]

Global Options:

  -p <path>                                Use alternate base path

Common Operations:

  help                                     Show this help
  version                                  Print version (of this binary)
  identity new                             Generate and print a new identity
  service                                  Start the node service
   (usually not invoked manually)

"###,
        VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION,
    )
}

fn print_help() {
    let h = make_help();
    let _ = std::io::stdout().write_all(h.as_bytes());
}

#[cfg(target_os = "macos")]
fn platform_default_home_path() -> String {
    "/Library/Application Support/ZtService".into()
}

#[cfg(not(target_os = "macos"))]
fn platform_default_home_path() -> String {
    "/var/lib/zt-service".into()
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_sigint as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn load_local_config(base_path: &std::path::Path) -> LocalConfig {
    let path = base_path.join("local.conf");
    match util::read_limit(&path, util::DEFAULT_FILE_IO_READ_LIMIT) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
        Err(_) => LocalConfig::default(),
    }
}

/// Load the on-disk identity, or generate and persist a fresh one. Returns
/// the identity plus whether it was freshly generated.
fn load_or_create_identity(store: &FileStore) -> NodeIdentity {
    if let Some(id) = store.load_identity() {
        return id;
    }
    let id = NodeIdentity::generate();
    let _ = store.save_identity(&id);
    id
}

/// One attempt at constructing and running the node service. Returns the
/// termination reason observed, so the caller can decide whether to retry
/// after an identity collision (spec.md §9 Open Question, resolved as a
/// single retry).
fn run_once(base_path: &std::path::Path, lc: &LocalConfig, log: &Arc<Log>, store: Arc<FileStore>, identity: &NodeIdentity) -> TermReason {
    let node: Arc<dyn Node> = Arc::new(FakeNode::new(identity.id));

    let mut fixed_ports = vec![lc.settings.primary_port];
    if let Some(p) = lc.settings.secondary_port {
        fixed_ports.push(p);
    }
    let policy = BindPolicy {
        exclude_interface_prefixes: lc.settings.blacklist_interface_prefixes.clone(),
        exclude_cidrs: lc.settings.blacklist_cidrs.iter().filter_map(|s| s.parse().ok()).collect(),
    };
    let binder = Arc::new(UdpBinder::new(fixed_ports, policy));
    let _ = binder.refresh(&netif::local_addresses(), &[]);

    let stack = SmolStack::new(StackConfig::default());
    let _socket_table = SocketTable::new(stack.clone());

    let mut config = NodeServiceConfig::default();
    config.cached_network_rejoin_on_start = lc.settings.allow_network_caching;
    config.peer_prune_max_age_ms = lc.settings.peer_prune_max_age_ms;

    let frame_sink: Arc<dyn zt_core::tap::FrameSink> = stack.clone();
    let netif_manager: Arc<dyn zt_core::tap::NetifManager> = stack.clone();
    let service = NodeService::new(node, store.clone(), binder.clone(), frame_sink, netif_manager, config);
    stack.set_outbound_sink(service.outbound_frame_sink());
    let stack_thread = stack.run();

    let term_reason: Arc<std::sync::Mutex<Option<TermReason>>> = Arc::new(std::sync::Mutex::new(None));
    let term_reason2 = term_reason.clone();
    let log_for_events = log.clone();
    let handler = Arc::new(move |e: &Event| {
        l!(log_for_events, "event: {:?}", e.code());
        if let Event::NodeDown { reason } = e {
            *term_reason2.lock().unwrap() = Some(reason.clone());
        }
    });

    if service.run(handler).is_err() {
        log.fatal("failed to start node service".to_string());
        stack.terminate();
        let _ = stack_thread.join();
        return TermReason::UnrecoverableError("failed to start".to_string());
    }

    for (nwid, _) in &lc.network {
        if let Ok(net_id) = u64::from_str_radix(nwid, 16) {
            let _ = service.join_network(net_id);
        }
    }

    l!(log, "node {} started, primary port {}", identity.id, lc.settings.primary_port);

    let mut refresh_clock = zt_utils::ms_monotonic();
    while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        if term_reason.lock().unwrap().is_some() {
            break;
        }
        let now = zt_utils::ms_monotonic();
        if now.saturating_sub(refresh_clock) >= BINDER_REFRESH_INTERVAL_MS {
            let _ = binder.refresh(&netif::local_addresses(), &service.all_tap_addresses());
            refresh_clock = now;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    d!(log, "shutting down");
    let reason = term_reason.lock().unwrap().clone().unwrap_or(TermReason::Requested);
    service.terminate(reason.clone());
    stack.terminate();
    let _ = stack_thread.join();
    let _ = base_path; // retained for symmetry with load_local_config's signature
    reason
}

fn run_service(base_path: &std::path::Path, lc: LocalConfig) -> i32 {
    let log_path = lc.settings.log.path.clone().unwrap_or_else(|| base_path.join("zt-service.log").to_string_lossy().into_owned());
    let log = Arc::new(Log::new(log_path, lc.settings.log.max_size, lc.settings.log.stderr, lc.settings.log.debug, ""));

    let store = match FileStore::open(base_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log.fatal(format!("cannot open state store at {}: {}", base_path.display(), e));
            return exitcode::ERR_IOERR;
        }
    };

    install_signal_handlers();

    let mut identity = load_or_create_identity(&store);
    let mut retried = false;
    loop {
        let reason = run_once(base_path, &lc, &log, store.clone(), &identity);
        match reason {
            TermReason::IdentityCollision if !retried && lc.settings.allow_identity_caching => {
                l!(log, "identity collision detected, saving old secret aside and generating a new identity");
                let _ = store.save_secret_after_collision();
                identity = NodeIdentity::generate();
                let _ = store.save_identity(&identity);
                retried = true;
                continue;
            }
            TermReason::IdentityCollision => {
                log.fatal("identity collision persisted after recovery retry, giving up".to_string());
                return exitcode::ERR_IOERR;
            }
            _ => {
                l!(log, "exiting: {:?}", reason);
                return exitcode::OK;
            }
        }
    }
}

fn cmd_identity_new() -> i32 {
    let id = NodeIdentity::generate();
    println!("{}", id.public_ascii());
    println!("{}", id.secret_ascii());
    exitcode::OK
}

fn main() {
    let global_args = Box::new({
        let help = make_help();
        Command::new("zt-service")
            .arg(Arg::new("path").short('p').takes_value(true))
            .subcommand_required(true)
            .subcommand(Command::new("help"))
            .subcommand(Command::new("version"))
            .subcommand(Command::new("service"))
            .subcommand(Command::new("identity").subcommand(Command::new("new")))
            .override_help(help.as_str())
            .override_usage("")
            .disable_version_flag(true)
            .disable_help_subcommand(false)
            .disable_help_flag(true)
            .try_get_matches_from(std::env::args())
            .unwrap_or_else(|e| {
                if e.kind() == clap::ErrorKind::DisplayHelp || e.kind() == clap::ErrorKind::MissingSubcommand {
                    print_help();
                    std::process::exit(exitcode::OK);
                } else {
                    eprintln!("Invalid command line. Use 'help' for help.");
                    std::process::exit(exitcode::ERR_USAGE);
                }
            })
    });

    let base_path: std::path::PathBuf = global_args.value_of("path").map_or_else(platform_default_home_path, |p| p.to_string()).into();

    let code = match global_args.subcommand() {
        Some(("help", _)) => {
            print_help();
            exitcode::OK
        }
        Some(("version", _)) => {
            println!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION);
            exitcode::OK
        }
        Some(("identity", cmd_args)) => match cmd_args.subcommand() {
            Some(("new", _)) => cmd_identity_new(),
            _ => {
                eprintln!("Invalid command line. Use 'help' for help.");
                exitcode::ERR_USAGE
            }
        },
        Some(("service", _)) => {
            let _ = std::fs::create_dir_all(&base_path);
            let lc = load_local_config(&base_path);
            run_service(&base_path, lc)
        }
        _ => {
            eprintln!("Invalid command line. Use 'help' for help.");
            exitcode::ERR_USAGE
        }
    };

    std::process::exit(code);
}
