// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The UDP binder (component C3). Grounded on
//! `vl1-service/src/sys/udp.rs`'s `BoundUdpPort`/`BoundUdpSocket`, adapted
//! from tokio's async `UdpSocket` to `std::net::UdpSocket` to match this
//! crate's std::thread-based concurrency model (spec.md Design Note on
//! concurrency). `vl1service.rs`'s `udp_bind_daemon` port-reconciliation
//! logic (fixed ports plus a filled-in random port, evicting stale bindings
//! by staleness rather than liveness-ping) is the direct model for
//! [`UdpBinder::refresh`].

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;

use zt_utils::error::{ZtError, Result};
use zt_utils::random::xorshift64_random;

/// Interface name prefixes the binder never binds to regardless of
/// configuration: loopback and this workspace's own virtual tap interfaces
/// across the platforms it targets, so a misconfigured (or empty)
/// `exclude_interface_prefixes` can't make the binder loop packets back
/// through its own tap.
pub const BASELINE_EXCLUDED_INTERFACE_PREFIXES: &[&str] = &["lo", "zt", "tun", "tap", "feth", "utun"];

/// Policy governing which local interface addresses the binder is allowed
/// to bind to. Grounded on the original's blacklist-by-interface-name and
/// blacklist-by-CIDR options (spec.md §4.3), plus an always-on exclusion of
/// a tap's own managed IPs so the binder never listens on an address that
/// is itself virtual (which would create a routing loop).
#[derive(Debug, Clone, Default)]
pub struct BindPolicy {
    pub exclude_interface_prefixes: Vec<String>,
    pub exclude_cidrs: Vec<IpNet>,
}

impl BindPolicy {
    pub fn allows(&self, interface_name: &str, addr: IpAddr) -> bool {
        if BASELINE_EXCLUDED_INTERFACE_PREFIXES.iter().any(|p| interface_name.starts_with(p)) {
            return false;
        }
        if self.exclude_interface_prefixes.iter().any(|p| interface_name.starts_with(p.as_str())) {
            return false;
        }
        !self.exclude_cidrs.iter().any(|c| c.contains(&addr))
    }
}

/// Bind a UDP socket with `SO_REUSEADDR` set before `bind(2)`, the way
/// `vl1-service/src/sys/udp.rs` configures its sockets at the fd/handle
/// level before handing them off. `std::net::UdpSocket::bind` offers no
/// hook to set socket options pre-bind, so the socket is built with
/// `socket2` (as `tonarino-innernet`'s server does for the same reason)
/// and converted into a plain `std::net::UdpSocket` once bound.
fn bind_with_reuseaddr(local: SocketAddr) -> io::Result<UdpSocket> {
    use socket2::{Domain, Socket, Type};

    let domain = if local.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&local.into())?;
    Ok(socket.into())
}

/// One UDP socket bound to a single local address, part of a [`BoundUdpPort`].
pub struct BoundUdpSocket {
    pub local: SocketAddr,
    pub interface: String,
    socket: UdpSocket,
    last_receive_time: AtomicI64,
}

impl BoundUdpSocket {
    fn bind(local: SocketAddr, interface: String) -> io::Result<Self> {
        let socket = bind_with_reuseaddr(local)?;
        socket.set_nonblocking(false)?;
        Ok(Self { local, interface, socket, last_receive_time: AtomicI64::new(0) })
    }

    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, dest)
    }

    /// Blocking receive. The Node Service (C8) runs this in a dedicated
    /// reader thread per bound socket.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.socket.recv_from(buf)?;
        self.last_receive_time.store(zt_utils::ms_monotonic(), Ordering::Relaxed);
        Ok((n, from))
    }

    pub fn last_receive_time(&self) -> i64 {
        self.last_receive_time.load(Ordering::Relaxed)
    }

    pub fn try_clone(&self) -> io::Result<UdpSocket> {
        self.socket.try_clone()
    }
}

/// All sockets bound to the same UDP port across every eligible local
/// interface address.
pub struct BoundUdpPort {
    pub port: u16,
    pub sockets: Vec<Arc<BoundUdpSocket>>,
}

/// The range the original scans when filling in a random secondary port,
/// avoiding the well-known range to reduce collisions with other services.
pub const UNASSIGNED_PRIVILEGED_PORT_RANGE: std::ops::RangeInclusive<u16> = 20000..=0xfffe;

pub struct UdpBinder {
    fixed_ports: Vec<u16>,
    policy: BindPolicy,
    ports: Mutex<Vec<BoundUdpPort>>,
}

impl UdpBinder {
    pub fn new(fixed_ports: Vec<u16>, policy: BindPolicy) -> Self {
        Self { fixed_ports, policy, ports: Mutex::new(Vec::new()) }
    }

    /// Reconcile bound ports against `local_addrs` (the currently-detected
    /// local interface addresses) filtered by `self.policy` and by
    /// `tap_ips` — addresses currently assigned to one of this node's own
    /// virtual taps, which must never be bound even if some future policy
    /// change would otherwise allow their interface (spec.md §4.3). Every
    /// fixed port is kept bound on every eligible address, plus one
    /// additional randomly-chosen port (the "secondary port") is bound the
    /// same way if none is bound yet. Addresses that have disappeared
    /// (interface down, IP removed, or now a tap address) are dropped from
    /// their port's socket list.
    pub fn refresh(&self, local_addrs: &[(String, IpAddr)], tap_ips: &[IpAddr]) -> Result<()> {
        let eligible: Vec<&(String, IpAddr)> = local_addrs.iter().filter(|(iface, addr)| self.policy.allows(iface, *addr) && !tap_ips.contains(addr)).collect();

        let mut ports = self.ports.lock();
        let mut wanted_ports = self.fixed_ports.clone();
        // keep exactly one already-bound secondary (non-fixed) port alive; pick a
        // fresh one only if none survived the previous reconciliation
        if let Some(secondary) = ports.iter().map(|p| p.port).find(|p| !self.fixed_ports.contains(p)) {
            wanted_ports.push(secondary);
        } else {
            wanted_ports.push(self.pick_secondary_port());
        }

        ports.retain(|p| wanted_ports.contains(&p.port));

        for &port in &wanted_ports {
            let existing = ports.iter_mut().find(|p| p.port == port);
            let bound = match existing {
                Some(b) => b,
                None => {
                    ports.push(BoundUdpPort { port, sockets: Vec::new() });
                    ports.last_mut().unwrap()
                }
            };

            bound.sockets.retain(|s| eligible.iter().any(|(iface, addr)| *iface == s.interface && *addr == s.local.ip()));

            for (iface, addr) in &eligible {
                if bound.sockets.iter().any(|s| s.local.ip() == *addr) {
                    continue;
                }
                match BoundUdpSocket::bind(SocketAddr::new(*addr, port), iface.clone()) {
                    Ok(sock) => bound.sockets.push(Arc::new(sock)),
                    Err(_) => continue, // address in use or transiently unavailable; retried next refresh
                }
            }
        }

        Ok(())
    }

    fn pick_secondary_port(&self) -> u16 {
        let span = (*UNASSIGNED_PRIVILEGED_PORT_RANGE.end() - *UNASSIGNED_PRIVILEGED_PORT_RANGE.start()) as u64;
        (*UNASSIGNED_PRIVILEGED_PORT_RANGE.start() as u64 + (xorshift64_random() % (span + 1))) as u16
    }

    pub fn bound_ports(&self) -> Vec<u16> {
        self.ports.lock().iter().map(|p| p.port).collect()
    }

    pub fn all_sockets(&self) -> Vec<Arc<BoundUdpSocket>> {
        self.ports.lock().iter().flat_map(|p| p.sockets.iter().cloned()).collect()
    }

    /// Every local address this binder currently has at least one socket
    /// bound on, deduplicated. Feeds the Node Service's (C8) periodic
    /// local-interface-address refresh (spec.md:184,
    /// `ZT_LOCAL_INTERFACE_CHECK_INTERVAL`), which reports these to the
    /// overlay core as candidate paths for other peers to reach this node.
    pub fn all_bound_local_interface_addresses(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<IpAddr> = self.ports.lock().iter().flat_map(|p| p.sockets.iter().map(|s| s.local.ip())).collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    /// Send on the first socket bound to `local.port()` whose local address
    /// matches, or any socket on that port if `local`'s address is unspecified.
    pub fn send(&self, local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Result<usize> {
        let ports = self.ports.lock();
        let bound = ports.iter().find(|p| p.port == local.port()).ok_or(ZtError::NoRoute)?;
        let sock = bound
            .sockets
            .iter()
            .find(|s| s.local.ip() == local.ip() || local.ip().is_unspecified())
            .ok_or(ZtError::NoRoute)?;
        sock.send_to(data, remote).map_err(|_| ZtError::General)
    }

    pub fn is_socket_valid(&self, local: SocketAddr) -> bool {
        self.ports.lock().iter().any(|p| p.port == local.port() && p.sockets.iter().any(|s| s.local == local))
    }

    pub fn close_all(&self) {
        self.ports.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_policy_excludes_by_interface_prefix_and_cidr() {
        let policy = BindPolicy {
            exclude_interface_prefixes: vec!["docker".into(), "veth".into()],
            exclude_cidrs: vec!["169.254.0.0/16".parse().unwrap()],
        };
        assert!(!policy.allows("docker0", "172.17.0.1".parse().unwrap()));
        assert!(!policy.allows("eth0", "169.254.1.1".parse().unwrap()));
        assert!(policy.allows("eth0", "192.168.1.10".parse().unwrap()));
    }

    #[test]
    fn bind_policy_always_excludes_baseline_virtual_and_loopback_interfaces() {
        let policy = BindPolicy::default();
        assert!(!policy.allows("lo", "127.0.0.1".parse().unwrap()));
        assert!(!policy.allows("zt0", "10.1.0.1".parse().unwrap()));
        assert!(!policy.allows("tun0", "10.2.0.1".parse().unwrap()));
        assert!(!policy.allows("utun3", "10.3.0.1".parse().unwrap()));
        assert!(policy.allows("eth0", "192.168.1.10".parse().unwrap()));
    }

    #[test]
    fn refresh_binds_every_fixed_port_on_every_eligible_address() {
        let binder = UdpBinder::new(vec![0], BindPolicy::default());
        binder.refresh(&[("eth0".to_string(), "127.0.0.1".parse().unwrap())], &[]).unwrap();
        // port 0 asks the OS to pick an ephemeral port; exactly one socket
        // should be bound on the loopback address plus one secondary port.
        assert!(binder.bound_ports().len() >= 1);
        binder.close_all();
        assert!(binder.bound_ports().is_empty());
    }

    #[test]
    fn refresh_excludes_addresses_currently_assigned_to_a_tap() {
        let binder = UdpBinder::new(vec![0], BindPolicy::default());
        let tap_addr: IpAddr = "192.168.1.10".parse().unwrap();
        binder.refresh(&[("eth0".to_string(), tap_addr)], &[tap_addr]).unwrap();
        assert!(binder.all_bound_local_interface_addresses().is_empty());
    }

    #[test]
    fn send_to_an_unbound_port_returns_no_route() {
        let binder = UdpBinder::new(vec![], BindPolicy::default());
        let err = binder.send("127.0.0.1:19993".parse().unwrap(), "127.0.0.1:19994".parse().unwrap(), b"x").unwrap_err();
        assert_eq!(err, ZtError::NoRoute);
    }
}
