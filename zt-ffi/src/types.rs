// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Wire-compatible socket address types for the C ABI (spec.md §6:
//! "`sockaddr_storage`/`sockaddr_in`/`sockaddr_in6` layouts must be
//! bit-compatible with Linux's"). `libc`'s definitions already are that
//! layout on every target this workspace cares about, so these are plain
//! aliases rather than a hand-rolled repr(C) reimplementation — the same
//! choice `socket2`/`smoltcp`'s own C-interop layers make.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

pub type ZtsSockaddr = libc::sockaddr;
pub type ZtsSockaddrIn = libc::sockaddr_in;
pub type ZtsSockaddrIn6 = libc::sockaddr_in6;
pub type ZtsSockaddrStorage = libc::sockaddr_storage;
pub type ZtsSocklenT = libc::socklen_t;
/// Byte counts returned by `zts_send`/`zts_recv` and friends, wide enough to
/// carry a transfer count or the `-1` failure sentinel without truncation.
pub type ZtsSsizeT = isize;

/// The façade's own canonical family constants (spec.md §6), which happen
/// to already equal Linux's `AF_INET`/`AF_INET6` numerically; kept as
/// distinct constants rather than re-exporting `libc::AF_INET` so a future
/// non-Linux host value can diverge without touching callers.
pub const ZTS_AF_INET: i32 = 2;
pub const ZTS_AF_INET6: i32 = 10;

pub const ZTS_SOCK_STREAM: i32 = 1;
pub const ZTS_SOCK_DGRAM: i32 = 2;

/// Read a `sockaddr_storage` the caller filled in, honoring whatever
/// `sa_family` it carries. Returns `None` for an unsupported family or a
/// null pointer, which callers translate to `invalid_arg`.
///
/// # Safety
/// `addr` must point to at least `ZtsSockaddrStorage` bytes of initialized
/// memory tagged with a valid `sa_family`, or be null.
pub unsafe fn read_sockaddr(addr: *const ZtsSockaddrStorage) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    let family = (*addr).ss_family as i32;
    if family == ZTS_AF_INET {
        let sin = &*(addr as *const ZtsSockaddrIn);
        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        let port = u16::from_be(sin.sin_port);
        Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    } else if family == ZTS_AF_INET6 {
        let sin6 = &*(addr as *const ZtsSockaddrIn6);
        let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
        let port = u16::from_be(sin6.sin6_port);
        Some(SocketAddr::V6(SocketAddrV6::new(ip, port, sin6.sin6_flowinfo, sin6.sin6_scope_id)))
    } else {
        None
    }
}

/// Write `addr` into the caller-supplied `out` buffer, bit-compatible with
/// a native `sockaddr_in`/`sockaddr_in6`, and report how many bytes were
/// written through `out_len` the way `getsockname(2)` does.
///
/// # Safety
/// `out` must point to at least `size_of::<ZtsSockaddrStorage>()` bytes of
/// writable memory; `out_len`, if non-null, must point to writable memory.
pub unsafe fn write_sockaddr(addr: SocketAddr, out: *mut ZtsSockaddrStorage, out_len: *mut ZtsSocklenT) {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = out as *mut ZtsSockaddrIn;
            std::ptr::write_bytes(sin, 0, 1);
            (*sin).sin_family = ZTS_AF_INET as libc::sa_family_t;
            (*sin).sin_port = v4.port().to_be();
            (*sin).sin_addr = libc::in_addr { s_addr: u32::from_be_bytes(v4.ip().octets()) };
            if !out_len.is_null() {
                *out_len = std::mem::size_of::<ZtsSockaddrIn>() as ZtsSocklenT;
            }
        }
        SocketAddr::V6(v6) => {
            let sin6 = out as *mut ZtsSockaddrIn6;
            std::ptr::write_bytes(sin6, 0, 1);
            (*sin6).sin6_family = ZTS_AF_INET6 as libc::sa_family_t;
            (*sin6).sin6_port = v6.port().to_be();
            (*sin6).sin6_addr = libc::in6_addr { s6_addr: v6.ip().octets() };
            (*sin6).sin6_flowinfo = v6.flowinfo();
            (*sin6).sin6_scope_id = v6.scope_id();
            if !out_len.is_null() {
                *out_len = std::mem::size_of::<ZtsSockaddrIn6>() as ZtsSocklenT;
            }
        }
    }
}

pub fn family_of(ip: IpAddr) -> i32 {
    match ip {
        IpAddr::V4(_) => ZTS_AF_INET,
        IpAddr::V6(_) => ZTS_AF_INET6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_v4_through_the_wire_layout() {
        let original: SocketAddr = "10.1.2.3:9993".parse().unwrap();
        let mut storage: ZtsSockaddrStorage = unsafe { std::mem::zeroed() };
        let mut len: ZtsSocklenT = 0;
        unsafe { write_sockaddr(original, &mut storage, &mut len) };
        let restored = unsafe { read_sockaddr(&storage) }.unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn round_trips_v6_through_the_wire_layout() {
        let original: SocketAddr = "[fe80::1]:51820".parse().unwrap();
        let mut storage: ZtsSockaddrStorage = unsafe { std::mem::zeroed() };
        unsafe { write_sockaddr(original, &mut storage, std::ptr::null_mut()) };
        let restored = unsafe { read_sockaddr(&storage) }.unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn null_pointer_reads_as_none() {
        assert!(unsafe { read_sockaddr(std::ptr::null()) }.is_none());
    }
}
