// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The socket ABI (spec.md §6): `zts_socket`/`zts_bind`/`zts_connect`/
//! `zts_listen`/`zts_accept`/`zts_send{,to}`/`zts_recv{,from}`/`zts_close`/
//! `zts_shutdown`/`zts_select`/`zts_fcntl`/`zts_{set,get}sockopt`, a thin
//! marshaling layer over [`zt_netstack::SocketTable`] (C7). Every call
//! reaches the socket table through the process-local [`crate::runtime`]
//! singleton rather than a handle parameter, matching this crate's
//! lifecycle ABI (spec.md §9 "Global service singleton").
//!
//! Option-name/level constants below reuse Linux's actual numeric values
//! (`SOL_SOCKET = 1`, `IPPROTO_TCP = 6`, `SO_REUSEADDR = 2`, ...) purely so
//! a host that already has Linux's `<sys/socket.h>` constants in scope can
//! pass them through unchanged; nothing in this crate depends on the
//! specific values.

use std::slice;
use std::time::Duration;

use zt_netstack::{Family, RecvFlags, ShutdownHow, SockOpt, SockOptName, SockType};
use zt_utils::error::ZtError;

use crate::errno::fail;
use crate::runtime::RUNTIME;
use crate::types::{read_sockaddr, write_sockaddr, ZtsSockaddrStorage, ZtsSocklenT, ZtsSsizeT, ZTS_AF_INET, ZTS_AF_INET6, ZTS_SOCK_DGRAM, ZTS_SOCK_STREAM};

pub const ZTS_SHUT_RD: i32 = 0;
pub const ZTS_SHUT_WR: i32 = 1;
pub const ZTS_SHUT_RDWR: i32 = 2;

pub const ZTS_SOL_SOCKET: i32 = 1;
pub const ZTS_IPPROTO_IP: i32 = 0;
pub const ZTS_IPPROTO_TCP: i32 = 6;

pub const ZTS_SO_SNDBUF: i32 = 7;
pub const ZTS_SO_RCVBUF: i32 = 8;
pub const ZTS_SO_KEEPALIVE: i32 = 9;
pub const ZTS_SO_REUSEADDR: i32 = 2;
pub const ZTS_SO_BROADCAST: i32 = 6;
pub const ZTS_SO_LINGER: i32 = 13;
pub const ZTS_SO_RCVTIMEO: i32 = 20;
pub const ZTS_SO_SNDTIMEO: i32 = 21;
pub const ZTS_TCP_NODELAY: i32 = 1;
pub const ZTS_IP_TTL: i32 = 2;

pub const ZTS_F_GETFL: i32 = 3;
pub const ZTS_F_SETFL: i32 = 4;
pub const ZTS_O_NONBLOCK: i32 = 0x800;

/// `recv`/`recvfrom` `flags` bits (spec.md §4.7), Linux's actual numeric
/// values so a host with `<sys/socket.h>` in scope can pass them through
/// unchanged.
pub const ZTS_MSG_DONTWAIT: i32 = 0x40;
pub const ZTS_MSG_PEEK: i32 = 0x02;

fn recv_flags_from_wire(flags: i32) -> RecvFlags {
    RecvFlags { peek: flags & ZTS_MSG_PEEK != 0, dontwait: flags & ZTS_MSG_DONTWAIT != 0 }
}

fn family_from_wire(af: i32) -> Option<Family> {
    if af == ZTS_AF_INET {
        Some(Family::Inet)
    } else if af == ZTS_AF_INET6 {
        Some(Family::Inet6)
    } else {
        None
    }
}

fn type_from_wire(t: i32) -> Option<SockType> {
    if t == ZTS_SOCK_STREAM {
        Some(SockType::Stream)
    } else if t == ZTS_SOCK_DGRAM {
        Some(SockType::Dgram)
    } else {
        None
    }
}

#[no_mangle]
pub extern "C" fn zts_socket(family: i32, sock_type: i32) -> i32 {
    let (family, kind) = match (family_from_wire(family), type_from_wire(sock_type)) {
        (Some(f), Some(k)) => (f, k),
        _ => return fail(ZtError::InvalidArg),
    };
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.socket(family, kind) {
            Ok(fd) => fd,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

/// # Safety
/// `addr` must point to at least `addrlen` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn zts_bind(fd: i32, addr: *const ZtsSockaddrStorage, addrlen: ZtsSocklenT) -> i32 {
    let _ = addrlen;
    let sockaddr = match read_sockaddr(addr) {
        Some(a) => a,
        None => return fail(ZtError::InvalidArg),
    };
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.bind(fd, sockaddr) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

/// # Safety
/// `addr` must point to at least `addrlen` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn zts_connect(fd: i32, addr: *const ZtsSockaddrStorage, addrlen: ZtsSocklenT) -> i32 {
    let _ = addrlen;
    let sockaddr = match read_sockaddr(addr) {
        Some(a) => a,
        None => return fail(ZtError::InvalidArg),
    };
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.connect(fd, sockaddr) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

#[no_mangle]
pub extern "C" fn zts_listen(fd: i32, backlog: i32) -> i32 {
    if backlog < 0 {
        return fail(ZtError::InvalidArg);
    }
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.listen(fd, backlog as usize) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

/// # Safety
/// `addr`, if non-null, must point to at least one `ZtsSockaddrStorage` of
/// writable memory; `addrlen`, if non-null, must point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn zts_accept(fd: i32, addr: *mut ZtsSockaddrStorage, addrlen: *mut ZtsSocklenT) -> i32 {
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    match live.sockets.accept(fd) {
        Ok((new_fd, peer)) => {
            if !addr.is_null() {
                write_sockaddr(peer, addr, addrlen);
            }
            new_fd
        }
        Err(e) => fail(e),
    }
}

/// # Safety
/// `buf` must point to at least `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn zts_send(fd: i32, buf: *const u8, len: usize, flags: i32) -> ZtsSsizeT {
    let _ = flags;
    if buf.is_null() {
        return fail(ZtError::InvalidArg) as ZtsSsizeT;
    }
    let data = slice::from_raw_parts(buf, len);
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.send(fd, data) {
            Ok(n) => n as ZtsSsizeT,
            Err(e) => fail(e) as ZtsSsizeT,
        },
        None => fail(ZtError::Service) as ZtsSsizeT,
    }
}

/// # Safety
/// `buf` must point to at least `len` readable bytes; `addr` to at least
/// `addrlen` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn zts_sendto(fd: i32, buf: *const u8, len: usize, flags: i32, addr: *const ZtsSockaddrStorage, addrlen: ZtsSocklenT) -> ZtsSsizeT {
    let _ = (flags, addrlen);
    if buf.is_null() {
        return fail(ZtError::InvalidArg) as ZtsSsizeT;
    }
    let dest = match read_sockaddr(addr) {
        Some(a) => a,
        None => return fail(ZtError::InvalidArg) as ZtsSsizeT,
    };
    let data = slice::from_raw_parts(buf, len);
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.send_to(fd, data, dest) {
            Ok(n) => n as ZtsSsizeT,
            Err(e) => fail(e) as ZtsSsizeT,
        },
        None => fail(ZtError::Service) as ZtsSsizeT,
    }
}

/// # Safety
/// `buf` must point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn zts_recv(fd: i32, buf: *mut u8, len: usize, flags: i32) -> ZtsSsizeT {
    if buf.is_null() {
        return fail(ZtError::InvalidArg) as ZtsSsizeT;
    }
    let data = slice::from_raw_parts_mut(buf, len);
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.recv(fd, data, recv_flags_from_wire(flags)) {
            Ok(n) => n as ZtsSsizeT,
            Err(e) => fail(e) as ZtsSsizeT,
        },
        None => fail(ZtError::Service) as ZtsSsizeT,
    }
}

/// # Safety
/// `buf` must point to at least `len` writable bytes; `addr`, if non-null,
/// to at least one `ZtsSockaddrStorage` of writable memory.
#[no_mangle]
pub unsafe extern "C" fn zts_recvfrom(fd: i32, buf: *mut u8, len: usize, flags: i32, addr: *mut ZtsSockaddrStorage, addrlen: *mut ZtsSocklenT) -> ZtsSsizeT {
    if buf.is_null() {
        return fail(ZtError::InvalidArg) as ZtsSsizeT;
    }
    let data = slice::from_raw_parts_mut(buf, len);
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service) as ZtsSsizeT,
    };
    match live.sockets.recv_from(fd, data, recv_flags_from_wire(flags)) {
        Ok((n, from)) => {
            if !addr.is_null() {
                write_sockaddr(from, addr, addrlen);
            }
            n as ZtsSsizeT
        }
        Err(e) => fail(e) as ZtsSsizeT,
    }
}

#[no_mangle]
pub extern "C" fn zts_close(fd: i32) -> i32 {
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.close(fd) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

#[no_mangle]
pub extern "C" fn zts_shutdown(fd: i32, how: i32) -> i32 {
    let how = match how {
        ZTS_SHUT_RD => ShutdownHow::Read,
        ZTS_SHUT_WR => ShutdownHow::Write,
        ZTS_SHUT_RDWR => ShutdownHow::Both,
        _ => return fail(ZtError::InvalidArg),
    };
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.shutdown(fd, how) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

/// A slice-of-fds adaptation of `select(2)`: the underlying façade already
/// takes `&[i32]` rather than `fd_set` bitmaps (spec.md §4.7), so this
/// keeps that shape rather than reimplementing `FD_SET`/`FD_ISSET` bit
/// twiddling across the C boundary. `timeout_ms < 0` blocks indefinitely.
///
/// # Safety
/// `read_fds`/`write_fds` must point to at least `nread`/`nwrite` readable
/// `i32`s; `out_read`/`out_write` to at least `nread`/`nwrite` writable
/// `i32`s (the façade never reports more ready fds than it was given).
#[no_mangle]
pub unsafe extern "C" fn zts_select(
    read_fds: *const i32,
    nread: usize,
    write_fds: *const i32,
    nwrite: usize,
    out_read: *mut i32,
    out_write: *mut i32,
    timeout_ms: i32,
) -> i32 {
    let reads = if read_fds.is_null() { &[][..] } else { slice::from_raw_parts(read_fds, nread) };
    let writes = if write_fds.is_null() { &[][..] } else { slice::from_raw_parts(write_fds, nwrite) };
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };

    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    match live.sockets.select(reads, writes, timeout) {
        Ok((ready_read, ready_write)) => {
            if !out_read.is_null() {
                for (i, fd) in ready_read.iter().enumerate() {
                    *out_read.add(i) = *fd;
                }
            }
            if !out_write.is_null() {
                for (i, fd) in ready_write.iter().enumerate() {
                    *out_write.add(i) = *fd;
                }
            }
            (ready_read.len() + ready_write.len()) as i32
        }
        Err(e) => fail(e),
    }
}

/// `fcntl(F_GETFL)`/`fcntl(F_SETFL, O_NONBLOCK)`, the one facility spec.md
/// §4.7 names explicitly; any other `cmd` fails with `invalid_arg`.
#[no_mangle]
pub extern "C" fn zts_fcntl(fd: i32, cmd: i32, arg: i32) -> i32 {
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    match cmd {
        ZTS_F_GETFL => match live.sockets.is_nonblocking(fd) {
            Ok(true) => ZTS_O_NONBLOCK,
            Ok(false) => 0,
            Err(e) => fail(e),
        },
        ZTS_F_SETFL => match live.sockets.set_nonblocking(fd, arg & ZTS_O_NONBLOCK != 0) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        _ => fail(ZtError::InvalidArg),
    }
}

/// Reads a 4-byte little-endian `u32` out of `optval`, the wire shape every
/// integer-valued option below uses.
unsafe fn read_u32(optval: *const u8, optlen: ZtsSocklenT) -> Option<u32> {
    if optval.is_null() || (optlen as usize) < 4 {
        return None;
    }
    let bytes = slice::from_raw_parts(optval, 4);
    Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

unsafe fn write_u32(optval: *mut u8, optlen: *mut ZtsSocklenT, value: u32) {
    if optval.is_null() {
        return;
    }
    std::ptr::copy_nonoverlapping(value.to_ne_bytes().as_ptr(), optval, 4);
    if !optlen.is_null() {
        *optlen = 4;
    }
}

/// # Safety
/// `optval` must point to at least `optlen` readable bytes appropriate for
/// `optname` (every option here reads a 4-byte `u32`/`bool`-as-`u32`).
#[no_mangle]
pub unsafe extern "C" fn zts_setsockopt(fd: i32, level: i32, optname: i32, optval: *const u8, optlen: ZtsSocklenT) -> i32 {
    let opt = match (level, optname) {
        (ZTS_SOL_SOCKET, ZTS_SO_REUSEADDR) => read_u32(optval, optlen).map(|v| SockOpt::ReuseAddr(v != 0)),
        (ZTS_SOL_SOCKET, ZTS_SO_KEEPALIVE) => read_u32(optval, optlen).map(|v| SockOpt::KeepAlive(v != 0)),
        (ZTS_SOL_SOCKET, ZTS_SO_BROADCAST) => read_u32(optval, optlen).map(|v| SockOpt::Broadcast(v != 0)),
        (ZTS_SOL_SOCKET, ZTS_SO_RCVTIMEO) => read_u32(optval, optlen).map(SockOpt::RecvTimeoutMs),
        (ZTS_SOL_SOCKET, ZTS_SO_SNDTIMEO) => read_u32(optval, optlen).map(SockOpt::SendTimeoutMs),
        (ZTS_SOL_SOCKET, ZTS_SO_RCVBUF) => read_u32(optval, optlen).map(SockOpt::RecvBufferBytes),
        (ZTS_SOL_SOCKET, ZTS_SO_SNDBUF) => read_u32(optval, optlen).map(SockOpt::SendBufferBytes),
        (ZTS_SOL_SOCKET, ZTS_SO_LINGER) => read_u32(optval, optlen).map(|v| SockOpt::LingerMs(if v == 0 { None } else { Some(v) })),
        (ZTS_IPPROTO_TCP, ZTS_TCP_NODELAY) => read_u32(optval, optlen).map(|v| SockOpt::TcpNoDelay(v != 0)),
        (ZTS_IPPROTO_IP, ZTS_IP_TTL) => read_u32(optval, optlen).map(|v| SockOpt::IpTtl(v as u8)),
        _ => return fail(ZtError::NoProtoOpt),
    };
    let opt = match opt {
        Some(o) => o,
        None => return fail(ZtError::InvalidArg),
    };
    let rt = RUNTIME.lock();
    match &rt.live {
        Some(live) => match live.sockets.setsockopt(fd, opt) {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        None => fail(ZtError::Service),
    }
}

/// # Safety
/// `optval` must point to at least 4 writable bytes; `optlen`, if non-null,
/// to writable memory.
#[no_mangle]
pub unsafe extern "C" fn zts_getsockopt(fd: i32, level: i32, optname: i32, optval: *mut u8, optlen: *mut ZtsSocklenT) -> i32 {
    let name = match (level, optname) {
        (ZTS_SOL_SOCKET, ZTS_SO_REUSEADDR) => SockOptName::ReuseAddr,
        (ZTS_SOL_SOCKET, ZTS_SO_KEEPALIVE) => SockOptName::KeepAlive,
        (ZTS_SOL_SOCKET, ZTS_SO_BROADCAST) => SockOptName::Broadcast,
        (ZTS_SOL_SOCKET, ZTS_SO_RCVTIMEO) => SockOptName::RecvTimeoutMs,
        (ZTS_SOL_SOCKET, ZTS_SO_SNDTIMEO) => SockOptName::SendTimeoutMs,
        (ZTS_SOL_SOCKET, ZTS_SO_RCVBUF) => SockOptName::RecvBufferBytes,
        (ZTS_SOL_SOCKET, ZTS_SO_SNDBUF) => SockOptName::SendBufferBytes,
        (ZTS_SOL_SOCKET, ZTS_SO_LINGER) => SockOptName::LingerMs,
        (ZTS_IPPROTO_TCP, ZTS_TCP_NODELAY) => SockOptName::TcpNoDelay,
        (ZTS_IPPROTO_IP, ZTS_IP_TTL) => SockOptName::IpTtl,
        _ => return fail(ZtError::NoProtoOpt),
    };
    let rt = RUNTIME.lock();
    let live = match &rt.live {
        Some(live) => live,
        None => return fail(ZtError::Service),
    };
    match live.sockets.getsockopt(fd, name) {
        Ok(SockOpt::ReuseAddr(v))
        | Ok(SockOpt::KeepAlive(v))
        | Ok(SockOpt::TcpNoDelay(v))
        | Ok(SockOpt::Broadcast(v)) => {
            write_u32(optval, optlen, v as u32);
            0
        }
        Ok(SockOpt::RecvTimeoutMs(v)) | Ok(SockOpt::SendTimeoutMs(v)) | Ok(SockOpt::RecvBufferBytes(v)) | Ok(SockOpt::SendBufferBytes(v)) => {
            write_u32(optval, optlen, v);
            0
        }
        Ok(SockOpt::LingerMs(v)) => {
            write_u32(optval, optlen, v.unwrap_or(0));
            0
        }
        Ok(SockOpt::IpTtl(v)) => {
            write_u32(optval, optlen, v as u32);
            0
        }
        Err(e) => fail(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_wire_accepts_only_inet_and_inet6() {
        assert_eq!(family_from_wire(ZTS_AF_INET), Some(Family::Inet));
        assert_eq!(family_from_wire(ZTS_AF_INET6), Some(Family::Inet6));
        assert_eq!(family_from_wire(99), None);
    }

    #[test]
    fn type_from_wire_accepts_only_stream_and_dgram() {
        assert_eq!(type_from_wire(ZTS_SOCK_STREAM), Some(SockType::Stream));
        assert_eq!(type_from_wire(ZTS_SOCK_DGRAM), Some(SockType::Dgram));
        assert_eq!(type_from_wire(99), None);
    }

    #[test]
    fn recv_flags_from_wire_decodes_peek_and_dontwait_independently() {
        let both = recv_flags_from_wire(ZTS_MSG_PEEK | ZTS_MSG_DONTWAIT);
        assert!(both.peek && both.dontwait);
        let neither = recv_flags_from_wire(0);
        assert!(!neither.peek && !neither.dontwait);
        assert!(recv_flags_from_wire(ZTS_MSG_PEEK).peek);
        assert!(recv_flags_from_wire(ZTS_MSG_DONTWAIT).dontwait);
    }

    #[test]
    fn read_u32_rejects_null_and_short_buffers() {
        let buf: [u8; 4] = 42u32.to_ne_bytes();
        assert_eq!(unsafe { read_u32(buf.as_ptr(), 4) }, Some(42));
        assert_eq!(unsafe { read_u32(std::ptr::null(), 4) }, None);
        assert_eq!(unsafe { read_u32(buf.as_ptr(), 2) }, None);
    }

    #[test]
    fn write_u32_round_trips_and_reports_length() {
        let mut buf = [0u8; 4];
        let mut len: ZtsSocklenT = 0;
        unsafe { write_u32(buf.as_mut_ptr(), &mut len, 7) };
        assert_eq!(u32::from_ne_bytes(buf), 7);
        assert_eq!(len, 4);
    }
}
