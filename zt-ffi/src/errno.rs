// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! `zts_errno` plus the abstract-kind -> small-integer mapping spec.md §6/§7
//! requires at the C boundary ("non-negative on success; `-1` with
//! `zts_errno` set on failure"). Grounded on the raw-pointer/thread-local
//! conventions the teacher's own FFI-adjacent code (`capi.rs` bindings used
//! throughout `zerotier-network-hypervisor`) favors over a panicking Result
//! unwrap at a `extern "C"` boundary.

use std::cell::Cell;

use zt_utils::error::ZtError;

pub const ZTS_ERR_OK: i32 = 0;
pub const ZTS_ERR_INVALID_ARG: i32 = 1;
pub const ZTS_ERR_BAD_FD: i32 = 2;
pub const ZTS_ERR_SERVICE: i32 = 3;
pub const ZTS_ERR_INVALID_OP: i32 = 4;
pub const ZTS_ERR_NO_RESULT: i32 = 5;
pub const ZTS_ERR_RESOURCE_EXHAUSTED: i32 = 6;
pub const ZTS_ERR_NO_ROUTE: i32 = 7;
pub const ZTS_ERR_WOULD_BLOCK: i32 = 8;
pub const ZTS_ERR_TIMEOUT: i32 = 9;
pub const ZTS_ERR_NOT_CONNECTED: i32 = 10;
pub const ZTS_ERR_CONN_REFUSED: i32 = 11;
pub const ZTS_ERR_RESET: i32 = 12;
pub const ZTS_ERR_BROKEN_PIPE: i32 = 13;
pub const ZTS_ERR_NO_PROTOOPT: i32 = 14;
pub const ZTS_ERR_GENERAL: i32 = 15;
pub const ZTS_ERR_UNRECOVERABLE: i32 = 16;

thread_local! {
    static LAST_ERRNO: Cell<i32> = const { Cell::new(ZTS_ERR_OK) };
}

pub(crate) fn set_errno(code: i32) {
    LAST_ERRNO.with(|c| c.set(code));
}

pub(crate) fn to_errno(e: ZtError) -> i32 {
    match e {
        ZtError::Ok => ZTS_ERR_OK,
        ZtError::InvalidArg => ZTS_ERR_INVALID_ARG,
        ZtError::BadFd => ZTS_ERR_BAD_FD,
        ZtError::Service => ZTS_ERR_SERVICE,
        ZtError::InvalidOp => ZTS_ERR_INVALID_OP,
        ZtError::NoResult => ZTS_ERR_NO_RESULT,
        ZtError::ResourceExhausted => ZTS_ERR_RESOURCE_EXHAUSTED,
        ZtError::NoRoute => ZTS_ERR_NO_ROUTE,
        ZtError::WouldBlock => ZTS_ERR_WOULD_BLOCK,
        ZtError::Timeout => ZTS_ERR_TIMEOUT,
        ZtError::NotConnected => ZTS_ERR_NOT_CONNECTED,
        ZtError::ConnRefused => ZTS_ERR_CONN_REFUSED,
        ZtError::Reset => ZTS_ERR_RESET,
        ZtError::BrokenPipe => ZTS_ERR_BROKEN_PIPE,
        ZtError::NoProtoOpt => ZTS_ERR_NO_PROTOOPT,
        ZtError::General => ZTS_ERR_GENERAL,
        ZtError::Unrecoverable => ZTS_ERR_UNRECOVERABLE,
    }
}

/// Record `e` as the calling thread's `zts_errno` and return the `-1`
/// failure sentinel every `zts_*` call uses on error.
pub(crate) fn fail(e: ZtError) -> i32 {
    set_errno(to_errno(e));
    -1
}

/// Returns the calling thread's most recently set error code.
#[no_mangle]
pub extern "C" fn zts_errno() -> i32 {
    LAST_ERRNO.with(|c| c.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_sets_errno_and_returns_sentinel() {
        assert_eq!(fail(ZtError::BadFd), -1);
        assert_eq!(zts_errno(), ZTS_ERR_BAD_FD);
    }

    #[test]
    fn errno_defaults_to_ok_on_a_fresh_thread() {
        std::thread::spawn(|| assert_eq!(zts_errno(), ZTS_ERR_OK)).join().unwrap();
    }
}
