// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Process exit codes, BSD `sysexits.h` numbering.

pub const OK: i32 = 0;
pub const ERR_USAGE: i32 = 64;
pub const ERR_IOERR: i32 = 74;
