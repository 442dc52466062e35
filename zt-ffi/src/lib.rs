// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! BSD-shaped C ABI over the overlay socket runtime (spec.md §6). Grounded
//! on `other_examples`'s `rust-zerotier-core::node`'s `extern "C"`
//! callback-trampoline style — there a generic Rust `Node<T, N>` is driven
//! by an external C library that calls back into Rust through raw function
//! pointers; here the direction is inverted (we *are* the library a C host
//! embeds), so the callback flows the other way: the host hands us one
//! `extern "C" fn` pointer via [`lifecycle::zts_init_set_event_handler`] and
//! we invoke it directly from the event dispatcher thread, with no capi
//! shim layer needed since there's no foreign struct to marshal through.
//!
//! Design Note (spec.md §9, "Global service singleton"): the original has a
//! process-wide `zt1Service` pointer; this crate keeps one explicit
//! [`runtime::Runtime`] internally but exposes it only as a process-local
//! default handle, matching the note's "bindings may keep a process-local
//! default handle for convenience" — every external symbol here is a bare
//! function, no handle parameter, exactly like spec.md §6's lifecycle table.

mod errno;
mod lifecycle;
mod query;
mod runtime;
mod socket;
mod types;

pub use errno::zts_errno;
pub use lifecycle::*;
pub use query::*;
pub use socket::*;
pub use types::{ZtsSockaddr, ZtsSockaddrIn, ZtsSockaddrIn6, ZtsSockaddrStorage, ZtsSocklenT, ZtsSsizeT, ZTS_AF_INET, ZTS_AF_INET6, ZTS_SOCK_DGRAM, ZTS_SOCK_STREAM};
