// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The TCP/IP stack driver (component C6) and socket façade (component C7).
//! Built on `smoltcp`, the one dependency in this workspace neither the
//! teacher nor any single pack repo carries wholesale — picked because it is
//! the `no_std`-capable, pure-Rust stack the broader retrieval pack reaches
//! for whenever a user-space netif/socket layer is needed (grounded on
//! `RedHatOnTop-kernel-performed-illegal-operation/network` and several
//! `other_examples` files), matching spec.md Design Note 9's "polymorphism
//! over network stack" guidance: one `Stack` capability, one implementation.
//!
//! Layout mirrors the crate's two components: [`device`]/[`stack`] drive the
//! per-network `smoltcp::iface::Interface` (C6); [`socket`] is the
//! file-descriptor-table socket façade (C7) built on top of it.

pub mod device;
pub mod socket;
pub mod stack;

pub use socket::{Family, RecvFlags, ShutdownHow, SockOpt, SockOptName, SockType, SocketState, SocketTable};
pub use stack::{SmolStack, StackConfig};
