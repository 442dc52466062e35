// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The embedder-facing daemon: on-disk state store, `local.conf` loading,
//! logging and CLI, wired around a [`zt_core::service::NodeService`]. Built
//! as a library so `zt-ffi` can reuse [`filestore::FileStore`] for its own
//! `init_from_storage` entry point without duplicating the on-disk layout.

pub mod exitcode;
pub mod filestore;
pub mod identity;
pub mod localconfig;
pub mod log;
pub mod netif;
pub mod util;

pub use filestore::FileStore;
pub use identity::NodeIdentity;
pub use localconfig::LocalConfig;
pub use log::Log;
