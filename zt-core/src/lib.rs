// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Core overlay-socket-runtime types shared by every embedder: the event
//! pipeline (C1), state-store capability (C2), UDP binder (C3), opaque Node
//! facade (C4), virtual tap (C5) and Node Service orchestrator (C8).
//! `zt-netstack` builds the TCP/IP stack driver (C6) and socket façade (C7)
//! on top of the types exported here; `zt-ffi` and `zt-service` are the
//! only crates that construct a [`service::NodeService`] directly.

pub mod binder;
pub mod config;
pub mod event;
pub mod network;
pub mod node;
pub mod peer;
pub mod service;
pub mod store;
pub mod tap;

pub use config::NodeServiceConfig;
pub use event::{Event, EventCode, EventHandler, EventQueue, TermReason};
pub use network::{NetworkConfig, NetworkConfigSink, NetworkSettings, NetworkState, Route};
pub use node::{test_support::FakeNode, Node, NodeId, NodeResult};
pub use peer::{PeerPath, PeerRole, PeerSnapshot};
pub use service::NodeService;
pub use store::{MemoryStore, StateStore, StoreKind};
pub use tap::{EthernetFrame, FrameSink, Mac, MulticastGroup, NetifHandle, NetifManager, NetworkStatus, OutboundFrameSink, VirtualTap};
pub use binder::{BindPolicy, BoundUdpPort, BoundUdpSocket, UdpBinder};
