//! Distributed garbage collection for RPC runtimes
//!
//! This crate keeps track of which exported objects are referenced by
//! which remote processes, grants time-bounded leases on that liveness,
//! and reclaims objects once no client holds a valid lease.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DgcRuntime (this crate)                 │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  Server half (exporter)      │  Client half (client)        │
//! │  - ObjectTable / Target      │  - EndpointLedger            │
//! │  - LeaseRegistry + sweep     │  - per-endpoint renew loop   │
//! │  - DgcServer dirty/clean     │  - DirtyBackoff, clean retry │
//! │  - KeepAlive + reaper        │  - LiveRef trackers          │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  AckCoordinator (holds marshaled objects until ack/timeout) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  protocol: allow-listed wire codec, loopback, framed TCP    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! - **Dirty**: a client announces it holds references and asks for a lease
//! - **Clean**: a client announces it no longer holds references
//! - **Lease**: time-bounded liveness granted to one client VM
//! - **VmId**: identifies a client process across all of its leases
//! - **Sequence number**: orders dirty/clean calls from one client so
//!   late retries cannot undo newer decisions
//! - **Strong clean**: a clean whose sequence number is remembered for good
//!
//! # Modules
//!
//! - [`types`]: identifiers, endpoints, leases and errors
//! - [`exporter`]: server-side tables and the `dirty`/`clean` service
//! - [`client`]: client-side reference tracking and lease renewal
//! - [`ack`]: acknowledgment holds
//! - [`protocol`]: wire codec and transports
//! - [`runtime`]: the per-process service object

pub mod ack;
pub mod client;
pub mod clock;
pub mod config;
pub mod exporter;
pub mod protocol;
pub mod reclaim;
pub mod runtime;
pub mod types;

pub use ack::{AckCoordinator, PendingAck};
pub use client::{DgcClient, EndpointLedger, EndpointPhase, LiveRef};
pub use clock::{LeaseClock, ManualClock, SystemClock};
pub use config::DgcConfig;
pub use exporter::{
    DgcServer, ExportOptions, Exported, LeaseRegistry, ObjectTable, RemoteObject, Target,
    Unreferenced,
};
pub use protocol::{DgcDispatcher, DgcListener, LoopbackConnector, TcpConnector};
pub use runtime::{DgcRuntime, DgcRuntimeBuilder};
pub use types::{
    AckId, DgcError, Endpoint, FactoryId, FaultKind, Lease, ObjectId, RemoteRef, Result, VmId,
};

/// Wire protocol version spoken by this implementation
pub const WIRE_VERSION: u8 = protocol::wire::WIRE_VERSION;
