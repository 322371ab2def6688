//! # pushgate-server
//!
//! The concurrency engine of the pushgate gateway: sharded connection
//! registry, per-connection actors, and the assembly that ties them to a
//! WebSocket transport.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `websocket::connection` | Per-connection actor: outbound queue, read/write flows, shutdown latch |
//! | `websocket::handshake` | Axum upgrade boundary, `/ws` and `/metrics` routing |
//! | `bucket` | One registry shard: register/evict, unicast, broadcast, close reconciliation |
//! | `gateway` | Owns the fixed bucket array, routes by shard index, runs the online monitor |
//! | `ack` | Acknowledgment subsystem contract consumed by reliable sends |
//! | `settings` | Externally supplied gateway configuration |
//! | `metrics` | Prometheus recorder helpers and metric name constants |
//!
//! ## Data Flow
//!
//! Inbound frame → connection inbound flow → [`websocket::connection::Receiver`].
//! Outbound payload → [`bucket::Bucket::send`] / [`bucket::Bucket::broadcast`]
//! → connection outbound queue → outbound flow → transport write.

#![deny(unsafe_code)]

pub mod ack;
pub mod bucket;
pub mod gateway;
pub mod metrics;
pub mod settings;
pub mod websocket;

pub use ack::{Acker, MemoryAcker};
pub use bucket::Bucket;
pub use gateway::Gateway;
pub use settings::GatewaySettings;
pub use websocket::connection::{ClientConnection, CloseNotice, HandshakeRequest, Receiver};
