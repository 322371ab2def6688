//! # pushgate-core
//!
//! Foundation types for the pushgate push/messaging gateway.
//!
//! This crate provides the shared vocabulary the server crate builds on:
//!
//! - **Errors**: [`errors::GatewayError`] hierarchy via `thiserror`
//! - **Wire envelope**: [`envelope::Envelope`] with JSON and compact binary codecs
//! - **Sharding**: [`shard::shard_index`] token → shard ordinal mapping
//! - **Ids**: [`ids::DeliveryIdGen`] for reliable-delivery ids, [`ids::ConnId`]
//!   for connection-instance identity
//! - **Logging**: [`logging::init`] tracing bootstrap
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `pushgate-server`.

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod shard;

pub use envelope::{Encoding, Envelope, FrameKind};
pub use errors::{AckError, GatewayError, Result};
