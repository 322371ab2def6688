//! WebSocket-facing half of the gateway.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `connection` | Per-connection actor: bounded outbound queue, inbound/outbound flows, idempotent shutdown |
//! | `handshake` | Axum upgrade boundary and minimal `/ws` + `/metrics` routing |

pub mod connection;
pub mod handshake;
