//! Error types for the gateway.
//!
//! Every failure here is connection- or request-scoped. Nothing in this
//! taxonomy is allowed to take down a bucket or the process: a transport
//! fault closes the one connection it belongs to, a full queue rejects the
//! one enqueue that hit it, and a partial broadcast reports which tokens
//! failed without aborting the fan-out.

use thiserror::Error;

/// Convenience alias used across the gateway crates.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// WebSocket upgrade/handshake failed; the connection was never created.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// Unicast target is not registered in its shard. Non-fatal.
    #[error("no connection registered for token '{token}'")]
    NoSuchConnection {
        /// Token that was looked up.
        token: String,
    },

    /// Outbound queue occupancy crossed the backpressure threshold.
    ///
    /// Advisory: the connection survives and nothing was enqueued. Callers
    /// decide whether to drop, retry, or escalate.
    #[error("outbound queue for token '{token}' is saturated ({len}/{capacity})")]
    QueueFull {
        /// Token of the slow consumer.
        token: String,
        /// Queue occupancy at the time of the rejected enqueue.
        len: usize,
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Enqueue raced with connection teardown; the queue consumer is gone.
    #[error("connection for token '{token}' is closed")]
    ConnectionClosed {
        /// Token of the closed connection.
        token: String,
    },

    /// Envelope serialization failed.
    #[error("envelope encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// An inbound or stored envelope could not be decoded.
    #[error("envelope decode failed: {0}")]
    Decode(String),

    /// The ack subsystem refused to register a reliable delivery.
    /// The send is not attempted.
    #[error("ack registration failed: {0}")]
    AckRegistration(#[from] AckError),

    /// Broadcast completed its full iteration but some sends failed.
    #[error("broadcast delivered to {success} connection(s), failed for {} token(s): {}", failed_tokens.len(), failed_tokens.join(", "))]
    PartialBroadcast {
        /// Number of connections that accepted the envelope.
        success: usize,
        /// Tokens whose send failed, in iteration order.
        failed_tokens: Vec<String>,
    },
}

/// Errors surfaced by the acknowledgment subsystem contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AckError {
    /// A pending delivery already exists under this (token, delivery id) pair.
    #[error("delivery {delivery_id} for token '{token}' is already pending")]
    DuplicateDelivery {
        /// Session token of the duplicate registration.
        token: String,
        /// Delivery id of the duplicate registration.
        delivery_id: i64,
    },
}
