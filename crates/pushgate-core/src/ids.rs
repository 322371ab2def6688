//! Id sources: reliable-delivery ids and connection-instance ids.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Generates delivery ids for reliable sends.
///
/// Ids key the ack subsystem's pending map together with the token, so two
/// in-flight reliable sends to the same token must never share an id. A
/// monotonic counter guarantees that within a process; the starting point
/// is randomized so ids from a restarted process do not collide with ids a
/// client still holds from the previous one.
#[derive(Debug)]
pub struct DeliveryIdGen {
    next: AtomicI64,
}

impl DeliveryIdGen {
    /// New generator with a randomized starting point.
    pub fn new() -> Self {
        // High 32 bits random, low 32 bits count from 1. Positive by
        // construction so 0 stays reserved for "no delivery id".
        let base = (i64::from(rand::random::<u32>() >> 1) << 32) | 1;
        Self {
            next: AtomicI64::new(base),
        }
    }

    /// Next delivery id. Strictly increasing, never 0.
    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DeliveryIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-unique identity of one connection *instance*.
///
/// Tokens identify logical sessions and get reused across reconnects; the
/// close-notification reconciliation needs to tell apart "the connection
/// that emitted this notice" from "whatever currently occupies the token's
/// slot". Comparing `ConnId`s answers that without holding the old `Arc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    /// Allocate the next connection id.
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
