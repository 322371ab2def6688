//! Acknowledgment subsystem contract.
//!
//! Reliable sends are tracked by an acknowledgment subsystem the registry
//! consumes but does not implement: the bucket registers a delivery under
//! `(token, delivery_id)` *before* forwarding the envelope, and refuses to
//! send when registration fails. Retry, timeout, and cleanup policy belong
//! to the implementation and are opaque to the core.

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pushgate_core::AckError;

/// Capability the bucket requires from the acknowledgment subsystem.
pub trait Acker: Send + Sync {
    /// Register a pending reliable delivery.
    ///
    /// Fails when a delivery under the same `(token, delivery_id)` pair is
    /// already pending; the caller must not send in that case.
    fn add_message(&self, token: &str, delivery_id: i64, payload: &Bytes) -> Result<(), AckError>;
}

/// In-memory [`Acker`].
///
/// Tracks pending deliveries in a concurrent map. Confirmation removes the
/// entry; everything else (redelivery, expiry) is left to the embedding
/// application.
#[derive(Debug, Default)]
pub struct MemoryAcker {
    pending: DashMap<(String, i64), Bytes>,
}

impl MemoryAcker {
    /// New, empty acker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm a delivery, removing its pending record.
    /// Returns `false` when no such delivery was pending.
    pub fn confirm(&self, token: &str, delivery_id: i64) -> bool {
        self.pending
            .remove(&(token.to_owned(), delivery_id))
            .is_some()
    }

    /// Number of deliveries awaiting confirmation.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Acker for MemoryAcker {
    fn add_message(&self, token: &str, delivery_id: i64, payload: &Bytes) -> Result<(), AckError> {
        let key = (token.to_owned(), delivery_id);
        match self.pending.entry(key) {
            Entry::Occupied(_) => Err(AckError::DuplicateDelivery {
                token: token.to_owned(),
                delivery_id,
            }),
            Entry::Vacant(slot) => {
                let _ = slot.insert(payload.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_confirm() {
        let acker = MemoryAcker::new();
        acker
            .add_message("t1", 1, &Bytes::from_static(b"payload"))
            .unwrap();
        assert_eq!(acker.pending(), 1);
        assert!(acker.confirm("t1", 1));
        assert_eq!(acker.pending(), 0);
    }

    #[test]
    fn duplicate_delivery_rejected() {
        let acker = MemoryAcker::new();
        acker.add_message("t1", 5, &Bytes::from_static(b"a")).unwrap();
        let err = acker
            .add_message("t1", 5, &Bytes::from_static(b"b"))
            .unwrap_err();
        assert_eq!(
            err,
            AckError::DuplicateDelivery {
                token: "t1".into(),
                delivery_id: 5,
            }
        );
        // The original payload is untouched.
        assert_eq!(acker.pending(), 1);
    }

    #[test]
    fn same_id_different_tokens_are_distinct() {
        let acker = MemoryAcker::new();
        acker.add_message("t1", 9, &Bytes::from_static(b"a")).unwrap();
        acker.add_message("t2", 9, &Bytes::from_static(b"b")).unwrap();
        assert_eq!(acker.pending(), 2);
    }

    #[test]
    fn confirm_unknown_delivery_is_noop() {
        let acker = MemoryAcker::new();
        assert!(!acker.confirm("nobody", 1));
    }
}
