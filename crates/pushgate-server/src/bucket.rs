//! One shard of the connection registry.
//!
//! A bucket owns one partition of the global token → connection map, its
//! own read/write lock, a cached online counter, and the close-notification
//! conduit shared by every connection it owns. Buckets never coordinate
//! with each other; the sharding index guarantees a token always routes to
//! the same bucket, so per-shard uniqueness is global uniqueness.
//!
//! Map entries are removed by the bucket's reconciliation task, which
//! drains the conduit and deletes an entry only when the current occupant
//! is the exact instance that emitted the notice. A newer session that
//! already replaced the slot is therefore never deleted by its
//! predecessor's teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use metrics::counter;
use parking_lot::RwLock;
use pushgate_core::envelope::Envelope;
use pushgate_core::errors::{GatewayError, Result};
use pushgate_core::ids::DeliveryIdGen;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ack::Acker;
use crate::metrics::{BROADCAST_FAILURES_TOTAL, EVICTIONS_TOTAL};
use crate::settings::GatewaySettings;
use crate::websocket::connection::{ClientConnection, CloseNotice, HandshakeRequest};

/// One partition of the connection registry.
pub struct Bucket {
    clients: RwLock<HashMap<String, Arc<ClientConnection>>>,
    /// Cached connection count. Eventually consistent: incremented on
    /// register, corrected only by [`Bucket::flush`].
    online: AtomicI64,
    close_tx: mpsc::UnboundedSender<CloseNotice>,
    acker: Arc<dyn Acker>,
    delivery_ids: Arc<DeliveryIdGen>,
    settings: Arc<GatewaySettings>,
}

impl Bucket {
    /// Build a bucket and start its close-notice reconciliation task.
    ///
    /// Must run inside a tokio runtime. The task holds only a weak
    /// reference and exits when the bucket is dropped.
    pub fn new(
        settings: Arc<GatewaySettings>,
        acker: Arc<dyn Acker>,
        delivery_ids: Arc<DeliveryIdGen>,
    ) -> Arc<Self> {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let bucket = Arc::new(Self {
            clients: RwLock::new(HashMap::with_capacity(settings.bucket_capacity_hint)),
            online: AtomicI64::new(0),
            close_tx,
            acker,
            delivery_ids,
            settings,
        });
        let _ = tokio::spawn(run_reconciler(Arc::downgrade(&bucket), close_rx));
        bucket
    }

    /// Build a connection actor with this shard's defaults.
    ///
    /// The returned receiver is the outbound queue consumer, to be handed
    /// to the outbound flow when the socket is wired up.
    pub fn create_connection(
        &self,
        token: impl Into<String>,
        request: HandshakeRequest,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Envelope>) {
        ClientConnection::new(
            token,
            self.settings.encoding,
            self.settings.frame_kind,
            self.settings.client_buffer_size,
            self.close_tx.clone(),
            request,
        )
    }

    /// Install a connection under its token. Newest session wins: an
    /// existing occupant is replaced in the map and then evicted with its
    /// close notice suppressed, so the old instance's teardown cannot tear
    /// the new entry out of the map.
    pub fn register(&self, conn: Arc<ClientConnection>) {
        let token = conn.token().to_owned();
        let evicted = {
            let mut clients = self.clients.write();
            let old = clients.insert(token.clone(), conn);
            if old.is_none() {
                let _ = self.online.fetch_add(1, Ordering::Relaxed);
            }
            old
        };
        // Teardown involves transport I/O latency; run it outside the
        // exclusive lock so unrelated register/send callers don't queue
        // behind it.
        if let Some(old) = evicted {
            warn!(token = %token, old_conn = %old.conn_id(), "token already online, evicting previous session");
            counter!(EVICTIONS_TOTAL).increment(1);
            old.offline_for_retry();
        }
    }

    /// Unicast to one token.
    ///
    /// Reliable sends are registered with the ack subsystem first; if that
    /// registration fails the envelope is not forwarded.
    pub fn send(&self, token: &str, payload: Bytes, reliable: bool) -> Result<()> {
        let conn = self
            .clients
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| GatewayError::NoSuchConnection {
                token: token.to_owned(),
            })?;
        self.forward(&conn, payload, reliable)
    }

    /// Fan out to every connection in the shard.
    ///
    /// The shard lock is held shared for the full iteration; the sharding
    /// index keeps shards small enough that this stays short. Per-entry
    /// failures never abort the loop; the aggregate outcome reports the
    /// success count or, when anything failed, the failing tokens.
    pub fn broadcast(&self, payload: &Bytes, reliable: bool) -> Result<usize> {
        let mut success = 0;
        let mut failed_tokens = Vec::new();
        {
            let clients = self.clients.read();
            for (token, conn) in clients.iter() {
                match self.forward(conn, payload.clone(), reliable) {
                    Ok(()) => success += 1,
                    Err(e) => {
                        debug!(token = %token, error = %e, "broadcast send failed");
                        failed_tokens.push(token.clone());
                    }
                }
            }
        }
        if failed_tokens.is_empty() {
            Ok(success)
        } else {
            counter!(BROADCAST_FAILURES_TOTAL).increment(failed_tokens.len() as u64);
            Err(GatewayError::PartialBroadcast {
                success,
                failed_tokens,
            })
        }
    }

    /// Best-effort disconnect: look up and shut down, no-op when absent.
    /// Map removal happens when the reconciliation task drains the notice.
    pub fn offline(&self, token: &str) {
        let conn = self.clients.read().get(token).cloned();
        if let Some(conn) = conn {
            conn.offline();
        }
    }

    /// Disconnect every session in the shard. Process-shutdown path; each
    /// connection tears down through its own latch and notice.
    pub fn offline_all(&self) {
        let conns: Vec<_> = self.clients.read().values().cloned().collect();
        for conn in conns {
            conn.offline();
        }
    }

    /// Presence check.
    pub fn is_online(&self, token: &str) -> bool {
        self.clients.read().contains_key(token)
    }

    /// Recompute the cached online counter from the true map size.
    /// Invoked by the gateway's periodic monitor, never self-scheduled.
    pub fn flush(&self) {
        let len = self.clients.read().len() as i64;
        self.online.store(len, Ordering::Relaxed);
    }

    /// Last-flushed online count. Lock-free; may transiently lag the map.
    pub fn onlines(&self) -> i64 {
        self.online.load(Ordering::Relaxed)
    }

    /// Write end of the close-notification conduit, for connections created
    /// outside [`Bucket::create_connection`].
    pub fn close_notifier(&self) -> mpsc::UnboundedSender<CloseNotice> {
        self.close_tx.clone()
    }

    fn forward(&self, conn: &Arc<ClientConnection>, payload: Bytes, reliable: bool) -> Result<()> {
        if reliable {
            let delivery_id = self.delivery_ids.next_id();
            self.acker.add_message(conn.token(), delivery_id, &payload)?;
            conn.send(payload, delivery_id)
        } else {
            conn.send(payload, 0)
        }
    }

    /// Remove the notice's map entry, but only if the current occupant is
    /// the instance that emitted it.
    fn reconcile(&self, notice: &CloseNotice) {
        let mut clients = self.clients.write();
        match clients.get(&notice.token) {
            Some(current) if current.conn_id() == notice.conn_id => {
                let _ = clients.remove(&notice.token);
                debug!(token = %notice.token, conn = %notice.conn_id, "reconciled closed connection");
            }
            Some(_) => {
                debug!(token = %notice.token, conn = %notice.conn_id, "stale close notice, slot already replaced");
            }
            None => {}
        }
    }
}

/// Drain the bucket's conduit for its whole lifetime.
async fn run_reconciler(bucket: Weak<Bucket>, mut close_rx: mpsc::UnboundedReceiver<CloseNotice>) {
    while let Some(notice) = close_rx.recv().await {
        let Some(bucket) = bucket.upgrade() else { break };
        bucket.reconcile(&notice);
    }
}
