//! The gateway assembler: a fixed array of buckets behind the sharding index.
//!
//! The gateway owns `shard_count` buckets, created once at startup and
//! never resharded. Unicasts route through [`pushgate_core::shard::shard_index`];
//! broadcasts fan out shard by shard and merge the per-shard outcomes into
//! one aggregate. A periodic monitor flushes every bucket's cached counter
//! and publishes the global online gauge.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::gauge;
use pushgate_core::errors::{GatewayError, Result};
use pushgate_core::ids::DeliveryIdGen;
use pushgate_core::shard::shard_index;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ack::Acker;
use crate::bucket::Bucket;
use crate::metrics::ONLINE_CONNECTIONS;
use crate::settings::{GatewaySettings, SettingsError};

/// The assembled gateway: all shards plus the process-lifetime plumbing.
pub struct Gateway {
    buckets: Vec<Arc<Bucket>>,
    settings: Arc<GatewaySettings>,
    /// Last-flushed global online count.
    online: AtomicI64,
    /// Base cancellation context; stops the monitor and marks shutdown.
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("shards", &self.buckets.len())
            .field("online", &self.online.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Validate settings and build the fixed bucket array.
    ///
    /// Must run inside a tokio runtime (each bucket spawns its
    /// reconciliation task).
    pub fn new(
        settings: GatewaySettings,
        acker: Arc<dyn Acker>,
    ) -> std::result::Result<Arc<Self>, SettingsError> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let delivery_ids = Arc::new(DeliveryIdGen::new());
        let buckets = (0..settings.shard_count)
            .map(|_| {
                Bucket::new(
                    Arc::clone(&settings),
                    Arc::clone(&acker),
                    Arc::clone(&delivery_ids),
                )
            })
            .collect();
        info!(shards = settings.shard_count, "gateway assembled");
        Ok(Arc::new(Self {
            buckets,
            settings,
            online: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Shard registry a token routes to. Stable for the process lifetime.
    pub fn bucket_for(&self, token: &str) -> &Arc<Bucket> {
        &self.buckets[shard_index(token, self.buckets.len())]
    }

    /// Unicast to one token, wherever its shard is.
    pub fn send(&self, token: &str, payload: Bytes, reliable: bool) -> Result<()> {
        self.bucket_for(token).send(token, payload, reliable)
    }

    /// Fan out to every connection in every shard.
    ///
    /// Per-shard outcomes are merged: the aggregate succeeds only when no
    /// shard reported a failing token, and otherwise carries the total
    /// success count plus every failing token across shards.
    pub fn broadcast(&self, payload: &Bytes, reliable: bool) -> Result<usize> {
        let mut success = 0;
        let mut failed_tokens = Vec::new();
        for bucket in &self.buckets {
            match bucket.broadcast(payload, reliable) {
                Ok(count) => success += count,
                Err(GatewayError::PartialBroadcast {
                    success: shard_success,
                    failed_tokens: shard_failed,
                }) => {
                    success += shard_success;
                    failed_tokens.extend(shard_failed);
                }
                Err(other) => return Err(other),
            }
        }
        if failed_tokens.is_empty() {
            Ok(success)
        } else {
            Err(GatewayError::PartialBroadcast {
                success,
                failed_tokens,
            })
        }
    }

    /// Best-effort disconnect by token.
    pub fn offline(&self, token: &str) {
        self.bucket_for(token).offline(token);
    }

    /// Presence check by token.
    pub fn is_online(&self, token: &str) -> bool {
        self.bucket_for(token).is_online(token)
    }

    /// Last-flushed global online count.
    pub fn onlines(&self) -> i64 {
        self.online.load(Ordering::Relaxed)
    }

    /// Gateway configuration snapshot.
    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Flush every shard and publish the global gauge. The monitor calls
    /// this on its interval; tests call it directly.
    pub fn flush_onlines(&self) -> i64 {
        let mut total = 0;
        for bucket in &self.buckets {
            bucket.flush();
            total += bucket.onlines();
        }
        self.online.store(total, Ordering::Relaxed);
        gauge!(ONLINE_CONNECTIONS).set(total as f64);
        debug!(online = total, "online counters flushed");
        total
    }

    /// Periodic online monitor. Runs until [`Gateway::close`] cancels the
    /// base context.
    pub async fn run_online_monitor(self: Arc<Self>) {
        let interval = Duration::from_secs(self.settings.flush_interval_secs.max(1));
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    let _ = self.flush_onlines();
                }
            }
        }
        info!("online monitor stopped");
    }

    /// Cancel the base context: stops the monitor and disconnects every
    /// registered session, shard by shard.
    pub fn close(&self) {
        self.shutdown.cancel();
        for bucket in &self.buckets {
            bucket.offline_all();
        }
    }

    /// Whether [`Gateway::close`] has been requested.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
