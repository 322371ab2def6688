//! The per-connection actor.
//!
//! Every accepted session is one [`ClientConnection`] owning one physical
//! WebSocket. Two independently scheduled flows run for the connection's
//! whole lifetime and share nothing but the connection's own queue and
//! shutdown signal:
//!
//! - the **outbound flow** drains the bounded envelope queue, serializes
//!   under the negotiated encoding, and writes one frame per envelope;
//! - the **inbound flow** reads frames and hands each one to the external
//!   [`Receiver`] handler.
//!
//! Shutdown is a single-use latch: explicit offline, duplicate-login
//! eviction, a read fault, and a write fault can all race, and exactly one
//! of them runs the teardown sequence. Teardown cancels both flows, lets
//! the outbound flow close the socket, and — unless suppressed for the
//! eviction path — emits a [`CloseNotice`] on the bucket's shared conduit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::http::{HeaderMap, Uri};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use pushgate_core::envelope::{Encoding, Envelope, FrameKind};
use pushgate_core::errors::{GatewayError, Result};
use pushgate_core::ids::ConnId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{DEGRADED_WRITES_TOTAL, DISCONNECTIONS_TOTAL, QUEUE_FULL_TOTAL};

/// A write slower than this is logged as a degraded network, not a fault.
const SLOW_WRITE_THRESHOLD: Duration = Duration::from_secs(2);

/// Emitted on the bucket's conduit when a connection tears itself down.
///
/// Carries the connection *instance* id so the reconciliation flow can
/// refuse to delete a newer session that already replaced this one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseNotice {
    /// Token of the closed session.
    pub token: String,
    /// Instance that emitted the notice.
    pub conn_id: ConnId,
}

/// Snapshot of the HTTP request that originated a connection.
///
/// The socket outlives the upgrade request, so the parts downstream
/// consumers ask about (routing, auth headers, client metadata) are
/// captured at handshake time and kept on the connection.
#[derive(Clone, Debug, Default)]
pub struct HandshakeRequest {
    /// Request URI, query string included.
    pub uri: Uri,
    /// Headers as received at upgrade time.
    pub headers: HeaderMap,
}

/// External handler for inbound frames.
///
/// Invoked once per data frame on the inbound flow's own task; it must not
/// block indefinitely or the connection stops reading.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Handle one raw inbound frame.
    async fn handle(&self, conn: &Arc<ClientConnection>, frame: Bytes);
}

/// One live session: the actor side of a physical duplex connection.
pub struct ClientConnection {
    token: String,
    conn_id: ConnId,
    encoding: Encoding,
    frame_kind: FrameKind,
    outbound: mpsc::Sender<Envelope>,
    queue_capacity: usize,
    last_heartbeat: AtomicI64,
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_tx: mpsc::UnboundedSender<CloseNotice>,
    request: HandshakeRequest,
}

impl ClientConnection {
    /// Build a connection actor and hand back the outbound queue consumer.
    ///
    /// The receiver side belongs to the outbound flow; callers wiring a
    /// real socket pass it to [`spawn_flows`]. Tests hold it directly.
    pub fn new(
        token: impl Into<String>,
        encoding: Encoding,
        frame_kind: FrameKind,
        queue_capacity: usize,
        close_tx: mpsc::UnboundedSender<CloseNotice>,
        request: HandshakeRequest,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let conn = Arc::new(Self {
            token: token.into(),
            conn_id: ConnId::next(),
            encoding,
            frame_kind,
            outbound: tx,
            queue_capacity,
            last_heartbeat: AtomicI64::new(now_unix_secs()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_tx,
            request,
        });
        (conn, rx)
    }

    /// The request that originated this connection.
    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// Session token this connection serves.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Process-unique id of this connection instance.
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Negotiated envelope encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Negotiated outbound frame kind.
    pub fn frame_kind(&self) -> FrameKind {
        self.frame_kind
    }

    /// Whether the shutdown latch has fired.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once shutdown is signalled. Both flows wait on this.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await;
    }

    /// Enqueue one envelope for the outbound flow.
    ///
    /// Backpressure is advisory and soft: once the queue sits above 70% of
    /// its capacity the enqueue is refused with
    /// [`GatewayError::QueueFull`] and nothing is queued. The call never
    /// blocks; the caller decides whether to drop, retry, or kick the slow
    /// consumer.
    pub fn send(&self, payload: Bytes, delivery_id: i64) -> Result<()> {
        let occupancy = self.queue_capacity - self.outbound.capacity();
        if occupancy * 10 > self.queue_capacity * 7 {
            counter!(QUEUE_FULL_TOTAL).increment(1);
            return Err(GatewayError::QueueFull {
                token: self.token.clone(),
                len: occupancy,
                capacity: self.queue_capacity,
            });
        }
        match self.outbound.try_send(Envelope::new(delivery_id, payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(QUEUE_FULL_TOTAL).increment(1);
                Err(GatewayError::QueueFull {
                    token: self.token.clone(),
                    len: self.queue_capacity,
                    capacity: self.queue_capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::ConnectionClosed {
                token: self.token.clone(),
            }),
        }
    }

    /// Request shutdown; the token is emitted on the close conduit so the
    /// bucket's reconciliation flow can drop the map entry.
    pub fn offline(&self) {
        let _ = self.close(false);
    }

    /// Request shutdown *without* a close notice.
    ///
    /// Only the duplicate-login eviction path uses this: the evicted
    /// connection's slot is being overwritten by a newer session, and a
    /// notice from the old instance must not tear the new entry out of the
    /// map.
    pub fn offline_for_retry(&self) {
        let _ = self.close(true);
    }

    /// Seconds-since-epoch of the last observed heartbeat frame.
    pub fn last_heartbeat(&self) -> i64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    /// Stamp the liveness clock; called by the receive handler when it
    /// observes a heartbeat frame.
    pub fn reset_heartbeat(&self) {
        self.last_heartbeat.store(now_unix_secs(), Ordering::Relaxed);
    }

    /// Run the teardown sequence exactly once.
    ///
    /// Returns whether *this* call won the latch. Racing triggers (explicit
    /// offline, read fault, write fault, eviction) all funnel here; the
    /// compare-exchange guarantees a single execution no matter the
    /// interleaving.
    pub(crate) fn close(&self, suppress_notify: bool) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.shutdown.cancel();
        if !suppress_notify {
            // Unbounded conduit: emission can never stall teardown even if
            // the reconciliation flow lags.
            let _ = self.close_tx.send(CloseNotice {
                token: self.token.clone(),
                conn_id: self.conn_id,
            });
        }
        counter!(DISCONNECTIONS_TOTAL).increment(1);
        debug!(token = %self.token, conn = %self.conn_id, suppress_notify, "connection closed");
        true
    }
}

/// Spawn both flows for a freshly upgraded socket, plus a supervisor that
/// converts a panic in either flow into an orderly shutdown of this one
/// connection.
pub fn spawn_flows(
    conn: Arc<ClientConnection>,
    socket: WebSocket,
    outbound_rx: mpsc::Receiver<Envelope>,
    handler: Arc<dyn Receiver>,
) {
    let (sink, stream) = socket.split();
    let write = tokio::spawn(outbound_flow(Arc::clone(&conn), sink, outbound_rx));
    let read = tokio::spawn(inbound_flow(Arc::clone(&conn), stream, handler));
    let _ = tokio::spawn(async move {
        for handle in [write, read] {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(token = %conn.token(), error = %e, "connection flow panicked");
                }
                conn.offline();
            }
        }
    });
}

/// Outbound flow: drain the queue, serialize, write one frame per envelope.
async fn outbound_flow(
    conn: Arc<ClientConnection>,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    loop {
        tokio::select! {
            () = conn.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let raw = match envelope.encode(conn.encoding()) {
                    Ok(raw) => raw,
                    Err(e) => {
                        // Request-scoped: drop this envelope, keep the connection.
                        warn!(token = %conn.token(), error = %e, "dropping unencodable envelope");
                        continue;
                    }
                };
                let message = match conn.frame_kind() {
                    FrameKind::Text => {
                        // Settings validation guarantees text frames only
                        // carry JSON, which is valid UTF-8.
                        Message::Text(String::from_utf8_lossy(&raw).into_owned().into())
                    }
                    FrameKind::Binary => Message::Binary(raw),
                };
                let started = Instant::now();
                if let Err(e) = sink.send(message).await {
                    error!(token = %conn.token(), error = %e, "outbound write failed");
                    break;
                }
                let elapsed = started.elapsed();
                if elapsed > SLOW_WRITE_THRESHOLD {
                    counter!(DEGRADED_WRITES_TOTAL).increment(1);
                    warn!(token = %conn.token(), elapsed_ms = elapsed.as_millis() as u64, "degraded network: slow outbound write");
                }
            }
        }
    }
    // Sole owner of the sink: close the transport on the way out, whatever
    // ended the loop.
    let _ = sink.close().await;
    conn.offline();
}

/// Inbound flow: read frames, dispatch each to the receive handler.
async fn inbound_flow(
    conn: Arc<ClientConnection>,
    mut stream: SplitStream<WebSocket>,
    handler: Arc<dyn Receiver>,
) {
    loop {
        tokio::select! {
            () = conn.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => handler.handle(&conn, data).await,
                Some(Ok(Message::Text(text))) => {
                    handler.handle(&conn, Bytes::copy_from_slice(text.as_bytes())).await;
                }
                // Axum answers pings itself; pongs need no action here.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    info!(token = %conn.token(), ?frame, "peer closed connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(token = %conn.token(), error = %e, "inbound read failed");
                    break;
                }
                None => break,
            }
        }
    }
    conn.offline();
}

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_conn(
        capacity: usize,
    ) -> (
        Arc<ClientConnection>,
        mpsc::Receiver<Envelope>,
        mpsc::UnboundedReceiver<CloseNotice>,
    ) {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (conn, rx) = ClientConnection::new(
            "t1",
            Encoding::Json,
            FrameKind::Text,
            capacity,
            close_tx,
            HandshakeRequest::default(),
        );
        (conn, rx, close_rx)
    }

    #[tokio::test]
    async fn originating_request_is_retained() {
        let (close_tx, _close_rx) = mpsc::unbounded_channel();
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-client-version", "7.2.0".parse().unwrap());
        let request = HandshakeRequest {
            uri: "/ws?token=t1".parse().unwrap(),
            headers,
        };
        let (conn, _rx) = ClientConnection::new(
            "t1",
            Encoding::Json,
            FrameKind::Text,
            4,
            close_tx,
            request,
        );
        assert_eq!(conn.request().uri.path(), "/ws");
        assert_eq!(conn.request().uri.query(), Some("token=t1"));
        assert_eq!(
            conn.request().headers.get("x-client-version").unwrap(),
            "7.2.0"
        );
    }

    #[tokio::test]
    async fn send_enqueues_envelope() {
        let (conn, mut rx, _close_rx) = make_conn(10);
        conn.send(Bytes::from_static(b"hi"), 0).unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.delivery_id, 0);
        assert_eq!(envelope.payload, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn send_rejects_above_seventy_percent_occupancy() {
        let (conn, mut rx, _close_rx) = make_conn(10);
        // 10 * 0.7 = 7: the enqueue that would push occupancy past 70%
        // must be refused, so 8 fit (checks run pre-insert) and the 9th fails.
        for _ in 0..8 {
            conn.send(Bytes::from_static(b"x"), 0).unwrap();
        }
        let err = conn.send(Bytes::from_static(b"x"), 0).unwrap_err();
        assert_matches!(err, GatewayError::QueueFull { len: 8, capacity: 10, .. });
        // Nothing was enqueued by the failed call.
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 8);
    }

    #[tokio::test]
    async fn send_after_close_fails_with_connection_closed() {
        let (conn, rx, _close_rx) = make_conn(4);
        drop(rx); // consumer gone, as after the outbound flow exits
        let err = conn.send(Bytes::from_static(b"x"), 0).unwrap_err();
        assert_matches!(err, GatewayError::ConnectionClosed { .. });
    }

    #[tokio::test]
    async fn offline_emits_exactly_one_notice() {
        let (conn, _rx, mut close_rx) = make_conn(4);
        conn.offline();
        conn.offline();
        let notice = close_rx.recv().await.unwrap();
        assert_eq!(notice.token, "t1");
        assert_eq!(notice.conn_id, conn.conn_id());
        assert!(close_rx.try_recv().is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn offline_for_retry_suppresses_notice() {
        let (conn, _rx, mut close_rx) = make_conn(4);
        conn.offline_for_retry();
        assert!(conn.is_closed());
        assert!(close_rx.try_recv().is_err());
        // A later explicit offline must not re-run teardown or emit late.
        conn.offline();
        assert!(close_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn racing_triggers_run_teardown_exactly_once() {
        let (conn, _rx, mut close_rx) = make_conn(4);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move { conn.close(false) }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(close_rx.recv().await.is_some());
        assert!(close_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let (conn, _rx, _close_rx) = make_conn(4);
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.cancelled().await })
        };
        conn.offline();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancellation must release waiters")
            .unwrap();
    }

    #[tokio::test]
    async fn heartbeat_reset_moves_the_clock() {
        let (conn, _rx, _close_rx) = make_conn(4);
        let initial = conn.last_heartbeat();
        assert!(initial > 0);
        conn.reset_heartbeat();
        assert!(conn.last_heartbeat() >= initial);
    }
}
