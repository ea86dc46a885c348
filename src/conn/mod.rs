//! One WebSocket connection: bounded write queue, read/write loops,
//! heartbeat deadlines, and idempotent close.
//!
//! Ownership: the read loop (driven by `run`) is the primary owner; the
//! write loop runs on its own task and exits when the close-signal fires.
//! Everything else holds the `Arc` only to enqueue or to close.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::Session;
use crate::config::GatewayConfig;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// WebSocket close code 1001 ("going away").
const CLOSE_GOING_AWAY: u16 = 1001;

/// Callbacks the session layer supplies to a running connection.
///
/// `on_message` runs on the read loop and must not block for long; long
/// work is offloaded by the implementation. `on_close` is invoked exactly
/// once, after both loops have exited.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_message(&self, conn: &Arc<Connection>, raw: &[u8]);
    async fn on_close(&self, conn: &Arc<Connection>);
}

/// Timing/sizing knobs copied out of [`GatewayConfig`] at construction so
/// the connection never touches shared config afterwards.
#[derive(Debug, Clone, Copy)]
struct ConnTuning {
    pong_wait: Duration,
    ping_period: Duration,
    write_timeout: Duration,
    batch_drain: usize,
    max_frame_bytes: usize,
}

pub struct Connection {
    session: Session,
    instance_id: u64,
    tuning: ConnTuning,

    queue_tx: mpsc::Sender<Bytes>,
    queue_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    /// Pong replies routed from the read loop to the write loop, so the
    /// socket keeps a single writer.
    pong_tx: mpsc::Sender<Bytes>,
    pong_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,

    /// Close-signal: single-fire broadcast observed by both loops and by
    /// external subscribers via [`Connection::done`].
    closed: CancellationToken,
    /// Force signal: abandons any in-flight graceful Close frame.
    hard: CancellationToken,
    /// Whether the write loop should emit a Close frame before exiting.
    graceful: AtomicBool,
    on_close_fired: AtomicBool,
}

impl Connection {
    pub fn new(session: Session, cfg: &GatewayConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(cfg.write_queue_size);
        let (pong_tx, pong_rx) = mpsc::channel(4);
        Arc::new(Self {
            session,
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            tuning: ConnTuning {
                pong_wait: cfg.pong_wait(),
                ping_period: cfg.ping_period(),
                write_timeout: cfg.write_timeout(),
                batch_drain: cfg.batch_drain,
                max_frame_bytes: cfg.max_frame_bytes,
            },
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            pong_tx,
            pong_rx: Mutex::new(Some(pong_rx)),
            closed: CancellationToken::new(),
            hard: CancellationToken::new(),
            graceful: AtomicBool::new(false),
            on_close_fired: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn user_uuid(&self) -> &str {
        &self.session.user_uuid
    }

    pub fn device_id(&self) -> &str {
        &self.session.device_id
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Copy `payload` into the write queue.
    ///
    /// Returns `false` when the close-signal has fired or the queue is at
    /// capacity (drop-on-overflow — the caller decides whether that is
    /// fatal). Zero-length payloads succeed without enqueueing.
    pub fn enqueue(&self, payload: Bytes) -> bool {
        if payload.is_empty() {
            return true;
        }
        if self.closed.is_cancelled() {
            return false;
        }
        self.queue_tx.try_send(payload).is_ok()
    }

    /// Fire the close-signal and force both loops out. Idempotent.
    pub fn close(&self) {
        self.hard.cancel();
        self.closed.cancel();
    }

    /// Ask the write loop to send a Close frame ("server going away"),
    /// then fire the close-signal. Idempotent; the frame write is bounded
    /// by the write timeout.
    pub fn close_gracefully(&self) {
        self.graceful.store(true, Ordering::SeqCst);
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A view of the close-signal for external subscribers. Cancelling the
    /// returned child token does not close the connection.
    pub fn done(&self) -> CancellationToken {
        self.closed.child_token()
    }

    /// Drive the connection until it terminates.
    ///
    /// Spawns the write loop, runs the read loop on the calling task, and
    /// returns only after both have exited and `on_close` has run
    /// (exactly once). The underlying socket is closed on return.
    pub async fn run(
        self: &Arc<Self>,
        ws: WebSocket,
        parent: CancellationToken,
        handler: Arc<dyn ConnectionHandler>,
    ) {
        let queue_rx = self.queue_rx.lock().await.take();
        let pong_rx = self.pong_rx.lock().await.take();
        let (Some(queue_rx), Some(pong_rx)) = (queue_rx, pong_rx) else {
            warn!(
                user = %self.user_uuid(),
                device = %self.device_id(),
                "connection run() called twice — closing"
            );
            self.close();
            return;
        };

        let (sink, stream) = ws.split();
        let writer = tokio::spawn(Self::write_loop(
            self.clone(),
            sink,
            queue_rx,
            pong_rx,
            parent,
        ));

        self.read_loop(stream, &handler).await;

        // The read loop is done; make sure the writer unblocks, then join
        // it so the socket halves are both dropped before on_close runs.
        self.close();
        if let Err(e) = writer.await {
            debug!(err = %e, "write loop join error");
        }

        if !self.on_close_fired.swap(true, Ordering::SeqCst) {
            handler.on_close(self).await;
        }
    }

    async fn read_loop(
        self: &Arc<Self>,
        mut stream: SplitStream<WebSocket>,
        handler: &Arc<dyn ConnectionHandler>,
    ) {
        loop {
            // Any inbound frame (Pong included) re-arms the read deadline.
            let frame = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                res = tokio::time::timeout(self.tuning.pong_wait, stream.next()) => match res {
                    Err(_) => {
                        debug!(
                            user = %self.user_uuid(),
                            device = %self.device_id(),
                            "read deadline expired — dropping connection"
                        );
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        self.log_peer_error(&e);
                        break;
                    }
                    Ok(Some(Ok(frame))) => frame,
                },
            };

            match frame {
                Message::Text(text) => {
                    if text.len() > self.tuning.max_frame_bytes {
                        warn!(
                            user = %self.user_uuid(),
                            size = text.len(),
                            "inbound frame exceeds limit — dropping connection"
                        );
                        break;
                    }
                    handler.on_message(self, text.as_bytes()).await;
                }
                Message::Binary(data) => {
                    if data.len() > self.tuning.max_frame_bytes {
                        warn!(
                            user = %self.user_uuid(),
                            size = data.len(),
                            "inbound frame exceeds limit — dropping connection"
                        );
                        break;
                    }
                    handler.on_message(self, &data).await;
                }
                Message::Ping(payload) => {
                    // Reply through the write loop; the socket has one writer.
                    let _ = self.pong_tx.try_send(payload);
                }
                Message::Pong(_) => {}
                Message::Close(_) => break,
            }
        }
    }

    async fn write_loop(
        conn: Arc<Connection>,
        mut sink: SplitSink<WebSocket, Message>,
        mut queue: mpsc::Receiver<Bytes>,
        mut pongs: mpsc::Receiver<Bytes>,
        parent: CancellationToken,
    ) {
        let start = tokio::time::Instant::now() + conn.tuning.ping_period;
        let mut ping = tokio::time::interval_at(start, conn.tuning.ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                biased;
                _ = conn.closed.cancelled() => {
                    if conn.graceful.load(Ordering::SeqCst) {
                        conn.send_close(&mut sink, "server going away").await;
                    }
                    break;
                }
                _ = parent.cancelled() => {
                    conn.send_close(&mut sink, "server shutting down").await;
                    // Closing here also unblocks the read loop.
                    conn.close();
                    break;
                }
                Some(payload) = pongs.recv() => {
                    if !conn.write_frame(&mut sink, Message::Pong(payload)).await {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if !conn.write_frame(&mut sink, Message::Ping(Bytes::new())).await {
                        break;
                    }
                }
                maybe = queue.recv() => {
                    let Some(payload) = maybe else {
                        conn.close();
                        break;
                    };
                    if !conn.write_text(&mut sink, payload).await {
                        break;
                    }
                    // Opportunistically drain a few more queued messages to
                    // cut scheduling overhead. One frame per payload — the
                    // batching is scheduling-level, never protocol-level.
                    for _ in 0..conn.tuning.batch_drain {
                        match queue.try_recv() {
                            Ok(extra) => {
                                if !conn.write_text(&mut sink, extra).await {
                                    break 'outer;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        }
        // Dropping the sink closes the write half; together with the read
        // loop exiting this tears the socket down.
    }

    /// Serialize one queued payload as its own text frame. Payloads are
    /// always UTF-8 JSON produced by the envelope codec or the push plane.
    async fn write_text(&self, sink: &mut SplitSink<WebSocket, Message>, payload: Bytes) -> bool {
        let text = match String::from_utf8(payload.to_vec()) {
            Ok(t) => t,
            Err(_) => {
                warn!(
                    user = %self.user_uuid(),
                    device = %self.device_id(),
                    "non-UTF-8 payload skipped"
                );
                return true;
            }
        };
        self.write_frame(sink, Message::Text(Utf8Bytes::from(text)))
            .await
    }

    /// One bounded write. Any error or timeout is fatal to the connection.
    async fn write_frame(&self, sink: &mut SplitSink<WebSocket, Message>, msg: Message) -> bool {
        match tokio::time::timeout(self.tuning.write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.log_peer_error(&e);
                self.close();
                false
            }
            Err(_) => {
                warn!(
                    user = %self.user_uuid(),
                    device = %self.device_id(),
                    "write deadline expired — dropping connection"
                );
                self.close();
                false
            }
        }
    }

    async fn send_close(&self, sink: &mut SplitSink<WebSocket, Message>, reason: &'static str) {
        let frame = Message::Close(Some(CloseFrame {
            code: CLOSE_GOING_AWAY,
            reason: Utf8Bytes::from_static(reason),
        }));
        tokio::select! {
            _ = self.hard.cancelled() => {}
            res = tokio::time::timeout(self.tuning.write_timeout, sink.send(frame)) => {
                if let Ok(Err(e)) = res {
                    self.log_peer_error(&e);
                }
            }
        }
    }

    /// Peer-reset and broken-pipe are routine churn, not operator signal.
    fn log_peer_error(&self, e: &axum::Error) {
        let msg = e.to_string();
        if msg.contains("Broken pipe") || msg.contains("Connection reset") {
            debug!(
                user = %self.user_uuid(),
                device = %self.device_id(),
                err = %msg,
                "peer gone"
            );
        } else {
            warn!(
                user = %self.user_uuid(),
                device = %self.device_id(),
                err = %msg,
                "socket error"
            );
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("user_uuid", &self.session.user_uuid)
            .field("device_id", &self.session.device_id)
            .field("instance_id", &self.instance_id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Arc<Connection> {
        let session = Session {
            user_uuid: "u1".into(),
            device_id: "d1".into(),
            client_ip: "127.0.0.1".into(),
        };
        Connection::new(session, &GatewayConfig::default())
    }

    fn small_queue_conn(capacity: usize) -> Arc<Connection> {
        let session = Session {
            user_uuid: "u1".into(),
            device_id: "d1".into(),
            client_ip: "127.0.0.1".into(),
        };
        let cfg = GatewayConfig {
            write_queue_size: capacity,
            ..GatewayConfig::default()
        };
        Connection::new(session, &cfg)
    }

    #[test]
    fn test_enqueue_accepts_until_capacity() {
        let conn = small_queue_conn(2);
        assert!(conn.enqueue(Bytes::from_static(b"a")));
        assert!(conn.enqueue(Bytes::from_static(b"b")));
        // Queue full — drop-on-overflow, never block.
        assert!(!conn.enqueue(Bytes::from_static(b"c")));
    }

    #[test]
    fn test_enqueue_empty_payload_is_noop_success() {
        let conn = small_queue_conn(1);
        assert!(conn.enqueue(Bytes::new()));
        // The empty payload must not have consumed the single slot.
        assert!(conn.enqueue(Bytes::from_static(b"a")));
        assert!(!conn.enqueue(Bytes::from_static(b"b")));
    }

    #[test]
    fn test_enqueue_rejected_after_close() {
        let conn = test_conn();
        conn.close();
        assert!(!conn.enqueue(Bytes::from_static(b"a")));
    }

    #[test]
    fn test_close_is_idempotent() {
        let conn = test_conn();
        conn.close();
        conn.close();
        conn.close_gracefully();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_done_observes_close() {
        let conn = test_conn();
        let done = conn.done();
        assert!(!done.is_cancelled());
        conn.close_gracefully();
        assert!(done.is_cancelled());
    }

    #[test]
    fn test_done_child_cannot_close_connection() {
        let conn = test_conn();
        conn.done().cancel();
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_instance_ids_are_distinct() {
        let a = test_conn();
        let b = test_conn();
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn test_fifo_order_preserved_in_queue() {
        let conn = small_queue_conn(8);
        for i in 0..5u8 {
            assert!(conn.enqueue(Bytes::from(vec![i])));
        }
        let mut rx = conn
            .queue_rx
            .try_lock()
            .expect("rx lock")
            .take()
            .expect("receiver present");
        for i in 0..5u8 {
            let got = rx.try_recv().expect("queued payload");
            assert_eq!(&got[..], &[i][..]);
        }
    }
}
