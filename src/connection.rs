//! Connection handle abstraction
//!
//! `Connection` is the duplex, message-oriented stream a session talks
//! through. All methods take `&self` so both pumps of a session and the
//! room's shutdown path can share one handle behind an `Arc`.
//!
//! `WsConnection` implements it on top of a tokio-tungstenite stream.

use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::config::Config;
use crate::error::ConnectionError;
use crate::signal::CloseSignal;

/// Duplex message stream with deadlines and explicit close
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Read the next data payload
    ///
    /// Fails with `Timeout` once the read deadline passes. Liveness
    /// acknowledgements received while waiting push the deadline forward
    /// by the connection's idle timeout.
    async fn read(&self) -> Result<Vec<u8>, ConnectionError>;

    /// Write one text frame, giving up at `deadline`
    async fn write(&self, frame: String, deadline: Instant) -> Result<(), ConnectionError>;

    /// Move the read deadline
    fn set_read_deadline(&self, deadline: Instant);

    /// Send a liveness probe, giving up at `deadline`
    async fn send_liveness_probe(&self, deadline: Instant) -> Result<(), ConnectionError>;

    /// Send a close frame (best effort) and close the connection
    ///
    /// Idempotent: only the first call has any effect.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// WebSocket-backed connection
///
/// The stream is split so a blocked read never holds up writers.
pub struct WsConnection<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    read_deadline: StdMutex<Instant>,
    idle_timeout: Duration,
    write_wait: Duration,
    closed: CloseSignal,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an accepted WebSocket stream
    pub fn new(ws: WebSocketStream<S>, config: &Config) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            read_deadline: StdMutex::new(Instant::now() + config.pong_wait),
            idle_timeout: config.pong_wait,
            write_wait: config.write_wait,
            closed: CloseSignal::new(),
        }
    }

    fn read_deadline(&self) -> Instant {
        *self
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, msg: Message, deadline: Instant) -> Result<(), ConnectionError> {
        if self.closed.is_fired() {
            return Err(ConnectionError::Closed);
        }
        let mut sink = timeout_at(deadline, self.sink.lock())
            .await
            .map_err(|_| ConnectionError::Timeout)?;
        timeout_at(deadline, sink.send(msg))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(())
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self) -> Result<Vec<u8>, ConnectionError> {
        let mut stream = self.stream.lock().await;
        loop {
            let deadline = self.read_deadline();
            let next = tokio::select! {
                () = self.closed.fired() => return Err(ConnectionError::Closed),
                next = timeout_at(deadline, stream.next()) => next,
            };

            match next {
                Err(_) => return Err(ConnectionError::Timeout),
                Ok(None) => return Err(ConnectionError::Closed),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(Message::Text(text)))) => return Ok(text.as_bytes().to_vec()),
                Ok(Some(Ok(Message::Binary(data)))) => return Ok(data.to_vec()),
                Ok(Some(Ok(Message::Pong(_)))) => {
                    self.set_read_deadline(Instant::now() + self.idle_timeout);
                }
                Ok(Some(Ok(Message::Close(_)))) => return Err(ConnectionError::Closed),
                // Pings are answered by tungstenite on the next write
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    async fn write(&self, frame: String, deadline: Instant) -> Result<(), ConnectionError> {
        self.send(Message::Text(frame.into()), deadline).await
    }

    fn set_read_deadline(&self, deadline: Instant) {
        *self
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    async fn send_liveness_probe(&self, deadline: Instant) -> Result<(), ConnectionError> {
        self.send(Message::Ping(Default::default()), deadline).await
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.closed.fire() {
            return Ok(());
        }
        let deadline = Instant::now() + self.write_wait;
        let mut sink = timeout_at(deadline, self.sink.lock())
            .await
            .map_err(|_| ConnectionError::Timeout)?;
        // Closing the sink sends the close frame
        let result = timeout_at(deadline, sink.close()).await;
        debug!("connection closed");
        result.map_err(|_| ConnectionError::Timeout)??;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory connection for driving rooms and sessions in tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::message::Envelope;

    /// Server side of an in-memory connection
    pub(crate) struct MockConnection {
        incoming: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        outgoing: mpsc::UnboundedSender<String>,
        stalled: AtomicBool,
        probes: AtomicUsize,
        closes: AtomicUsize,
        read_deadline: StdMutex<Option<Instant>>,
        closed: CloseSignal,
    }

    /// Test side of an in-memory connection
    pub(crate) struct MockPeer {
        pub(crate) conn: Arc<MockConnection>,
        incoming: Option<mpsc::UnboundedSender<Vec<u8>>>,
        outgoing: mpsc::UnboundedReceiver<String>,
    }

    pub(crate) fn pair() -> (Arc<MockConnection>, MockPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(MockConnection {
            incoming: Mutex::new(in_rx),
            outgoing: out_tx,
            stalled: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            read_deadline: StdMutex::new(None),
            closed: CloseSignal::new(),
        });
        let peer = MockPeer {
            conn: Arc::clone(&conn),
            incoming: Some(in_tx),
            outgoing: out_rx,
        };
        (conn, peer)
    }

    impl MockConnection {
        pub(crate) fn is_closed(&self) -> bool {
            self.closed.is_fired()
        }

        pub(crate) fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub(crate) fn probe_count(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        pub(crate) fn read_deadline(&self) -> Option<Instant> {
            *self.read_deadline.lock().unwrap()
        }
    }

    impl MockPeer {
        /// Deliver a text payload to the server side
        pub(crate) fn send_text(&self, text: &str) {
            if let Some(tx) = &self.incoming {
                let _ = tx.send(text.as_bytes().to_vec());
            }
        }

        /// Simulate the remote end going away
        pub(crate) fn hang_up(&mut self) {
            self.incoming = None;
        }

        /// Make every subsequent write block until its deadline
        pub(crate) fn stall_writes(&self) {
            self.conn.stalled.store(true, Ordering::SeqCst);
        }

        /// Next frame written by the server, decoded as an envelope
        pub(crate) async fn next_envelope(&mut self) -> Option<Envelope> {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.outgoing.recv())
                .await
                .ok()??;
            Some(serde_json::from_str(&frame).expect("server wrote a non-envelope frame"))
        }

        /// Next envelope that is not a system notice
        pub(crate) async fn next_message(&mut self) -> Option<Envelope> {
            loop {
                let env = self.next_envelope().await?;
                if env.kind == crate::message::EnvelopeKind::Message {
                    return Some(env);
                }
            }
        }

        pub(crate) async fn wait_closed(&self) {
            tokio::time::timeout(Duration::from_secs(2), self.conn.closed.fired())
                .await
                .expect("connection was not closed");
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn read(&self) -> Result<Vec<u8>, ConnectionError> {
            let mut incoming = self.incoming.lock().await;
            tokio::select! {
                () = self.closed.fired() => Err(ConnectionError::Closed),
                payload = incoming.recv() => payload.ok_or(ConnectionError::Closed),
            }
        }

        async fn write(&self, frame: String, deadline: Instant) -> Result<(), ConnectionError> {
            if self.closed.is_fired() {
                return Err(ConnectionError::Closed);
            }
            if self.stalled.load(Ordering::SeqCst) {
                return match timeout_at(deadline, self.closed.fired()).await {
                    Ok(()) => Err(ConnectionError::Closed),
                    Err(_) => Err(ConnectionError::Timeout),
                };
            }
            self.outgoing
                .send(frame)
                .map_err(|_| ConnectionError::Closed)
        }

        fn set_read_deadline(&self, deadline: Instant) {
            *self.read_deadline.lock().unwrap() = Some(deadline);
        }

        async fn send_liveness_probe(&self, _deadline: Instant) -> Result<(), ConnectionError> {
            if self.closed.is_fired() {
                return Err(ConnectionError::Closed);
            }
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            if self.closed.fire() {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mock_close_idempotent() {
        let (conn, peer) = pair();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.close_count(), 1);
        assert!(matches!(conn.read().await, Err(ConnectionError::Closed)));
        peer.wait_closed().await;
    }
}
