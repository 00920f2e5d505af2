//! Connection core (spec §4.8)
//!
//! Wraps any reliable bidirectional byte stream behind one interface (the
//! transport is plug-replaceable: WebSocket, direct socket, or relay hand-off,
//! mirroring how the teacher's `transport::Connection` wraps an `mpsc::Sender`
//! over whatever QUIC gives it). A background reader/writer pair drives the
//! stream; callers interact only through `send_*`, `wait_for_*`, and the
//! single `watch_state` subscription the spec calls `onEnterState`.

use crate::framing::{Frame, FrameCodec, FrameType};
use futures_util::{SinkExt, StreamExt};
use meshstore_core::error::{Error, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// `{connecting -> open -> closed}`, single-direction, never revisits a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// A framed, keepalive-capable connection over one byte stream.
pub struct Connection {
    outbound_tx: mpsc::UnboundedSender<Frame>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    state_tx: watch::Sender<ConnectionState>,
    pong_seen: Arc<AtomicBool>,
}

impl Connection {
    /// Spawn reader/writer tasks over `io` and return the handle. Starts in
    /// `Connecting` and flips to `Open` as soon as the tasks are live (there is
    /// no handshake at this layer; callers that need one run it over
    /// `send_text`/`wait_for_message` before treating the connection as ready).
    pub fn spawn<T>(io: T) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(io, FrameCodec);
        let (mut sink, mut stream) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<Frame>();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let pong_seen = Arc::new(AtomicBool::new(false));

        let writer_state = state_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = writer_state.send(ConnectionState::Closed);
        });

        let reader_state = state_tx.clone();
        let reader_pong_seen = pong_seen.clone();
        let pong_tx = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(frame) => match frame.frame_type {
                        FrameType::Ping => {
                            let _ = pong_tx.send(Frame::pong());
                        }
                        FrameType::Pong => {
                            reader_pong_seen.store(true, Ordering::SeqCst);
                        }
                        FrameType::Text | FrameType::Binary => {
                            if inbox_tx.send(frame).is_err() {
                                break;
                            }
                        }
                    },
                    Err(e) => {
                        warn!("connection read error: {e}");
                        break;
                    }
                }
            }
            let _ = reader_state.send(ConnectionState::Closed);
        });

        let _ = state_tx.send(ConnectionState::Open);

        Arc::new(Self { outbound_tx, inbox_rx: AsyncMutex::new(inbox_rx), state_tx, pong_seen })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// The spec's single `onEnterState` subscription: a `watch` receiver
    /// resolves immediately with the current state and again on every change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.outbound_tx.send(Frame::text(text)).map_err(|_| Error::ConnectionClosed)
    }

    pub fn send_json(&self, value: &Value) -> Result<()> {
        self.send_text(serde_json::to_string(value)?)
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        self.outbound_tx.send(Frame::binary(bytes)).map_err(|_| Error::ConnectionClosed)
    }

    /// Next text/binary frame, or *Timeout* if none arrives in time, or
    /// *ConnectionClosed* if the stream ended.
    pub async fn wait_for_message(&self, timeout: Duration) -> Result<Frame> {
        let mut inbox = self.inbox_rx.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Next text/binary frame with no timeout, or *ConnectionClosed* once the
    /// stream ends. Used by [`crate::mux::RequestMultiplexer`]'s dispatch loop,
    /// which has no notion of "waiting too long" for the next frame — only the
    /// per-request promises it resolves carry timeouts.
    pub async fn recv_any(&self) -> Result<Frame> {
        let mut inbox = self.inbox_rx.lock().await;
        inbox.recv().await.ok_or(Error::ConnectionClosed)
    }

    /// Wait for a JSON text frame whose `key` field equals `command`;
    /// otherwise *UnexpectedMessage*.
    pub async fn wait_for_json_with(&self, command: &str, key: &str, timeout: Duration) -> Result<Value> {
        let frame = self.wait_for_message(timeout).await?;
        let text = frame.as_text().map_err(|e| Error::UnexpectedMessage(e.to_string()))?;
        let value: Value = serde_json::from_str(text)?;
        match value.get(key).and_then(Value::as_str) {
            Some(found) if found == command => Ok(value),
            Some(found) => Err(Error::UnexpectedMessage(format!("expected {key}={command}, found {found}"))),
            None => Err(Error::UnexpectedMessage(format!("missing field {key}"))),
        }
    }

    /// Start sender-configurable ping/pong keepalive: every `interval`, send a
    /// Ping and require a Pong within `pong_timeout`; an absent pong tears the
    /// connection down (spec §4.8, §5 "Cancellation and timeouts").
    pub fn start_keepalive(self: &Arc<Self>, interval: Duration, pong_timeout: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if this.state() == ConnectionState::Closed {
                    return;
                }
                this.pong_seen.store(false, Ordering::SeqCst);
                if this.outbound_tx.send(Frame::ping()).is_err() {
                    return;
                }
                tokio::time::sleep(pong_timeout).await;
                if !this.pong_seen.load(Ordering::SeqCst) {
                    debug!("keepalive pong timed out, closing connection");
                    this.close();
                    return;
                }
            }
        });
    }

    pub fn close(&self) {
        let _ = self.state_tx.send(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn text_frame_round_trips_over_a_duplex_pair() {
        let (a_io, b_io) = duplex(4096);
        let a = Connection::spawn(a_io);
        let b = Connection::spawn(b_io);

        a.send_text("hello friend").unwrap();
        let received = b.wait_for_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.as_text().unwrap(), "hello friend");
    }

    #[tokio::test]
    async fn wait_for_message_times_out_with_no_traffic() {
        let (a_io, _b_io) = duplex(4096);
        let a = Connection::spawn(a_io);
        let result = a.wait_for_message(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn wait_for_json_with_matches_command_field() {
        let (a_io, b_io) = duplex(4096);
        let a = Connection::spawn(a_io);
        let b = Connection::spawn(b_io);

        a.send_json(&serde_json::json!({"command": "register", "publicKey": "abcd"})).unwrap();
        let value = b.wait_for_json_with("register", "command", Duration::from_secs(1)).await.unwrap();
        assert_eq!(value["publicKey"], "abcd");
    }

    #[tokio::test]
    async fn wait_for_json_with_rejects_mismatched_command() {
        let (a_io, b_io) = duplex(4096);
        let a = Connection::spawn(a_io);
        let b = Connection::spawn(b_io);

        a.send_json(&serde_json::json!({"command": "ping"})).unwrap();
        let result = b.wait_for_json_with("register", "command", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::UnexpectedMessage(_))));
    }

    #[tokio::test]
    async fn closing_rejects_further_sends() {
        let (a_io, _b_io) = duplex(4096);
        let a = Connection::spawn(a_io);
        a.close();
        assert!(matches!(a.send_text("x"), Err(Error::ConnectionClosed)));
    }
}
