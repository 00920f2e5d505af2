//! Adapts a WebSocket onto a plain duplex byte stream.
//!
//! `meshstore_net::Connection` is built over `AsyncRead + AsyncWrite` the way
//! it would run over a direct TCP socket; a relay connection instead runs
//! over a WebSocket (spec §4.9, scenario S5). Rather than teach `Connection`
//! two transports, every WS Binary message here carries one chunk of the same
//! length-prefixed byte stream `FrameCodec` already frames, so `Connection`
//! runs unmodified regardless of which transport carried its bytes.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

const BRIDGE_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Spawn the bridge task and return the near end of the duplex pair; hand
/// that to [`meshstore_net::Connection::spawn`].
pub fn bridge<S>(ws: WebSocketStream<S>) -> DuplexStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (near, far) = tokio::io::duplex(BRIDGE_BUFFER);
    tokio::spawn(run(ws, far));
    near
}

async fn run<S>(ws: WebSocketStream<S>, mut local: DuplexStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut read_buf = [0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = local.read(&mut read_buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if ws_tx.send(Message::Binary(read_buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("ws bridge: local read error: {e}");
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        if local.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Text/Ping/Pong at the WS layer are not part of our byte
                        // stream; tokio-tungstenite answers pings on our behalf.
                    }
                    Some(Err(e)) => {
                        warn!("ws bridge: websocket error: {e}");
                        break;
                    }
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}
