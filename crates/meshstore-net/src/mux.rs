//! Request multiplexer (spec §4.8 "A Request multiplexer", §6 "Wire protocol
//! — request multiplexer")
//!
//! Sits on top of one [`Connection`] and turns its text frames into
//! request/response pairs tagged by a monotonic counter, the way the teacher's
//! `transport::Transport` layers a stream-id scheme over its onion circuits.
//! Two roles share one multiplexer: a local `serviceId -> handler` registry
//! answers inbound `request` messages, while `send` tags outbound requests and
//! resolves them when a matching `{responseId, ...}` message arrives.

use crate::connection::Connection;
use meshstore_core::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// The sentinel the spec uses to encode an "absent argument" inside a JSON
/// array, where plain JSON would otherwise coerce a missing slot to `null`.
pub const UNDEFINED_SENTINEL: &str = "$__undefined$";

/// One chunk of a streamed response (spec §6 `stream` / `stream-end` /
/// `stream-error` types).
#[derive(Clone, Debug)]
pub enum StreamChunk {
    Data(Value),
    End,
    Error(String),
}

/// Handle to an in-flight streamed response: a pull-based stream per Design
/// Notes ("Async iterators" -> explicit `next`/close), fed by the dispatch
/// loop as `stream` frames tagged with this request's id arrive.
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<StreamChunk>,
}

impl ResponseStream {
    /// Next chunk, or `None` once the stream has ended (normally or in error —
    /// callers that care about `stream-error` should inspect the last
    /// [`StreamChunk::Error`] rather than relying on `None` alone).
    pub async fn next(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }
}

/// A registered service handler: takes the decoded `args` array and returns
/// the value to answer with, or an error to send back as `{type: "error"}`.
pub type ServiceFn =
    Arc<dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

enum Pending {
    /// A plain `send()` caller waiting for one `data`/`error` message.
    Single(oneshot::Sender<Result<Value>>),
    /// A `send_streamed()` caller waiting on `stream`/`stream-end`/`stream-error`.
    Stream(mpsc::UnboundedSender<StreamChunk>),
}

struct Shared {
    services: Mutex<HashMap<u32, ServiceFn>>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_request_id: AtomicU64,
}

/// A multiplexer wired to one [`Connection`]. Construction spawns the
/// background dispatch loop; dropping every clone and closing the connection
/// is what stops it.
#[derive(Clone)]
pub struct RequestMultiplexer {
    conn: Arc<Connection>,
    shared: Arc<Shared>,
}

fn check_sendable(value: &Value) -> Result<()> {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.is_nan() || f.is_infinite() {
                    return Err(Error::UnsendableValue(format!("non-finite number: {n}")));
                }
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(check_sendable),
        Value::Object(map) => map.values().try_for_each(check_sendable),
        _ => Ok(()),
    }
}

/// Encode an argument list where `None` becomes the spec's
/// [`UNDEFINED_SENTINEL`], the way a JSON array that can't represent
/// `undefined` natively needs one.
pub fn encode_args(args: &[Option<Value>]) -> Result<Vec<Value>> {
    args.iter()
        .map(|arg| match arg {
            Some(v) => {
                check_sendable(v)?;
                Ok(v.clone())
            }
            None => Ok(Value::String(UNDEFINED_SENTINEL.to_string())),
        })
        .collect()
}

/// Inverse of [`encode_args`]: the sentinel string decodes back to `None`.
pub fn decode_args(args: Vec<Value>) -> Vec<Option<Value>> {
    args.into_iter()
        .map(|v| match &v {
            Value::String(s) if s == UNDEFINED_SENTINEL => None,
            _ => Some(v),
        })
        .collect()
}

impl RequestMultiplexer {
    pub fn new(conn: Arc<Connection>) -> Self {
        let shared = Arc::new(Shared {
            services: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        });

        let dispatch_conn = conn.clone();
        let dispatch_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                match dispatch_conn.recv_any().await {
                    Ok(frame) => {
                        let Ok(text) = frame.as_text() else { continue };
                        if let Err(e) = handle_frame(&dispatch_conn, &dispatch_shared, text).await {
                            warn!("mux: malformed frame ignored: {e}");
                        }
                    }
                    Err(_) => {
                        reject_all_outstanding(&dispatch_shared).await;
                        break;
                    }
                }
            }
        });

        Self { conn, shared }
    }

    /// Register a service handler under `id`, replacing any previous one.
    pub async fn add_service(&self, id: u32, handler: ServiceFn) {
        self.shared.services.lock().await.insert(id, handler);
    }

    pub async fn remove_service(&self, id: u32) {
        self.shared.services.lock().await.remove(&id);
    }

    fn alloc_request_id(&self) -> u64 {
        self.shared.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send `args` to `service_id` on the peer and resolve with its single
    /// `data` value, or the `error` it answered with (or *ConnectionClosed* if
    /// the socket drops first).
    pub async fn send(&self, service_id: u32, args: Vec<Value>) -> Result<Value> {
        for arg in &args {
            check_sendable(arg)?;
        }
        let request_id = self.alloc_request_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(request_id, Pending::Single(tx));

        self.conn.send_json(&serde_json::json!({
            "requestId": request_id,
            "type": "request",
            "serviceId": service_id,
            "args": args,
        }))?;

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Send `args` to `service_id`, expecting a streamed response
    /// (`stream`/`stream-end`/`stream-error` messages rather than one `data`).
    pub async fn send_streamed(&self, service_id: u32, args: Vec<Value>) -> Result<ResponseStream> {
        for arg in &args {
            check_sendable(arg)?;
        }
        let request_id = self.alloc_request_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.pending.lock().await.insert(request_id, Pending::Stream(tx));

        self.conn.send_json(&serde_json::json!({
            "requestId": request_id,
            "type": "request",
            "serviceId": service_id,
            "args": args,
        }))?;

        Ok(ResponseStream { rx })
    }
}

async fn reject_all_outstanding(shared: &Shared) {
    let mut pending = shared.pending.lock().await;
    for (_, entry) in pending.drain() {
        match entry {
            Pending::Single(tx) => {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
            Pending::Stream(tx) => {
                let _ = tx.send(StreamChunk::Error("connection closed".to_string()));
            }
        }
    }
}

async fn handle_frame(conn: &Arc<Connection>, shared: &Shared, text: &str) -> Result<()> {
    let msg: Value = serde_json::from_str(text)?;
    let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or_default();

    match msg_type {
        "request" => {
            let request_id = msg
                .get("requestId")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::UnexpectedMessage("request missing requestId".into()))?;
            let service_id = msg
                .get("serviceId")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::UnexpectedMessage("request missing serviceId".into()))?
                as u32;
            let args: Vec<Value> = msg.get("args").and_then(|v| v.as_array()).cloned().unwrap_or_default();

            let handler = shared.services.lock().await.get(&service_id).cloned();
            let conn = conn.clone();
            tokio::spawn(async move {
                let outcome = match handler {
                    Some(handler) => handler(args).await,
                    None => Err(Error::UnexpectedMessage(format!("no service registered for id {service_id}"))),
                };
                let reply = match outcome {
                    Ok(value) => serde_json::json!({"responseId": request_id, "type": "data", "value": value}),
                    Err(e) => serde_json::json!({
                        "responseId": request_id,
                        "type": "error",
                        "name": error_name(&e),
                        "message": e.to_string(),
                    }),
                };
                if let Err(e) = conn.send_json(&reply) {
                    debug!("mux: failed to send response for request {request_id}: {e}");
                }
            });
            Ok(())
        }
        "data" => resolve_single(shared, &msg, |value| Ok(value)).await,
        "error" => {
            resolve_single(shared, &msg, |_| {
                Err(Error::UnexpectedMessage(format!(
                    "remote error: {}",
                    msg_field_str(&msg, "message")
                )))
            })
            .await
        }
        "stream" => {
            let request_id = response_id(&msg)?;
            let value = msg.get("value").cloned().unwrap_or(Value::Null);
            push_stream(shared, request_id, StreamChunk::Data(value)).await;
            Ok(())
        }
        "stream-end" => {
            let request_id = response_id(&msg)?;
            push_stream(shared, request_id, StreamChunk::End).await;
            shared.pending.lock().await.remove(&request_id);
            Ok(())
        }
        "stream-error" => {
            let request_id = response_id(&msg)?;
            push_stream(shared, request_id, StreamChunk::Error(msg_field_str(&msg, "message"))).await;
            shared.pending.lock().await.remove(&request_id);
            Ok(())
        }
        "write-stream-error" => {
            warn!("peer aborted an outbound file stream: {}", msg_field_str(&msg, "message"));
            Ok(())
        }
        other => Err(Error::UnexpectedMessage(format!("unknown mux message type: {other}"))),
    }
}

fn response_id(msg: &Value) -> Result<u64> {
    msg.get("responseId")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::UnexpectedMessage("message missing responseId".into()))
}

fn msg_field_str(msg: &Value, field: &str) -> String {
    msg.get(field).and_then(Value::as_str).unwrap_or("").to_string()
}

async fn resolve_single(shared: &Shared, msg: &Value, to_result: impl FnOnce(Value) -> Result<Value>) -> Result<()> {
    let request_id = response_id(msg)?;
    let entry = shared.pending.lock().await.remove(&request_id);
    match entry {
        Some(Pending::Single(tx)) => {
            let value = msg.get("value").cloned().unwrap_or(Value::Null);
            let _ = tx.send(to_result(value));
        }
        Some(Pending::Stream(tx)) => {
            let _ = tx.send(StreamChunk::Error("expected streamed response, got single".to_string()));
        }
        None => debug!("mux: response for unknown requestId {request_id}"),
    }
    Ok(())
}

async fn push_stream(shared: &Shared, request_id: u64, chunk: StreamChunk) {
    let pending = shared.pending.lock().await;
    if let Some(Pending::Stream(tx)) = pending.get(&request_id) {
        let _ = tx.send(chunk);
    }
}

fn error_name(e: &Error) -> &'static str {
    match e {
        Error::NotFound(_) => "NotFound",
        Error::WrongType { .. } => "WrongType",
        Error::MalformedHash(_) => "MalformedHash",
        Error::MalformedKey(_) => "MalformedKey",
        Error::MalformedSalt(_) => "MalformedSalt",
        Error::MalformedNonce(_) => "MalformedNonce",
        Error::TamperedCiphertext => "TamperedCiphertext",
        Error::AuthenticationFailed => "AuthenticationFailed",
        Error::UnknownType(_) => "UnknownType",
        Error::RecipeRuleViolation(_) => "RecipeRuleViolation",
        Error::ForbiddenValue(_) => "ForbiddenValue",
        Error::DuplicateEnable(_) => "DuplicateEnable",
        Error::Timeout => "Timeout",
        Error::UnexpectedMessage(_) => "UnexpectedMessage",
        Error::ConnectionClosed => "ConnectionClosed",
        Error::UnsendableValue(_) => "UnsendableValue",
        Error::NetworkError(_) => "NetworkError",
        Error::ShutdownInProgress => "ShutdownInProgress",
        Error::Io(_) => "IoError",
        Error::Json(_) => "JsonError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    fn spawn_pair() -> (RequestMultiplexer, RequestMultiplexer) {
        let (a_io, b_io) = duplex(8192);
        let a = RequestMultiplexer::new(Connection::spawn(a_io));
        let b = RequestMultiplexer::new(Connection::spawn(b_io));
        (a, b)
    }

    #[tokio::test]
    async fn send_resolves_against_a_registered_service() {
        let (client, server) = spawn_pair();
        server
            .add_service(
                1,
                Arc::new(|args: Vec<Value>| {
                    Box::pin(async move {
                        let n = args[0].as_i64().unwrap_or(0);
                        Ok(Value::from(n * 2))
                    })
                }),
            )
            .await;

        let result = tokio::time::timeout(Duration::from_secs(1), client.send(1, vec![Value::from(21)]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Value::from(42));
    }

    #[tokio::test]
    async fn send_surfaces_a_remote_error() {
        let (client, server) = spawn_pair();
        server
            .add_service(7, Arc::new(|_args| Box::pin(async move { Err(Error::NotFound("x".into())) })))
            .await;

        let result = tokio::time::timeout(Duration::from_secs(1), client.send(7, vec![])).await.unwrap();
        assert!(matches!(result, Err(Error::UnexpectedMessage(_))));
    }

    #[tokio::test]
    async fn unregistered_service_yields_an_error_response() {
        let (client, _server) = spawn_pair();
        let result = tokio::time::timeout(Duration::from_secs(1), client.send(99, vec![])).await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn undefined_sentinel_round_trips_through_encode_decode() {
        let encoded = encode_args(&[Some(Value::from(1)), None, Some(Value::from("x"))]).unwrap();
        assert_eq!(encoded[1], Value::String(UNDEFINED_SENTINEL.to_string()));

        let decoded = decode_args(encoded);
        assert_eq!(decoded, vec![Some(Value::from(1)), None, Some(Value::from("x"))]);
    }

    #[test]
    fn finite_numbers_pass_the_sendable_check() {
        assert!(check_sendable(&Value::from(3.14)).is_ok());
        // serde_json itself refuses to build a Number from NaN/Infinity, so
        // the only way such a value reaches the wire is through this guard's
        // nested array/object walk catching it inside a larger structure.
        assert!(serde_json::Number::from_f64(f64::NAN).is_none());
        assert!(serde_json::Number::from_f64(f64::INFINITY).is_none());
    }

    #[tokio::test]
    async fn closing_the_connection_rejects_outstanding_sends() {
        let (a_io, b_io) = duplex(8192);
        let client = RequestMultiplexer::new(Connection::spawn(a_io));
        let server_conn = Connection::spawn(b_io);

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.send(1, vec![]).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server_conn.close();
        drop(server_conn);

        let result = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }
}
