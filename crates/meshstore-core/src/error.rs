//! Error types for meshstore-core (spec §7)

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error kinds surfaced by the object store, channel log, and trust graph.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage lookup missed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object read with a type assertion that failed.
    #[error("wrong type: expected {expected}, found {found}")]
    WrongType { expected: String, found: String },

    /// A hash did not match the expected length/charset.
    #[error("malformed hash: {0}")]
    MalformedHash(String),

    /// A key did not match the expected length.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// A salt was shorter than the minimum required length.
    #[error("malformed salt: {0}")]
    MalformedSalt(String),

    /// A nonce did not match the expected length.
    #[error("malformed nonce: {0}")]
    MalformedNonce(String),

    /// Authenticator rejected ciphertext on decrypt.
    #[error("tampered ciphertext")]
    TamperedCiphertext,

    /// Remote could not prove key possession.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Serializer encountered a recipe name it does not know.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A value violated its recipe's field rule (wrong kind, missing required field, ...).
    #[error("recipe rule violation: {0}")]
    RecipeRuleViolation(String),

    /// NaN, +-Infinity, or another value the canonical form forbids.
    #[error("forbidden value: {0}")]
    ForbiddenValue(String),

    /// A reverse-map type was enabled twice at start-up.
    #[error("duplicate enable: type {0} already participates in reverse-index maintenance")]
    DuplicateEnable(String),

    /// A wait_for_* call exceeded its timeout.
    #[error("timeout")]
    Timeout,

    /// A protocol frame arrived when a different one was expected.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The connection was closed before the operation resolved.
    #[error("connection closed")]
    ConnectionClosed,

    /// A value could not be encoded onto the wire: NaN, +-Infinity, or another
    /// JSON-unsendable value (spec §4.8 encoding edge cases).
    #[error("unsendable value: {0}")]
    UnsendableValue(String),

    /// Transport-level failure below the framing layer (socket reset, DNS
    /// failure, relay unreachable); distinct from *Timeout* and
    /// *ConnectionClosed* so retry policies (pairing's `maxTries`) can treat it
    /// the same as *Timeout*.
    #[error("network error: {0}")]
    NetworkError(String),

    /// A call arrived after the store began shutting down.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// I/O error from the underlying blob/version/reverse-map storage.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error at a protocol boundary.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
