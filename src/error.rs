//! Error types for presence operations

/// Errors surfaced by presence and store operations
///
/// Store failures are handed back to the caller as-is. Nothing in this crate
/// retries.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// The connection was shut down (or dropped) before the operation finished
    #[error("connection closed")]
    Closed,

    /// Error reported by Redis or by the Redis client
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Operation against a key holding a different kind of value
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Expiry that is zero or too far in the future to represent
    #[error("invalid expire time: {0}s")]
    InvalidExpire(u64),

    /// Channel pattern the in-memory store cannot evaluate
    #[error("unsupported channel pattern: {0}")]
    UnsupportedPattern(String),

    /// Increment on a value that is not an integer, or that would overflow
    #[error("value is not an integer or out of range")]
    NotInteger,

    /// Payload could not be serialized into the message envelope
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// Message payload is not valid JSON
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

pub type Result<T, E = PresenceError> = std::result::Result<T, E>;
