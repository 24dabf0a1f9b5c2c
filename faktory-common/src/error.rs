use thiserror::Error;

/// Enumeration of errors that can originate from the wire protocol adapter,
/// the connection pool, or the high-level client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server returned -ERR {0}")]
    ServerError(String),

    #[error("expected reply {expected:?}, got {actual:?}")]
    ProtocolAssertion { expected: String, actual: String },

    #[error("server protocol version {found} is not supported, expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("no handler registered for job type {0:?}")]
    UnknownJobType(String),

    #[error("job failed: {0}")]
    JobError(String),

    #[error("shutdown timeout exceeded")]
    ShutdownAborted,

    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pool acquisition timed out after {0:?}")]
    PoolTimeout(std::time::Duration),

    #[error("pool is draining and no longer accepts acquisitions")]
    PoolDraining,

    #[error("invalid FAKTORY_URL: {0}")]
    InvalidUrl(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, Error>;
