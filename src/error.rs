//! Error types for meshdb
//!
//! All errors that can occur in engine operations are represented by the `MeshError`
//! enum. Errors that travel across the wire (or are surfaced through telemetry) are
//! carried as structured [`DamError`] objects with a closed set of kinds.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Closed set of error kinds shared by local errors and wire `dam` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Timeout,
    Validation,
    Conflict,
    Network,
    Storage,
    Malformed,
    Permission,
    Limit,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::NotFound,
        ErrorKind::Unauthorized,
        ErrorKind::Timeout,
        ErrorKind::Validation,
        ErrorKind::Conflict,
        ErrorKind::Network,
        ErrorKind::Storage,
        ErrorKind::Malformed,
        ErrorKind::Permission,
        ErrorKind::Limit,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Network => "network",
            ErrorKind::Storage => "storage",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Permission => "permission",
            ErrorKind::Limit => "limit",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<ErrorKind> {
        ErrorKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Best-effort classification of a free-form `dam` message from a foreign peer.
    ///
    /// Our own frames carry an explicit kind; frames from other implementations only
    /// carry text, so the kind is recovered from conventional phrasing.
    pub fn classify(message: &str) -> ErrorKind {
        let m = message.to_ascii_lowercase();
        if m.contains("not found") || m.contains("no such") {
            ErrorKind::NotFound
        } else if m.contains("unauthorized") || m.contains("unauthenticated") {
            ErrorKind::Unauthorized
        } else if m.contains("timeout") || m.contains("timed out") {
            ErrorKind::Timeout
        } else if m.contains("malformed") || m.contains("parse") {
            ErrorKind::Malformed
        } else if m.contains("invalid") || m.contains("validation") {
            ErrorKind::Validation
        } else if m.contains("conflict") {
            ErrorKind::Conflict
        } else if m.contains("network") || m.contains("connection") || m.contains("disconnect") {
            ErrorKind::Network
        } else if m.contains("storage") || m.contains("disk") || m.contains("corrupt") {
            ErrorKind::Storage
        } else if m.contains("permission") || m.contains("forbidden") {
            ErrorKind::Permission
        } else if m.contains("too big") || m.contains("limit") || m.contains("overflow") {
            ErrorKind::Limit
        } else {
            ErrorKind::Unknown
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for all engine operations
///
/// All fallible operations return `MeshResult<T>` which is `Result<T, MeshError>`.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Requested data does not exist. Absent data is normally `None`, not an error;
    /// this variant is for operations that require presence.
    #[error("not found: {0}")]
    NotFound(String),

    /// Peer or caller is not authorized for the operation
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A deadline elapsed before the operation completed
    #[error("timeout: {0}")]
    Timeout(String),

    /// Input failed validation (bad soul, bad option, bad value shape)
    #[error("validation error: {0}")]
    Validation(String),

    /// Concurrent-write conflict; always resolvable by merge, never fatal
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network operation failed (connection lost, send failed, handshake refused)
    #[error("network error: {0}")]
    Network(String),

    /// Storage adapter failure
    #[error("storage error: {0}")]
    Storage(String),

    /// A node or frame does not have the required structure
    #[error("malformed: {0}")]
    Malformed(String),

    /// Operation denied by policy
    #[error("permission denied: {0}")]
    Permission(String),

    /// A configured bound was exceeded
    #[error("limit exceeded: {0}")]
    Limit(String),

    /// Queue capacity exhausted; the caller should slow down and retry
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// The request was cancelled before it completed
    #[error("cancelled")]
    Cancelled,

    /// Anything that does not fit the taxonomy
    #[error("unknown error: {0}")]
    Unknown(String),

    /// Storage operation failed (from sled database)
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    /// JSON serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing failed (invalid peer URL format)
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl MeshError {
    /// Map the error onto the closed wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::NotFound(_) => ErrorKind::NotFound,
            MeshError::Unauthorized(_) => ErrorKind::Unauthorized,
            MeshError::Timeout(_) => ErrorKind::Timeout,
            MeshError::Validation(_) => ErrorKind::Validation,
            MeshError::Conflict(_) => ErrorKind::Conflict,
            MeshError::Network(_) => ErrorKind::Network,
            MeshError::Storage(_) | MeshError::Sled(_) | MeshError::Io(_) => ErrorKind::Storage,
            MeshError::Malformed(_) | MeshError::Serialization(_) => ErrorKind::Malformed,
            MeshError::Permission(_) => ErrorKind::Permission,
            MeshError::Limit(_) | MeshError::Backpressure(_) => ErrorKind::Limit,
            MeshError::UrlParse(_) => ErrorKind::Validation,
            MeshError::Cancelled | MeshError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

/// Result type alias for engine operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Structured error object as carried by `dam` frames and the telemetry stream.
///
/// Identity across a wire round trip holds on `kind`, `message`, `code`, `soul`,
/// `field` and `error_id`; `timestamp` and `context` are advisory and excluded
/// from equality.
#[derive(Clone, Debug)]
pub struct DamError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub soul: Option<String>,
    pub field: Option<String>,
    pub error_id: String,
    /// Wall-clock ms at creation (not round-tripped).
    pub timestamp: i64,
    pub context: BTreeMap<String, Value>,
}

impl DamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            soul: None,
            field: None,
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_soul(mut self, soul: impl Into<String>) -> Self {
        self.soul = Some(soul.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_error_id(mut self, id: impl Into<String>) -> Self {
        self.error_id = id.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

impl PartialEq for DamError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && self.code == other.code
            && self.soul == other.soul
            && self.field == other.field
            && self.error_id == other.error_id
    }
}

impl From<&MeshError> for DamError {
    fn from(err: &MeshError) -> Self {
        DamError::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for DamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
