//! Unified error type for every layer of the block-store stack.
//!
//! Every layer returns `Result<T>` with the same [`StoreError`]; callers are only ever
//! expected to match on [`ErrorKind`], never on the layer that produced it.

use std::fmt;

/// The error kinds a caller may match on. See the propagation policy: `Transient` never
/// escapes the HTTP I/O layer and `NotFound` never escapes the zero cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Object absent; callers above the zero cache never see this.
    NotFound,
    /// A conditional fetch matched the caller-supplied digest.
    NotModified,
    /// Length mismatch, digest mismatch, HMAC failure, or malformed metadata.
    Integrity,
    /// Signing or credential failure reported by the object store.
    Auth,
    /// Retriable transport or server failure; callers above HTTP I/O never see this.
    Transient,
    /// Non-retriable transport failure after retries are exhausted.
    Io,
    /// Persisted store metadata is incompatible with the running configuration.
    Config,
    /// A capacity bound was hit; the caller normally blocks rather than observing this.
    Overflow,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::NotModified => "not modified",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Auth => "auth",
            ErrorKind::Transient => "transient",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
            ErrorKind::Overflow => "overflow",
        };
        f.write_str(s)
    }
}

/// The error type returned by every [`crate::store::BlockStore`] operation.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl StoreError {
    /// Build a new error of the given kind with no source.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach a source error, preserving the original cause for diagnostics.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The kind callers are expected to match on.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message, independent of `kind`.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn not_modified(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotModified, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn overflow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overflow, message)
    }

    /// Whether this error is retriable at the HTTP layer (5xx, 408, 429, transport).
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::io(e.to_string()).with_source(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::config(e.to_string()).with_source(e)
    }
}

/// The result type returned by every block-store operation.
pub type Result<T> = std::result::Result<T, StoreError>;
