use std::fmt;

/// Error kind for backend client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misconfiguration. Retrying will not help.
    Config,
    /// Network or storage I/O. Transient, safe to retry.
    Io,
    /// Malformed data on the wire.
    Format,
    Logic,
}

/// Error returned by every broker, store, cache and dead-letter client.
#[derive(Debug, Clone)]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    /// True when the operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Io
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ClientError {}

// ---------------------------------------------------------------------------
// From impls: standard error types → ClientError with correct ErrorKind
// ---------------------------------------------------------------------------

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::format(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for ClientError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::format(e.to_string())
    }
}
