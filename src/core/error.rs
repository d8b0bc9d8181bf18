//! Unified error handling for pingcall
//!
//! Every failure a request can end with is expressed as a [`RequestError`].
//! Failures reported by the transport (or injected into it) carry a
//! [`TransportError`] payload, which is also what telemetry sees.

use std::{error::Error as StdError, fmt, io, sync::Arc};

/// Error payload reported by a transport connection or a body source.
///
/// `code` is a short socket-style identifier (`ENOTFOUND`, `ECONNRESET`, ...).
#[derive(Clone)]
pub struct TransportError {
    code: String,
    message: String,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl TransportError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying error this one was derived from.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Connection torn down locally without a more specific reason.
    pub fn aborted() -> Self {
        Self::new("ECONNABORTED", "connection aborted")
    }

    /// Peer closed the connection before a complete response head arrived.
    pub fn hang_up() -> Self {
        Self::new("ECONNRESET", "socket hang up")
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TransportError");
        debug.field("code", &self.code).field("message", &self.message);
        if let Some(cause) = &self.cause {
            debug.field("cause", &cause.to_string());
        }
        debug.finish()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => "ENOENT",
            io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
            io::ErrorKind::ConnectionReset => "ECONNRESET",
            io::ErrorKind::ConnectionAborted => "ECONNABORTED",
            io::ErrorKind::TimedOut => "ETIMEDOUT",
            io::ErrorKind::BrokenPipe => "EPIPE",
            io::ErrorKind::UnexpectedEof => "ECONNRESET",
            io::ErrorKind::PermissionDenied => "EACCES",
            io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
            _ => "EIO",
        };
        TransportError::new(code, err.to_string()).with_cause(err)
    }
}

/// Terminal failure of a request
#[derive(Debug, Clone)]
pub enum RequestError {
    /// The supplied body is none of the recognised body shapes
    InvalidBodyType(String),

    /// The live body source failed while being piped into the connection
    BodySource(TransportError),

    /// The connection reported a failure
    Transport(TransportError),

    /// The request target could not be resolved into an absolute URI
    InvalidTarget(String),

    /// Configuration could not be loaded or is inconsistent
    Configuration(String),

    /// Internal invariant failure
    Internal(String),
}

impl RequestError {
    /// Short identifier of the failure, shared with telemetry for
    /// transport-level errors.
    pub fn code(&self) -> &str {
        match self {
            RequestError::InvalidBodyType(_) => "EINVALIDBODY",
            RequestError::BodySource(err) | RequestError::Transport(err) => err.code(),
            RequestError::InvalidTarget(_) => "EINVALIDTARGET",
            RequestError::Configuration(_) => "ECONFIG",
            RequestError::Internal(_) => "EINTERNAL",
        }
    }

    /// The transport payload, for failures that went through a connection.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            RequestError::BodySource(err) | RequestError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::InvalidBodyType(ty) => write!(f, "Invalid body type: {ty}"),
            RequestError::BodySource(err) => write!(f, "Body source error: {err}"),
            RequestError::Transport(err) => write!(f, "Transport error: {err}"),
            RequestError::InvalidTarget(msg) => write!(f, "Invalid request target: {msg}"),
            RequestError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            RequestError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl StdError for RequestError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RequestError::BodySource(err) | RequestError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        RequestError::Transport(err)
    }
}

/// Result type alias for request operations
pub type RequestResult<T> = std::result::Result<T, RequestError>;

/// Result type alias for connection-level operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> RequestResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> RequestResult<T> {
        self.map_err(|e| RequestError::Configuration(format!("{context}: {e}")))
    }
}
