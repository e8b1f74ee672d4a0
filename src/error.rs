//! Error types for the scopesync engine

use std::fmt;
use thiserror::Error;

use crate::identity::ObjectId;

/// Script error classes raised by application code running in a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum ErrorKind {
    /// TypeError - wrong type for operation
    TypeError,
    /// ReferenceError - unknown method or property
    ReferenceError,
    /// RangeError - value out of range
    RangeError,
    /// Generic Error - user-thrown errors
    GenericError,
    /// InternalError - engine failure surfaced to the application
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::ReferenceError => write!(f, "ReferenceError"),
            ErrorKind::RangeError => write!(f, "RangeError"),
            ErrorKind::GenericError => write!(f, "Error"),
            ErrorKind::InternalError => write!(f, "InternalError"),
        }
    }
}

/// Why a request was rejected before reaching application code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    UnknownApplication(u32),
    UnknownTarget(ObjectId),
    PrivateMethod(String),
    MalformedArguments(String),
    PayloadTooLarge(usize),
    InvalidChangeType(u8),
    ScopeAttachment(String),
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownApplication(id) => write!(f, "unknown application {}", id),
            Self::UnknownTarget(id) => write!(f, "unknown target {}", id),
            Self::PrivateMethod(name) => write!(f, "method '{}' is private", name),
            Self::MalformedArguments(msg) => write!(f, "malformed arguments: {}", msg),
            Self::PayloadTooLarge(n) => write!(f, "argument payload of {} bytes exceeds limit", n),
            Self::InvalidChangeType(code) => write!(f, "invalid change type code {}", code),
            Self::ScopeAttachment(name) => write!(f, "'{}' holds a scope and cannot be changed", name),
        }
    }
}

/// Failure to hand a message to one client link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("link {0} is closed")]
    Closed(u64),
    #[error("send failed: {0}")]
    Failed(String),
}

/// Main error type for scopesync
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unresolvable request; dropped without a reply
    #[error("ProtocolError: {0}")]
    Protocol(ProtocolViolation),

    /// Raised by application code while servicing a request
    #[error("{kind}: {message}")]
    Application { kind: ErrorKind, message: String },

    /// Delivery to a client link failed
    #[error("DeliveryError: {0}")]
    Delivery(#[from] DeliveryError),

    /// Operation on a scope or channel that has been disposed
    #[error("DisposedError: {0}")]
    Disposed(String),

    /// Configuration could not be loaded
    #[error("ConfigError: {0}")]
    Config(String),

    /// JSON encoding or decoding failure
    #[error("JsonError: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an application error of the given kind
    pub fn application(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Application {
            kind,
            message: message.into(),
        }
    }

    /// Create a TypeError
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::application(ErrorKind::TypeError, message)
    }

    /// Create a ReferenceError
    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::application(ErrorKind::ReferenceError, message)
    }

    /// Create a RangeError
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::application(ErrorKind::RangeError, message)
    }

    /// Create a generic user error
    pub fn generic(message: impl Into<String>) -> Self {
        Self::application(ErrorKind::GenericError, message)
    }

    pub fn protocol(violation: ProtocolViolation) -> Self {
        Error::Protocol(violation)
    }

    /// Whether this error must stay invisible to clients
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type for scopesync operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_display() {
        let err = Error::type_error("count is not a number");
        assert_eq!(err.to_string(), "TypeError: count is not a number");
        assert!(!err.is_protocol());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = Error::protocol(ProtocolViolation::PrivateMethod("_secret".into()));
        assert_eq!(err.to_string(), "ProtocolError: method '_secret' is private");
        assert!(err.is_protocol());
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("JsonError"));
    }

    #[test]
    fn test_generic_kind_renders_as_error() {
        assert_eq!(Error::generic("boom").to_string(), "Error: boom");
    }
}
