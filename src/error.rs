//! Error handling for tether.
//!
//! Errors are categorized with gRPC-style status codes. The session layer
//! uses only a handful of them:
//!
//! * `Unavailable` - no socket is open to send on
//! * `FailedPrecondition` - an API contract was violated by the caller
//! * `InvalidArgument` - a frame or configuration value could not be parsed
//! * `DeadlineExceeded` - a connection attempt took too long
//! * `Unauthenticated` - the server rejected our password
//!
//! # Example
//!
//! ```rust
//! use tether::error::{Error, ErrorKind, Result};
//!
//! fn check_port(port: u16) -> Result<()> {
//!     if port == 0 {
//!         return Err(Error::invalid_argument("port may not be zero"));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// Returns `None` when the underlying error is of another type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

/// Standard result type for tether operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    #[error("operation was cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    #[error("invalid argument specified")]
    InvalidArgument = 3,

    #[error("operation timed out")]
    DeadlineExceeded = 4,

    #[error("not found")]
    NotFound = 5,

    #[error("attempt to create what already exists")]
    AlreadyExists = 6,

    #[error("permission denied")]
    PermissionDenied = 7,

    #[error("no valid authentication credentials")]
    Unauthenticated = 16,

    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    #[error("invalid state")]
    FailedPrecondition = 9,

    #[error("operation aborted")]
    Aborted = 10,

    #[error("out of range")]
    OutOfRange = 11,

    #[error("not implemented")]
    Unimplemented = 12,

    #[error("internal error")]
    Internal = 13,

    #[error("service unavailable")]
    Unavailable = 14,

    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

/// Generates one constructor per error kind.
macro_rules! constructors {
    ($($(#[$doc:meta])* $name:ident => $kind:ident,)*) => {
        impl Error {
            $(
                $(#[$doc])*
                pub fn $name<E>(error: E) -> Self
                where
                    E: Into<Box<dyn std::error::Error + Send + Sync>>,
                {
                    Self::new(ErrorKind::$kind, error)
                }
            )*
        }
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }
}

constructors! {
    /// An operation was interrupted by conflicting state, e.g. a socket that
    /// reset mid-write.
    aborted => Aborted,
    already_exists => AlreadyExists,
    /// An operation was cancelled before completion.
    cancelled => Cancelled,
    data_loss => DataLoss,
    /// A connection attempt or other time-bound operation took too long.
    deadline_exceeded => DeadlineExceeded,
    /// The caller broke an API contract, such as attaching a callback for an
    /// owner that is not a registered client.
    failed_precondition => FailedPrecondition,
    internal => Internal,
    /// A frame, option or configuration value could not be understood.
    invalid_argument => InvalidArgument,
    not_found => NotFound,
    out_of_range => OutOfRange,
    permission_denied => PermissionDenied,
    resource_exhausted => ResourceExhausted,
    /// The server accepted the connection but rejected our credentials.
    unauthenticated => Unauthenticated,
    /// No socket is available to carry the request.
    unavailable => Unavailable,
    unimplemented => Unimplemented,
    unknown => Unknown,
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as `"{kind}: {details}"`.
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into their logical equivalents.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts WebSocket errors into appropriate error kinds.
///
/// * `ConnectionClosed` -> `Cancelled`
/// * `AlreadyClosed` -> `Unavailable`
/// * `Io` -> mapped like any other IO error
/// * `Capacity` -> `OutOfRange`
/// * `Url` -> `InvalidArgument`
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match err {
            ConnectionClosed => Self::cancelled(err),
            AlreadyClosed => Self::unavailable(err),
            Io(err) => err.into(),
            Http(_) => Self::unavailable(err),
            Capacity(err) => Self::out_of_range(err),
            Url(err) => Self::invalid_argument(err),
            WriteBufferFull(_) => Self::resource_exhausted(err.to_string()),
            AttackAttempt => Self::permission_denied(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts JSON errors through IO error mapping.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

/// Converts configuration file errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_kind_and_details() {
        let err = Error::unavailable("no socket");
        assert_eq!(err.to_string(), "service unavailable: no socket");
    }

    #[test]
    fn io_errors_map_to_logical_kinds() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(Error::from(refused).kind, ErrorKind::Unavailable);

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(Error::from(reset).kind, ErrorKind::Aborted);
    }

    #[test]
    fn json_errors_are_invalid_arguments() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        // Truncated input surfaces as an unexpected EOF.
        assert_eq!(Error::from(err).kind, ErrorKind::DataLoss);

        let err = serde_json::from_str::<serde_json::Value>("{]").unwrap_err();
        assert_eq!(Error::from(err).kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn downcast_reaches_the_original_error() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert!(err.downcast::<std::io::Error>().is_some());
    }
}
