//! Contains the `Error` and `Result` types that `snooker` uses.

use std::{sync::Arc, time::Duration};

use thiserror::Error;

/// The result type for all methods that can return an error in the `snooker` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `snooker` crate. The inner
/// [`ErrorKind`] is wrapped in a `Box` to keep the type small on the
/// happy path.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    /// Create an establishment error wrapping an arbitrary message. Intended for
    /// [`Connect`](crate::Connect) implementations whose transport errors are not
    /// `std::io::Error`.
    pub fn connect(message: impl Into<String>) -> Self {
        ErrorKind::Connect {
            message: message.into(),
        }
        .into()
    }

    /// Create an error representing a transport that closed or errored after it
    /// was established. Intended for the `closed` future returned by
    /// [`Connect`](crate::Connect) implementations.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        ErrorKind::ConnectionLost {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn claim_timeout(waited: Duration) -> Self {
        ErrorKind::ClaimTimeout { waited }.into()
    }

    /// Whether the claim failed because its queue sojourn exceeded the caller-supplied
    /// timeout.
    pub fn is_claim_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ClaimTimeout { .. })
    }

    /// Whether the claim was cancelled by the caller or the pool.
    pub fn is_claim_cancelled(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ClaimCancelled)
    }

    /// Whether the claim failed because every known backend was dead.
    pub fn is_pool_failed(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::PoolFailed)
    }

    /// Whether the claim failed because the pool was stopping or stopped.
    pub fn is_pool_stopping(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::PoolStopping)
    }

    /// Whether the claim failed because the resolver reached steady state with zero
    /// backends.
    pub fn is_no_backends(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::NoBackends)
    }

    /// Whether the claim was shed by the overload controller.
    pub fn is_overloaded(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Overloaded { .. })
    }

    /// Whether this error was produced while establishing or holding a transport
    /// connection, as opposed to by the pool itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Connect { .. } | ErrorKind::ConnectionLost { .. } | ErrorKind::Io(..)
        )
    }

    pub(crate) fn is_timed_out_io(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref e) if e.kind() == std::io::ErrorKind::TimedOut)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(err)))
    }
}

impl From<std::io::ErrorKind> for Error {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::new(ErrorKind::Io(Arc::new(err.into())))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// A claim spent longer in the queue than the caller-supplied timeout.
    #[error("Claim timed out after waiting {waited:?} for a connection")]
    #[non_exhaustive]
    ClaimTimeout { waited: Duration },

    /// A waiting claim was cancelled.
    #[error("Claim was cancelled before a connection became available")]
    ClaimCancelled,

    /// Every backend known to the pool was dead when the claim was serviced.
    #[error("All backends are unreachable")]
    PoolFailed,

    /// The claim arrived or was still queued while the pool was stopping.
    #[error("The pool is stopping")]
    PoolStopping,

    /// The resolver reached steady state without reporting any backends.
    #[error("The service resolved to zero backends")]
    NoBackends,

    /// The overload controller shed this claim to protect queue latency.
    #[error("Claim shed after {sojourn:?} in an overloaded queue")]
    #[non_exhaustive]
    Overloaded { sojourn: Duration },

    /// A transport could not be established.
    #[error("Connection attempt failed: {message}")]
    #[non_exhaustive]
    Connect { message: String },

    /// An established transport closed, ended, or errored.
    #[error("Connection lost: {message}")]
    #[non_exhaustive]
    ConnectionLost { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}
