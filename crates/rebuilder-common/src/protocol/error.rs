use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error category carried in [`Response::Error`] frames.
///
/// The scheduler uses this to tell transient conditions (retry elsewhere
/// or after backoff) apart from fatal ones without parsing message text.
///
/// [`Response::Error`]: super::Response::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The worker is at its concurrency capacity. Retryable.
    Overloaded,
    /// The endpoint could not reach a backend right now. Retryable.
    Unavailable,
    /// The presented lease id was never granted or was already released.
    InvalidLease,
    /// A file name resolves outside the lease's working directory.
    PathTraversal,
    /// No such resource (e.g. Wait without a started build).
    NotFound,
    /// Malformed or incomplete request.
    InvalidArgument,
    /// The endpoint does not serve this call (balancer build calls, Clean).
    Unimplemented,
    /// Anything else that went wrong on the remote side.
    Internal,
}

#[derive(Error, Debug)]
pub enum RebuilderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("{0:?} is not a valid lease id")]
    InvalidLease(String),

    #[error("invalid file name {0:?}: outside of the build directory")]
    PathTraversal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not implemented: {0}")]
    Unimplemented(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An error reported by the remote side of an RPC call. The message
    /// is relayed verbatim; the kind preserves the remote category.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

pub type Result<T> = std::result::Result<T, RebuilderError>;

impl RebuilderError {
    /// Whether this failure is expected to resolve itself, so the caller
    /// should retry after the shared delay instead of aborting.
    ///
    /// Covers admission refusal due to capacity and transport-level
    /// unavailability. Everything else is either a per-job fatal error or
    /// a setup error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Overloaded(_)
                | Self::Connection(_)
                | Self::Remote {
                    kind: ErrorKind::Overloaded | ErrorKind::Unavailable,
                    ..
                }
        )
    }

    /// The wire category for this error when it crosses an RPC boundary.
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            Self::Overloaded(_) => ErrorKind::Overloaded,
            Self::Connection(_) => ErrorKind::Unavailable,
            Self::InvalidLease(_) => ErrorKind::InvalidLease,
            Self::PathTraversal(_) => ErrorKind::PathTraversal,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidArgument,
            Self::Unimplemented(_) => ErrorKind::Unimplemented,
            Self::Remote { kind, .. } => *kind,
            _ => ErrorKind::Internal,
        }
    }

    /// Reconstructs an error received over the wire.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        Self::Remote { kind, message }
    }
}
