//! Error kinds surfaced by the scout.
//!
//! `UNSUPPORTED` and `ILLEGAL_STATE` are programmer errors: they indicate
//! API misuse and should generally not be matched on by well-behaved
//! callers, but they are not panics, so that a misbehaving session cannot
//! take the whole scout down.

use thiserror::Error;

/// The six scout-level error kinds named in the specification.
#[derive(Error, Debug)]
pub enum ScoutError {
    /// The cached object's type tag disagrees with the caller-requested type.
    #[error("wrong type for object {object}: cached as {cached}, requested as {requested}")]
    WrongType {
        object: String,
        cached: &'static str,
        requested: &'static str,
    },

    /// The object does not exist at the store and `create` was false.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The requested version is below the prune-clock or above the clock
    /// after retry exhaustion.
    #[error("version not found for object {object}: {reason}")]
    VersionNotFound { object: String, reason: String },

    /// An RPC deadline was exceeded, or the scout was shut down mid-call.
    #[error("network error: {0}")]
    Network(String),

    /// An unsupported isolation level or operation was requested.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The API was misused: a handle was reused after commit, concurrent
    /// open was attempted while disabled, etc.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The durable commit log could not be read or written.
    #[error("commit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A wire message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

pub type ScoutResult<T> = Result<T, ScoutError>;

impl From<bincode::error::EncodeError> for ScoutError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ScoutError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ScoutError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ScoutError::Codec(e.to_string())
    }
}
