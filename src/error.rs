use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Transient contention. The operation is safe to retry as-is.
    Busy,
    /// Fatal corruption: decoding errors, checksum mismatches, or unexpected
    /// internal values. The affected tree transitions to a read-only state.
    Corrupt(String),
    /// An insert found an existing visible value for the key.
    DuplicateKey,
    /// Invalid user input, typically unrecognized configuration or options.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// No visible value exists for the requested key.
    NotFound,
    /// A write was attempted on a read-only structure (sealed chunk,
    /// checkpoint cursor, etc.).
    ReadOnly,
    /// The cursor's view was invalidated by a concurrent switch or merge.
    /// The cursor has refreshed itself; the caller should retry.
    Rollback,
    /// The tree is shutting down; in-flight work was abandoned.
    Shutdown,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Busy => write!(f, "resource busy, retry the operation"),
            Error::Corrupt(msg) => write!(f, "corruption detected: {msg}"),
            Error::DuplicateKey => write!(f, "key already exists"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotFound => write!(f, "key not found"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Rollback => write!(f, "cursor view invalidated, retry the operation"),
            Error::Shutdown => write!(f, "tree is shutting down"),
        }
    }
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
