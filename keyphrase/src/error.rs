//! Error types for keyphrase pipeline operations.
//!
//! This module defines [`Error`], the error type shared by the engines,
//! storage adapter and push transport, along with a [`Result`] alias.

use common::StorageError;

/// Error type for keyphrase pipeline operations.
///
/// # Error Categories
///
/// - [`Storage`](Error::Storage): failures reading or writing the backing
///   store or connection registry.
/// - [`Encoding`](Error::Encoding): stored keys or values that cannot be
///   decoded.
/// - [`InvalidInput`](Error::InvalidInput): malformed change records or API
///   requests. These are validation failures: the offending record is
///   skipped, never retried.
/// - [`Transport`](Error::Transport): push-client creation or send failures.
/// - [`Internal`](Error::Internal): invariant violations inside the
///   pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Storage(String),
    Encoding(String),
    InvalidInput(String),
    Transport(String),
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Storage(msg) => Error::Storage(msg),
            StorageError::Internal(msg) => Error::Internal(msg),
        }
    }
}

impl From<common::serde::DeserializeError> for Error {
    fn from(err: common::serde::DeserializeError) -> Self {
        Error::Encoding(err.message)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Result type alias for keyphrase pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
