use std::fmt;
use thiserror::Error;

use crate::sync::chunk::DateRange;
use crate::sync::DataType;

#[derive(Debug, Error)]
pub enum Error {
    /// The refresh token was rejected (or no credential exists). The user
    /// has to authorize again; never retried.
    #[error("Authorization expired: {0}. Run: withings-sync auth url")]
    AuthExpired(String),

    #[error("Transient authentication error: {0}")]
    TransientAuth(String),

    #[error("Fetch failed for {data_type} over {range}: {message}")]
    FetchFailed {
        data_type: DataType,
        range: DateRange,
        message: String,
    },

    #[error("Could not decode {data_type} record: {message}")]
    Decode { data_type: DataType, message: String },

    #[error("Another sync is already running (lock held on {0})")]
    AlreadyRunning(String),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that end the whole run rather than a single data type.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AuthExpired(_) | Error::AlreadyRunning(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
