use std::{fmt, io, sync::mpsc::SendError};

#[cfg(feature = "service")]
use std::{borrow::Cow, error::Error as StdError};

use http::status::StatusCode;
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::SendError as TokioSendError;

#[cfg(feature = "service")]
use sqlx::{
    error::{DatabaseError, ErrorKind as DatabaseErrorKind},
    Error as SqlxError,
};

use serde_json::Error as JsonError;

use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum JobsiteError {
    #[error("Document store error: {0}")]
    Store(String),
    #[error("Invalid Command: {0}")]
    Command(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Invalid state transition: {0}")]
    InvalidState(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl JobsiteError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            JobsiteError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            JobsiteError::Command(_) => StatusCode::BAD_REQUEST,
            JobsiteError::Custom(_) => StatusCode::INTERNAL_SERVER_ERROR,
            JobsiteError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            JobsiteError::NotFound(_) => StatusCode::NOT_FOUND,
            JobsiteError::InvalidState(_) => StatusCode::CONFLICT,
            JobsiteError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            JobsiteError::PermissionDenied => StatusCode::FORBIDDEN,
            JobsiteError::Serialization(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<toml::de::Error> for JobsiteError {
    fn from(src: toml::de::Error) -> JobsiteError {
        JobsiteError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for JobsiteError {
    fn from(src: toml::ser::Error) -> JobsiteError {
        JobsiteError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for JobsiteError {
    fn from(src: JsonError) -> JobsiteError {
        JobsiteError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<uuid::Error> for JobsiteError {
    fn from(src: uuid::Error) -> JobsiteError {
        JobsiteError::Serialization(format!("UUID conversion failed: {src}"))
    }
}

impl From<io::Error> for JobsiteError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => JobsiteError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => JobsiteError::PermissionDenied,
            _ => JobsiteError::Io(format!("IOError: {}: {x}", x.kind())),
        }
    }
}

impl From<fmt::Error> for JobsiteError {
    fn from(x: fmt::Error) -> Self {
        JobsiteError::Custom(format!("{x}"))
    }
}

impl From<RegexError> for JobsiteError {
    fn from(x: RegexError) -> Self {
        JobsiteError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<SendError<Event>> for JobsiteError {
    fn from(x: SendError<Event>) -> Self {
        JobsiteError::Io(format!(
            "Channel update send Error, could not transmit event {:?}",
            x.0
        ))
    }
}

impl<T> From<TokioSendError<T>> for JobsiteError {
    fn from(_: TokioSendError<T>) -> Self {
        JobsiteError::Io("Worker channel closed, could not transmit command".to_string())
    }
}

#[cfg(feature = "service")]
impl From<SqlxError> for JobsiteError {
    fn from(db_error: SqlxError) -> Self {
        match db_error {
            SqlxError::RowNotFound => JobsiteError::NotFound("database row not found".to_string()),
            other => JobsiteError::Store(format!("database error: {other:?}")),
        }
    }
}

#[cfg(feature = "service")]
impl From<sqlx::migrate::MigrateError> for JobsiteError {
    fn from(migrate_error: sqlx::migrate::MigrateError) -> Self {
        JobsiteError::Store(format!("migration error: {migrate_error}"))
    }
}

#[cfg(feature = "service")]
impl DatabaseError for JobsiteError {
    fn message(&self) -> &str {
        "Jobsite FromRow parsing failure"
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        DatabaseErrorKind::Other
    }

    /// The extended result code.
    #[inline]
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }

    #[doc(hidden)]
    fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }
}
