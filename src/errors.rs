use hyper::StatusCode;
use std::io;
use thiserror::Error;

/// Failures produced while serving a single request.
///
/// Only `Server::call` turns these into responses; everything below it just
/// propagates them with `?`.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The request path leaves the server root.
    #[error("request path escapes the server root")]
    PathEscape,

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    /// Directory listings are disabled.
    #[error("directory listings are disabled")]
    Forbidden,

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("zip: {0}")]
    Zip(#[from] async_zip::error::ZipError),

    /// The request went away (client disconnect or shutdown) while an archive
    /// was being written.
    #[error("request cancelled")]
    Cancelled,
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PathEscape | Self::Io(_) | Self::Zip(_) | Self::Cancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the failure should show up in the server log as an error.
    pub fn is_logged(&self) -> bool {
        matches!(self, Self::PathEscape | Self::Io(_) | Self::Zip(_))
    }
}
