use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::table::RecordKey;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid user/password combination")]
    Authentication,

    #[error(
        "entry ({key}) is already associated to the file {}. \
         Rename that file first to avoid creating duplicates",
        existing.display()
    )]
    AlreadyAssigned { key: RecordKey, existing: PathBuf },

    #[error("{} duplicate file(s) found; resolve them before continuing", pairs.len())]
    Duplicates { pairs: Vec<(PathBuf, PathBuf)> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("more than one entry was found for {0}; please contact the database maintainer")]
    Ambiguous(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request to {url} failed: {status}. Body: {body}")]
    Remote {
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response: {source}. Body: {body}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
    },

    #[error("journal error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("credential store error: {0}")]
    Credentials(#[from] keyring::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("{0}")]
    Command(String),
}

impl DbError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Errors that invalidate the whole operation, not just the current file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication | Self::Ambiguous(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DbError::Authentication.is_fatal());
        assert!(DbError::Ambiguous("file id 3".into()).is_fatal());
        assert!(!DbError::NotFound("file id 3".into()).is_fatal());
        assert!(!DbError::io("/tmp/x", std::io::ErrorKind::NotFound.into()).is_fatal());
    }

    #[test]
    fn test_io_error_names_path() {
        let err = DbError::io("/data/take1.raw", std::io::ErrorKind::AlreadyExists.into());
        assert!(err.to_string().starts_with("/data/take1.raw:"));
    }
}
