//! Error types for sqltag.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for sqltag operations.
#[derive(Debug, Error)]
pub enum SqlTagError {
    /// Reading from a SQL source stream failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A SQL source file could not be opened or read.
    #[error("IO error reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A source yielded no statements at all.
    #[error("Nothing parsed")]
    EmptyInput,

    /// A loader was invoked without any paths.
    #[error("No files to parse")]
    NoFiles,

    /// Malformed glob pattern.
    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    /// Lookup of a name that was never declared.
    #[error("Unknown query: {0}")]
    UnknownQuery(String),

    /// One or more prepared statements could not be released.
    #[error("Deallocation error: {0}")]
    Deallocation(String),

    /// Preparing a statement failed.
    #[error("Error in preparing statement {name}: {message}")]
    Prepare { name: String, message: String },

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SqlTagError {
    /// Create a read error for the given source path.
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Create a prepare error for the named query.
    pub fn prepare(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Prepare {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Fold a list of failure messages into a single deallocation error.
    ///
    /// Returns `None` when there is nothing to report.
    pub fn deallocation(messages: Vec<String>) -> Option<Self> {
        if messages.is_empty() {
            None
        } else {
            Some(Self::Deallocation(messages.join("\n")))
        }
    }
}

/// Result type alias for sqltag operations.
pub type SqlTagResult<T> = Result<T, SqlTagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SqlTagError::UnknownQuery("find-user".to_string());
        assert_eq!(err.to_string(), "Unknown query: find-user");
    }

    #[test]
    fn test_deallocation_aggregate() {
        assert!(SqlTagError::deallocation(Vec::new()).is_none());

        let err = SqlTagError::deallocation(vec!["one failed".into(), "two failed".into()]).unwrap();
        assert_eq!(
            err.to_string(),
            "Deallocation error: one failed\ntwo failed"
        );
    }

    #[test]
    fn test_read_error_names_path() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = SqlTagError::read("queries/missing.sql", source);
        assert_eq!(
            err.to_string(),
            "IO error reading queries/missing.sql: no such file"
        );
    }
}
