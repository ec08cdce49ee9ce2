//! Error types for strand

use thiserror::Error;

/// Result type alias for strand operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pool, the query manager or the scheduler.
///
/// Shared query results and child coroutine failures hand one error to
/// several receivers, so the enum is `Clone`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid or missing configuration (unknown connection name, bad role entry, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Physical connection could not be opened or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server rejected the statement
    #[error("Query execution error ({code}): {message}")]
    QueryExecution { code: u16, message: String },

    /// A deadline expired (query execution, pool wait, coroutine)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled before it completed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The transaction is closed and accepts no more statements
    #[error("Transaction closed: {0}")]
    TransactionClosed(String),

    /// The connection or transaction is not in a state that accepts a query
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Type conversion error
    #[error("Type conversion error: expected {expected}, got {actual}")]
    TypeConversion {
        expected: &'static str,
        actual: String,
    },

    /// Column not found in row
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Null value for non-optional field
    #[error("Unexpected null value for column: {0}")]
    UnexpectedNull(String),

    /// Error raised by a coroutine body
    #[error("Coroutine error: {0}")]
    Coroutine(String),
}

impl Error {
    /// Whether this error means the physical link can no longer be trusted.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl From<mysql_async::Error> for Error {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(server) => Error::QueryExecution {
                code: server.code,
                message: server.message,
            },
            mysql_async::Error::Io(io) => Error::Connection(io.to_string()),
            mysql_async::Error::Driver(driver) => Error::Connection(driver.to_string()),
            other => Error::QueryExecution {
                code: 0,
                message: other.to_string(),
            },
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::QueryExecution {
            code: 1146,
            message: "Table 'test.missing' doesn't exist".into(),
        };
        assert_eq!(
            err.to_string(),
            "Query execution error (1146): Table 'test.missing' doesn't exist"
        );
        assert_eq!(
            Error::Timeout("query exceeded 30s".into()).to_string(),
            "Timeout: query exceeded 30s"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Connection("reset".into()).is_fatal_for_connection());
        assert!(!Error::QueryExecution {
            code: 1064,
            message: "syntax".into()
        }
        .is_fatal_for_connection());
    }
}
