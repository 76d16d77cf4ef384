//! Error types for tributary-rdbc
//!
//! Every error carries an [`ErrorCategory`]. The feeder reschedules a
//! fetch cycle that failed on the connection or on a timeout, and gives up
//! on bad SQL or values it cannot convert.

use std::fmt;
use thiserror::Error;

/// Result type for tributary-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What kind of failure an [`Error`] is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connecting or talking to the server
    Connection,
    /// Statement rejected or failed
    Query,
    /// Column value without a target representation
    Conversion,
    /// Statement or connect deadline exceeded
    Timeout,
    /// Bad connection settings
    Config,
}

impl ErrorCategory {
    /// Whether a later attempt may succeed
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }

    /// Label used in logs and metrics
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Conversion => "conversion",
            Self::Timeout => "timeout",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database access error
#[derive(Error, Debug)]
pub enum Error {
    /// Connection refused, lost or unusable
    #[error("connection error: {message}")]
    Connection {
        /// What went wrong
        message: String,
        /// Driver error
        #[source]
        source: Option<BoxError>,
    },

    /// Statement failed
    #[error("query error: {message}")]
    Query {
        /// Server message
        message: String,
        /// Statement text, when known
        sql: Option<String>,
    },

    /// A column value could not be converted
    #[error("cannot convert value: {0}")]
    Conversion(String),

    /// Deadline exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invalid connection settings
    #[error("invalid connection settings: {0}")]
    Config(String),
}

impl Error {
    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Conversion(_) => ErrorCategory::Conversion,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Config(_) => ErrorCategory::Config,
        }
    }

    /// Whether a later attempt may succeed
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Connection error without a driver cause
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Connection error wrapping the driver's error
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Query error without statement text
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    /// Query error remembering the failed statement
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Settings error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Value conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::Conversion(message.into())
    }

    /// Statement text of a query error
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Query { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_categories() {
        assert!(Error::connection("refused").is_retriable());
        assert!(Error::timeout("statement timeout").is_retriable());
        assert!(!Error::type_conversion("NaN").is_retriable());
        assert!(!Error::query("syntax error").is_retriable());
        assert!(!Error::config("missing host").is_retriable());
    }

    #[test]
    fn test_query_error_keeps_sql() {
        let err = Error::query_with_sql("syntax error", "SELECT * FORM users");
        assert_eq!(err.to_string(), "query error: syntax error");
        assert_eq!(err.sql(), Some("SELECT * FORM users"));
        assert_eq!(Error::timeout("x").sql(), None);
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(ErrorCategory::Conversion.to_string(), "conversion");
        assert_eq!(Error::config("missing url").category(), ErrorCategory::Config);
    }

    #[test]
    fn test_source_is_exposed() {
        use std::error::Error as _;
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::connection_with_source("connection lost", io);
        assert!(err.source().is_some());
    }
}
