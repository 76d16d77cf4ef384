//! # tributary-rdbc
//!
//! Relational database connectivity for the Tributary index feeder.
//!
//! The crate offers a small, driver-neutral read interface: positional `?`
//! statements, streamed rows of typed [`Value`]s and a connection factory per
//! backend. Values convert to JSON document fields through
//! [`Value::to_json`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tributary_rdbc::prelude::*;
//!
//! let config = ConnectionConfig::new("postgres://localhost/shop")
//!     .with_credentials(Some("shop"), Some("secret"));
//! let conn = PgConnectionFactory.connect(&config).await?;
//!
//! let mut rows = conn
//!     .query_stream("SELECT id AS _id, name FROM products WHERE updated_at >= ?",
//!         &[Value::from(chrono::Utc::now())],
//!         &QueryOptions::default().with_fetch_size(100))
//!     .await?;
//! while let Some(row) = rows.next().await? {
//!     println!("{:?}", row.get_by_name("_id"));
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL support via tokio-postgres (default)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod dialect;
pub mod error;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

/// Everything a backend or a caller usually needs
pub mod prelude {
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, DatabaseType, QueryOptions, RowStream,
        VecRowStream,
    };
    pub use crate::dialect::{
        count_placeholders, dialect_for, quote_identifier, rewrite_placeholders, GenericDialect,
        PostgresDialect, SqlDialect,
    };
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::types::{Row, Value};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgConnection, PgConnectionFactory};
}

pub use error::{Error, Result};
pub use types::{Row, Value};

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_backend_from_jdbc_url() {
        let config = ConnectionConfig::new("jdbc:postgresql://db:5432/shop");
        assert_eq!(config.database_type(), DatabaseType::PostgreSQL);
        assert_eq!(dialect_for(config.database_type()).identifier_quote(), "\"");
    }

    #[tokio::test]
    async fn test_vec_stream_yields_rows_in_order() {
        let rows = (1..=3)
            .map(|n| Row::new(vec!["_id".to_string()], vec![Value::from(n as i64)]))
            .collect();
        let mut stream = VecRowStream::new(rows);
        let mut ids = Vec::new();
        while let Some(row) = stream.next().await.unwrap() {
            ids.push(row.get(0).and_then(Value::as_i64));
        }
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
    }
}
