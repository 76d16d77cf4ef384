//! Unit tests for tributary-rdbc connection module

use async_trait::async_trait;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tributary_rdbc::connection::{
    Connection, ConnectionConfig, QueryOptions, RowStream, VecRowStream, TIMESTAMPDIFF_PROBE_SQL,
};
use tributary_rdbc::{Error, Result, Row, Value};

/// Connection that accepts only the statements it was told about
struct ProbeConnection {
    supports_timestampdiff: bool,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for ProbeConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        if sql == TIMESTAMPDIFF_PROBE_SQL && !self.supports_timestampdiff {
            return Err(Error::query_with_sql("function not found", sql));
        }
        Ok(vec![Row::new(vec!["x".to_string()], vec![Value::Int64(0)])])
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Ok(0)
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: &[Value],
        _options: &QueryOptions,
    ) -> Result<Pin<Box<dyn RowStream>>> {
        let rows = self.query(sql, params).await?;
        Ok(Box::pin(VecRowStream::new(rows)))
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn test_connection_config_default() {
    let config = ConnectionConfig::default();

    assert!(config.url.is_empty());
    assert!(!config.connect_timeout.is_zero());
    assert!(config.user.is_none());
    assert_eq!(config.application_name.as_deref(), Some("tributary"));
}

#[tokio::test]
async fn test_probe_timestampdiff_supported() {
    let conn = ProbeConnection {
        supports_timestampdiff: true,
        closed: AtomicBool::new(false),
    };
    assert!(conn.probe_timestampdiff().await);
}

#[tokio::test]
async fn test_probe_timestampdiff_unsupported() {
    let conn = ProbeConnection {
        supports_timestampdiff: false,
        closed: AtomicBool::new(false),
    };
    assert!(!conn.probe_timestampdiff().await);
}

#[tokio::test]
async fn test_default_identifier_quote_and_query_one() {
    let conn = ProbeConnection {
        supports_timestampdiff: true,
        closed: AtomicBool::new(false),
    };
    assert_eq!(conn.identifier_quote(), "\"");

    let row = conn.query_one("SELECT 0", &[]).await.unwrap().unwrap();
    assert_eq!(row.get_by_name("x"), Some(&Value::Int64(0)));

    conn.close().await.unwrap();
    assert!(!conn.is_valid().await);
}
