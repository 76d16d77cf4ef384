//! PostgreSQL backend implementation for tributary-rdbc
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection with prepared, type-adapted parameters
//! - Streaming row iteration over `query_raw`
//! - Connection factory

use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Statement;

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, QueryOptions, RowStream,
};
use crate::dialect::{rewrite_placeholders, PostgresDialect};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Convert a Value to a parameter matching the statement's declared type
///
/// Integers are widened or narrowed to the target width and timestamps are
/// converted between naive and zoned forms so that watermarks bind against
/// either `timestamp` or `timestamptz` columns.
fn value_to_sql(value: &Value, target: &Type) -> Result<BoxedParam> {
    let mismatch = || {
        Error::type_conversion(format!(
            "cannot bind {} as {}",
            value.kind(),
            target.name()
        ))
    };

    Ok(match (value, target) {
        (Value::Null, _) => typed_null(target),
        (Value::DateTimeTz(dt), &Type::TIMESTAMP) => Box::new(dt.naive_utc()),
        (Value::DateTime(dt), &Type::TIMESTAMPTZ) => Box::new(dt.and_utc()),
        (Value::DateTimeTz(dt), &Type::DATE) => Box::new(dt.date_naive()),
        (Value::DateTime(dt), &Type::DATE) => Box::new(dt.date()),
        (v, &Type::INT2) => {
            let n = v.as_i64().ok_or_else(mismatch)?;
            Box::new(i16::try_from(n).map_err(|_| mismatch())?)
        }
        (v, &Type::INT4) => {
            let n = v.as_i64().ok_or_else(mismatch)?;
            Box::new(i32::try_from(n).map_err(|_| mismatch())?)
        }
        (v, &Type::INT8) => Box::new(v.as_i64().ok_or_else(mismatch)?),
        (Value::Bool(b), _) => Box::new(*b),
        (Value::Int8(n), _) => Box::new(i16::from(*n)),
        (Value::Int16(n), _) => Box::new(*n),
        (Value::Int32(n), _) => Box::new(*n),
        (Value::Int64(n), _) => Box::new(*n),
        (Value::Float32(n), _) => Box::new(*n),
        (Value::Float64(n), _) => Box::new(*n),
        (Value::Decimal(d), _) => Box::new(*d),
        (Value::String(s), _) => Box::new(s.clone()),
        (Value::Bytes(b), _) => Box::new(b.clone()),
        (Value::Date(d), _) => Box::new(*d),
        (Value::Time(t), _) => Box::new(*t),
        (Value::DateTime(dt), _) => Box::new(*dt),
        (Value::DateTimeTz(dt), _) => Box::new(*dt),
        (Value::Uuid(u), _) => Box::new(*u),
        (Value::Json(j), _) => Box::new(j.clone()),
        (Value::Array(_), _) => Box::new(value.to_json()?),
    })
}

/// NULL parameters still have to pass the driver's type check
fn typed_null(target: &Type) -> BoxedParam {
    match *target {
        Type::BOOL => Box::new(Option::<bool>::None),
        Type::INT2 => Box::new(Option::<i16>::None),
        Type::INT4 => Box::new(Option::<i32>::None),
        Type::INT8 => Box::new(Option::<i64>::None),
        Type::FLOAT4 => Box::new(Option::<f32>::None),
        Type::FLOAT8 => Box::new(Option::<f64>::None),
        Type::NUMERIC => Box::new(Option::<rust_decimal::Decimal>::None),
        Type::BYTEA => Box::new(Option::<Vec<u8>>::None),
        Type::DATE => Box::new(Option::<chrono::NaiveDate>::None),
        Type::TIME => Box::new(Option::<chrono::NaiveTime>::None),
        Type::TIMESTAMP => Box::new(Option::<chrono::NaiveDateTime>::None),
        Type::TIMESTAMPTZ => Box::new(Option::<chrono::DateTime<chrono::Utc>>::None),
        Type::UUID => Box::new(Option::<uuid::Uuid>::None),
        Type::JSON | Type::JSONB => Box::new(Option::<serde_json::Value>::None),
        _ => Box::new(Option::<String>::None),
    }
}

fn bind_params(params: &[Value], types: &[Type]) -> Result<Vec<BoxedParam>> {
    if params.len() != types.len() {
        return Err(Error::query(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            params.len()
        )));
    }
    params
        .iter()
        .zip(types)
        .map(|(v, t)| value_to_sql(v, t))
        .collect()
}

/// Column labels of a prepared statement, shared by all its rows
fn labels(stmt: &Statement) -> Arc<[String]> {
    stmt.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row, labels: &Arc<[String]>) -> Result<Row> {
    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect::<Result<Vec<_>>>()?;

    Ok(Row::new(Arc::clone(labels), values))
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Option<T>>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        let name = row.columns().get(idx).map(|c| c.name()).unwrap_or("?");
        Error::type_conversion(format!("column {}: {}", name, e))
    })
}

fn array<'a, T>(row: &'a tokio_postgres::Row, idx: usize, wrap: fn(T) -> Value) -> Result<Value>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    Ok(get::<Vec<Option<T>>>(row, idx)?
        .map(|items| {
            Value::Array(
                items
                    .into_iter()
                    .map(|item| item.map(wrap).unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .unwrap_or(Value::Null))
}

/// Convert a PostgreSQL value to a Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    let value = match *pg_type {
        Type::BOOL => get(row, idx)?.map(Value::Bool),
        Type::CHAR => get::<i8>(row, idx)?.map(Value::Int8),
        Type::INT2 => get(row, idx)?.map(Value::Int16),
        Type::INT4 => get(row, idx)?.map(Value::Int32),
        Type::INT8 => get(row, idx)?.map(Value::Int64),
        Type::OID => get::<u32>(row, idx)?.map(|n| Value::Int64(i64::from(n))),
        Type::FLOAT4 => get(row, idx)?.map(Value::Float32),
        Type::FLOAT8 => get(row, idx)?.map(Value::Float64),
        Type::NUMERIC => get(row, idx)?.map(Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => get(row, idx)?.map(Value::String),
        Type::BYTEA => get(row, idx)?.map(Value::Bytes),
        Type::DATE => get(row, idx)?.map(Value::Date),
        Type::TIME => get(row, idx)?.map(Value::Time),
        Type::TIMESTAMP => get(row, idx)?.map(Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx)?.map(Value::DateTimeTz),
        Type::UUID => get(row, idx)?.map(Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx)?.map(Value::Json),
        Type::BOOL_ARRAY => return array(row, idx, Value::Bool),
        Type::INT2_ARRAY => return array(row, idx, Value::Int16),
        Type::INT4_ARRAY => return array(row, idx, Value::Int32),
        Type::INT8_ARRAY => return array(row, idx, Value::Int64),
        Type::FLOAT8_ARRAY => return array(row, idx, Value::Float64),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => return array(row, idx, Value::String),
        _ => get::<String>(row, idx)
            .map_err(|_| {
                Error::type_conversion(format!(
                    "unsupported column type {} for column {}",
                    pg_type.name(),
                    row.columns()[idx].name()
                ))
            })?
            .map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: tokio_postgres::Client,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection wrapper
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    async fn prepare(&self, sql: &str) -> Result<(Statement, String)> {
        self.ensure_open()?;
        let native = rewrite_placeholders(sql, &PostgresDialect);
        let stmt = self
            .client
            .prepare(&native)
            .await
            .map_err(|e| map_pg_error(e, &native))?;
        Ok((stmt, native))
    }
}

fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.is_closed() {
        Error::connection_with_source("connection lost", e)
    } else {
        Error::query_with_sql(e.to_string(), sql)
    }
}

fn param_refs(boxed: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let (stmt, native) = self.prepare(sql).await?;
        let boxed = bind_params(params, stmt.params())?;

        let pg_rows = self
            .client
            .query(&stmt, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, &native))?;

        let labels = labels(&stmt);
        pg_rows.iter().map(|row| pg_row_to_row(row, &labels)).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let (stmt, native) = self.prepare(sql).await?;
        let boxed = bind_params(params, stmt.params())?;

        self.client
            .execute(&stmt, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, &native))
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<Pin<Box<dyn RowStream>>> {
        let (stmt, native) = self.prepare(sql).await?;
        let boxed = bind_params(params, stmt.params())?;

        // Rows arrive incrementally from the server, so fetch size is only a hint here.
        let start = self.client.query_raw(&stmt, param_refs(&boxed));
        let inner = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, start)
                .await
                .map_err(|_| Error::timeout(format!("query exceeded {:?}", limit)))?,
            None => start.await,
        }
        .map_err(|e| map_pg_error(e, &native))?;

        Ok(Box::pin(PgRowStream {
            inner: Box::pin(inner),
            labels: labels(&stmt),
            sql: native,
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Row stream over a server-side result
struct PgRowStream {
    inner: Pin<Box<tokio_postgres::RowStream>>,
    labels: Arc<[String]>,
    sql: String,
}

impl RowStream for PgRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            match self.inner.next().await {
                Some(Ok(row)) => pg_row_to_row(&row, &self.labels).map(Some),
                Some(Err(e)) => Err(map_pg_error(e, &self.sql)),
                None => Ok(None),
            }
        })
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

impl PgConnectionFactory {
    fn pg_config(config: &ConnectionConfig) -> Result<tokio_postgres::Config> {
        let url = config.url.strip_prefix("jdbc:").unwrap_or(&config.url);
        let url = url.replacen("postgresql://", "postgres://", 1);
        let mut pg: tokio_postgres::Config = url
            .parse()
            .map_err(|e| Error::config(format!("invalid connection url: {}", e)))?;
        if let Some(user) = &config.user {
            pg.user(user);
        }
        if let Some(password) = &config.password {
            pg.password(password);
        }
        if let Some(app) = &config.application_name {
            pg.application_name(app);
        }
        pg.connect_timeout(config.connect_timeout);
        Ok(pg)
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let pg = Self::pg_config(config)?;
        let (client, connection) = pg
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        // Spawn the connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection terminated");
            }
        });

        tracing::debug!(config = ?config, "opened postgres connection");
        Ok(Box::new(PgConnection::new(client)))
    }
}

/// Connect to PostgreSQL database
pub async fn connect(url: &str) -> Result<Box<dyn Connection>> {
    PgConnectionFactory
        .connect(&ConnectionConfig::new(url))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_value_conversion() {
        assert!(value_to_sql(&Value::Int32(42), &Type::INT4).is_ok());
        assert!(value_to_sql(&Value::Int32(42), &Type::INT8).is_ok());
        assert!(value_to_sql(&Value::String("hello".into()), &Type::TEXT).is_ok());
        assert!(value_to_sql(&Value::Null, &Type::TIMESTAMP).is_ok());
        assert!(value_to_sql(&Value::Bool(true), &Type::BOOL).is_ok());
    }

    #[test]
    fn test_timestamp_adapts_to_column_type() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(value_to_sql(&Value::DateTimeTz(ts), &Type::TIMESTAMP).is_ok());
        assert!(value_to_sql(&Value::DateTime(ts.naive_utc()), &Type::TIMESTAMPTZ).is_ok());
    }

    #[test]
    fn test_integer_narrowing_overflow() {
        let err = value_to_sql(&Value::Int64(i64::MAX), &Type::INT4).unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[test]
    fn test_bind_params_arity() {
        let err = bind_params(&[Value::Int32(1)], &[]).unwrap_err();
        assert!(err.to_string().contains("expects 0 parameters"));
    }

    #[test]
    fn test_pg_config_from_jdbc_url() {
        let config = ConnectionConfig::new("jdbc:postgresql://localhost:5432/shop")
            .with_credentials(Some("shop"), Some("secret"));
        let pg = PgConnectionFactory::pg_config(&config).unwrap();
        assert_eq!(pg.get_user(), Some("shop"));
        assert_eq!(pg.get_dbname(), Some("shop"));
    }

    #[test]
    fn test_pg_config_carries_timeout() {
        let config = ConnectionConfig::new("postgres://localhost/shop")
            .with_connect_timeout(std::time::Duration::from_secs(3));
        let pg = PgConnectionFactory::pg_config(&config).unwrap();
        assert_eq!(
            pg.get_connect_timeout(),
            Some(&std::time::Duration::from_secs(3))
        );
        assert_eq!(pg.get_application_name(), Some("tributary"));
    }
}
