//! `PostgreSQL` Driver
//!
//! bb8 pool management and row conversion for `PostgreSQL` databases.
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` with a `bb8` pool sized from the gateway limits
//! - Pool construction does not dial the server; the first acquisition (or a
//!   liveness probe) surfaces connectivity errors
//! - Statements are prepared first so column names are available even for
//!   empty result sets
//! - BYTEA is Base64-encoded, NaN/Infinity floats become JSON null
//! - Row limits are enforced above the driver, in the query pipeline

use bb8::{Pool, PooledConnection};
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::types::Type;
use tokio_postgres::NoTls;

use crate::config::GatewayLimits;
use crate::engine::{ConnectionDescriptor, EngineKind, RawRows};
use crate::error::{GatewayError, Result};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Owned pool guard; returns the connection on drop
pub type PgConn = PooledConnection<'static, PostgresConnectionManager<NoTls>>;

fn build_pg_config(descriptor: &ConnectionDescriptor) -> Result<tokio_postgres::Config> {
    if descriptor.engine != EngineKind::Postgres {
        return Err(GatewayError::validation(format!(
            "Expected postgres engine, got {}",
            descriptor.engine
        )));
    }

    let host = descriptor
        .host
        .as_deref()
        .ok_or_else(|| GatewayError::validation("PostgreSQL requires 'host' parameter"))?;
    let user = descriptor
        .user
        .as_deref()
        .ok_or_else(|| GatewayError::validation("PostgreSQL requires 'user' parameter"))?;
    let database = descriptor
        .database
        .as_deref()
        .ok_or_else(|| GatewayError::validation("PostgreSQL requires 'database' parameter"))?;

    let mut config = tokio_postgres::Config::new();
    config.host(host).user(user).dbname(database);
    if let Some(port) = descriptor.effective_port() {
        config.port(port);
    }
    if let Some(password) = descriptor.password.as_deref() {
        config.password(password);
    }

    Ok(config)
}

/// Build a pool for the descriptor, sized from `pool_max_connections`
pub async fn create_pool(
    descriptor: &ConnectionDescriptor,
    limits: &GatewayLimits,
) -> Result<PgPool> {
    let config = build_pg_config(descriptor)?;
    let manager = PostgresConnectionManager::new(config, NoTls);

    Pool::builder()
        .max_size(limits.pool_max_connections)
        .connection_timeout(std::time::Duration::from_secs(limits.default_timeout_secs))
        .build(manager)
        .await
        .map_err(|e| {
            GatewayError::connection_failed(format!("Failed to create PostgreSQL pool: {e}"))
        })
}

/// Check out a connection; waits up to the pool's connection timeout
pub async fn acquire(pool: &PgPool) -> Result<PgConn> {
    pool.get_owned().await.map_err(|e| {
        GatewayError::connection_failed(format!("Failed to get PostgreSQL connection: {e}"))
    })
}

/// Execute a statement and collect all rows as JSON-safe values
pub async fn fetch(conn: &PgConn, sql: &str) -> Result<RawRows> {
    let stmt = conn.prepare(sql).await.map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

    let pg_rows =
        conn.query(&stmt, &[]).await.map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let mut rows = Vec::with_capacity(pg_rows.len());
    for row in &pg_rows {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(postgres_value_to_json(row, idx)?);
        }
        rows.push(values);
    }

    Ok(RawRows { columns, rows })
}

/// Execute a statement where no result set is expected
pub async fn execute(conn: &PgConn, sql: &str) -> Result<()> {
    conn.batch_execute(sql).await.map_err(|e| GatewayError::query_failed(e.to_string()))
}

/// Convert `PostgreSQL` value to JSON value based on column type
fn postgres_value_to_json(row: &tokio_postgres::Row, idx: usize) -> Result<serde_json::Value> {
    let column_type = row.columns()[idx].type_();

    let value = match *column_type {
        Type::BOOL => {
            get_typed::<bool>(row, idx)?.map_or(serde_json::Value::Null, serde_json::Value::Bool)
        }
        Type::INT2 => {
            get_typed::<i16>(row, idx)?.map_or(serde_json::Value::Null, |v| serde_json::json!(v))
        }
        Type::INT4 => {
            get_typed::<i32>(row, idx)?.map_or(serde_json::Value::Null, |v| serde_json::json!(v))
        }
        Type::INT8 => {
            get_typed::<i64>(row, idx)?.map_or(serde_json::Value::Null, |v| serde_json::json!(v))
        }
        Type::FLOAT4 => get_typed::<f32>(row, idx)?.map_or(serde_json::Value::Null, |v| {
            // NaN/Infinity are not representable in JSON
            serde_json::Number::from_f64(f64::from(v))
                .map_or(serde_json::Value::Null, serde_json::Value::Number)
        }),
        Type::FLOAT8 => get_typed::<f64>(row, idx)?.map_or(serde_json::Value::Null, |v| {
            serde_json::Number::from_f64(v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number)
        }),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => get_typed::<String>(row, idx)?
            .map_or(serde_json::Value::Null, serde_json::Value::String),
        Type::JSON | Type::JSONB => {
            get_typed::<serde_json::Value>(row, idx)?.unwrap_or(serde_json::Value::Null)
        }
        Type::BYTEA => get_typed::<Vec<u8>>(row, idx)?.map_or(serde_json::Value::Null, |bytes| {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }),
        Type::TIMESTAMP => {
            get_typed::<chrono::NaiveDateTime>(row, idx)?.map_or(serde_json::Value::Null, |v| {
                serde_json::Value::String(v.format("%Y-%m-%dT%H:%M:%S").to_string())
            })
        }
        Type::TIMESTAMPTZ => get_typed::<chrono::DateTime<chrono::Utc>>(row, idx)?
            .map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.to_rfc3339())),
        Type::DATE => {
            get_typed::<chrono::NaiveDate>(row, idx)?.map_or(serde_json::Value::Null, |v| {
                serde_json::Value::String(v.format("%Y-%m-%d").to_string())
            })
        }
        Type::TIME => {
            get_typed::<chrono::NaiveTime>(row, idx)?.map_or(serde_json::Value::Null, |v| {
                serde_json::Value::String(v.format("%H:%M:%S").to_string())
            })
        }
        Type::UUID => get_typed::<uuid::Uuid>(row, idx)?
            .map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.to_string())),
        _ => get_string_lossy(row, idx),
    };

    Ok(value)
}

fn get_typed<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Option<T>>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .map_err(|e| GatewayError::query_failed(format!("Value conversion failed: {e}")))
}

/// Last-resort conversion for types without a native mapping (arrays, enums,
/// NUMERIC). Falls back to a type-name placeholder rather than failing the
/// whole row.
fn get_string_lossy(row: &tokio_postgres::Row, idx: usize) -> serde_json::Value {
    match row.try_get::<_, Option<String>>(idx) {
        Ok(Some(s)) => serde_json::Value::String(s),
        Ok(None) => serde_json::Value::Null,
        Err(_) => serde_json::Value::String(format!("<{}>", row.columns()[idx].type_().name())),
    }
}
