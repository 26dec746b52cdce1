//! SQL Server Driver
//!
//! bb8-tiberius pool management and row conversion for Microsoft SQL Server.
//!
//! # Implementation Notes
//! - Uses `tiberius` pooled with `bb8-tiberius`, which owns the TCP stream
//!   setup for each connection
//! - Pool construction does not dial the server; the first acquisition (or a
//!   liveness probe) surfaces connectivity errors
//! - Date/time values are read through the chrono getters since `ColumnData`
//!   only exposes raw encodings for them
//! - NUMERIC is converted through its value/scale pair; binary data is
//!   Base64-encoded
//! - Row limits are enforced above the driver, in the query pipeline

use bb8::{Pool, PooledConnection};
use bb8_tiberius::ConnectionManager;
use tiberius::{AuthMethod, ColumnData, Config, EncryptionLevel};

use crate::config::GatewayLimits;
use crate::engine::{ConnectionDescriptor, EngineKind, RawRows};
use crate::error::{GatewayError, Result};

pub type MssqlPool = Pool<ConnectionManager>;

/// Owned pool guard; returns the connection on drop
pub type MssqlConn = PooledConnection<'static, ConnectionManager>;

fn build_config(descriptor: &ConnectionDescriptor) -> Result<Config> {
    if descriptor.engine != EngineKind::SqlServer {
        return Err(GatewayError::validation(format!(
            "Expected sqlserver engine, got {}",
            descriptor.engine
        )));
    }

    let host = descriptor
        .host
        .as_deref()
        .ok_or_else(|| GatewayError::validation("SQL Server requires 'host' parameter"))?;
    let user = descriptor
        .user
        .as_deref()
        .ok_or_else(|| GatewayError::validation("SQL Server requires 'user' parameter"))?;
    let password = descriptor.password.as_deref().unwrap_or("");

    let mut config = Config::new();
    config.host(host);
    if let Some(port) = descriptor.effective_port() {
        config.port(port);
    }
    config.authentication(AuthMethod::sql_server(user, password));
    if let Some(database) = descriptor.database.as_deref() {
        config.database(database);
    }
    // Managed servers require TLS; local instances frequently have no cert
    config.encryption(if descriptor.remote {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::NotSupported
    });
    config.trust_cert();

    Ok(config)
}

/// Build a pool for the descriptor, sized from `pool_max_connections`
pub async fn create_pool(
    descriptor: &ConnectionDescriptor,
    limits: &GatewayLimits,
) -> Result<MssqlPool> {
    let config = build_config(descriptor)?;
    let manager = ConnectionManager::new(config);

    Pool::builder()
        .max_size(limits.pool_max_connections)
        .connection_timeout(std::time::Duration::from_secs(limits.default_timeout_secs))
        .build(manager)
        .await
        .map_err(|e| {
            GatewayError::connection_failed(format!("Failed to create SQL Server pool: {e}"))
        })
}

/// Check out a connection; waits up to the pool's connection timeout
pub async fn acquire(pool: &MssqlPool) -> Result<MssqlConn> {
    pool.get_owned().await.map_err(|e| {
        GatewayError::connection_failed(format!("Failed to get SQL Server connection: {e}"))
    })
}

/// Execute a statement and collect all rows as JSON-safe values
pub async fn fetch(conn: &mut MssqlConn, sql: &str) -> Result<RawRows> {
    let mut stream =
        conn.simple_query(sql).await.map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let columns: Vec<String> = stream
        .columns()
        .await
        .map_err(|e| GatewayError::query_failed(e.to_string()))?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let tib_rows = stream
        .into_first_result()
        .await
        .map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let rows = tib_rows.iter().map(convert_row).collect();

    Ok(RawRows { columns, rows })
}

/// Execute a statement where no result set is expected
pub async fn execute(conn: &mut MssqlConn, sql: &str) -> Result<()> {
    conn.simple_query(sql)
        .await
        .map_err(|e| GatewayError::query_failed(e.to_string()))?
        .into_results()
        .await
        .map_err(|e| GatewayError::query_failed(e.to_string()))?;
    Ok(())
}

/// Convert a tiberius row to positional JSON values.
///
/// Date/time cells go through `try_get` with chrono types; everything else is
/// converted straight from the wire representation.
fn convert_row(row: &tiberius::Row) -> Vec<serde_json::Value> {
    row.cells()
        .enumerate()
        .map(|(idx, (_col, data))| match data {
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<chrono::NaiveDateTime, _>(idx)
                .ok()
                .flatten()
                .map_or(serde_json::Value::Null, |dt| {
                    serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
                }),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
                .ok()
                .flatten()
                .map_or(serde_json::Value::Null, |dt| {
                    serde_json::Value::String(dt.to_rfc3339())
                }),
            ColumnData::Date(Some(_)) => row
                .try_get::<chrono::NaiveDate, _>(idx)
                .ok()
                .flatten()
                .map_or(serde_json::Value::Null, |d| {
                    serde_json::Value::String(d.format("%Y-%m-%d").to_string())
                }),
            ColumnData::Time(Some(_)) => row
                .try_get::<chrono::NaiveTime, _>(idx)
                .ok()
                .flatten()
                .map_or(serde_json::Value::Null, |t| {
                    serde_json::Value::String(t.format("%H:%M:%S").to_string())
                }),
            other => column_data_to_json(other),
        })
        .collect()
}

/// Convert non-temporal `ColumnData` to a JSON value
fn column_data_to_json(data: &ColumnData<'_>) -> serde_json::Value {
    match data {
        ColumnData::Bit(Some(b)) => serde_json::Value::Bool(*b),
        ColumnData::U8(Some(v)) => serde_json::json!(*v),
        ColumnData::I16(Some(v)) => serde_json::json!(*v),
        ColumnData::I32(Some(v)) => serde_json::json!(*v),
        ColumnData::I64(Some(v)) => serde_json::json!(*v),
        ColumnData::F32(Some(v)) => serde_json::Number::from_f64(f64::from(*v))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        ColumnData::F64(Some(v)) => serde_json::Number::from_f64(*v)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        #[allow(clippy::cast_precision_loss)]
        ColumnData::Numeric(Some(n)) => {
            let value = n.value() as f64 / 10f64.powi(i32::from(n.scale()));
            serde_json::Number::from_f64(value)
                .map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        ColumnData::String(Some(s)) => serde_json::Value::String(s.to_string()),
        ColumnData::Guid(Some(g)) => serde_json::Value::String(g.to_string()),
        ColumnData::Binary(Some(b)) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b.as_ref()))
        }
        ColumnData::Xml(Some(xml)) => serde_json::Value::String(xml.to_string()),
        _ => serde_json::Value::Null,
    }
}
