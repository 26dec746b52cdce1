//! `MySQL` Driver
//!
//! Pool management and row conversion for `MySQL` and `MariaDB` databases.
//!
//! # Implementation Notes
//! - Uses `mysql_async`, whose built-in pool is sized from the gateway limits
//! - The pool requires an explicit `disconnect()`; [`crate::engine::PoolHandle::close`]
//!   calls it so server-side sessions are not leaked
//! - `Bytes` values are returned as UTF-8 text when valid, Base64 otherwise
//! - NaN/Infinity floats become JSON null
//! - Row limits are enforced above the driver, in the query pipeline

use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, Value};

use crate::config::GatewayLimits;
use crate::engine::{ConnectionDescriptor, EngineKind, RawRows};
use crate::error::{GatewayError, Result};

fn build_opts(descriptor: &ConnectionDescriptor, limits: &GatewayLimits) -> Result<Opts> {
    if descriptor.engine != EngineKind::MySql {
        return Err(GatewayError::validation(format!(
            "Expected mysql engine, got {}",
            descriptor.engine
        )));
    }

    let host = descriptor
        .host
        .as_deref()
        .ok_or_else(|| GatewayError::validation("MySQL requires 'host' parameter"))?;
    let user = descriptor
        .user
        .as_deref()
        .ok_or_else(|| GatewayError::validation("MySQL requires 'user' parameter"))?;
    let database = descriptor
        .database
        .as_deref()
        .ok_or_else(|| GatewayError::validation("MySQL requires 'database' parameter"))?;

    let max = usize::try_from(limits.pool_max_connections.max(1))
        .map_err(|_| GatewayError::config_error("pool_max_connections out of range"))?;
    let constraints = PoolConstraints::new(0, max)
        .ok_or_else(|| GatewayError::config_error("Invalid MySQL pool constraints"))?;

    let mut builder = OptsBuilder::default()
        .ip_or_hostname(host)
        .user(Some(user))
        .db_name(Some(database))
        .pool_opts(PoolOpts::default().with_constraints(constraints));

    if let Some(port) = descriptor.effective_port() {
        builder = builder.tcp_port(port);
    }
    if let Some(password) = descriptor.password.as_deref() {
        builder = builder.pass(Some(password));
    }

    Ok(builder.into())
}

/// Build a pool for the descriptor. No connection is dialed until the first
/// acquisition.
pub fn create_pool(descriptor: &ConnectionDescriptor, limits: &GatewayLimits) -> Result<Pool> {
    Ok(Pool::new(build_opts(descriptor, limits)?))
}

/// Execute a statement and collect all rows as JSON-safe values
pub async fn fetch(conn: &mut Conn, sql: &str) -> Result<RawRows> {
    let mut result =
        conn.query_iter(sql).await.map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let columns: Vec<String> = result
        .columns()
        .map(|cols| cols.iter().map(|c| c.name_str().to_string()).collect())
        .unwrap_or_default();

    let mysql_rows: Vec<Row> =
        result.collect().await.map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let mut rows = Vec::with_capacity(mysql_rows.len());
    for row in &mysql_rows {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..row.len() {
            values.push(mysql_value_to_json(row, idx)?);
        }
        rows.push(values);
    }

    Ok(RawRows { columns, rows })
}

/// Execute a statement where no result set is expected
pub async fn execute(conn: &mut Conn, sql: &str) -> Result<()> {
    conn.query_drop(sql).await.map_err(|e| GatewayError::query_failed(e.to_string()))
}

/// Convert `MySQL` value to JSON value
fn mysql_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    let value = row
        .as_ref(idx)
        .ok_or_else(|| GatewayError::query_failed(format!("Failed to get value at index {idx}")))?;

    Ok(scalar_to_json(value))
}

fn scalar_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => {
            // Text columns arrive as Bytes; fall back to Base64 for binary
            if let Ok(s) = std::str::from_utf8(bytes) {
                serde_json::Value::String(s.to_string())
            } else {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                serde_json::Value::String(encoded)
            }
        }

        Value::Int(i) => serde_json::Value::Number((*i).into()),

        Value::UInt(u) => serde_json::json!(*u),

        Value::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // Handle NaN/Infinity as null

        Value::Double(d) => serde_json::Number::from_f64(*d)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // Handle NaN/Infinity as null

        Value::Date(year, month, day, hour, minute, second, micro) => {
            let datetime_str = format!(
                "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
            );
            serde_json::Value::String(datetime_str)
        }

        Value::Time(is_negative, days, hours, minutes, seconds, microseconds) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            let time_str =
                format!("{sign}{total_hours}:{minutes:02}:{seconds:02}.{microseconds:06}");
            serde_json::Value::String(time_str)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_opts_require_server_fields() {
        let mut descriptor = ConnectionDescriptor::mysql(
            "localhost".to_string(),
            3306,
            "app".to_string(),
            "secret".to_string(),
            "shop".to_string(),
        );
        let limits = GatewayLimits::default();
        assert!(build_opts(&descriptor, &limits).is_ok());

        descriptor.database = None;
        let err = build_opts(&descriptor, &limits).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_opts_reject_wrong_engine() {
        let descriptor = ConnectionDescriptor::sqlite(PathBuf::from("/tmp/x.db"));
        assert!(build_opts(&descriptor, &GatewayLimits::default()).is_err());
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(scalar_to_json(&Value::NULL), serde_json::Value::Null);
        assert_eq!(scalar_to_json(&Value::Int(42)), serde_json::json!(42));
        assert_eq!(scalar_to_json(&Value::Bytes(b"hello".to_vec())), serde_json::json!("hello"));
        assert_eq!(scalar_to_json(&Value::Double(f64::NAN)), serde_json::Value::Null);
        assert_eq!(
            scalar_to_json(&Value::Date(2024, 3, 15, 10, 30, 0, 0)),
            serde_json::json!("2024-03-15T10:30:00.000000")
        );
        assert_eq!(
            scalar_to_json(&Value::Bytes(vec![0xff, 0xfe])),
            serde_json::json!("//4=")
        );
    }
}
