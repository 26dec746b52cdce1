//! Oracle Driver
//!
//! Connection factory and row conversion for Oracle databases.
//!
//! # Implementation Notes
//! - Uses the `oracle` crate (synchronous, links the Oracle client library),
//!   which is why this driver sits behind a non-default feature
//! - The "pool" is a factory opening one connection per acquisition through
//!   an Easy Connect DSN
//! - NUMBER is fetched as f64 when it has decimal places, i64 otherwise;
//!   RAW/BLOB data is Base64-encoded; timestamps use the chrono getters
//! - Row limits are enforced above the driver, in the query pipeline

use oracle::sql_type::OracleType;
use oracle::{Connection, Row};

use crate::engine::{ConnectionDescriptor, EngineKind, RawRows};
use crate::error::{GatewayError, Result};

/// Opens one connection per acquisition, disguised as a pool
pub struct OracleFactory {
    user: String,
    password: String,
    dsn: String,
}

impl OracleFactory {
    /// Validate the descriptor and build a factory for its DSN
    pub fn new(descriptor: &ConnectionDescriptor) -> Result<Self> {
        if descriptor.engine != EngineKind::Oracle {
            return Err(GatewayError::validation(format!(
                "Expected oracle engine, got {}",
                descriptor.engine
            )));
        }

        let user = descriptor
            .user
            .clone()
            .ok_or_else(|| GatewayError::validation("Oracle requires 'user' parameter"))?;
        let password = descriptor
            .password
            .clone()
            .ok_or_else(|| GatewayError::validation("Oracle requires 'password' parameter"))?;
        let dsn = descriptor
            .dsn
            .clone()
            .ok_or_else(|| GatewayError::validation("Oracle requires 'dsn' parameter"))?;

        Ok(Self { user, password, dsn })
    }

    /// Open a connection to the DSN
    pub fn open(&self) -> Result<Connection> {
        Connection::connect(&self.user, &self.password, &self.dsn).map_err(|e| {
            GatewayError::connection_failed(format!("Failed to connect to Oracle: {e}"))
        })
    }
}

/// Execute a statement and collect all rows as JSON-safe values
pub fn fetch(conn: &Connection, sql: &str) -> Result<RawRows> {
    let result_set =
        conn.query(sql, &[]).map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let column_info: Vec<(String, OracleType)> = result_set
        .column_info()
        .iter()
        .map(|c| (c.name().to_string(), c.oracle_type().clone()))
        .collect();
    let columns: Vec<String> = column_info.iter().map(|(name, _)| name.clone()).collect();

    let mut rows = Vec::new();
    for row in result_set {
        let row = row.map_err(|e| GatewayError::query_failed(e.to_string()))?;
        let mut values = Vec::with_capacity(column_info.len());
        for (idx, (_, oracle_type)) in column_info.iter().enumerate() {
            values.push(oracle_value_to_json(&row, idx, oracle_type)?);
        }
        rows.push(values);
    }

    Ok(RawRows { columns, rows })
}

/// Execute a statement where no result set is expected
pub fn execute(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute(sql, &[]).map_err(|e| GatewayError::query_failed(e.to_string()))?;
    Ok(())
}

/// Convert an Oracle value to a JSON value based on its declared type
fn oracle_value_to_json(
    row: &Row,
    idx: usize,
    oracle_type: &OracleType,
) -> Result<serde_json::Value> {
    let value = match oracle_type {
        OracleType::Number(_, scale) if *scale == 0 => get_typed::<i64>(row, idx)?
            .map_or(serde_json::Value::Null, |v| serde_json::json!(v)),
        OracleType::Number(_, _) | OracleType::Float(_) | OracleType::BinaryDouble
        | OracleType::BinaryFloat => {
            get_typed::<f64>(row, idx)?.map_or(serde_json::Value::Null, |v| {
                serde_json::Number::from_f64(v)
                    .map_or(serde_json::Value::Null, serde_json::Value::Number)
            })
        }
        OracleType::Int64 => get_typed::<i64>(row, idx)?
            .map_or(serde_json::Value::Null, |v| serde_json::json!(v)),
        OracleType::Date | OracleType::Timestamp(_) => {
            get_typed::<chrono::NaiveDateTime>(row, idx)?.map_or(serde_json::Value::Null, |v| {
                serde_json::Value::String(v.format("%Y-%m-%dT%H:%M:%S").to_string())
            })
        }
        OracleType::TimestampTZ(_) | OracleType::TimestampLTZ(_) => {
            get_typed::<chrono::DateTime<chrono::Utc>>(row, idx)?
                .map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.to_rfc3339()))
        }
        OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => {
            get_typed::<Vec<u8>>(row, idx)?.map_or(serde_json::Value::Null, |bytes| {
                use base64::Engine;
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            })
        }
        _ => get_typed::<String>(row, idx)?
            .map_or(serde_json::Value::Null, serde_json::Value::String),
    };

    Ok(value)
}

fn get_typed<T>(row: &Row, idx: usize) -> Result<Option<T>>
where
    T: oracle::sql_type::FromSql,
{
    row.get::<usize, Option<T>>(idx)
        .map_err(|e| GatewayError::query_failed(format!("Value conversion failed: {e}")))
}
