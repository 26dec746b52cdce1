//! `SQLite` Driver
//!
//! Connection factory and row conversion for `SQLite` databases.
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver); calls are short and file-local
//! - The "pool" is a factory: `SQLite` connections are cheap to open, so one
//!   is opened per acquisition and dropped on release
//! - Databases are opened read-only; the gateway never writes, and a missing
//!   or invalid file fails at open time (which is what liveness probes rely
//!   on)
//! - BLOB data is Base64-encoded for JSON safety
//! - Row limits are enforced above the driver, in the query pipeline

use rusqlite::{Connection, OpenFlags, Row};
use std::path::PathBuf;

use crate::engine::{ConnectionDescriptor, EngineKind, RawRows};
use crate::error::{GatewayError, Result};

/// Opens one connection per acquisition, disguised as a pool
pub struct SqliteFactory {
    path: PathBuf,
}

impl SqliteFactory {
    /// Validate the descriptor and build a factory for its file path
    pub fn new(descriptor: &ConnectionDescriptor) -> Result<Self> {
        if descriptor.engine != EngineKind::Sqlite {
            return Err(GatewayError::validation(format!(
                "Expected sqlite engine, got {}",
                descriptor.engine
            )));
        }

        let path = descriptor
            .file
            .clone()
            .ok_or_else(|| GatewayError::validation("SQLite requires 'file' parameter"))?;

        Ok(Self { path })
    }

    /// Open a read-only connection to the database file
    pub fn open(&self) -> Result<Connection> {
        let path = self.path.to_str().ok_or_else(|| {
            GatewayError::validation("SQLite file path contains invalid UTF-8 characters")
        })?;

        Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(|e| {
            GatewayError::connection_failed(format!("Failed to open SQLite database: {e}"))
        })
    }
}

/// Execute a statement and collect all rows as JSON-safe values
pub fn fetch(conn: &Connection, sql: &str) -> Result<RawRows> {
    let mut stmt =
        conn.prepare(sql).map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();
    let column_count = columns.len();

    let mut rows = stmt.query([]).map_err(|e| GatewayError::query_failed(e.to_string()))?;

    let mut rows_data = Vec::new();
    while let Some(row) =
        rows.next().map_err(|e| GatewayError::query_failed(e.to_string()))?
    {
        rows_data.push(
            row_to_json(column_count, row).map_err(|e| GatewayError::query_failed(e.to_string()))?,
        );
    }

    Ok(RawRows { columns, rows: rows_data })
}

/// Execute a statement where no result set is expected
pub fn execute(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute_batch(sql).map_err(|e| GatewayError::query_failed(e.to_string()))
}

/// Convert a `SQLite` row to a JSON-safe `Vec`
fn row_to_json(
    column_count: usize,
    row: &Row,
) -> std::result::Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut values = Vec::with_capacity(column_count);

    for idx in 0..column_count {
        values.push(sqlite_value_to_json(row, idx)?);
    }

    Ok(values)
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    use rusqlite::types::ValueRef;

    let value_ref = row.get_ref(idx)?;

    Ok(match value_ref {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // Handle NaN/Infinity as null
        ValueRef::Text(s) => {
            let text = std::str::from_utf8(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            serde_json::Value::String(text.to_string())
        }
        ValueRef::Blob(b) => {
            // Encode BLOB as Base64 for JSON safety
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(b);
            serde_json::Value::String(encoded)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dialect_for;
    use pretty_assertions::assert_eq;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("colloquy_sqlite_{name}_{}.db", std::process::id()))
    }

    fn seed_db(path: &PathBuf) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL, avatar BLOB);
             INSERT INTO users (name, score, avatar) VALUES ('alice', 9.5, X'DEADBEEF');
             INSERT INTO users (name, score, avatar) VALUES ('bob', NULL, NULL);",
        )
        .unwrap();
    }

    #[test]
    fn test_factory_rejects_wrong_engine() {
        let descriptor = ConnectionDescriptor::mysql(
            "localhost".to_string(),
            3306,
            "u".to_string(),
            "p".to_string(),
            "db".to_string(),
        );
        assert!(SqliteFactory::new(&descriptor).is_err());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let descriptor =
            ConnectionDescriptor::sqlite(PathBuf::from("/nonexistent/dir/missing.db"));
        let factory = SqliteFactory::new(&descriptor).unwrap();
        let err = factory.open().unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
    }

    #[test]
    fn test_fetch_converts_values() {
        let path = temp_db_path("fetch");
        let _ = std::fs::remove_file(&path);
        seed_db(&path);

        let descriptor = ConnectionDescriptor::sqlite(path.clone());
        let factory = SqliteFactory::new(&descriptor).unwrap();
        let conn = factory.open().unwrap();

        let result = fetch(&conn, "SELECT id, name, score, avatar FROM users ORDER BY id").unwrap();
        assert_eq!(result.columns, vec!["id", "name", "score", "avatar"]);
        assert_eq!(result.rows.len(), 2);

        assert_eq!(result.rows[0][0], serde_json::json!(1));
        assert_eq!(result.rows[0][1], serde_json::json!("alice"));
        assert_eq!(result.rows[0][2], serde_json::json!(9.5));
        // X'DEADBEEF' as base64
        assert_eq!(result.rows[0][3], serde_json::json!("3q2+7w=="));

        assert_eq!(result.rows[1][2], serde_json::Value::Null);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_read_only_open_blocks_writes() {
        let path = temp_db_path("readonly");
        let _ = std::fs::remove_file(&path);
        seed_db(&path);

        let descriptor = ConnectionDescriptor::sqlite(path.clone());
        let conn = SqliteFactory::new(&descriptor).unwrap().open().unwrap();
        assert!(execute(&conn, "INSERT INTO users (name) VALUES ('mallory')").is_err());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_probe_sql_round_trip() {
        let path = temp_db_path("probe");
        let _ = std::fs::remove_file(&path);
        seed_db(&path);

        let descriptor = ConnectionDescriptor::sqlite(path.clone());
        let conn = SqliteFactory::new(&descriptor).unwrap().open().unwrap();
        let probe = dialect_for(EngineKind::Sqlite).probe_sql();
        assert!(fetch(&conn, probe).is_ok());

        let _ = std::fs::remove_file(&path);
    }
}
