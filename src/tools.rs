//! Tool Executor
//!
//! The seven database tools offered to the model. Argument structs derive
//! `Deserialize` and `JsonSchema` so the same definition feeds both parsing
//! and the schema advertised to the model. Every tool carries a required
//! `rationale` surfaced to the client as a progress line.
//!
//! Per-call failures (bad arguments, unknown tools, query errors) become
//! structured error outcomes, never `Err`: one broken call must not abort the
//! round.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::context::{ContextStore, QueryStatus};
use crate::engine::ConnectionDescriptor;
use crate::llm::{ToolCall, ToolDefinition};
use crate::ops::QueryOperations;

/// Outcome of one tool call, split into the full client payload and the
/// bounded summary replayed to the model
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub client_result: serde_json::Value,
    pub model_summary: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn ok(client_result: serde_json::Value, model_summary: impl Into<String>) -> Self {
        Self { client_result, model_summary: model_summary.into(), is_error: false }
    }

    fn error(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            client_result: json!({"error": {"code": code, "message": message}}),
            model_summary: format!("Error: {message}"),
            is_error: true,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ConnectionStatusArgs {
    /// Why this tool is needed right now, shown to the user
    #[allow(dead_code)]
    rationale: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DatabaseListArgs {
    #[allow(dead_code)]
    rationale: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DatabaseSchemaArgs {
    #[allow(dead_code)]
    rationale: String,
    /// Database to describe; the connected database when omitted
    database: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TableColumnsArgs {
    #[allow(dead_code)]
    rationale: String,
    table_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExecuteQueryArgs {
    #[allow(dead_code)]
    rationale: String,
    /// The SELECT statement to run
    query: String,
    /// Row cap, 1 to 1000 (default 100)
    max_rows: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RecentQueriesArgs {
    #[allow(dead_code)]
    rationale: String,
    /// Number of history entries, 1 to 50 (default 5)
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SampleDataArgs {
    #[allow(dead_code)]
    rationale: String,
    table_name: String,
    /// Number of sample rows, 1 to 100 (default 5)
    rows: Option<u32>,
}

/// The tool surface advertised to the model
#[must_use]
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        definition::<ConnectionStatusArgs>(
            "get_connection_status",
            "Check whether the user has a live database connection and which database it points at",
        ),
        definition::<DatabaseListArgs>(
            "get_database_list",
            "List the databases visible on the connected server, excluding system databases",
        ),
        definition::<DatabaseSchemaArgs>(
            "get_database_schema",
            "Get all tables and their columns for a database",
        ),
        definition::<TableColumnsArgs>(
            "get_table_columns",
            "Get the column names, types and nullability of one table",
        ),
        definition::<ExecuteQueryArgs>(
            "execute_query",
            "Run a read-only SELECT query and return its rows",
        ),
        definition::<RecentQueriesArgs>(
            "get_recent_queries",
            "List the user's recently executed queries",
        ),
        definition::<SampleDataArgs>(
            "get_sample_data",
            "Fetch a few example rows from a table to understand its contents",
        ),
    ]
}

fn definition<A: JsonSchema>(name: &str, description: &str) -> ToolDefinition {
    let schema = schemars::schema_for!(A);
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters: serde_json::to_value(schema).unwrap_or_else(|_| json!({})),
    }
}

/// Progress line shown to the user while a tool runs
#[must_use]
pub fn display_message(name: &str, arguments: &serde_json::Value) -> String {
    let rationale = arguments
        .get("rationale")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .to_string();

    let action = match name {
        "get_connection_status" => "Checking connection status".to_string(),
        "get_database_list" => "Listing databases".to_string(),
        "get_database_schema" => match arguments.get("database").and_then(serde_json::Value::as_str)
        {
            Some(db) => format!("Reading schema of {db}"),
            None => "Reading database schema".to_string(),
        },
        "get_table_columns" => match arguments.get("table_name").and_then(serde_json::Value::as_str)
        {
            Some(table) => format!("Inspecting columns of {table}"),
            None => "Inspecting table columns".to_string(),
        },
        "execute_query" => "Running query".to_string(),
        "get_recent_queries" => "Looking up recent queries".to_string(),
        "get_sample_data" => match arguments.get("table_name").and_then(serde_json::Value::as_str) {
            Some(table) => format!("Sampling rows from {table}"),
            None => "Sampling rows".to_string(),
        },
        other => format!("Running {other}"),
    };

    if rationale.is_empty() {
        action
    } else {
        format!("{action}: {rationale}")
    }
}

/// Dispatches model tool calls to the query pipeline and context store
pub struct ToolExecutor {
    ops: Arc<QueryOperations>,
    context: Arc<ContextStore>,
}

impl ToolExecutor {
    #[must_use]
    pub fn new(ops: Arc<QueryOperations>, context: Arc<ContextStore>) -> Self {
        Self { ops, context }
    }

    /// Execute one tool call for `user` against the host-resolved descriptor
    pub async fn execute(
        &self,
        user: &str,
        descriptor: Option<&ConnectionDescriptor>,
        call: &ToolCall,
    ) -> ToolOutcome {
        match call.name.as_str() {
            "get_connection_status" => self.connection_status(user, descriptor, call).await,
            "get_database_list" => self.database_list(user, descriptor, call).await,
            "get_database_schema" => self.database_schema(user, descriptor, call).await,
            "get_table_columns" => self.table_columns(user, descriptor, call).await,
            "execute_query" => self.execute_query(user, descriptor, call).await,
            "get_recent_queries" => self.recent_queries(user, call).await,
            "get_sample_data" => self.sample_data(user, descriptor, call).await,
            other => ToolOutcome::error("UNKNOWN_TOOL", format!("Unknown tool: {other}")),
        }
    }

    async fn connection_status(
        &self,
        user: &str,
        descriptor: Option<&ConnectionDescriptor>,
        call: &ToolCall,
    ) -> ToolOutcome {
        let Ok(_args) = parse::<ConnectionStatusArgs>(call) else {
            return bad_args(call);
        };

        match self.context.connection_state(user, descriptor).await {
            Ok(state) => {
                let summary = match &state {
                    crate::context::ConnectionState::Connected(c) => format!(
                        "Connected to {} ({})",
                        c.database.as_deref().unwrap_or("?"),
                        c.engine
                    ),
                    other => format!("Not connected ({})", other.as_str()),
                };
                let connection = match &state {
                    crate::context::ConnectionState::Connected(c) => {
                        serde_json::to_value(c).unwrap_or(serde_json::Value::Null)
                    }
                    _ => serde_json::Value::Null,
                };
                ToolOutcome::ok(
                    json!({"state": state.as_str(), "connection": connection}),
                    summary,
                )
            }
            Err(e) => ToolOutcome::error(e.error_code(), e.message()),
        }
    }

    async fn database_list(
        &self,
        user: &str,
        descriptor: Option<&ConnectionDescriptor>,
        call: &ToolCall,
    ) -> ToolOutcome {
        let Ok(_args) = parse::<DatabaseListArgs>(call) else {
            return bad_args(call);
        };
        let Some(descriptor) = descriptor else {
            return no_connection();
        };

        match self.ops.list_databases(user, descriptor).await {
            Ok(databases) => ToolOutcome::ok(
                json!({"databases": databases}),
                format!("{} databases: {}", databases.len(), databases.join(", ")),
            ),
            Err(e) => ToolOutcome::error(e.error_code(), e.message()),
        }
    }

    async fn database_schema(
        &self,
        user: &str,
        descriptor: Option<&ConnectionDescriptor>,
        call: &ToolCall,
    ) -> ToolOutcome {
        let Ok(args) = parse::<DatabaseSchemaArgs>(call) else {
            return bad_args(call);
        };
        let Some(descriptor) = descriptor else {
            return no_connection();
        };

        // Selecting another database re-targets the descriptor for this call
        let target = match args.database {
            Some(database) => {
                if let Err(e) = crate::security::validate_identifier(&database) {
                    return ToolOutcome::error(e.error_code(), e.message());
                }
                let mut switched = descriptor.clone();
                if descriptor.database.is_some() {
                    switched.database = Some(database);
                }
                switched
            }
            None => descriptor.clone(),
        };

        let database = target.database.clone().unwrap_or_else(|| "main".to_string());

        // Serve from the user's schema cache while it is fresh
        if let Ok(Some(cached)) = self.context.schema(user, &database).await {
            return schema_outcome(&database, &cached.tables, &cached.columns, true);
        }

        match self.ops.fetch_schema_snapshot(user, &target).await {
            Ok(snapshot) => {
                if let Err(e) = self.context.store_schema(user, &snapshot).await {
                    tracing::warn!(user, error = %e, "failed to cache schema snapshot");
                }
                schema_outcome(&database, &snapshot.tables, &snapshot.columns, false)
            }
            Err(e) => ToolOutcome::error(e.error_code(), e.message()),
        }
    }

    async fn table_columns(
        &self,
        user: &str,
        descriptor: Option<&ConnectionDescriptor>,
        call: &ToolCall,
    ) -> ToolOutcome {
        let Ok(args) = parse::<TableColumnsArgs>(call) else {
            return bad_args(call);
        };
        let Some(descriptor) = descriptor else {
            return no_connection();
        };

        match self.ops.describe_table(user, descriptor, &args.table_name).await {
            Ok(columns) => {
                let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
                ToolOutcome::ok(
                    json!({"table": args.table_name, "columns": columns}),
                    format!("{} has {} columns: {}", args.table_name, names.len(), names.join(", ")),
                )
            }
            Err(e) => ToolOutcome::error(e.error_code(), e.message()),
        }
    }

    async fn execute_query(
        &self,
        user: &str,
        descriptor: Option<&ConnectionDescriptor>,
        call: &ToolCall,
    ) -> ToolOutcome {
        let Ok(args) = parse::<ExecuteQueryArgs>(call) else {
            return bad_args(call);
        };
        let Some(descriptor) = descriptor else {
            return no_connection();
        };

        let max_rows = match bounded(args.max_rows, 100, 1, 1000, "max_rows") {
            Ok(v) => v,
            Err(message) => return ToolOutcome::error("VALIDATION_ERROR", message),
        };

        let database = descriptor.database.clone();
        match self.ops.run_query(user, descriptor, &args.query, Some(max_rows), None).await {
            Ok(result) => {
                if let Err(e) = self
                    .context
                    .record_query(
                        user,
                        &args.query,
                        database.as_deref(),
                        result.returned_rows,
                        QueryStatus::Success,
                    )
                    .await
                {
                    tracing::warn!(user, error = %e, "failed to record query history");
                }

                let preview_rows = self.ops.limits().model_preview_rows;
                let preview: Vec<&Vec<serde_json::Value>> =
                    result.rows.iter().take(preview_rows).collect();
                let summary = format!(
                    "Returned {} of {} rows{} in {} ms. Columns: {}. First rows: {}",
                    result.returned_rows,
                    result.total_rows,
                    if result.truncated { " (truncated)" } else { "" },
                    result.execution_time_ms,
                    result.columns.join(", "),
                    serde_json::to_string(&preview).unwrap_or_default(),
                );

                ToolOutcome::ok(
                    serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
                    summary,
                )
            }
            Err(e) => {
                if let Err(record_err) = self
                    .context
                    .record_query(user, &args.query, database.as_deref(), 0, QueryStatus::Error)
                    .await
                {
                    tracing::warn!(user, error = %record_err, "failed to record query history");
                }
                ToolOutcome::error(e.error_code(), e.message())
            }
        }
    }

    async fn recent_queries(&self, user: &str, call: &ToolCall) -> ToolOutcome {
        let Ok(args) = parse::<RecentQueriesArgs>(call) else {
            return bad_args(call);
        };

        let limit = match bounded(args.limit, 5, 1, 50, "limit") {
            Ok(v) => v,
            Err(message) => return ToolOutcome::error("VALIDATION_ERROR", message),
        };

        match self.context.recent_queries(user, limit as usize).await {
            Ok(entries) => ToolOutcome::ok(
                json!({"queries": entries}),
                format!("{} recent queries", entries.len()),
            ),
            Err(e) => ToolOutcome::error(e.error_code(), e.message()),
        }
    }

    async fn sample_data(
        &self,
        user: &str,
        descriptor: Option<&ConnectionDescriptor>,
        call: &ToolCall,
    ) -> ToolOutcome {
        let Ok(args) = parse::<SampleDataArgs>(call) else {
            return bad_args(call);
        };
        let Some(descriptor) = descriptor else {
            return no_connection();
        };

        let rows = match bounded(args.rows, 5, 1, 100, "rows") {
            Ok(v) => v,
            Err(message) => return ToolOutcome::error("VALIDATION_ERROR", message),
        };

        match self.ops.sample_rows(user, descriptor, &args.table_name, rows).await {
            Ok(result) => {
                let preview_rows = self.ops.limits().model_preview_rows;
                let preview: Vec<&Vec<serde_json::Value>> =
                    result.rows.iter().take(preview_rows).collect();
                let summary = format!(
                    "{} sample rows from {}: {}",
                    result.returned_rows,
                    args.table_name,
                    serde_json::to_string(&preview).unwrap_or_default(),
                );
                ToolOutcome::ok(
                    serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
                    summary,
                )
            }
            Err(e) => ToolOutcome::error(e.error_code(), e.message()),
        }
    }
}

fn parse<A: for<'de> Deserialize<'de>>(call: &ToolCall) -> Result<A, serde_json::Error> {
    serde_json::from_value(call.arguments.clone())
}

fn bad_args(call: &ToolCall) -> ToolOutcome {
    ToolOutcome::error("VALIDATION_ERROR", format!("Invalid arguments for {}", call.name))
}

fn no_connection() -> ToolOutcome {
    ToolOutcome::error("CONNECTION_FAILED", "No active database connection")
}

fn bounded(
    value: Option<u32>,
    default: u32,
    min: u32,
    max: u32,
    field: &str,
) -> Result<u32, String> {
    let value = value.unwrap_or(default);
    if value < min || value > max {
        return Err(format!("{field} must be between {min} and {max}, got {value}"));
    }
    Ok(value)
}

fn schema_outcome(
    database: &str,
    tables: &[String],
    columns: &std::collections::HashMap<String, Vec<crate::engine::dialect::ColumnDescription>>,
    from_cache: bool,
) -> ToolOutcome {
    ToolOutcome::ok(
        json!({
            "database": database,
            "tables": tables,
            "columns": columns,
            "cached": from_cache,
        }),
        format!("{} has {} tables: {}", database, tables.len(), tables.join(", ")),
    )
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::config::GatewayLimits;
    use crate::context::InMemoryContextRepository;
    use crate::manager::ConnectionManager;

    fn executor() -> ToolExecutor {
        let limits = GatewayLimits::default();
        let manager = Arc::new(ConnectionManager::new(limits.clone()));
        let ops = Arc::new(QueryOperations::new(Arc::clone(&manager), limits.clone()));
        let context = Arc::new(ContextStore::new(
            Arc::new(InMemoryContextRepository::new()),
            manager,
            limits,
        ));
        ToolExecutor::new(ops, context)
    }

    fn seeded_sqlite(name: &str) -> ConnectionDescriptor {
        let path =
            std::env::temp_dir().join(format!("colloquy_tools_{name}_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT, qty INTEGER);
             INSERT INTO orders (item, qty) VALUES ('widget', 2), ('gadget', 1);",
        )
        .unwrap();
        ConnectionDescriptor::sqlite(path)
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall { id: "call_1".to_string(), name: name.to_string(), arguments }
    }

    #[test]
    fn test_definitions_cover_all_tools() {
        let defs = definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "get_connection_status",
                "get_database_list",
                "get_database_schema",
                "get_table_columns",
                "execute_query",
                "get_recent_queries",
                "get_sample_data",
            ]
        );
        for def in &defs {
            let required = def.parameters["required"].as_array().cloned().unwrap_or_default();
            assert!(
                required.iter().any(|r| r == "rationale"),
                "{} must require a rationale",
                def.name
            );
        }
    }

    #[test]
    fn test_display_messages() {
        let message = display_message(
            "execute_query",
            &json!({"rationale": "counting orders", "query": "SELECT 1"}),
        );
        assert_eq!(message, "Running query: counting orders");

        let message =
            display_message("get_sample_data", &json!({"rationale": "", "table_name": "orders"}));
        assert_eq!(message, "Sampling rows from orders");
    }

    #[tokio::test]
    async fn test_execute_query_end_to_end() {
        let executor = executor();
        let descriptor = seeded_sqlite("query");

        let outcome = executor
            .execute(
                "alice",
                Some(&descriptor),
                &call(
                    "execute_query",
                    json!({"rationale": "r", "query": "SELECT item FROM orders ORDER BY id"}),
                ),
            )
            .await;

        assert!(!outcome.is_error);
        assert_eq!(outcome.client_result["returned_rows"], json!(2));
        assert!(outcome.model_summary.contains("widget"));

        // The query landed in history
        let history = executor
            .execute("alice", Some(&descriptor), &call("get_recent_queries", json!({"rationale": "r"})))
            .await;
        assert_eq!(history.client_result["queries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_query_rejects_writes_as_structured_error() {
        let executor = executor();
        let descriptor = seeded_sqlite("writes");

        let outcome = executor
            .execute(
                "alice",
                Some(&descriptor),
                &call("execute_query", json!({"rationale": "r", "query": "DROP TABLE orders"})),
            )
            .await;

        assert!(outcome.is_error);
        assert_eq!(outcome.client_result["error"]["code"], json!("SECURITY_REJECTION"));
        assert!(outcome.model_summary.contains("DROP"));
    }

    #[tokio::test]
    async fn test_bounds_rejected_not_clamped() {
        let executor = executor();
        let descriptor = seeded_sqlite("bounds");

        let outcome = executor
            .execute(
                "alice",
                Some(&descriptor),
                &call(
                    "execute_query",
                    json!({"rationale": "r", "query": "SELECT 1", "max_rows": 5000}),
                ),
            )
            .await;
        assert!(outcome.is_error);
        assert_eq!(outcome.client_result["error"]["code"], json!("VALIDATION_ERROR"));

        let outcome = executor
            .execute(
                "alice",
                Some(&descriptor),
                &call("get_sample_data", json!({"rationale": "r", "table_name": "orders", "rows": 0})),
            )
            .await;
        assert!(outcome.is_error);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let executor = executor();
        let outcome =
            executor.execute("alice", None, &call("drop_everything", json!({}))).await;
        assert!(outcome.is_error);
        assert_eq!(outcome.client_result["error"]["code"], json!("UNKNOWN_TOOL"));
    }

    #[tokio::test]
    async fn test_missing_connection() {
        let executor = executor();
        let outcome = executor
            .execute("alice", None, &call("get_database_list", json!({"rationale": "r"})))
            .await;
        assert!(outcome.is_error);
        assert_eq!(outcome.client_result["error"]["code"], json!("CONNECTION_FAILED"));
    }

    #[tokio::test]
    async fn test_schema_tool_uses_cache_on_second_call() {
        let executor = executor();
        let descriptor = seeded_sqlite("schema_cache");
        let args = json!({"rationale": "r"});

        let first = executor
            .execute("alice", Some(&descriptor), &call("get_database_schema", args.clone()))
            .await;
        assert_eq!(first.client_result["cached"], json!(false));

        let second = executor
            .execute("alice", Some(&descriptor), &call("get_database_schema", args))
            .await;
        assert_eq!(second.client_result["cached"], json!(true));
        assert_eq!(second.client_result["tables"], json!(["orders"]));
    }

    #[tokio::test]
    async fn test_sample_data() {
        let executor = executor();
        let descriptor = seeded_sqlite("sample");

        let outcome = executor
            .execute(
                "alice",
                Some(&descriptor),
                &call("get_sample_data", json!({"rationale": "r", "table_name": "orders", "rows": 1})),
            )
            .await;
        assert!(!outcome.is_error);
        assert_eq!(outcome.client_result["returned_rows"], json!(1));
    }
}
