//! Colloquy - AI Database Gateway Core
//!
//! Colloquy is the library core of an AI database assistant: a read-only SQL
//! gateway over five engines plus the orchestration loop that lets a chat
//! model inspect and query those databases through tools.
//!
//! # Core Principles
//! - Read-only by construction (every statement passes the security analyzer)
//! - Explicit connection identity (descriptors are host-resolved, never
//!   ambient)
//! - Credentials never appear in errors, logs or fingerprints
//! - Bounded work everywhere (row caps, query length cap, tool round cap)
//!
//! # Module Organization
//! - [`error`] - Error taxonomy with stable codes
//! - [`security`] - Read-only SQL analyzer and identifier validation
//! - [`config`] - Runtime limits and TTLs
//! - [`engine`] - Dialects and the feature-gated driver facade
//! - [`manager`] - Per-user pool registry
//! - [`ops`] - Query pipeline and introspection cache
//! - [`context`] - Per-user session context store
//! - [`llm`] - Chat completion client abstraction
//! - [`tools`] - The tool surface offered to the model
//! - [`protocol`] - Stream frames and the bracket-marker codec
//! - [`orchestrator`] - Multi-round tool-calling driver

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod llm;
pub mod manager;
pub mod ops;
pub mod orchestrator;
pub mod protocol;
pub mod security;
pub mod tools;

// Re-export commonly used types for convenience
pub use config::GatewayLimits;
pub use context::{
    ConnectionState, ContextRepository, ContextStore, InMemoryContextRepository, QueryStatus,
    UserContext,
};
pub use engine::{dialect_for, ConnectionDescriptor, Dialect, EngineKind, PoolHandle, PooledConn};
pub use error::{GatewayError, QueryErrorKind, Result, UpstreamErrorKind};
pub use llm::{ChatClient, ChatMessage, CompletionDelta, CompletionRequest, Role, ToolCall};
pub use manager::ConnectionManager;
pub use ops::{QueryOperations, QueryResult, SchemaSnapshot};
pub use orchestrator::{
    ChatTurn, Conversation, ConversationStore, InMemoryConversationStore, Orchestrator,
    StoredMessage, MAX_TOOL_ROUNDS,
};
pub use protocol::{StreamFrame, ToolRecord, ToolState};
pub use security::{analyze, ensure_read_only, validate_identifier, QueryAnalysis, QueryType};
pub use tools::{definitions, display_message, ToolExecutor, ToolOutcome};
