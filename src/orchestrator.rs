//! Chat Orchestrator
//!
//! Drives one conversation turn: rounds of model calls with tool definitions,
//! sequential tool execution, then a finalizing call without tools. Output is
//! a stream of [`StreamFrame`]s over an mpsc channel; the receiver dropping
//! is the cancellation signal and flushes partial output to the conversation
//! store.
//!
//! Rounds are bounded by [`MAX_TOOL_ROUNDS`] so a model that always requests
//! tools cannot loop forever; exhausting the limit proceeds to the finalizing
//! call with whatever context has been gathered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::engine::ConnectionDescriptor;
use crate::error::{GatewayError, Result};
use crate::llm::{ChatClient, ChatMessage, CompletionRequest, Role, ToolCall};
use crate::protocol::{StreamFrame, ToolRecord, ToolState};
use crate::tools::{definitions, ToolExecutor};

/// Upper bound on model calls that may request tools in one turn
pub const MAX_TOOL_ROUNDS: usize = 10;

/// One persisted conversation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub tools: Vec<ToolRecord>,

    /// True when the turn was cancelled mid-stream
    pub partial: bool,

    pub created_at: DateTime<Utc>,
}

/// A stored conversation and its owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    pub messages: Vec<StoredMessage>,
}

/// Persistence seam for conversations
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Conversation>>;

    async fn store_message(&self, id: &str, owner: &str, message: StoredMessage) -> Result<()>;

    /// Delete a conversation, refusing when `owner` does not match. Returns
    /// whether anything was deleted.
    async fn delete(&self, id: &str, owner: &str) -> Result<bool>;
}

/// `DashMap`-backed store for tests and single-process hosts
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<String, Conversation>,
}

impl InMemoryConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.get(id).map(|c| c.clone()))
    }

    async fn store_message(&self, id: &str, owner: &str, message: StoredMessage) -> Result<()> {
        self.conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation {
                id: id.to_string(),
                owner: owner.to_string(),
                messages: Vec::new(),
            })
            .messages
            .push(message);
        Ok(())
    }

    async fn delete(&self, id: &str, owner: &str) -> Result<bool> {
        let owned = self
            .conversations
            .get(id)
            .is_some_and(|c| c.owner == owner);
        if !owned {
            return Ok(false);
        }
        Ok(self.conversations.remove(id).is_some())
    }
}

/// One chat turn as the host hands it over
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub conversation_id: String,
    pub user: String,
    pub prompt: String,

    /// Host-resolved active connection, never ambient state
    pub descriptor: Option<ConnectionDescriptor>,

    pub system_prompt: String,
}

/// Receiver dropped mid-stream
struct Cancelled;

/// Accumulated output of the running turn
struct TurnState {
    prompt_persisted: bool,
    thinking_open: bool,
    answer: String,
    records: Vec<ToolRecord>,
}

/// Multi-round tool-calling driver around a [`ChatClient`]
pub struct Orchestrator {
    client: Arc<dyn ChatClient>,
    tools: Arc<ToolExecutor>,
    store: Arc<dyn ConversationStore>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        client: Arc<dyn ChatClient>,
        tools: Arc<ToolExecutor>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self { client, tools, store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Run one turn as a spawned task, returning the frame receiver. Dropping
    /// the receiver cancels the turn; accumulated output is then persisted
    /// marked partial.
    #[must_use]
    pub fn run(self: &Arc<Self>, turn: ChatTurn) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(64);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(turn, tx).await;
        });
        rx
    }

    async fn drive(&self, turn: ChatTurn, tx: mpsc::Sender<StreamFrame>) {
        let mut state = TurnState {
            prompt_persisted: false,
            thinking_open: false,
            answer: String::new(),
            records: Vec::new(),
        };

        match self.orchestrate(&turn, &tx, &mut state).await {
            Ok(Ok(())) => {
                self.persist_assistant(&turn, &state, false).await;
            }
            Ok(Err(Cancelled)) => {
                tracing::info!(
                    conversation = %turn.conversation_id,
                    "turn cancelled, flushing partial output"
                );
                self.persist_assistant(&turn, &state, true).await;
            }
            Err(e) => {
                let text = match &e {
                    GatewayError::UpstreamModel { kind, .. } => kind.user_message().to_string(),
                    other => other.message(),
                };
                tracing::warn!(conversation = %turn.conversation_id, error = %e, "turn failed");
                let _ = tx.send(StreamFrame::Text(text)).await;

                // A failed first call stores nothing (the prompt is only
                // persisted once the model has produced output); a failure
                // after tool rounds flushes the accumulated records instead
                // of dropping them
                if state.prompt_persisted {
                    self.persist_assistant(&turn, &state, true).await;
                }
            }
        }
    }

    /// Outer result is a gateway failure; inner result is cancellation
    async fn orchestrate(
        &self,
        turn: &ChatTurn,
        tx: &mpsc::Sender<StreamFrame>,
        state: &mut TurnState,
    ) -> Result<std::result::Result<(), Cancelled>> {
        let mut messages = self.history(turn).await?;

        for _round in 0..MAX_TOOL_ROUNDS {
            let request = CompletionRequest {
                messages: messages.clone(),
                tools: definitions(),
                stream: true,
            };

            let (calls, content) = match self.consume_stream(turn, tx, state, request).await? {
                Ok(outcome) => outcome,
                Err(cancelled) => return Ok(Err(cancelled)),
            };

            if calls.is_empty() {
                if content {
                    // The round's stream already carried the answer
                    return Ok(Ok(()));
                }
                break;
            }

            messages.push(ChatMessage::assistant(describe_calls(&calls)));

            for call in &calls {
                if let Err(cancelled) = self.run_tool(turn, tx, state, &mut messages, call).await {
                    return Ok(Err(cancelled));
                }
            }
        }

        // Finalizing: one more call without tool definitions
        let request = CompletionRequest { messages, tools: Vec::new(), stream: true };
        match self.consume_stream(turn, tx, state, request).await? {
            Ok(_) => Ok(Ok(())),
            Err(cancelled) => Ok(Err(cancelled)),
        }
    }

    /// Forward one completion stream, returning the collected tool calls and
    /// whether any content was emitted
    async fn consume_stream(
        &self,
        turn: &ChatTurn,
        tx: &mpsc::Sender<StreamFrame>,
        state: &mut TurnState,
        request: CompletionRequest,
    ) -> Result<std::result::Result<(Vec<ToolCall>, bool), Cancelled>> {
        let mut stream = self.client.complete(request).await?;
        let mut calls = Vec::new();
        let mut content_emitted = false;

        while let Some(delta) = stream.next().await {
            let delta = delta?;

            if let Some(reasoning) = delta.reasoning {
                if !state.thinking_open {
                    state.thinking_open = true;
                    if send(tx, StreamFrame::ThinkingStart).await.is_err() {
                        return Ok(Err(Cancelled));
                    }
                }
                if send(tx, StreamFrame::ThinkingChunk(reasoning)).await.is_err() {
                    return Ok(Err(Cancelled));
                }
            }

            if let Some(content) = delta.content {
                if state.thinking_open {
                    state.thinking_open = false;
                    if send(tx, StreamFrame::ThinkingEnd).await.is_err() {
                        return Ok(Err(Cancelled));
                    }
                }
                self.persist_prompt_once(turn, state).await;
                state.answer.push_str(&content);
                content_emitted = true;
                if send(tx, StreamFrame::Text(content)).await.is_err() {
                    return Ok(Err(Cancelled));
                }
            }

            calls.extend(delta.tool_calls);
        }

        if state.thinking_open {
            state.thinking_open = false;
            if send(tx, StreamFrame::ThinkingEnd).await.is_err() {
                return Ok(Err(Cancelled));
            }
        }

        Ok(Ok((calls, content_emitted)))
    }

    /// Execute one tool call with strictly ordered running/done frames
    async fn run_tool(
        &self,
        turn: &ChatTurn,
        tx: &mpsc::Sender<StreamFrame>,
        state: &mut TurnState,
        messages: &mut Vec<ChatMessage>,
        call: &ToolCall,
    ) -> std::result::Result<(), Cancelled> {
        self.persist_prompt_once(turn, state).await;

        // Friendly progress line ahead of the status marker; not part of the
        // accumulated answer
        let progress = crate::tools::display_message(&call.name, &call.arguments);
        send(tx, StreamFrame::Text(progress)).await.map_err(|()| Cancelled)?;

        let running = StreamFrame::ToolStatus {
            name: call.name.clone(),
            state: ToolState::Running,
            args: call.arguments.clone(),
            result: serde_json::Value::Null,
        };
        send(tx, running).await.map_err(|()| Cancelled)?;

        let outcome = self.tools.execute(&turn.user, turn.descriptor.as_ref(), call).await;

        state.records.push(ToolRecord {
            name: call.name.clone(),
            args: call.arguments.clone(),
            result: outcome.client_result.clone(),
        });
        messages.push(ChatMessage::tool(format!("{}: {}", call.name, outcome.model_summary)));

        let done = StreamFrame::ToolStatus {
            name: call.name.clone(),
            state: ToolState::Done,
            args: call.arguments.clone(),
            result: outcome.client_result,
        };
        send(tx, done).await.map_err(|()| Cancelled)
    }

    /// System prompt, stored history, then the new user prompt
    async fn history(&self, turn: &ChatTurn) -> Result<Vec<ChatMessage>> {
        let mut messages = vec![ChatMessage::system(turn.system_prompt.clone())];

        if let Some(conversation) = self.store.get(&turn.conversation_id).await? {
            for stored in &conversation.messages {
                messages.push(ChatMessage { role: stored.role, content: stored.content.clone() });
            }
        }

        messages.push(ChatMessage::user(turn.prompt.clone()));
        Ok(messages)
    }

    /// Store the user prompt on the first emitted output, so a turn whose
    /// first model call fails stores nothing
    async fn persist_prompt_once(&self, turn: &ChatTurn, state: &mut TurnState) {
        if state.prompt_persisted {
            return;
        }
        state.prompt_persisted = true;

        let message = StoredMessage {
            role: Role::User,
            content: turn.prompt.clone(),
            tools: Vec::new(),
            partial: false,
            created_at: Utc::now(),
        };
        if let Err(e) =
            self.store.store_message(&turn.conversation_id, &turn.user, message).await
        {
            tracing::warn!(conversation = %turn.conversation_id, error = %e, "failed to store prompt");
        }
    }

    async fn persist_assistant(&self, turn: &ChatTurn, state: &TurnState, partial: bool) {
        if !state.prompt_persisted {
            return;
        }

        let content = if state.answer.is_empty() {
            if state.records.is_empty() {
                return;
            }
            // Tools ran but the model produced no text
            format!("(completed {} tool calls without a text answer)", state.records.len())
        } else {
            state.answer.clone()
        };

        let message = StoredMessage {
            role: Role::Assistant,
            content,
            tools: state.records.clone(),
            partial,
            created_at: Utc::now(),
        };
        if let Err(e) =
            self.store.store_message(&turn.conversation_id, &turn.user, message).await
        {
            tracing::warn!(conversation = %turn.conversation_id, error = %e, "failed to store assistant message");
        }
    }
}

/// Compact textual record of the calls a round requested, kept in the model
/// transcript
fn describe_calls(calls: &[ToolCall]) -> String {
    let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
    format!("[requested tools: {}]", names.join(", "))
}

async fn send(
    tx: &mpsc::Sender<StreamFrame>,
    frame: StreamFrame,
) -> std::result::Result<(), ()> {
    tx.send(frame).await.map_err(|_| ())
}
