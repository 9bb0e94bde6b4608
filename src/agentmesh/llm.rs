//! Shared primitives for provider-agnostic LLM clients.
//!
//! Applications interact with language models through the [`LlmClient`] trait
//! and the lightweight data types defined here. The trait abstracts over
//! concrete vendor implementations while the supporting structs describe chat
//! messages, native tool calls, and token accounting.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use agentmesh::clients::openai::OpenAiClient;
//! use agentmesh::llm::{GenerateOptions, LlmClient, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let client = OpenAiClient::new(&key, "gpt-4.1-mini");
//!
//!     let response = client
//!         .generate(
//!             &[Message::user("Who are you?")],
//!             None,
//!             &GenerateOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("Assistant: {}", response.message.content);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::agentmesh::error::MeshError;

/// A single tool call returned by the LLM in a native function-calling
/// response.
///
/// Providers assign an opaque [`id`](NativeToolCall::id) to each call so that
/// the tool result can be correlated back in a follow-up `Role::Tool` message.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeToolCall {
    /// Provider-assigned call ID, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema passed to the LLM along with a chat request.
///
/// Serialised as an OpenAI-compatible `tools` array entry before
/// transmission; providers without first-class function schemas receive the
/// same information inlined into the system prompt instead.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the API `tools` array. For MCP-hosted
    /// tools this is the qualified `<server>/<tool>` name.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message. May carry tool calls with empty text.
    Assistant,
    /// A tool-result message correlating with a prior assistant
    /// [`NativeToolCall`].
    ///
    /// Serialises as `{"role": "tool", "tool_call_id": "<call_id>", ...}` on
    /// the OpenAI-compatible wire.
    Tool {
        /// The id of the tool call this message answers.
        call_id: String,
    },
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
    /// Reasoning tokens, for providers that meter them separately.
    pub reasoning_tokens: Option<usize>,
}

impl TokenUsage {
    /// Fold another usage record into this one (used by the agent loop to
    /// aggregate across turns).
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        if let Some(r) = other.reasoning_tokens {
            *self.reasoning_tokens.get_or_insert(0) += r;
        }
    }
}

/// Represents a generic message exchanged with an LLM.
///
/// The `tool_calls` field is populated on assistant messages when the
/// provider returns native function-calling results; it is empty for all
/// other message kinds. A `tool` message must reference a `tool_call.id`
/// that appeared in an earlier assistant message.
#[derive(Debug, Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body. Stored as `Arc<str>` so conversation histories can
    /// be cheaply cloned between turns and sub-agents.
    pub content: Arc<str>,
    /// Native tool calls requested by the assistant.
    pub tool_calls: Vec<NativeToolCall>,
}

impl Message {
    /// Build a system message.
    pub fn system(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::System,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::User,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Build a plain assistant message.
    pub fn assistant(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Build an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(
        content: impl AsRef<str>,
        tool_calls: Vec<NativeToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
            tool_calls,
        }
    }

    /// Build a tool-response message answering the given call id.
    pub fn tool_response(call_id: impl Into<String>, content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// Natural end of the assistant turn.
    EndTurn,
    /// The model requested one or more tool calls.
    ToolUse,
    /// The output hit the provider's length limit.
    Length,
    /// Anything else, carried verbatim from the provider.
    Other(String),
}

/// Constraint on how the model may use the supplied tools.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    /// Model decides freely (provider default).
    Auto,
    /// Model must not call tools.
    None,
    /// Model must call the named tool.
    Required(String),
}

/// Per-call knobs forwarded to the provider.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Tool-use constraint; `None` means provider default.
    pub tool_choice: Option<ToolChoice>,
    /// Force strict JSON output (or a schema-constrained mode if the provider
    /// has one).
    pub json_mode: bool,
    /// Sampling temperature; `None` means provider default.
    pub temperature: Option<f32>,
}

/// A normalized provider reply.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The assistant message, possibly carrying tool calls with empty text.
    pub message: Message,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token accounting, when the provider reports it.
    pub usage: Option<TokenUsage>,
    /// The model that actually served the request (useful under fallback).
    pub model: String,
}

/// Trait-driven abstraction for a concrete LLM provider.
///
/// An [`LlmClient`] translates agentmesh requests into the provider-specific
/// wire format and returns provider responses in a uniform shape. The
/// abstraction excludes conversation bookkeeping; that lives in the agent
/// loop.
///
/// All implementations must be thread-safe (`Send + Sync`) so they can be
/// shared between tasks. Failures must be classified: the
/// [`MeshError::kind`](crate::agentmesh::error::MeshError) drives the
/// fallback chain.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// The `messages` slice must include any system priming messages the
    /// caller wishes to send. `tools` carries native [`ToolDefinition`]s for
    /// the provider's function-calling API. On success the returned
    /// [`LlmResponse::message`] may contain non-empty
    /// [`Message::tool_calls`] when the provider selected one or more tools.
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        options: &GenerateOptions,
    ) -> Result<LlmResponse, MeshError>;

    /// Return the identifier used to select the upstream model
    /// (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;

    /// Short provider tag used for credential lookup and cross-provider
    /// fallback decisions (e.g. `"openai"`, `"anthropic"`).
    fn provider(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = Message::tool_response("call_1", "4");
        assert_eq!(
            msg.role,
            Role::Tool {
                call_id: "call_1".to_string()
            }
        );
        assert_eq!(msg.content.as_ref(), "4");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn test_usage_absorb() {
        let mut total = TokenUsage::default();
        total.absorb(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            reasoning_tokens: Some(2),
        });
        total.absorb(&TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
            total_tokens: 2,
            reasoning_tokens: None,
        });
        assert_eq!(total.total_tokens, 17);
        assert_eq!(total.reasoning_tokens, Some(2));
    }
}
