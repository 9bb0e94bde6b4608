//! Anthropic Claude client wrapper built on the OpenAI-compatible transport.
//!
//! Use this module when you want to call Anthropic's Claude models through
//! the same [`LlmClient`] interface used by the rest of the crate. The
//! wrapper delegates HTTP concerns to the shared OpenAI implementation, so
//! swapping from OpenAI to Claude only requires a different constructor.

use async_trait::async_trait;

use crate::agentmesh::clients::openai::OpenAiClient;
use crate::agentmesh::error::MeshError;
use crate::agentmesh::llm::{GenerateOptions, LlmClient, LlmResponse, Message, ToolDefinition};

/// Anthropic Claude models available through the compatibility layer.
pub enum Model {
    /// `claude-opus-4-1` – flagship reasoning tier.
    ClaudeOpus41,
    /// `claude-sonnet-4-0` – balanced reasoning + throughput.
    ClaudeSonnet4,
    /// `claude-haiku-3-5` – fastest Claude tier.
    ClaudeHaiku35,
}

fn model_to_string(model: Model) -> String {
    match model {
        Model::ClaudeOpus41 => "claude-opus-4-1".to_string(),
        Model::ClaudeSonnet4 => "claude-sonnet-4-0".to_string(),
        Model::ClaudeHaiku35 => "claude-haiku-3-5".to_string(),
    }
}

/// Client wrapper for Anthropic's Claude API routed through the
/// OpenAI-compatible surface.
pub struct AnthropicClient {
    /// Delegated client that handles the HTTP interactions.
    delegate: OpenAiClient,
    model: String,
}

impl AnthropicClient {
    /// Create a client from an API key and explicit model string.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            delegate: OpenAiClient::new_with_base_url(
                api_key,
                model,
                "https://api.anthropic.com/v1",
            ),
            model: model.to_string(),
        }
    }

    /// Create a client from an API key and strongly typed model variant.
    pub fn new_with_model_enum(api_key: &str, model: Model) -> Self {
        Self::new(api_key, &model_to_string(model))
    }

    /// Create a client pointing at a custom Claude-compatible base URL.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            delegate: OpenAiClient::new_with_base_url(api_key, model, base_url),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        options: &GenerateOptions,
    ) -> Result<LlmResponse, MeshError> {
        self.delegate.generate(messages, tools, options).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &str {
        "anthropic"
    }
}
