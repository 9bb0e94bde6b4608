//! xAI Grok client wrapper via the OpenAI-compatible endpoint.

use async_trait::async_trait;

use crate::agentmesh::clients::openai::OpenAiClient;
use crate::agentmesh::error::MeshError;
use crate::agentmesh::llm::{GenerateOptions, LlmClient, LlmResponse, Message, ToolDefinition};

/// Client wrapper for xAI's Grok API.
pub struct XaiClient {
    delegate: OpenAiClient,
    model: String,
}

impl XaiClient {
    /// Create a client from an API key and explicit model string
    /// (e.g. `"grok-4"`).
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            delegate: OpenAiClient::new_with_base_url(api_key, model, "https://api.x.ai/v1"),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for XaiClient {
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
        "xai"
    }
}
