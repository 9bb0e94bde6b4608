//! Google Gemini client wrapper via the OpenAI-compatible endpoint.
//!
//! Google exposes Gemini models behind an OpenAI-compatible surface at
//! `/v1beta/openai`; the wrapper delegates to the shared implementation.

use async_trait::async_trait;

use crate::agentmesh::clients::openai::OpenAiClient;
use crate::agentmesh::error::MeshError;
use crate::agentmesh::llm::{GenerateOptions, LlmClient, LlmResponse, Message, ToolDefinition};

/// Client wrapper for Google's Gemini API.
pub struct GeminiClient {
    delegate: OpenAiClient,
    model: String,
}

impl GeminiClient {
    /// Create a client from an API key and explicit model string
    /// (e.g. `"gemini-2.5-flash"`).
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            delegate: OpenAiClient::new_with_base_url(
                api_key,
                model,
                "https://generativelanguage.googleapis.com/v1beta/openai",
            ),
            model: model.to_string(),
        }
    }

    /// Create a client pointing at a custom Gemini-compatible base URL.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            delegate: OpenAiClient::new_with_base_url(api_key, model, base_url),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
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
        "gemini"
    }
}
