//! OpenAI client built on the shared Chat Completions wire format.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::clients::openai::{Model, OpenAiClient};
//! use agentmesh::llm::{GenerateOptions, LlmClient, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let client = OpenAiClient::new_with_model_enum(&key, Model::Gpt41Mini);
//!     let reply = client
//!         .generate(&[Message::user("Hello")], None, &GenerateOptions::default())
//!         .await?;
//!     println!("{}", reply.message.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;

use crate::agentmesh::clients::http_pool::get_shared_http_client;
use crate::agentmesh::clients::wire::send_chat_request;
use crate::agentmesh::error::MeshError;
use crate::agentmesh::llm::{GenerateOptions, LlmClient, LlmResponse, Message, ToolDefinition};

/// OpenAI models commonly used with agentmesh (mid-2025 snapshot).
pub enum Model {
    /// `gpt-4.1` – flagship tier.
    Gpt41,
    /// `gpt-4.1-mini` – balanced cost/latency.
    Gpt41Mini,
    /// `gpt-4.1-nano` – cheapest tier.
    Gpt41Nano,
    /// `o4-mini` – reasoning tier.
    O4Mini,
}

/// Convert a [`Model`] variant into its public string identifier.
fn model_to_string(model: Model) -> String {
    match model {
        Model::Gpt41 => "gpt-4.1".to_string(),
        Model::Gpt41Mini => "gpt-4.1-mini".to_string(),
        Model::Gpt41Nano => "gpt-4.1-nano".to_string(),
        Model::O4Mini => "o4-mini".to_string(),
    }
}

/// Client for the OpenAI API (and any endpoint that speaks its wire format).
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    /// Some reasoning models reject explicit temperature; the adapter strips
    /// it rather than leaking the quirk to callers.
    supports_temperature: bool,
}

impl OpenAiClient {
    /// Create a client from an API key and explicit model string.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, "https://api.openai.com/v1")
    }

    /// Create a client from an API key and strongly typed model variant.
    pub fn new_with_model_enum(api_key: &str, model: Model) -> Self {
        Self::new(api_key, &model_to_string(model))
    }

    /// Create a client pointing at a custom OpenAI-compatible base URL.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        let supports_temperature = !model.starts_with("o1") && !model.starts_with("o4");
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            supports_temperature,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        options: &GenerateOptions,
    ) -> Result<LlmResponse, MeshError> {
        let mut options = options.clone();
        if !self.supports_temperature {
            options.temperature = None;
        }
        send_chat_request(
            &self.base_url,
            &self.api_key,
            &self.model,
            messages,
            tools,
            &options,
            get_shared_http_client(),
        )
        .await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &str {
        "openai"
    }
}
