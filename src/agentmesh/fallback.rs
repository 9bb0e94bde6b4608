//! Primary-then-fallback model chain.
//!
//! Configuration supplies a primary [`LlmClient`] and an ordered list of
//! fallbacks, optionally including a cross-provider tail. On a retryable
//! classification (`rate_limit`, `server_error`, `bad_gateway`,
//! `service_unavailable`, `gateway_timeout`, `llm_timeout`) the chain emits a
//! `fallback_model_used` event and retries the same request against the next
//! entry. `unauthorized`, `schema_violation`, and `context_length` are
//! non-retryable and surface immediately. When the chain is exhausted the
//! last error is surfaced to the caller, which reports it as
//! `llm_generation_error`.
//!
//! Fallback state is per-call: concurrent callers walk the chain
//! independently and nothing is shared besides the clients themselves.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agentmesh::cancel::run_with_deadline;
use crate::agentmesh::clients::anthropic::AnthropicClient;
use crate::agentmesh::clients::gemini::GeminiClient;
use crate::agentmesh::clients::openai::OpenAiClient;
use crate::agentmesh::clients::xai::XaiClient;
use crate::agentmesh::config::{provider_api_key, MeshConfig};
use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::event::{EventBus, EventContext, EventType};
use crate::agentmesh::llm::{GenerateOptions, LlmClient, LlmResponse, Message, ToolDefinition};

/// An ordered chain of [`LlmClient`]s tried until one answers.
pub struct FallbackChain {
    clients: Vec<Arc<dyn LlmClient>>,
    bus: Arc<EventBus>,
    llm_timeout: Duration,
}

impl FallbackChain {
    /// Build a chain from the primary client and its ordered fallbacks.
    ///
    /// Panics if `clients` is empty: a chain requires a primary entry.
    pub fn new(
        clients: Vec<Arc<dyn LlmClient>>,
        bus: Arc<EventBus>,
        llm_timeout: Duration,
    ) -> Self {
        assert!(!clients.is_empty(), "fallback chain requires a primary client");
        Self {
            clients,
            bus,
            llm_timeout,
        }
    }

    /// Build a chain from the configured model ids.
    ///
    /// Each model id is mapped to its provider by prefix and to a client via
    /// the provider's `<PROVIDER>_API_KEY` credential. Fallback entries from
    /// a different provider than the primary are dropped unless
    /// `cross_provider_fallback` is set.
    pub fn from_config(config: &MeshConfig, bus: Arc<EventBus>) -> Result<Self, MeshError> {
        let primary_provider = provider_for_model(&config.primary_model);
        let mut clients = vec![client_for_model(&config.primary_model)?];

        for model in &config.fallback_models {
            let provider = provider_for_model(model);
            if provider != primary_provider && !config.cross_provider_fallback {
                log::warn!(
                    "dropping fallback '{}': cross-provider fallback is disabled",
                    model
                );
                continue;
            }
            clients.push(client_for_model(model)?);
        }

        Ok(Self::new(clients, bus, config.llm_timeout))
    }

    /// Model id of the primary entry.
    pub fn primary_model(&self) -> &str {
        self.clients[0].model_name()
    }

    /// Number of entries in the chain (primary included).
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Always false; construction requires a primary entry.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Run one generation, walking the chain on retryable failures.
    ///
    /// Each attempt is bounded by the per-call LLM timeout and the supplied
    /// cancellation token. Emits one `fallback_model_used` event per
    /// advancement, carrying the failed model, the replacement, and the
    /// classified kind that triggered the hop.
    pub async fn generate(
        &self,
        ctx: &EventContext,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        options: &GenerateOptions,
    ) -> Result<LlmResponse, MeshError> {
        let mut last_err: Option<MeshError> = None;

        for (position, client) in self.clients.iter().enumerate() {
            let attempt = run_with_deadline(cancel, self.llm_timeout, ErrorKind::LlmTimeout, {
                client.generate(messages, tools, options)
            })
            .await;

            match attempt {
                Ok(response) => return Ok(response),
                Err(err) if err.kind == ErrorKind::Cancelled => return Err(err),
                Err(err) if err.kind.is_retryable_llm() => {
                    let next = self.clients.get(position + 1);
                    if let Some(next_client) = next {
                        log::warn!(
                            "model '{}' failed with {}; falling back to '{}'",
                            client.model_name(),
                            err.kind,
                            next_client.model_name()
                        );
                        self.bus
                            .emit(
                                ctx,
                                EventType::FallbackModelUsed,
                                serde_json::json!({
                                    "failed_model": client.model_name(),
                                    "failed_provider": client.provider(),
                                    "fallback_model": next_client.model_name(),
                                    "fallback_provider": next_client.provider(),
                                    "error_kind": err.kind.as_str(),
                                }),
                            )
                            .await;
                    }
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err
            .unwrap_or_else(|| MeshError::new(ErrorKind::Unknown, "fallback chain exhausted")))
    }
}

/// Map a model id to its provider tag by prefix.
fn provider_for_model(model: &str) -> &'static str {
    if model.starts_with("claude") {
        "anthropic"
    } else if model.starts_with("gemini") {
        "gemini"
    } else if model.starts_with("grok") {
        "xai"
    } else {
        "openai"
    }
}

/// Build a concrete client for a model id from the ambient credentials.
fn client_for_model(model: &str) -> Result<Arc<dyn LlmClient>, MeshError> {
    let provider = provider_for_model(model);
    let key = provider_api_key(provider).ok_or_else(|| {
        MeshError::new(
            ErrorKind::Unauthorized,
            format!("no API key configured for provider '{}'", provider),
        )
    })?;
    Ok(match provider {
        "anthropic" => Arc::new(AnthropicClient::new(&key, model)),
        "gemini" => Arc::new(GeminiClient::new(&key, model)),
        "xai" => Arc::new(XaiClient::new(&key, model)),
        _ => Arc::new(OpenAiClient::new(&key, model)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::llm::{LlmClient, StopReason};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyClient {
        model: String,
        fail_kind: Option<ErrorKind>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn generate(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _options: &GenerateOptions,
        ) -> Result<LlmResponse, MeshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_kind {
                Some(kind) => Err(MeshError::new(kind, "synthetic failure")),
                None => Ok(LlmResponse {
                    message: Message::assistant("ok"),
                    stop_reason: StopReason::EndTurn,
                    usage: None,
                    model: self.model.clone(),
                }),
            }
        }

        fn model_name(&self) -> &str {
            &self.model
        }

        fn provider(&self) -> &str {
            "mock"
        }
    }

    fn flaky(model: &str, fail_kind: Option<ErrorKind>) -> Arc<FlakyClient> {
        Arc::new(FlakyClient {
            model: model.to_string(),
            fail_kind,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_rate_limit_advances_to_secondary() {
        let primary = flaky("primary", Some(ErrorKind::RateLimit));
        let secondary = flaky("secondary", None);
        let chain = FallbackChain::new(
            vec![primary.clone(), secondary.clone()],
            Arc::new(EventBus::new()),
            Duration::from_secs(5),
        );

        let ctx = EventContext::new("s1", "test");
        let cancel = CancellationToken::new();
        let response = chain
            .generate(&ctx, &cancel, &[Message::user("hi")], None, &Default::default())
            .await
            .unwrap();

        assert_eq!(response.model, "secondary");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_surfaces_immediately() {
        let primary = flaky("primary", Some(ErrorKind::Unauthorized));
        let secondary = flaky("secondary", None);
        let chain = FallbackChain::new(
            vec![primary, secondary.clone()],
            Arc::new(EventBus::new()),
            Duration::from_secs(5),
        );

        let ctx = EventContext::new("s1", "test");
        let cancel = CancellationToken::new();
        let err = chain
            .generate(&ctx, &cancel, &[Message::user("hi")], None, &Default::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Unauthorized);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_provider_mapping_by_model_prefix() {
        assert_eq!(provider_for_model("gpt-4.1"), "openai");
        assert_eq!(provider_for_model("o4-mini"), "openai");
        assert_eq!(provider_for_model("claude-sonnet-4-0"), "anthropic");
        assert_eq!(provider_for_model("gemini-2.5-flash"), "gemini");
        assert_eq!(provider_for_model("grok-4"), "xai");
    }

    #[tokio::test]
    async fn test_exhausted_chain_returns_last_error() {
        let chain = FallbackChain::new(
            vec![
                flaky("a", Some(ErrorKind::ServerError)),
                flaky("b", Some(ErrorKind::BadGateway)),
            ],
            Arc::new(EventBus::new()),
            Duration::from_secs(5),
        );

        let ctx = EventContext::new("s1", "test");
        let cancel = CancellationToken::new();
        let err = chain
            .generate(&ctx, &cancel, &[Message::user("hi")], None, &Default::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::BadGateway);
    }
}
