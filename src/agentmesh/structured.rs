//! Schema-validated structured output.
//!
//! Given a prompt and a JSON schema, runs the model in JSON mode and
//! validates the reply. Validation failures are recoverable by re-prompting:
//! the validator error is appended verbatim to the next attempt, up to
//! `max_retries` (default 2).
//!
//! Used by the conditional LM and by the orchestrator's plan parser.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::event::{EventBus, EventContext, EventType};
use crate::agentmesh::fallback::FallbackChain;
use crate::agentmesh::llm::{GenerateOptions, Message};

/// Default number of re-prompts after the initial attempt.
pub const DEFAULT_MAX_RETRIES: usize = 2;

/// JSON-mode generator with validation and bounded re-prompting.
pub struct StructuredOutput {
    llm: Arc<FallbackChain>,
    bus: Arc<EventBus>,
    max_retries: usize,
}

impl StructuredOutput {
    /// Build a generator over the given chain.
    pub fn new(llm: Arc<FallbackChain>, bus: Arc<EventBus>) -> Self {
        Self {
            llm,
            bus,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the retry bound (builder pattern).
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Generate a JSON value conforming to `schema`.
    pub async fn generate_value(
        &self,
        ctx: &EventContext,
        cancel: &CancellationToken,
        prompt: &str,
        schema: &JsonValue,
        temperature: Option<f32>,
    ) -> Result<JsonValue, MeshError> {
        self.bus
            .emit(
                ctx,
                EventType::StructuredOutputStart,
                serde_json::json!({"prompt_chars": prompt.len()}),
            )
            .await;

        let validator = jsonschema::validator_for(schema).map_err(|e| {
            MeshError::new(
                ErrorKind::SchemaViolation,
                format!("schema does not compile: {}", e),
            )
        })?;

        let system = format!(
            "Respond with a single JSON document and nothing else. The document \
             must conform to this JSON Schema:\n{}",
            serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
        );
        let options = GenerateOptions {
            json_mode: true,
            temperature,
            ..Default::default()
        };

        let mut user_prompt = prompt.to_string();
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            let messages = [Message::system(&system), Message::user(&user_prompt)];
            let response = match self.llm.generate(ctx, cancel, &messages, None, &options).await {
                Ok(response) => response,
                Err(err) => {
                    self.emit_error(ctx, attempt, &err.to_string()).await;
                    return Err(err);
                }
            };

            let text = response.message.content.as_ref();
            match parse_and_validate(text, &validator) {
                Ok(value) => {
                    self.bus
                        .emit(
                            ctx,
                            EventType::StructuredOutputEnd,
                            serde_json::json!({"attempts": attempt + 1}),
                        )
                        .await;
                    return Ok(value);
                }
                Err(validation_error) => {
                    log::debug!(
                        "structured output attempt {} rejected: {}",
                        attempt + 1,
                        validation_error
                    );
                    last_error = validation_error;
                    user_prompt = format!(
                        "{}\n\nYour previous reply was rejected by the JSON Schema \
                         validator:\n{}\nReturn a corrected JSON document.",
                        prompt, last_error
                    );
                }
            }
        }

        self.emit_error(ctx, self.max_retries, &last_error).await;
        Err(MeshError::new(
            ErrorKind::SchemaViolation,
            format!("output failed validation after retries: {}", last_error),
        ))
    }

    /// Generate and deserialize into `T`.
    pub async fn generate<T: DeserializeOwned>(
        &self,
        ctx: &EventContext,
        cancel: &CancellationToken,
        prompt: &str,
        schema: &JsonValue,
        temperature: Option<f32>,
    ) -> Result<T, MeshError> {
        let value = self
            .generate_value(ctx, cancel, prompt, schema, temperature)
            .await?;
        serde_json::from_value(value).map_err(|e| {
            MeshError::with_source(
                ErrorKind::SchemaViolation,
                "validated JSON did not deserialize",
                e,
            )
        })
    }

    async fn emit_error(&self, ctx: &EventContext, attempts: usize, error: &str) {
        self.bus
            .emit(
                ctx,
                EventType::StructuredOutputError,
                serde_json::json!({"attempts": attempts + 1, "error": error}),
            )
            .await;
    }
}

/// Parse model output (stripping a code fence if present) and validate.
fn parse_and_validate(text: &str, validator: &jsonschema::Validator) -> Result<JsonValue, String> {
    let candidate = strip_code_fence(text);
    let value: JsonValue =
        serde_json::from_str(candidate).map_err(|e| format!("not valid JSON: {}", e))?;
    validator
        .validate(&value)
        .map_err(|e| e.to_string())?;
    Ok(value)
}

/// Models in JSON mode occasionally still wrap output in a markdown fence.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("```json") {
        return inner.trim_end_matches("```").trim();
    }
    if let Some(inner) = trimmed.strip_prefix("```") {
        return inner.trim_end_matches("```").trim();
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence_variants() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_and_validate() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"result": {"type": "boolean"}},
            "required": ["result"]
        });
        let validator = jsonschema::validator_for(&schema).unwrap();

        assert!(parse_and_validate("{\"result\": true}", &validator).is_ok());
        assert!(parse_and_validate("{\"result\": \"yes\"}", &validator).is_err());
        assert!(parse_and_validate("not json", &validator).is_err());
    }
}
