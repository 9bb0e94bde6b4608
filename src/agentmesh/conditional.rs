//! Yes/no decision service with reasoning.
//!
//! Wraps the structured-output generator with a fixed `{result, reason}`
//! schema and a fixed analysis prompt. The orchestrator consults it to gate
//! the critique loop ("does this critique warrant another iteration?").
//! Temperature defaults to 0.1.
//!
//! Every call emits an `orchestrator_agent_end` with the decision and
//! reason; failures emit `orchestrator_agent_error`.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::error::MeshError;
use crate::agentmesh::event::{EventBus, EventContext, EventType};
use crate::agentmesh::structured::StructuredOutput;

/// Default decision temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.1;

/// A conditional decision with its justification.
#[derive(Debug, Clone, Deserialize)]
pub struct Decision {
    /// The yes/no outcome.
    pub result: bool,
    /// Why the model decided that way.
    pub reason: String,
}

fn decision_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "result": {"type": "boolean"},
            "reason": {"type": "string"}
        },
        "required": ["result", "reason"]
    })
}

/// Conditional LM used by the orchestrator.
pub struct ConditionalLlm {
    structured: Arc<StructuredOutput>,
    bus: Arc<EventBus>,
    temperature: f32,
}

impl ConditionalLlm {
    /// Build a conditional decision service.
    pub fn new(structured: Arc<StructuredOutput>, bus: Arc<EventBus>) -> Self {
        Self {
            structured,
            bus,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Override the decision temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Ask a yes/no question about the given context.
    pub async fn decide(
        &self,
        ctx: &EventContext,
        cancel: &CancellationToken,
        question: &str,
        context: &str,
    ) -> Result<Decision, MeshError> {
        let prompt = format!(
            "Analyze the context below and answer the question with true or \
             false, plus your reasoning.\n\nQuestion: {}\n\nContext:\n{}",
            question, context
        );

        match self
            .structured
            .generate::<Decision>(
                ctx,
                cancel,
                &prompt,
                &decision_schema(),
                Some(self.temperature),
            )
            .await
        {
            Ok(decision) => {
                self.bus
                    .emit(
                        ctx,
                        EventType::OrchestratorAgentEnd,
                        serde_json::json!({
                            "agent": "conditional",
                            "result": decision.result,
                            "reason": decision.reason,
                        }),
                    )
                    .await;
                Ok(decision)
            }
            Err(err) => {
                self.bus
                    .emit(
                        ctx,
                        EventType::OrchestratorAgentError,
                        serde_json::json!({
                            "agent": "conditional",
                            "error_kind": err.kind.as_str(),
                            "error": err.to_string(),
                        }),
                    )
                    .await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_schema_accepts_decision() {
        let validator = jsonschema::validator_for(&decision_schema()).unwrap();
        assert!(validator
            .validate(&serde_json::json!({"result": true, "reason": "looks done"}))
            .is_ok());
        assert!(validator
            .validate(&serde_json::json!({"result": "yes", "reason": "x"}))
            .is_err());
    }
}
