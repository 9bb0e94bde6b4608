//! The tool-using conversation loop.
//!
//! [`AgentLoop`] drives a conversation with a language model, dispatching
//! the tool calls the model requests through the
//! [`ToolCatalog`](crate::agentmesh::registry::ToolCatalog) and folding the
//! results back into the history until a termination rule fires. Two
//! variants share the one state machine:
//!
//! - **Simple** terminates as soon as an assistant message carries no tool
//!   calls.
//! - **ReAct** terminates when the assistant text matches the
//!   `Final Answer:` sentinel, or when `max_turns` is reached.
//!
//! Guarantees, all covered by tests:
//!
//! - At most one LLM call per turn.
//! - Every tool call appears exactly once in the history, keyed by its
//!   `tool_call.id`, immediately after the assistant message that introduced
//!   it and in declaration order — regardless of completion order.
//! - For every `tool_call_start` there is exactly one `tool_call_end` or
//!   `tool_call_error` within the same turn.
//! - `max_turns` is a hard cap; `max_turns = 0` ends the run before the
//!   first LLM call.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::cancel::Deadlines;
use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::event::{EventBus, EventContext, EventType};
use crate::agentmesh::fallback::FallbackChain;
use crate::agentmesh::llm::{
    GenerateOptions, Message, NativeToolCall, TokenUsage, ToolDefinition,
};
use crate::agentmesh::prompt::extract_final_answer;
use crate::agentmesh::registry::ToolCatalog;
use crate::agentmesh::spill::{envelope_for, SpillStore};

/// Execution strategy for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Single-shot tool loop; done when the model stops calling tools.
    Simple,
    /// Iterative reasoning; done on the Final-Answer sentinel.
    React,
}

impl AgentMode {
    /// Stable identifier used in events and persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Simple => "simple",
            AgentMode::React => "react",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Terminated naturally.
    Success,
    /// Hit the `max_turns` cap.
    TurnLimit,
    /// Fatal error (also returned as `Err`).
    Error,
    /// Cancelled through the token.
    Cancelled,
}

impl AgentStatus {
    /// Stable identifier used in events.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Success => "success",
            AgentStatus::TurnLimit => "turn_limit",
            AgentStatus::Error => "error",
            AgentStatus::Cancelled => "cancelled",
        }
    }
}

/// Internal loop state, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Generating,
    ToolDispatching,
    Absorbing,
    Terminating,
}

fn transition(state: &mut LoopState, next: LoopState) {
    log::trace!("agent loop: {:?} -> {:?}", state, next);
    *state = next;
}

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Execution strategy.
    pub mode: AgentMode,
    /// Hard cap on turns; 0 ends the run before any LLM call.
    pub max_turns: usize,
    /// Sampling temperature forwarded to the model.
    pub temperature: Option<f32>,
    /// Per-component deadlines.
    pub deadlines: Deadlines,
    /// Global cap on concurrently dispatched tool calls within a turn.
    pub max_concurrent_tools: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            mode: AgentMode::Simple,
            max_turns: 10,
            temperature: None,
            deadlines: Deadlines::default(),
            max_concurrent_tools: 8,
        }
    }
}

/// The final product of a run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Final assistant text (for ReAct, the extracted answer).
    pub final_text: String,
    /// How the run ended.
    pub status: AgentStatus,
    /// Turns actually consumed.
    pub turns: usize,
    /// Tool calls dispatched across all turns.
    pub tool_calls: usize,
    /// Aggregate token usage across all LLM calls.
    pub usage: TokenUsage,
}

/// One tool dispatch, resolved.
struct DispatchResult {
    call: NativeToolCall,
    response_text: String,
}

/// The conversation state machine.
pub struct AgentLoop {
    llm: Arc<FallbackChain>,
    catalog: Arc<ToolCatalog>,
    spill: Arc<SpillStore>,
    bus: Arc<EventBus>,
    ctx: EventContext,
    cancel: CancellationToken,
    settings: AgentSettings,
    system_prompt: String,
    seed_messages: Vec<Message>,
}

impl AgentLoop {
    /// Assemble a loop for one run.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<FallbackChain>,
        catalog: Arc<ToolCatalog>,
        spill: Arc<SpillStore>,
        bus: Arc<EventBus>,
        ctx: EventContext,
        cancel: CancellationToken,
        settings: AgentSettings,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            catalog,
            spill,
            bus,
            ctx,
            cancel,
            settings,
            system_prompt: system_prompt.into(),
            seed_messages: Vec::new(),
        }
    }

    /// Inject messages between the system prompt and the user objective
    /// (used by the orchestrator to feed context artifacts and critiques).
    pub fn with_seed_messages(mut self, messages: Vec<Message>) -> Self {
        self.seed_messages = messages;
        self
    }

    /// Run the loop to completion on `objective`.
    ///
    /// Returns `Ok` for natural termination and for the turn-limit cap;
    /// fatal LLM errors and cancellation come back as `Err` after the
    /// corresponding `agent_error` / `agent_end` events have been emitted.
    pub async fn run(&self, objective: &str) -> Result<AgentOutcome, MeshError> {
        let mut state = LoopState::Idle;
        let mut usage = TokenUsage::default();
        let mut tool_calls_total = 0usize;
        let mut turns = 0usize;

        self.bus
            .emit(
                &self.ctx,
                EventType::AgentStart,
                serde_json::json!({
                    "objective_preview": preview(objective),
                    "mode": self.settings.mode.as_str(),
                    "max_turns": self.settings.max_turns,
                }),
            )
            .await;

        if self.settings.max_turns == 0 {
            // Immediate cap: no LLM call, no tool call.
            return Ok(self
                .finish(String::new(), AgentStatus::TurnLimit, 0, 0, usage)
                .await);
        }

        let tools: Vec<ToolDefinition> = self.catalog.schemas();
        let options = GenerateOptions {
            temperature: self.settings.temperature,
            ..Default::default()
        };

        let mut history: Vec<Message> = Vec::new();
        history.push(Message::system(&self.system_prompt));
        history.extend(self.seed_messages.iter().cloned());
        history.push(Message::user(objective));

        let mut last_assistant_text = String::new();

        while turns < self.settings.max_turns {
            turns += 1;

            if self.cancel.is_cancelled() {
                return Err(self.fail(MeshError::cancelled(), turns, tool_calls_total, &usage).await);
            }

            if self.settings.mode == AgentMode::React {
                self.bus
                    .emit(
                        &self.ctx,
                        EventType::ReactReasoningStart,
                        serde_json::json!({"turn": turns}),
                    )
                    .await;
            }

            transition(&mut state, LoopState::Generating);
            self.bus
                .emit(
                    &self.ctx,
                    EventType::LlmGenerationStart,
                    serde_json::json!({
                        "turn": turns,
                        "model": self.llm.primary_model(),
                    }),
                )
                .await;

            let tools_arg = if tools.is_empty() {
                None
            } else {
                Some(tools.as_slice())
            };
            let response = match self
                .llm
                .generate(&self.ctx, &self.cancel, &history, tools_arg, &options)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    self.bus
                        .emit(
                            &self.ctx,
                            EventType::LlmGenerationError,
                            serde_json::json!({
                                "turn": turns,
                                "error_kind": err.kind.as_str(),
                                "error": err.to_string(),
                            }),
                        )
                        .await;
                    return Err(self.fail(err, turns, tool_calls_total, &usage).await);
                }
            };

            if let Some(call_usage) = &response.usage {
                usage.absorb(call_usage);
                self.bus
                    .emit(
                        &self.ctx,
                        EventType::TokenUsage,
                        serde_json::json!({
                            "turn": turns,
                            "input_tokens": call_usage.input_tokens,
                            "output_tokens": call_usage.output_tokens,
                            "total_tokens": call_usage.total_tokens,
                            "reasoning_tokens": call_usage.reasoning_tokens,
                        }),
                    )
                    .await;
            }

            let assistant_text = response.message.content.to_string();
            self.bus
                .emit(
                    &self.ctx,
                    EventType::LlmGenerationEnd,
                    serde_json::json!({
                        "turn": turns,
                        "response_chars": assistant_text.len(),
                        "tool_calls": response.message.tool_calls.len(),
                        "model": response.model,
                    }),
                )
                .await;

            if self.settings.mode == AgentMode::React {
                self.bus
                    .emit(
                        &self.ctx,
                        EventType::ReactReasoningEnd,
                        serde_json::json!({"turn": turns}),
                    )
                    .await;
            }

            let tool_calls = response.message.tool_calls.clone();
            last_assistant_text = assistant_text.clone();
            history.push(response.message);

            if tool_calls.is_empty() {
                match self.settings.mode {
                    AgentMode::Simple => {
                        transition(&mut state, LoopState::Terminating);
                        return Ok(self
                            .finish(
                                assistant_text,
                                AgentStatus::Success,
                                turns,
                                tool_calls_total,
                                usage,
                            )
                            .await);
                    }
                    AgentMode::React => {
                        if let Some(answer) = extract_final_answer(&assistant_text) {
                            return Ok(self
                                .finish(
                                    answer,
                                    AgentStatus::Success,
                                    turns,
                                    tool_calls_total,
                                    usage,
                                )
                                .await);
                        }
                        // No tools requested and no sentinel: nudge and spend
                        // another turn.
                        history.push(Message::user(
                            "Continue. When the objective is complete, end with \
                             'Final Answer: <answer>'.",
                        ));
                        continue;
                    }
                }
            }

            // For ReAct, the sentinel also terminates a turn that carried
            // tool calls the model no longer needs.
            if self.settings.mode == AgentMode::React {
                if let Some(answer) = extract_final_answer(&assistant_text) {
                    return Ok(self
                        .finish(answer, AgentStatus::Success, turns, tool_calls_total, usage)
                        .await);
                }
            }

            transition(&mut state, LoopState::ToolDispatching);
            let results = self.dispatch_tools(&tool_calls, turns).await;
            tool_calls_total += results.len();

            transition(&mut state, LoopState::Absorbing);
            // Declaration order, not completion order.
            for result in results {
                history.push(Message::tool_response(result.call.id, result.response_text));
            }
        }

        // Turn cap reached.
        Ok(self
            .finish(
                last_assistant_text,
                AgentStatus::TurnLimit,
                turns,
                tool_calls_total,
                usage,
            )
            .await)
    }

    /// Dispatch every call of one assistant turn concurrently and return the
    /// results in declaration order.
    async fn dispatch_tools(
        &self,
        calls: &[NativeToolCall],
        turn: usize,
    ) -> Vec<DispatchResult> {
        let gate = Arc::new(Semaphore::new(self.settings.max_concurrent_tools.max(1)));

        // Starts are emitted up front, in declaration order.
        for call in calls {
            self.bus
                .emit(
                    &self.ctx,
                    EventType::ToolCallStart,
                    serde_json::json!({
                        "turn": turn,
                        "call_id": call.id,
                        "tool": call.name,
                        "arguments": call.arguments,
                    }),
                )
                .await;
        }

        let futures = calls.iter().map(|call| {
            let call = call.clone();
            let gate = gate.clone();
            async move {
                let _permit = gate.acquire().await.expect("tool gate closed");
                let outcome = self
                    .catalog
                    .call(
                        &call.name,
                        call.arguments.clone(),
                        self.settings.deadlines.tool_call,
                        &self.cancel,
                    )
                    .await;
                self.absorb_tool_outcome(call, outcome, turn).await
            }
        });

        // join_all preserves input order, which is what keeps the fold in
        // declaration order below.
        join_all(futures).await
    }

    /// Turn one tool outcome into the text folded back to the model, emitting
    /// exactly one end-or-error event for the call.
    async fn absorb_tool_outcome(
        &self,
        call: NativeToolCall,
        outcome: Result<crate::agentmesh::mcp::ToolOutcome, MeshError>,
        turn: usize,
    ) -> DispatchResult {
        match outcome {
            Ok(outcome) if outcome.is_error => {
                self.bus
                    .emit(
                        &self.ctx,
                        EventType::ToolCallError,
                        serde_json::json!({
                            "turn": turn,
                            "call_id": call.id,
                            "tool": call.name,
                            "error_kind": ErrorKind::ToolError.as_str(),
                            "error": outcome.content,
                        }),
                    )
                    .await;
                let response_text = format!("Tool '{}' failed: {}", call.name, outcome.content);
                DispatchResult {
                    call,
                    response_text,
                }
            }
            Ok(outcome) => {
                let spilled = self
                    .spill
                    .maybe_spill(&call.name, &call.arguments, &outcome.content)
                    .unwrap_or_else(|err| {
                        log::warn!("spill failed for '{}': {}", call.name, err);
                        None
                    });

                let response_text = match &spilled {
                    Some(record) => {
                        self.bus
                            .emit(
                                &self.ctx,
                                EventType::LargeToolOutputDetected,
                                serde_json::json!({
                                    "turn": turn,
                                    "call_id": call.id,
                                    "tool": call.name,
                                    "path": record.path.to_string_lossy(),
                                    "length": record.byte_length,
                                    "mime": record.mime,
                                }),
                            )
                            .await;
                        envelope_for(record)
                    }
                    None => outcome.content.clone(),
                };

                self.bus
                    .emit(
                        &self.ctx,
                        EventType::ToolCallEnd,
                        serde_json::json!({
                            "turn": turn,
                            "call_id": call.id,
                            "tool": call.name,
                            "response_chars": response_text.len(),
                            "spilled": spilled.is_some(),
                        }),
                    )
                    .await;
                DispatchResult {
                    call,
                    response_text,
                }
            }
            Err(err) => {
                self.bus
                    .emit(
                        &self.ctx,
                        EventType::ToolCallError,
                        serde_json::json!({
                            "turn": turn,
                            "call_id": call.id,
                            "tool": call.name,
                            "error_kind": err.kind.as_str(),
                            "error": err.to_string(),
                        }),
                    )
                    .await;
                let response_text =
                    format!("Tool '{}' could not be executed: {}", call.name, err);
                DispatchResult {
                    call,
                    response_text,
                }
            }
        }
    }

    /// Emit the terminal events for a completed run.
    async fn finish(
        &self,
        final_text: String,
        status: AgentStatus,
        turns: usize,
        tool_calls: usize,
        usage: TokenUsage,
    ) -> AgentOutcome {
        self.bus
            .emit(
                &self.ctx,
                EventType::ConversationEnd,
                serde_json::json!({"final_text": final_text}),
            )
            .await;
        self.bus
            .emit(
                &self.ctx,
                EventType::AgentEnd,
                serde_json::json!({
                    "status": status.as_str(),
                    "turns": turns,
                    "tool_calls": tool_calls,
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens,
                    "total_tokens": usage.total_tokens,
                }),
            )
            .await;
        AgentOutcome {
            final_text,
            status,
            turns,
            tool_calls,
            usage,
        }
    }

    /// Emit the terminal events for a failed run and hand the error back.
    async fn fail(
        &self,
        err: MeshError,
        turns: usize,
        tool_calls: usize,
        usage: &TokenUsage,
    ) -> MeshError {
        let status = if err.kind == ErrorKind::Cancelled {
            AgentStatus::Cancelled
        } else {
            AgentStatus::Error
        };
        self.bus
            .emit(
                &self.ctx,
                EventType::AgentError,
                serde_json::json!({
                    "error_kind": err.kind.as_str(),
                    "message": err.user_message(),
                    "detail": err.to_string(),
                }),
            )
            .await;
        self.bus
            .emit(
                &self.ctx,
                EventType::AgentEnd,
                serde_json::json!({
                    "status": status.as_str(),
                    "turns": turns,
                    "tool_calls": tool_calls,
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens,
                    "total_tokens": usage.total_tokens,
                }),
            )
            .await;
        err
    }
}

fn preview(text: &str) -> String {
    const PREVIEW_CHARS: usize = 120;
    text.chars().take(PREVIEW_CHARS).collect()
}
