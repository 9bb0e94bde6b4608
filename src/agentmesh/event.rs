//! Typed event timeline and synchronous fan-out bus.
//!
//! Every lifecycle point in the runtime emits an [`Event`] through an
//! [`EventBus`]. The bus is a first-class value passed into constructors —
//! there is no global mutable state — and fan-out is synchronous: an emit
//! calls every registered [`EventListener`] in registration order and does
//! not proceed until each returns. Listener errors are logged and never
//! propagated, so a misbehaving sink cannot fail an agent run.
//!
//! Listeners shipped with the crate:
//!
//! - [`ObserverStore`](crate::agentmesh::observer::ObserverStore) — in-memory
//!   ring per observer for polling consumers.
//! - [`SqliteEventStore`](crate::agentmesh::event_store::SqliteEventStore) —
//!   appends a row per event.
//! - [`TraceExporter`](crate::agentmesh::event_store::TraceExporter) — ships
//!   event batches to a live-trace endpoint.
//! - [`ContextBridge`] — decorates sub-agent events with orchestrator context
//!   tags before forwarding them into a parent bus.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::event::{EventBus, EventContext, EventType};
//! use std::sync::Arc;
//!
//! # async {
//! let bus = Arc::new(EventBus::new());
//! let ctx = EventContext::new("session-1", "agent");
//! bus.emit(&ctx, EventType::AgentStart, serde_json::json!({"objective": "say hi"}))
//!     .await;
//! # };
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Enumeration of every event the runtime emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // ── Lifecycle ────────────────────────────────────────────────────────
    AgentStart,
    AgentEnd,
    AgentError,
    ConversationEnd,
    // ── LLM ──────────────────────────────────────────────────────────────
    LlmGenerationStart,
    LlmGenerationEnd,
    LlmGenerationError,
    TokenUsage,
    FallbackModelUsed,
    // ── Tools ────────────────────────────────────────────────────────────
    ToolCallStart,
    ToolCallEnd,
    ToolCallError,
    LargeToolOutputDetected,
    // ── ReAct ────────────────────────────────────────────────────────────
    ReactReasoningStart,
    ReactReasoningEnd,
    // ── Orchestrator ─────────────────────────────────────────────────────
    OrchestratorStart,
    OrchestratorEnd,
    OrchestratorError,
    OrchestratorAgentStart,
    OrchestratorAgentEnd,
    OrchestratorAgentError,
    TodoStepsExtracted,
    IndependentStepsSelected,
    // ── Structured output ────────────────────────────────────────────────
    StructuredOutputStart,
    StructuredOutputEnd,
    StructuredOutputError,
    // ── Human in the loop ────────────────────────────────────────────────
    HumanFeedbackRequested,
    HumanFeedbackReceived,
}

impl EventType {
    /// Stable snake_case identifier used in persisted rows and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentStart => "agent_start",
            EventType::AgentEnd => "agent_end",
            EventType::AgentError => "agent_error",
            EventType::ConversationEnd => "conversation_end",
            EventType::LlmGenerationStart => "llm_generation_start",
            EventType::LlmGenerationEnd => "llm_generation_end",
            EventType::LlmGenerationError => "llm_generation_error",
            EventType::TokenUsage => "token_usage",
            EventType::FallbackModelUsed => "fallback_model_used",
            EventType::ToolCallStart => "tool_call_start",
            EventType::ToolCallEnd => "tool_call_end",
            EventType::ToolCallError => "tool_call_error",
            EventType::LargeToolOutputDetected => "large_tool_output_detected",
            EventType::ReactReasoningStart => "react_reasoning_start",
            EventType::ReactReasoningEnd => "react_reasoning_end",
            EventType::OrchestratorStart => "orchestrator_start",
            EventType::OrchestratorEnd => "orchestrator_end",
            EventType::OrchestratorError => "orchestrator_error",
            EventType::OrchestratorAgentStart => "orchestrator_agent_start",
            EventType::OrchestratorAgentEnd => "orchestrator_agent_end",
            EventType::OrchestratorAgentError => "orchestrator_agent_error",
            EventType::TodoStepsExtracted => "todo_steps_extracted",
            EventType::IndependentStepsSelected => "independent_steps_selected",
            EventType::StructuredOutputStart => "structured_output_start",
            EventType::StructuredOutputEnd => "structured_output_end",
            EventType::StructuredOutputError => "structured_output_error",
            EventType::HumanFeedbackRequested => "human_feedback_requested",
            EventType::HumanFeedbackReceived => "human_feedback_received",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity block shared by every event emitted from one logical site.
///
/// The `trace_id` spans a whole session; each component derives a `span_id`
/// of its own via [`EventContext::child`], with `parent_id` pointing at the
/// parent span and `hierarchy_level` counting the depth (0 = session root,
/// 1 = agent, 2 = sub-agent, ...).
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Owning session.
    pub session_id: String,
    /// Trace shared by every event of the session.
    pub trace_id: String,
    /// Span of the emitting component.
    pub span_id: String,
    /// Span of the parent component, if any.
    pub parent_id: Option<String>,
    /// Depth in the component tree.
    pub hierarchy_level: u32,
    /// Emitting component name (e.g. `"agent"`, `"orchestrator"`,
    /// `"mcp_pool"`).
    pub component: String,
}

impl EventContext {
    /// Root context for a session.
    pub fn new(session_id: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: uuid::Uuid::new_v4().simple().to_string(),
            parent_id: None,
            hierarchy_level: 0,
            component: component.into(),
        }
    }

    /// Derive a child context one level deeper, with a fresh span.
    pub fn child(&self, component: impl Into<String>) -> Self {
        Self {
            session_id: self.session_id.clone(),
            trace_id: self.trace_id.clone(),
            span_id: uuid::Uuid::new_v4().simple().to_string(),
            parent_id: Some(self.span_id.clone()),
            hierarchy_level: self.hierarchy_level + 1,
            component: component.into(),
        }
    }
}

/// A single timeline entry.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonically increasing, globally unique id assigned by the bus.
    pub id: u64,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Typed discriminant.
    pub event_type: EventType,
    /// Owning session.
    pub session_id: String,
    /// Trace / span identity copied from the emitting [`EventContext`].
    pub trace_id: String,
    /// Span of the emitting component.
    pub span_id: String,
    /// Parent span, if any.
    pub parent_id: Option<String>,
    /// Depth in the component tree.
    pub hierarchy_level: u32,
    /// Emitting component name.
    pub component: String,
    /// Free-form event data.
    pub payload: serde_json::Value,
}

/// Trait for receiving events from an [`EventBus`].
///
/// Listeners must be non-blocking or internally buffered: the bus awaits each
/// listener before returning to the emitter, so a slow listener slows the
/// whole session.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Handle one event. Errors are logged by the bus and never propagated.
    async fn on_event(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Name used in log lines when the listener fails.
    fn name(&self) -> &str {
        "listener"
    }
}

/// Synchronous fan-out bus.
///
/// Emitting stamps the event with a fresh id and timestamp, then calls every
/// registered listener in registration order.
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Append a listener; it will receive every subsequent emit, after all
    /// previously registered listeners.
    pub fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .expect("listener registry poisoned")
            .push(listener);
    }

    /// Build, stamp, and fan out an event; returns the stamped event.
    pub async fn emit(
        &self,
        ctx: &EventContext,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Event {
        let event = Event {
            id: 0, // assigned by emit_event
            timestamp: Utc::now(),
            event_type,
            session_id: ctx.session_id.clone(),
            trace_id: ctx.trace_id.clone(),
            span_id: ctx.span_id.clone(),
            parent_id: ctx.parent_id.clone(),
            hierarchy_level: ctx.hierarchy_level,
            component: ctx.component.clone(),
            payload,
        };
        self.emit_event(event).await
    }

    /// Stamp a pre-built event with this bus's next id and fan it out.
    ///
    /// Used by [`ContextBridge`] to forward decorated events from a child bus
    /// into the parent timeline while keeping the parent's ids monotonic.
    pub async fn emit_event(&self, mut event: Event) -> Event {
        event.id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let listeners: Vec<Arc<dyn EventListener>> = {
            let guard = self.listeners.read().expect("listener registry poisoned");
            guard.clone()
        };

        for listener in listeners {
            if let Err(err) = listener.on_event(&event).await {
                log::error!(
                    "event listener '{}' failed on {}: {}",
                    listener.name(),
                    event.event_type,
                    err
                );
            }
        }
        event
    }

    /// Number of ids handed out so far.
    pub fn emitted_count(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrator context tags attached to sub-agent events.
#[derive(Debug, Clone, Default)]
pub struct ContextTags {
    /// Orchestration phase (`"planning"`, `"execution"`, `"critique"`).
    pub phase: String,
    /// Zero-based index of the current plan step.
    pub step_index: Option<usize>,
    /// One-based refinement iteration.
    pub iteration: Option<usize>,
    /// Name of the sub-agent currently running.
    pub agent_name: Option<String>,
}

/// Listener that decorates inbound events with orchestrator context tags and
/// forwards them to a parent bus.
///
/// The tags are copied under the lock, the lock is released, and only then is
/// the forward performed — listener work downstream is unknown and must never
/// run under this lock.
pub struct ContextBridge {
    parent: Arc<EventBus>,
    tags: RwLock<ContextTags>,
}

impl ContextBridge {
    /// Bridge into `parent` with empty tags.
    pub fn new(parent: Arc<EventBus>) -> Self {
        Self {
            parent,
            tags: RwLock::new(ContextTags::default()),
        }
    }

    /// Replace the current tags; subsequent events carry the new values.
    pub fn set_tags(&self, tags: ContextTags) {
        *self.tags.write().expect("context tags poisoned") = tags;
    }
}

#[async_trait]
impl EventListener for ContextBridge {
    async fn on_event(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let tags = {
            let guard = self.tags.read().expect("context tags poisoned");
            guard.clone()
        };
        // Lock released; safe to run unknown listener work downstream.

        let mut decorated = event.clone();
        let context = serde_json::json!({
            "phase": tags.phase,
            "step_index": tags.step_index,
            "iteration": tags.iteration,
            "agent_name": tags.agent_name,
        });
        match decorated.payload.as_object_mut() {
            Some(map) => {
                map.insert("orchestrator_context".to_string(), context);
            }
            None => {
                // Events without a base data block get wrapped rather than
                // dropped.
                decorated.payload = serde_json::json!({
                    "data": decorated.payload,
                    "orchestrator_context": context,
                });
            }
        }
        self.parent.emit_event(decorated).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "context_bridge"
    }
}
