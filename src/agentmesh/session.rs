//! Session driver: the inbound surface the HTTP/CLI shell calls.
//!
//! A [`SessionManager`] owns the event bus, the observer store, the MCP
//! pool, and the fallback chain, and exposes the five operations the shell
//! needs: `create_session`, `send_message`, `poll_events`,
//! `submit_human_feedback`, and `close_session`.
//!
//! Each session owns a spill directory (cleaned up on close) and one or more
//! observers polling its timeline. The agent loop is the session's exclusive
//! writer of conversation state; the event store is a shared reader/writer
//! serialized behind its own lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::agent::{AgentLoop, AgentMode, AgentSettings, AgentStatus};
use crate::agentmesh::cancel::Deadlines;
use crate::agentmesh::conditional::ConditionalLlm;
use crate::agentmesh::config::MeshConfig;
use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::event::{EventBus, EventContext, EventType};
use crate::agentmesh::event_store::{SqliteEventStore, TraceExporter};
use crate::agentmesh::fallback::FallbackChain;
use crate::agentmesh::mcp::McpPool;
use crate::agentmesh::observer::{new_observer_id, ObserverStore, Poll};
use crate::agentmesh::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::agentmesh::prompt::{PromptAssembler, PromptMode};
use crate::agentmesh::registry::{ToolCatalog, ToolFilter};
use crate::agentmesh::spill::{SpillStore, VirtualTools};
use crate::agentmesh::structured::StructuredOutput;

/// Execution strategy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Single-turn tool loop.
    Simple,
    /// Iterative ReAct loop.
    React,
    /// Plan → execute → critique orchestration.
    Orchestrator,
    /// Preset-driven workflow; runs through the orchestrator, the workflow
    /// surface itself lives outside the core.
    Workflow,
}

impl SessionMode {
    /// Stable identifier used in persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Simple => "simple",
            SessionMode::React => "react",
            SessionMode::Orchestrator => "orchestrator",
            SessionMode::Workflow => "workflow",
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Accepting messages.
    Idle,
    /// A run is in flight.
    Running,
    /// Last run finished successfully.
    Completed,
    /// Last run failed.
    Failed,
    /// Closed by the caller.
    Closed,
}

struct SessionState {
    mode: SessionMode,
    servers: Option<Vec<String>>,
    cancel: CancellationToken,
    ctx: EventContext,
    spill: Arc<SpillStore>,
    status: Mutex<SessionStatus>,
}

/// The session registry and its shared infrastructure.
pub struct SessionManager {
    config: MeshConfig,
    pool: Arc<McpPool>,
    llm: Arc<FallbackChain>,
    bus: Arc<EventBus>,
    observers: Arc<ObserverStore>,
    event_store: Option<Arc<SqliteEventStore>>,
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    feedback: Mutex<HashMap<String, oneshot::Sender<String>>>,
    reaper_cancel: CancellationToken,
}

impl SessionManager {
    /// Wire a manager: registers the observer store, the optional SQLite
    /// store, and (when configured) the trace exporter on a fresh bus, and
    /// starts the observer reaper.
    pub fn new(
        config: MeshConfig,
        pool: Arc<McpPool>,
        llm: Arc<FallbackChain>,
        event_store: Option<Arc<SqliteEventStore>>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let observers = Arc::new(ObserverStore::new(config.max_events_per_observer));
        bus.register(observers.clone());

        if let Some(store) = &event_store {
            bus.register(store.clone());
        }
        if let (Some(endpoint), mode) = (&config.trace_endpoint, config.trace_mode.as_str()) {
            if mode != "off" {
                bus.register(Arc::new(TraceExporter::new(
                    endpoint,
                    config.trace_key.as_deref(),
                    32,
                )));
            }
        }

        let reaper_cancel = CancellationToken::new();
        observers.spawn_reaper(
            std::time::Duration::from_secs(60),
            config.observer_idle_horizon,
            reaper_cancel.clone(),
        );

        Arc::new(Self {
            config,
            pool,
            llm,
            bus,
            observers,
            event_store,
            sessions: Mutex::new(HashMap::new()),
            feedback: Mutex::new(HashMap::new()),
            reaper_cancel,
        })
    }

    /// The bus sessions emit into (for wiring extra listeners).
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Create a session and its first observer.
    pub fn create_session(
        &self,
        mode: SessionMode,
        servers: Option<Vec<String>>,
        preset_query_id: Option<i64>,
    ) -> Result<(String, String), MeshError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let observer_id = new_observer_id();

        let spill_dir = self.config.spill_dir.join(&session_id);
        let spill = Arc::new(SpillStore::open(
            spill_dir,
            self.config.spill_threshold_bytes,
        )?);

        self.observers.init_observer(&observer_id, &session_id);
        if let Some(store) = &self.event_store {
            store.create_chat_session(&session_id, None, mode.as_str(), preset_query_id)?;
        }

        let state = Arc::new(SessionState {
            mode,
            servers,
            cancel: CancellationToken::new(),
            ctx: EventContext::new(&session_id, "session"),
            spill,
            status: Mutex::new(SessionStatus::Idle),
        });

        // Age sweeper for long-lived sessions; dies with the session token.
        let sweeper_spill = state.spill.clone();
        let sweeper_cancel = state.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweeper_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sweeper_spill.sweep_older_than(std::time::Duration::from_secs(24 * 3600));
                    }
                }
            }
        });

        self.sessions
            .lock()
            .expect("sessions poisoned")
            .insert(session_id.clone(), state);

        Ok((session_id, observer_id))
    }

    /// Attach an additional observer to an existing session.
    pub fn create_observer(&self, session_id: &str) -> Result<String, MeshError> {
        self.state_of(session_id)?;
        let observer_id = new_observer_id();
        self.observers.init_observer(&observer_id, session_id);
        Ok(observer_id)
    }

    fn state_of(&self, session_id: &str) -> Result<Arc<SessionState>, MeshError> {
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                MeshError::new(
                    ErrorKind::Unknown,
                    format!("unknown session '{}'", session_id),
                )
            })
    }

    /// Kick off a run for `text`; returns once the run is spawned.
    ///
    /// Progress is consumed through `poll_events`; the terminal
    /// `agent_end` / `orchestrator_end` event carries the outcome.
    pub async fn send_message(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
    ) -> Result<(), MeshError> {
        let state = self.state_of(session_id)?;
        {
            let mut status = state.status.lock().expect("status poisoned");
            if *status == SessionStatus::Closed {
                return Err(MeshError::new(ErrorKind::Unknown, "session is closed"));
            }
            if *status == SessionStatus::Running {
                return Err(MeshError::new(ErrorKind::Unknown, "session is busy"));
            }
            *status = SessionStatus::Running;
        }

        let manager = Arc::clone(self);
        let text = text.to_string();
        let session_id = session_id.to_string();
        let run_state = state.clone();

        tokio::spawn(async move {
            // Overall deadline turns into a cancel, which every suspension
            // point observes.
            let cancel = run_state.cancel.child_token();
            let watchdog = cancel.clone();
            let overall = manager.config.overall_timeout;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(overall).await;
                watchdog.cancel();
            });

            let result = manager.run_session(&run_state, &cancel, &text).await;
            timer.abort();

            let terminal = match &result {
                Ok(status) => *status,
                Err(_) => SessionStatus::Failed,
            };
            *run_state.status.lock().expect("status poisoned") = terminal;
            if let Some(store) = &manager.event_store {
                let row_status = match terminal {
                    SessionStatus::Completed => "success",
                    SessionStatus::Failed => "failed",
                    _ => "unknown",
                };
                let _ = store.complete_chat_session(&session_id, row_status);
            }
        });

        Ok(())
    }

    async fn run_session(
        &self,
        state: &SessionState,
        cancel: &CancellationToken,
        text: &str,
    ) -> Result<SessionStatus, MeshError> {
        let filter = ToolFilter {
            enabled_servers: state.servers.clone(),
            enabled_tools: None,
        };
        let virtual_tools = Arc::new(VirtualTools::new(state.spill.clone(), self.pool.clone()));
        let catalog = Arc::new(
            ToolCatalog::build(self.pool.clone(), &filter, Some(virtual_tools)).await?,
        );

        let deadlines = Deadlines {
            overall: self.config.overall_timeout,
            llm_call: self.config.llm_timeout,
            tool_call: self.config.tool_timeout,
            sub_agent: self.config.sub_agent_timeout,
        };

        match state.mode {
            SessionMode::Simple | SessionMode::React => {
                let (mode, prompt_mode) = match state.mode {
                    SessionMode::Simple => (AgentMode::Simple, PromptMode::General),
                    _ => (AgentMode::React, PromptMode::React),
                };

                let mut assembler = PromptAssembler::new(prompt_mode).with_virtual_tools();
                for server_id in self.pool.server_ids() {
                    if let Some(enabled) = &state.servers {
                        if !enabled.contains(&server_id) {
                            continue;
                        }
                    }
                    if let Ok(client) = self.pool.client(&server_id) {
                        if let Ok(prompts) = client.list_prompts().await {
                            assembler = assembler.with_prompts(&server_id, &prompts);
                        }
                        if let Ok(resources) = client.list_resources().await {
                            assembler = assembler.with_resources(&server_id, &resources);
                        }
                    }
                }

                let settings = AgentSettings {
                    mode,
                    deadlines,
                    ..Default::default()
                };
                let agent = AgentLoop::new(
                    self.llm.clone(),
                    catalog,
                    state.spill.clone(),
                    self.bus.clone(),
                    state.ctx.child("agent"),
                    cancel.clone(),
                    settings,
                    assembler.render(),
                );
                let outcome = agent.run(text).await?;
                Ok(match outcome.status {
                    AgentStatus::Success | AgentStatus::TurnLimit => SessionStatus::Completed,
                    _ => SessionStatus::Failed,
                })
            }
            SessionMode::Orchestrator | SessionMode::Workflow => {
                let structured =
                    Arc::new(StructuredOutput::new(self.llm.clone(), self.bus.clone()));
                let conditional =
                    Arc::new(ConditionalLlm::new(structured.clone(), self.bus.clone()));
                let settings = OrchestratorSettings {
                    workspace_dir: state.spill.dir().join("workspace"),
                    agent: AgentSettings {
                        deadlines,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let orchestrator = Orchestrator::new(
                    self.llm.clone(),
                    catalog,
                    state.spill.clone(),
                    self.bus.clone(),
                    structured,
                    conditional,
                    state.ctx.child("orchestrator"),
                    cancel.clone(),
                    settings,
                );
                let outcome = orchestrator.run(text).await?;
                Ok(match outcome.status {
                    AgentStatus::Success => SessionStatus::Completed,
                    _ => SessionStatus::Failed,
                })
            }
        }
    }

    /// Poll an observer's cursor.
    pub fn poll_events(&self, observer_id: &str, since_index: i64) -> Poll {
        self.observers.get_since(observer_id, since_index)
    }

    /// Ask the human a question; returns the request id and a receiver that
    /// resolves when `submit_human_feedback` is called.
    pub async fn request_human_feedback(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<(String, oneshot::Receiver<String>), MeshError> {
        let state = self.state_of(session_id)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.feedback
            .lock()
            .expect("feedback poisoned")
            .insert(request_id.clone(), tx);

        self.bus
            .emit(
                &state.ctx,
                EventType::HumanFeedbackRequested,
                serde_json::json!({"request_id": request_id, "prompt": prompt}),
            )
            .await;
        Ok((request_id, rx))
    }

    /// Deliver the human's answer for a pending feedback request.
    pub async fn submit_human_feedback(
        &self,
        session_id: &str,
        request_id: &str,
        text: &str,
    ) -> Result<(), MeshError> {
        let state = self.state_of(session_id)?;
        let sender = self
            .feedback
            .lock()
            .expect("feedback poisoned")
            .remove(request_id)
            .ok_or_else(|| {
                MeshError::new(
                    ErrorKind::Unknown,
                    format!("no pending feedback request '{}'", request_id),
                )
            })?;

        self.bus
            .emit(
                &state.ctx,
                EventType::HumanFeedbackReceived,
                serde_json::json!({"request_id": request_id, "chars": text.len()}),
            )
            .await;
        let _ = sender.send(text.to_string());
        Ok(())
    }

    /// Cancel any in-flight run, delete the spill directory, and detach the
    /// session's observers.
    pub async fn close_session(&self, session_id: &str) -> Result<(), MeshError> {
        let state = self.state_of(session_id)?;
        state.cancel.cancel();
        *state.status.lock().expect("status poisoned") = SessionStatus::Closed;
        state.spill.clear();

        for observer_id in self.observers.observers_for_session(session_id) {
            self.observers.close_observer(&observer_id);
        }
        if let Some(store) = &self.event_store {
            let _ = store.complete_chat_session(session_id, "closed");
        }
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .remove(session_id);
        Ok(())
    }

    /// Stop background tasks and close transports.
    pub async fn shutdown(&self) {
        self.reaper_cancel.cancel();
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_mode_identifiers() {
        assert_eq!(SessionMode::Simple.as_str(), "simple");
        assert_eq!(SessionMode::Orchestrator.as_str(), "orchestrator");
        assert_eq!(SessionMode::Workflow.as_str(), "workflow");
    }
}
