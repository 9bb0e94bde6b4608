//! Shared fixtures for the integration tests: a scripted LLM client, an
//! in-process tool box, and an event recorder.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use agentmesh::error::{ErrorKind, MeshError};
use agentmesh::event::{Event, EventBus, EventListener, EventType};
use agentmesh::fallback::FallbackChain;
use agentmesh::llm::{
    GenerateOptions, LlmClient, LlmResponse, Message, NativeToolCall, StopReason, TokenUsage,
    ToolDefinition,
};
use agentmesh::mcp::ToolOutcome;
use agentmesh::registry::{ToolDescriptor, VirtualToolExecutor};

/// One scripted reply: a canned response or a classified failure.
pub enum Scripted {
    Reply(LlmResponse),
    Fail(ErrorKind, String),
}

/// An [`LlmClient`] that replays a script and records every request.
pub struct ScriptedClient {
    model: String,
    script: Mutex<VecDeque<Scripted>>,
    pub calls: AtomicUsize,
    /// The message arrays of every request, in call order.
    pub seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    pub fn new(model: &str) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, entry: Scripted) {
        self.script.lock().unwrap().push_back(entry);
    }

    /// Queue a plain text reply.
    pub fn reply_text(&self, text: &str) -> &Self {
        self.push(Scripted::Reply(LlmResponse {
            message: Message::assistant(text),
            stop_reason: StopReason::EndTurn,
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                reasoning_tokens: None,
            }),
            model: self.model.clone(),
        }));
        self
    }

    /// Queue an assistant reply carrying tool calls.
    pub fn reply_tool_calls(&self, calls: Vec<(&str, &str, serde_json::Value)>) -> &Self {
        let tool_calls = calls
            .into_iter()
            .map(|(id, name, arguments)| NativeToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            })
            .collect();
        self.push(Scripted::Reply(LlmResponse {
            message: Message::assistant_with_tool_calls("", tool_calls),
            stop_reason: StopReason::ToolUse,
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                reasoning_tokens: None,
            }),
            model: self.model.clone(),
        }));
        self
    }

    /// Queue a classified failure.
    pub fn reply_error(&self, kind: ErrorKind) -> &Self {
        self.push(Scripted::Fail(kind, "scripted failure".to_string()));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn generate(
        &self,
        messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
        _options: &GenerateOptions,
    ) -> Result<LlmResponse, MeshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Reply(response)) => Ok(response),
            Some(Scripted::Fail(kind, message)) => Err(MeshError::new(kind, message)),
            None => Err(MeshError::new(
                ErrorKind::Unknown,
                "script exhausted: unexpected LLM call",
            )),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &str {
        "scripted"
    }
}

/// Build a single-entry fallback chain around a scripted client.
pub fn chain_of(client: Arc<ScriptedClient>, bus: Arc<EventBus>) -> Arc<FallbackChain> {
    Arc::new(FallbackChain::new(
        vec![client],
        bus,
        Duration::from_secs(5),
    ))
}

type ToolHandler = Box<dyn Fn(serde_json::Value) -> Result<ToolOutcome, MeshError> + Send + Sync>;

struct ToolboxEntry {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
}

/// An in-process tool source registered through the virtual-tool seam.
pub struct Toolbox {
    entries: Vec<ToolboxEntry>,
}

impl Toolbox {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a tool under a qualified name with a JSON-schema fragment.
    pub fn tool(
        mut self,
        qualified_name: &str,
        schema: serde_json::Value,
        handler: impl Fn(serde_json::Value) -> Result<ToolOutcome, MeshError> + Send + Sync + 'static,
    ) -> Self {
        let display_name = qualified_name
            .rsplit('/')
            .next()
            .unwrap_or(qualified_name)
            .to_string();
        self.entries.push(ToolboxEntry {
            descriptor: ToolDescriptor {
                qualified_name: qualified_name.to_string(),
                display_name,
                description: format!("test tool {}", qualified_name),
                schema,
                server_id: "virtual".to_string(),
            },
            handler: Box::new(handler),
        });
        self
    }
}

#[async_trait]
impl VirtualToolExecutor for Toolbox {
    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    async fn execute(&self, name: &str, args: serde_json::Value) -> Result<ToolOutcome, MeshError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.descriptor.qualified_name == name)
            .ok_or_else(|| MeshError::new(ErrorKind::ToolError, format!("no tool '{}'", name)))?;
        (entry.handler)(args)
    }
}

/// Route between several virtual executors by descriptor name.
pub struct CompositeExecutor {
    executors: Vec<Arc<dyn VirtualToolExecutor>>,
}

impl CompositeExecutor {
    pub fn new(executors: Vec<Arc<dyn VirtualToolExecutor>>) -> Self {
        Self { executors }
    }
}

#[async_trait]
impl VirtualToolExecutor for CompositeExecutor {
    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.executors
            .iter()
            .flat_map(|e| e.descriptors())
            .collect()
    }

    async fn execute(&self, name: &str, args: serde_json::Value) -> Result<ToolOutcome, MeshError> {
        for executor in &self.executors {
            if executor
                .descriptors()
                .iter()
                .any(|d| d.qualified_name == name)
            {
                return executor.execute(name, args).await;
            }
        }
        Err(MeshError::new(
            ErrorKind::ToolError,
            format!("no executor for '{}'", name),
        ))
    }
}

/// Helper for successful tool outcomes.
pub fn ok_outcome(content: impl Into<String>) -> Result<ToolOutcome, MeshError> {
    Ok(ToolOutcome {
        content: content.into(),
        structured: None,
        is_error: false,
    })
}

/// Bus listener that records every event for assertions.
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    /// Event types in emission order.
    pub fn types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect()
    }

    /// Count events of one type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Payloads of all events of one type, in order.
    pub fn payloads(&self, event_type: EventType) -> Vec<serde_json::Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .map(|e| e.payload.clone())
            .collect()
    }
}

#[async_trait]
impl EventListener for Recorder {
    async fn on_event(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recorder"
    }
}
