//! Fallback-chain behavior inside a full agent run.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agentmesh::agent::{AgentLoop, AgentSettings, AgentStatus};
use agentmesh::config::MeshConfig;
use agentmesh::error::ErrorKind;
use agentmesh::event::{EventBus, EventContext, EventType};
use agentmesh::fallback::FallbackChain;
use agentmesh::mcp::McpPool;
use agentmesh::registry::{ToolCatalog, ToolFilter};
use agentmesh::spill::SpillStore;
use tokio_util::sync::CancellationToken;

use common::{ok_outcome, Recorder, ScriptedClient, Toolbox};

#[tokio::test]
async fn test_rate_limited_primary_falls_back_without_duplicate_dispatch() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.register(recorder.clone());

    // Primary is rate-limited on the first call only; secondary answers with
    // a tool call, then a closing message.
    let primary = ScriptedClient::new("primary");
    primary.reply_error(ErrorKind::RateLimit);
    primary.reply_error(ErrorKind::RateLimit);
    let secondary = ScriptedClient::new("secondary");
    secondary.reply_tool_calls(vec![("c1", "echo/say", serde_json::json!({"text": "hi"}))]);
    secondary.reply_text("hi");

    let chain = Arc::new(FallbackChain::new(
        vec![primary.clone(), secondary.clone()],
        bus.clone(),
        Duration::from_secs(5),
    ));

    let toolbox = Toolbox::new().tool(
        "echo/say",
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }),
        |args| ok_outcome(args["text"].as_str().unwrap_or("").to_string()),
    );
    let pool = Arc::new(McpPool::new(Vec::new(), &MeshConfig::default()));
    let catalog = Arc::new(
        ToolCatalog::build(pool, &ToolFilter::default(), Some(Arc::new(toolbox)))
            .await
            .unwrap(),
    );
    let spill_dir = tempfile::tempdir().unwrap();
    let spill = Arc::new(SpillStore::open(spill_dir.path().join("spill"), 1000).unwrap());

    let agent = AgentLoop::new(
        chain,
        catalog,
        spill,
        bus,
        EventContext::new("s1", "agent"),
        CancellationToken::new(),
        AgentSettings::default(),
        "prompt",
    );

    let outcome = agent.run("Say hi.").await.unwrap();
    assert_eq!(outcome.status, AgentStatus::Success);
    assert_eq!(outcome.final_text, "hi");

    // One fallback event per turn that needed it; exactly one tool dispatch.
    let fallbacks = recorder.payloads(EventType::FallbackModelUsed);
    assert_eq!(fallbacks.len(), 2);
    assert_eq!(fallbacks[0]["failed_model"], "primary");
    assert_eq!(fallbacks[0]["fallback_model"], "secondary");
    assert_eq!(fallbacks[0]["error_kind"], "rate_limit");
    assert_eq!(recorder.count(EventType::ToolCallStart), 1);
    assert_eq!(recorder.count(EventType::ToolCallEnd), 1);

    // The primary was tried once per turn, the secondary served both.
    assert_eq!(primary.call_count(), 2);
    assert_eq!(secondary.call_count(), 2);
}

#[tokio::test]
async fn test_non_retryable_error_skips_the_chain() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.register(recorder.clone());

    let primary = ScriptedClient::new("primary");
    primary.reply_error(ErrorKind::ContextLength);
    let secondary = ScriptedClient::new("secondary");

    let chain = Arc::new(FallbackChain::new(
        vec![primary, secondary.clone()],
        bus.clone(),
        Duration::from_secs(5),
    ));
    let pool = Arc::new(McpPool::new(Vec::new(), &MeshConfig::default()));
    let catalog = Arc::new(
        ToolCatalog::build(pool, &ToolFilter::default(), None)
            .await
            .unwrap(),
    );
    let spill_dir = tempfile::tempdir().unwrap();
    let spill = Arc::new(SpillStore::open(spill_dir.path().join("spill"), 1000).unwrap());

    let agent = AgentLoop::new(
        chain,
        catalog,
        spill,
        bus,
        EventContext::new("s1", "agent"),
        CancellationToken::new(),
        AgentSettings::default(),
        "prompt",
    );

    let err = agent.run("go").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ContextLength);
    assert_eq!(secondary.call_count(), 0);
    assert_eq!(recorder.count(EventType::FallbackModelUsed), 0);
    assert_eq!(recorder.count(EventType::LlmGenerationError), 1);
}
