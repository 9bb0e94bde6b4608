//! Spill behavior end to end: envelope substitution, the
//! `large_tool_output_detected` event, fingerprint reuse, and the virtual
//! tools over the spilled artifact.

mod common;

use std::sync::Arc;

use agentmesh::agent::{AgentLoop, AgentSettings};
use agentmesh::config::MeshConfig;
use agentmesh::event::{EventBus, EventContext, EventType};
use agentmesh::mcp::McpPool;
use agentmesh::registry::{ToolCatalog, ToolFilter};
use agentmesh::spill::{SpillStore, VirtualTools};
use tokio_util::sync::CancellationToken;

use common::{chain_of, ok_outcome, CompositeExecutor, Recorder, ScriptedClient, Toolbox};

/// A JSON payload comfortably above the 1000-byte threshold.
fn big_json() -> String {
    let items: Vec<serde_json::Value> = (0..40)
        .map(|i| serde_json::json!({"id": i, "name": format!("item-{:04}", i)}))
        .collect();
    let text = serde_json::json!({ "items": items }).to_string();
    assert!(text.len() > 1000);
    text
}

#[tokio::test]
async fn test_oversized_output_is_enveloped_and_queryable() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.register(recorder.clone());

    let client = ScriptedClient::new("scripted-1");
    let chain = chain_of(client.clone(), bus.clone());

    let pool = Arc::new(McpPool::new(Vec::new(), &MeshConfig::default()));
    let spill_dir = tempfile::tempdir().unwrap();
    let spill = Arc::new(SpillStore::open(spill_dir.path().join("spill"), 1000).unwrap());

    let payload = big_json();
    let payload_for_tool = payload.clone();
    let toolbox = Toolbox::new().tool(
        "search/dump",
        serde_json::json!({"type": "object"}),
        move |_| ok_outcome(payload_for_tool.clone()),
    );
    let executor = CompositeExecutor::new(vec![
        Arc::new(toolbox),
        Arc::new(VirtualTools::new(spill.clone(), pool.clone())),
    ]);
    let catalog = Arc::new(
        ToolCatalog::build(pool, &ToolFilter::default(), Some(Arc::new(executor)))
            .await
            .unwrap(),
    );

    let agent = AgentLoop::new(
        chain,
        catalog.clone(),
        spill.clone(),
        bus,
        EventContext::new("s1", "agent"),
        CancellationToken::new(),
        AgentSettings::default(),
        "prompt",
    );

    client.reply_tool_calls(vec![("c1", "search/dump", serde_json::json!({}))]);
    client.reply_text("done");
    agent.run("dump it").await.unwrap();

    // Exactly one detection event.
    let detections = recorder.payloads(EventType::LargeToolOutputDetected);
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0]["length"], payload.len());
    assert_eq!(detections[0]["mime"], "application/json");
    let path = detections[0]["path"].as_str().unwrap().to_string();

    // The message fed back to the model is the envelope, not the raw bytes.
    let seen = client.seen.lock().unwrap();
    let folded = seen[1].last().unwrap().content.to_string();
    let envelope: serde_json::Value = serde_json::from_str(&folded).unwrap();
    assert_eq!(envelope["spilled"], true);
    assert_eq!(envelope["length"], payload.len());
    assert!(envelope["hint"]
        .as_str()
        .unwrap()
        .contains("read_large_output"));
    assert!(!folded.contains("item-0039"));
    drop(seen);

    // read_large_output returns the first 100 characters.
    let slice = catalog
        .call(
            "read_large_output",
            serde_json::json!({"path": path, "offset": 0, "length": 100}),
            std::time::Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(slice.content, payload.chars().take(100).collect::<String>());

    // query_large_output evaluates a jq-style pipeline.
    let count = catalog
        .call(
            "query_large_output",
            serde_json::json!({"path": path, "query": ".items | length"}),
            std::time::Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(count.structured, Some(serde_json::json!(40)));

    // search_large_output respects the match bound.
    let matches = catalog
        .call(
            "search_large_output",
            serde_json::json!({"path": path, "pattern": "item-", "max_matches": 5}),
            std::time::Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let rendered = matches.structured.unwrap();
    assert!(rendered.as_array().unwrap().len() <= 5);
}

#[tokio::test]
async fn test_identical_calls_reuse_one_spill_file() {
    let spill_dir = tempfile::tempdir().unwrap();
    let store = SpillStore::open(spill_dir.path().join("spill"), 100).unwrap();

    let args = serde_json::json!({"query": "rust"});
    let body = "x".repeat(500);
    let first = store
        .maybe_spill("search/web", &args, &body)
        .unwrap()
        .unwrap();
    let second = store
        .maybe_spill("search/web", &args, &body)
        .unwrap()
        .unwrap();

    assert_eq!(first.path, second.path);
    // Only the one artifact exists on disk.
    let files = std::fs::read_dir(store.dir()).unwrap().count();
    assert_eq!(files, 1);
}

#[tokio::test]
async fn test_session_close_clears_spill_dir() {
    let spill_dir = tempfile::tempdir().unwrap();
    let store = SpillStore::open(spill_dir.path().join("spill"), 10).unwrap();
    store
        .maybe_spill("t/x", &serde_json::json!({}), "0123456789abcdef")
        .unwrap()
        .unwrap();

    store.clear();
    assert!(!spill_dir.path().join("spill").exists());
}
