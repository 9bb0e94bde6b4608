//! Orchestrator behavior: the critic-gated refinement loop, independence
//! detection, context artifacts, and the iteration cap.

mod common;

use std::sync::Arc;

use agentmesh::agent::{AgentSettings, AgentStatus};
use agentmesh::conditional::ConditionalLlm;
use agentmesh::config::MeshConfig;
use agentmesh::event::{EventBus, EventContext, EventType};
use agentmesh::mcp::McpPool;
use agentmesh::orchestrator::{
    Orchestrator, OrchestratorSettings, Plan, StepTermination,
};
use agentmesh::registry::{ToolCatalog, ToolFilter};
use agentmesh::spill::SpillStore;
use agentmesh::structured::StructuredOutput;
use tokio_util::sync::CancellationToken;

use common::{chain_of, Recorder, ScriptedClient};

struct Harness {
    orchestrator: Orchestrator,
    recorder: Arc<Recorder>,
    client: Arc<ScriptedClient>,
    workspace: tempfile::TempDir,
}

async fn harness(settings_override: impl FnOnce(&mut OrchestratorSettings)) -> Harness {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.register(recorder.clone());

    let client = ScriptedClient::new("scripted-1");
    let chain = chain_of(client.clone(), bus.clone());

    let pool = Arc::new(McpPool::new(Vec::new(), &MeshConfig::default()));
    let catalog = Arc::new(
        ToolCatalog::build(pool, &ToolFilter::default(), None)
            .await
            .unwrap(),
    );
    let workspace = tempfile::tempdir().unwrap();
    let spill = Arc::new(SpillStore::open(workspace.path().join("spill"), 1000).unwrap());

    let structured = Arc::new(StructuredOutput::new(chain.clone(), bus.clone()));
    let conditional = Arc::new(ConditionalLlm::new(structured.clone(), bus.clone()));

    let mut settings = OrchestratorSettings {
        workspace_dir: workspace.path().join("workspace"),
        agent: AgentSettings::default(),
        ..Default::default()
    };
    settings_override(&mut settings);

    let orchestrator = Orchestrator::new(
        chain,
        catalog,
        spill,
        bus,
        structured,
        conditional,
        EventContext::new("s1", "orchestrator"),
        CancellationToken::new(),
        settings,
    );

    Harness {
        orchestrator,
        recorder,
        client,
        workspace,
    }
}

fn plan_json(steps: &[(&str, Option<&str>, &[&str])]) -> String {
    let steps: Vec<serde_json::Value> = steps
        .iter()
        .map(|(title, output, deps)| {
            let mut step = serde_json::json!({
                "title": title,
                "description": format!("carry out {}", title),
                "success_criteria": "complete and correct",
                "why": "part of the objective",
                "context_dependencies": deps.iter().collect::<Vec<_>>(),
            });
            if let Some(output) = output {
                step["context_output"] = serde_json::json!(output);
            }
            step
        })
        .collect();
    serde_json::json!({ "steps": steps }).to_string()
}

fn decision(result: bool) -> String {
    serde_json::json!({"result": result, "reason": "scripted decision"}).to_string()
}

#[tokio::test]
async fn test_critic_loop_runs_executor_three_times_then_proceeds() {
    let h = harness(|s| s.parallelize_independent = false).await;

    // Planner.
    h.client
        .reply_text(&plan_json(&[("step one", None, &[]), ("step two", None, &[])]));
    // Step one: two deficient iterations, satisfied on the third.
    for iteration in 1..=3 {
        h.client.reply_text(&format!("attempt {} output", iteration));
        h.client.reply_text("critique of the attempt");
        h.client.reply_text(&decision(iteration < 3));
    }
    // Step two: satisfied immediately.
    h.client.reply_text("step two output");
    h.client.reply_text("critique: fine");
    h.client.reply_text(&decision(false));

    let outcome = h.orchestrator.run("do the work").await.unwrap();
    assert_eq!(outcome.status, AgentStatus::Success);
    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.steps[0].iterations, 3);
    assert_eq!(outcome.steps[0].termination, StepTermination::Satisfied);
    assert_eq!(outcome.steps[0].output, "attempt 3 output");
    assert_eq!(outcome.steps[1].iterations, 1);
    assert_eq!(outcome.steps[1].termination, StepTermination::Satisfied);

    // Three executor invocations for step one, each bracketed by
    // orchestrator_agent events.
    let executor_starts: Vec<_> = h
        .recorder
        .payloads(EventType::OrchestratorAgentStart)
        .into_iter()
        .filter(|p| p["agent"] == "executor" && p["step_index"] == 0)
        .collect();
    assert_eq!(executor_starts.len(), 3);

    // The conditional decisions all surfaced as orchestrator_agent_end.
    let decisions: Vec<_> = h
        .recorder
        .payloads(EventType::OrchestratorAgentEnd)
        .into_iter()
        .filter(|p| p["agent"] == "conditional")
        .collect();
    assert_eq!(decisions.len(), 4);

    let titles = h.recorder.payloads(EventType::TodoStepsExtracted);
    assert_eq!(
        titles[0]["steps"],
        serde_json::json!(["step one", "step two"])
    );
}

#[tokio::test]
async fn test_iteration_cap_bounds_the_refinement_loop() {
    let h = harness(|s| s.parallelize_independent = false).await;

    h.client.reply_text(&plan_json(&[("only step", None, &[])]));
    // The conditional always demands another round.
    for _ in 0..3 {
        h.client.reply_text("executor output");
        h.client.reply_text("critique");
        h.client.reply_text(&decision(true));
    }

    let outcome = h.orchestrator.run("never satisfied").await.unwrap();
    assert_eq!(outcome.steps[0].iterations, 3);
    assert_eq!(outcome.steps[0].termination, StepTermination::IterationCap);
}

#[tokio::test]
async fn test_independent_steps_are_selected_for_parallel_dispatch() {
    let h = harness(|_| {}).await;

    h.client.reply_text(&plan_json(&[
        ("gather alpha", None, &["alpha.md"]),
        ("gather beta", None, &["beta.md"]),
    ]));
    // Both steps run concurrently; every remaining reply doubles as executor
    // output, critique text, and a parsable "no further iteration" decision.
    for _ in 0..6 {
        h.client.reply_text(&decision(false));
    }

    let outcome = h.orchestrator.run("gather things").await.unwrap();
    assert_eq!(outcome.steps.len(), 2);

    let selections = h.recorder.payloads(EventType::IndependentStepsSelected);
    assert_eq!(selections.len(), 1);
    assert_eq!(
        selections[0]["steps"],
        serde_json::json!(["gather alpha", "gather beta"])
    );
}

#[tokio::test]
async fn test_context_artifacts_flow_between_steps() {
    let h = harness(|s| s.parallelize_independent = true).await;

    h.client.reply_text(&plan_json(&[
        ("produce notes", Some("notes.md"), &[]),
        ("use notes", None, &["notes.md"]),
    ]));
    // Step one.
    h.client.reply_text("alpha notes content");
    h.client.reply_text("critique: fine");
    h.client.reply_text(&decision(false));
    // Step two.
    h.client.reply_text("summary built from notes");
    h.client.reply_text("critique: fine");
    h.client.reply_text(&decision(false));

    let outcome = h.orchestrator.run("notes pipeline").await.unwrap();
    assert_eq!(outcome.status, AgentStatus::Success);

    // The artifact was written under the workspace.
    let artifact = h.workspace.path().join("workspace").join("notes.md");
    assert_eq!(
        std::fs::read_to_string(artifact).unwrap(),
        "alpha notes content"
    );

    // The dependent executor saw the artifact in its seed context.
    let seen = h.client.seen.lock().unwrap();
    let saw_artifact = seen.iter().any(|messages| {
        messages.iter().any(|m| {
            m.content.contains("Context artifact 'notes.md'")
                && m.content.contains("alpha notes content")
        })
    });
    assert!(saw_artifact);

    // Dependent steps never batch with their producers.
    assert_eq!(h.recorder.count(EventType::IndependentStepsSelected), 0);
}

#[tokio::test]
async fn test_planner_schema_violation_surfaces_orchestrator_error() {
    let h = harness(|_| {}).await;

    // The planner returns unusable JSON three times (initial + 2 retries).
    for _ in 0..3 {
        h.client.reply_text("{\"steps\": \"not a list\"}");
    }

    let err = h.orchestrator.run("plan this").await.unwrap_err();
    assert_eq!(err.kind, agentmesh::error::ErrorKind::SchemaViolation);
    assert_eq!(h.recorder.count(EventType::OrchestratorError), 1);
    assert_eq!(h.recorder.count(EventType::StructuredOutputError), 1);
}

#[test]
fn test_plan_round_trip_preserves_document() {
    let json = r#"{"steps":[{"title":"a","description":"do a","success_criteria":"ok","why":"w","context_dependencies":[],"context_output":"out.md"},{"title":"b","description":"do b","success_criteria":"ok","why":"w","context_dependencies":["out.md"]}]}"#;
    let plan = Plan::from_json(json).unwrap();
    assert_eq!(plan.to_json(), json);
}
