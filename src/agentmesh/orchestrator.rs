//! Plan → execute → critique orchestration.
//!
//! The orchestrator composes three kinds of sub-agents under a refinement
//! loop:
//!
//! 1. **Planner** — produces an ordered [`Plan`] through the
//!    structured-output generator.
//! 2. **Executor** — one [`AgentLoop`] per step, wired to the configured
//!    servers; its events flow through a per-step
//!    [`ContextBridge`](crate::agentmesh::event::ContextBridge) into the
//!    parent timeline, tagged with phase, step index, iteration, and agent
//!    name.
//! 3. **Critic** — a sub-agent that receives the objective, the executor
//!    result, and the step context, and returns a critique.
//!
//! After each critic pass the conditional LM is asked whether the critique
//! warrants another iteration; `true` re-runs the executor with the critique
//! appended, up to `max_iterations` (default 3). Per-step termination is
//! always one of `satisfied`, `iteration_cap`, or `error`.
//!
//! Steps whose `context_dependencies` are syntactically disjoint may be
//! dispatched concurrently (an `independent_steps_selected` event names
//! them); dependent steps run strictly after their prerequisites. Each
//! step's `context_output` is written under the workspace directory and fed
//! to the steps that declare it as a dependency.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agentmesh::agent::{AgentLoop, AgentSettings, AgentStatus};
use crate::agentmesh::conditional::ConditionalLlm;
use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::event::{ContextBridge, ContextTags, EventBus, EventContext, EventType};
use crate::agentmesh::fallback::FallbackChain;
use crate::agentmesh::llm::Message;
use crate::agentmesh::prompt::{PromptAssembler, PromptMode};
use crate::agentmesh::registry::ToolCatalog;
use crate::agentmesh::spill::SpillStore;
use crate::agentmesh::structured::StructuredOutput;

/// Default bound on critic-gated refinement cycles per step.
pub const DEFAULT_MAX_ITERATIONS: usize = 3;

fn is_false(value: &bool) -> bool {
    !*value
}

/// One planned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Short step name.
    pub title: String,
    /// What the executor should do.
    pub description: String,
    /// How the critic judges completion.
    pub success_criteria: String,
    /// Why the step exists.
    pub why: String,
    /// Workspace paths this step consumes.
    #[serde(default)]
    pub context_dependencies: Vec<String>,
    /// Workspace path this step produces, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_output: Option<String>,
    /// Signals that indicate success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_patterns: Option<Vec<String>>,
    /// Signals that indicate failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_patterns: Option<Vec<String>>,
    /// A failing non-fatal step lets the orchestrator continue.
    #[serde(default, skip_serializing_if = "is_false")]
    pub non_fatal: bool,
}

/// An ordered plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Parse a plan document; invalid plans surface `schema_violation`.
    pub fn from_json(text: &str) -> Result<Self, MeshError> {
        serde_json::from_str(text)
            .map_err(|e| MeshError::with_source(ErrorKind::SchemaViolation, "invalid plan", e))
    }

    /// Serialize back to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("plan serialises")
    }

    /// The JSON Schema handed to the planner.
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": {"type": "string"},
                            "description": {"type": "string"},
                            "success_criteria": {"type": "string"},
                            "why": {"type": "string"},
                            "context_dependencies": {
                                "type": "array",
                                "items": {"type": "string"}
                            },
                            "context_output": {"type": "string"},
                            "success_patterns": {
                                "type": "array",
                                "items": {"type": "string"}
                            },
                            "failure_patterns": {
                                "type": "array",
                                "items": {"type": "string"}
                            },
                            "non_fatal": {"type": "boolean"}
                        },
                        "required": ["title", "description", "success_criteria", "why"]
                    }
                }
            },
            "required": ["steps"]
        })
    }
}

/// How a step's refinement loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTermination {
    /// The conditional LM declined another iteration.
    Satisfied,
    /// The loop hit `max_iterations` with the critique still unsatisfied.
    IterationCap,
    /// The executor or critic failed.
    Error,
}

impl StepTermination {
    /// Stable identifier used in logs and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepTermination::Satisfied => "satisfied",
            StepTermination::IterationCap => "iteration_cap",
            StepTermination::Error => "error",
        }
    }
}

/// One executed step.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// The step as planned.
    pub step: PlanStep,
    /// The executor's final output.
    pub output: String,
    /// The last critique, if a critic ran.
    pub critique: Option<String>,
    /// Refinement iterations consumed.
    pub iterations: usize,
    /// How the loop ended.
    pub termination: StepTermination,
}

/// The orchestrator's final product.
#[derive(Debug, Clone)]
pub struct OrchestratorOutcome {
    /// Concatenated report over all steps.
    pub report: String,
    /// Per-step results in plan order.
    pub steps: Vec<StepResult>,
    /// Terminal status.
    pub status: AgentStatus,
}

/// Knobs for one orchestration run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Bound on critic-gated refinement cycles per step.
    pub max_iterations: usize,
    /// Whether syntactically independent steps may run concurrently.
    pub parallelize_independent: bool,
    /// Directory receiving `context_output` artifacts.
    pub workspace_dir: PathBuf,
    /// Settings for executor and critic sub-agents.
    pub agent: AgentSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            parallelize_independent: true,
            workspace_dir: PathBuf::from("agentmesh_workspace"),
            agent: AgentSettings::default(),
        }
    }
}

/// The planner → executor → critic composition.
pub struct Orchestrator {
    llm: Arc<FallbackChain>,
    catalog: Arc<ToolCatalog>,
    spill: Arc<SpillStore>,
    bus: Arc<EventBus>,
    structured: Arc<StructuredOutput>,
    conditional: Arc<ConditionalLlm>,
    ctx: EventContext,
    cancel: CancellationToken,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Assemble an orchestrator for one run.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<FallbackChain>,
        catalog: Arc<ToolCatalog>,
        spill: Arc<SpillStore>,
        bus: Arc<EventBus>,
        structured: Arc<StructuredOutput>,
        conditional: Arc<ConditionalLlm>,
        ctx: EventContext,
        cancel: CancellationToken,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            llm,
            catalog,
            spill,
            bus,
            structured,
            conditional,
            ctx,
            cancel,
            settings,
        }
    }

    /// Run the full orchestration on `objective`.
    pub async fn run(&self, objective: &str) -> Result<OrchestratorOutcome, MeshError> {
        self.bus
            .emit(
                &self.ctx,
                EventType::OrchestratorStart,
                serde_json::json!({
                    "objective_preview": objective.chars().take(120).collect::<String>(),
                    "max_iterations": self.settings.max_iterations,
                }),
            )
            .await;

        if let Err(err) = std::fs::create_dir_all(&self.settings.workspace_dir) {
            let err = MeshError::with_source(ErrorKind::Unknown, "workspace dir", err);
            return Err(self.fail(err).await);
        }

        let plan = match self.plan(objective).await {
            Ok(plan) => plan,
            Err(err) => return Err(self.fail(err).await),
        };

        let mut results: Vec<StepResult> = Vec::with_capacity(plan.steps.len());
        let mut index = 0usize;

        while index < plan.steps.len() {
            if self.cancel.is_cancelled() {
                return Err(self.fail(MeshError::cancelled()).await);
            }

            let batch_end = if self.settings.parallelize_independent {
                independent_prefix(&plan.steps, index)
            } else {
                index + 1
            };

            if batch_end - index > 1 {
                let names: Vec<&str> = plan.steps[index..batch_end]
                    .iter()
                    .map(|s| s.title.as_str())
                    .collect();
                self.bus
                    .emit(
                        &self.ctx,
                        EventType::IndependentStepsSelected,
                        serde_json::json!({
                            "steps": names,
                            "from_index": index,
                            "to_index": batch_end - 1,
                        }),
                    )
                    .await;

                let futures = (index..batch_end)
                    .map(|i| self.run_step(objective, i, &plan.steps[i]));
                let batch_results = join_all(futures).await;
                for result in batch_results {
                    match result {
                        Ok(step_result) => results.push(step_result),
                        Err(err) => return Err(self.fail(err).await),
                    }
                }
            } else {
                match self.run_step(objective, index, &plan.steps[index]).await {
                    Ok(step_result) => results.push(step_result),
                    Err(err) => return Err(self.fail(err).await),
                }
            }
            index = batch_end;
        }

        for result in &results {
            log::info!(
                "step '{}' terminated after {} iteration(s): {}",
                result.step.title,
                result.iterations,
                result.termination.as_str()
            );
        }

        let report = results
            .iter()
            .map(|r| format!("## {}\n\n{}\n", r.step.title, r.output))
            .collect::<Vec<_>>()
            .join("\n");

        let status = if results
            .iter()
            .any(|r| r.termination == StepTermination::Error)
        {
            AgentStatus::Error
        } else {
            AgentStatus::Success
        };

        self.bus
            .emit(
                &self.ctx,
                EventType::OrchestratorEnd,
                serde_json::json!({
                    "status": status.as_str(),
                    "steps": results.len(),
                    "terminations": results
                        .iter()
                        .map(|r| r.termination.as_str())
                        .collect::<Vec<_>>(),
                }),
            )
            .await;

        Ok(OrchestratorOutcome {
            report,
            steps: results,
            status,
        })
    }

    /// Ask the planner for an ordered plan and announce the extracted steps.
    async fn plan(&self, objective: &str) -> Result<Plan, MeshError> {
        let prompt = format!(
            "Break the objective below into an ordered list of executable \
             steps. Each step needs a title, a description precise enough for \
             another agent to execute, success criteria, and a short why. \
             Declare context_output for steps whose result later steps need, \
             and context_dependencies naming those outputs.\n\nObjective: {}",
            objective
        );
        let plan: Plan = self
            .structured
            .generate(&self.ctx, &self.cancel, &prompt, &Plan::schema(), None)
            .await?;

        self.bus
            .emit(
                &self.ctx,
                EventType::TodoStepsExtracted,
                serde_json::json!({
                    "steps": plan.steps.iter().map(|s| s.title.clone()).collect::<Vec<_>>(),
                }),
            )
            .await;
        Ok(plan)
    }

    /// Run one step's executor/critic refinement loop.
    async fn run_step(
        &self,
        objective: &str,
        step_index: usize,
        step: &PlanStep,
    ) -> Result<StepResult, MeshError> {
        // Sub-agent events flow through a per-step bridge so concurrent steps
        // cannot stomp each other's tags.
        let bridge = Arc::new(ContextBridge::new(self.bus.clone()));
        let sub_bus = Arc::new(EventBus::new());
        sub_bus.register(bridge.clone());

        let dependency_context = self.load_dependencies(step);

        let mut previous_critique: Option<String> = None;
        let mut last_output = String::new();
        let mut last_critique: Option<String> = None;
        let mut iterations = 0usize;
        let mut termination = StepTermination::IterationCap;

        while iterations < self.settings.max_iterations {
            iterations += 1;

            bridge.set_tags(ContextTags {
                phase: "execution".to_string(),
                step_index: Some(step_index),
                iteration: Some(iterations),
                agent_name: Some("executor".to_string()),
            });

            let output = match self
                .run_executor(
                    objective,
                    step,
                    step_index,
                    iterations,
                    &dependency_context,
                    previous_critique.as_deref(),
                    &sub_bus,
                )
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    self.emit_agent_error("executor", step_index, iterations, &err)
                        .await;
                    if step.non_fatal {
                        termination = StepTermination::Error;
                        last_output = format!("step failed: {}", err.user_message());
                        break;
                    }
                    return Err(err);
                }
            };
            last_output = output;

            bridge.set_tags(ContextTags {
                phase: "critique".to_string(),
                step_index: Some(step_index),
                iteration: Some(iterations),
                agent_name: Some("critic".to_string()),
            });

            let critique = match self
                .run_critic(objective, step, step_index, iterations, &last_output, &sub_bus)
                .await
            {
                Ok(critique) => critique,
                Err(err) => {
                    self.emit_agent_error("critic", step_index, iterations, &err)
                        .await;
                    if step.non_fatal {
                        termination = StepTermination::Error;
                        break;
                    }
                    return Err(err);
                }
            };
            last_critique = Some(critique.clone());

            let decision = self
                .conditional
                .decide(
                    &self.ctx,
                    &self.cancel,
                    "Does this critique identify deficiencies that warrant \
                     another execution iteration?",
                    &format!(
                        "Step: {}\nSuccess criteria: {}\n\nCritique:\n{}",
                        step.title, step.success_criteria, critique
                    ),
                )
                .await?;

            if !decision.result {
                termination = StepTermination::Satisfied;
                break;
            }
            previous_critique = Some(critique);
        }

        if let Some(output_path) = &step.context_output {
            let path = self.settings.workspace_dir.join(output_path);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(err) = std::fs::write(&path, &last_output) {
                log::warn!("failed to write context artifact {:?}: {}", path, err);
            }
        }

        Ok(StepResult {
            step: step.clone(),
            output: last_output,
            critique: last_critique,
            iterations,
            termination,
        })
    }

    /// Run the executor sub-agent once.
    #[allow(clippy::too_many_arguments)]
    async fn run_executor(
        &self,
        objective: &str,
        step: &PlanStep,
        step_index: usize,
        iteration: usize,
        dependency_context: &[Message],
        previous_critique: Option<&str>,
        sub_bus: &Arc<EventBus>,
    ) -> Result<String, MeshError> {
        self.bus
            .emit(
                &self.ctx,
                EventType::OrchestratorAgentStart,
                serde_json::json!({
                    "agent": "executor",
                    "step_index": step_index,
                    "step": step.title,
                    "iteration": iteration,
                }),
            )
            .await;

        let mut instructions = format!(
            "You are executing one step of a larger plan.\n\
             Overall objective: {}\n\
             Step: {}\n\
             Description: {}\n\
             Success criteria: {}\n\
             Why this step: {}",
            objective, step.title, step.description, step.success_criteria, step.why
        );
        if let Some(critique) = previous_critique {
            instructions.push_str(&format!(
                "\n\nA previous attempt was critiqued as follows; address every \
                 point:\n{}",
                critique
            ));
        }

        let system_prompt = PromptAssembler::new(PromptMode::General)
            .with_virtual_tools()
            .with_extra_instructions(instructions)
            .render();

        let executor = AgentLoop::new(
            self.llm.clone(),
            self.catalog.clone(),
            self.spill.clone(),
            sub_bus.clone(),
            self.ctx.child("executor"),
            self.cancel.child_token(),
            self.settings.agent.clone(),
            system_prompt,
        )
        .with_seed_messages(dependency_context.to_vec());

        let outcome = executor.run(&step.description).await?;

        self.bus
            .emit(
                &self.ctx,
                EventType::OrchestratorAgentEnd,
                serde_json::json!({
                    "agent": "executor",
                    "step_index": step_index,
                    "step": step.title,
                    "iteration": iteration,
                    "status": outcome.status.as_str(),
                    "tool_calls": outcome.tool_calls,
                }),
            )
            .await;

        Ok(outcome.final_text)
    }

    /// Run the critic sub-agent once.
    async fn run_critic(
        &self,
        objective: &str,
        step: &PlanStep,
        step_index: usize,
        iteration: usize,
        executor_output: &str,
        sub_bus: &Arc<EventBus>,
    ) -> Result<String, MeshError> {
        self.bus
            .emit(
                &self.ctx,
                EventType::OrchestratorAgentStart,
                serde_json::json!({
                    "agent": "critic",
                    "step_index": step_index,
                    "step": step.title,
                    "iteration": iteration,
                }),
            )
            .await;

        let system_prompt = PromptAssembler::new(PromptMode::General)
            .with_extra_instructions(
                "You are a critic. Evaluate whether the executor's result \
                 satisfies the step's success criteria. List concrete \
                 deficiencies, or state clearly that the result is \
                 satisfactory.",
            )
            .render();

        let mut critic_settings = self.settings.agent.clone();
        critic_settings.max_turns = 1;

        let critic = AgentLoop::new(
            self.llm.clone(),
            self.catalog.clone(),
            self.spill.clone(),
            sub_bus.clone(),
            self.ctx.child("critic"),
            self.cancel.child_token(),
            critic_settings,
            system_prompt,
        );

        let prompt = format!(
            "Objective: {}\nStep: {}\nSuccess criteria: {}\n\nExecutor \
             result:\n{}",
            objective, step.title, step.success_criteria, executor_output
        );
        let outcome = critic.run(&prompt).await?;

        self.bus
            .emit(
                &self.ctx,
                EventType::OrchestratorAgentEnd,
                serde_json::json!({
                    "agent": "critic",
                    "step_index": step_index,
                    "step": step.title,
                    "iteration": iteration,
                    "status": outcome.status.as_str(),
                }),
            )
            .await;

        Ok(outcome.final_text)
    }

    /// Read the workspace artifacts a step depends on into seed messages.
    fn load_dependencies(&self, step: &PlanStep) -> Vec<Message> {
        let mut messages = Vec::new();
        for dependency in &step.context_dependencies {
            let path = self.settings.workspace_dir.join(dependency);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    messages.push(Message::user(format!(
                        "Context artifact '{}':\n{}",
                        dependency, content
                    )));
                }
                Err(err) => {
                    log::warn!("context dependency {:?} unavailable: {}", path, err);
                }
            }
        }
        messages
    }

    async fn emit_agent_error(
        &self,
        agent: &str,
        step_index: usize,
        iteration: usize,
        err: &MeshError,
    ) {
        self.bus
            .emit(
                &self.ctx,
                EventType::OrchestratorAgentError,
                serde_json::json!({
                    "agent": agent,
                    "step_index": step_index,
                    "iteration": iteration,
                    "error_kind": err.kind.as_str(),
                    "error": err.to_string(),
                }),
            )
            .await;
    }

    async fn fail(&self, err: MeshError) -> MeshError {
        self.bus
            .emit(
                &self.ctx,
                EventType::OrchestratorError,
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
                EventType::OrchestratorEnd,
                serde_json::json!({
                    "status": if err.kind == ErrorKind::Cancelled { "cancelled" } else { "error" },
                }),
            )
            .await;
        err
    }
}

/// Find the end of the maximal batch starting at `from` whose steps are
/// mutually independent: pairwise disjoint `context_dependencies`, and no
/// member depending on another member's `context_output`.
fn independent_prefix(steps: &[PlanStep], from: usize) -> usize {
    let mut end = from + 1;
    let mut seen_deps: HashSet<&str> = steps[from]
        .context_dependencies
        .iter()
        .map(|s| s.as_str())
        .collect();
    let mut seen_outputs: HashSet<&str> = steps[from]
        .context_output
        .iter()
        .map(|s| s.as_str())
        .collect();

    while end < steps.len() {
        let candidate = &steps[end];
        let candidate_deps: HashSet<&str> = candidate
            .context_dependencies
            .iter()
            .map(|s| s.as_str())
            .collect();

        let disjoint = candidate_deps.is_disjoint(&seen_deps);
        let independent = candidate_deps.iter().all(|d| !seen_outputs.contains(d));
        if !(disjoint && independent) {
            break;
        }

        seen_deps.extend(candidate_deps);
        if let Some(output) = &candidate.context_output {
            seen_outputs.insert(output.as_str());
        }
        end += 1;
    }
    end
}
