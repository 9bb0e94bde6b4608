//! Cancellation and deadline propagation.
//!
//! A single [`CancellationToken`](tokio_util::sync::CancellationToken) threads
//! through every suspension point: LLM calls, tool dispatches, sub-agent
//! executions, and the overall run. Children are derived with
//! [`CancellationToken::child_token`] so cancelling a parent cancels the whole
//! subtree. Cancellation is cooperative — each component wraps its awaits in
//! [`run_with_deadline`] and never blocks past a cancel.
//!
//! Timeouts are per-component and carried in [`Deadlines`]; a timeout surfaces
//! as a classified [`MeshError`] (`llm_timeout`, `tool_timeout`, or the kind
//! supplied by the caller), never as a panic or a silent hang.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agentmesh::error::{ErrorKind, MeshError};

/// The per-component timeout set threaded through a run.
///
/// Defaults mirror [`MeshConfig`](crate::agentmesh::config::MeshConfig):
/// 600 s overall, 120 s per LLM call, 60 s per tool call, 300 s per
/// sub-agent.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    /// Hard bound on the whole run.
    pub overall: Duration,
    /// Bound on a single LLM round-trip.
    pub llm_call: Duration,
    /// Bound on a single tool dispatch.
    pub tool_call: Duration,
    /// Bound on one orchestrator sub-agent execution.
    pub sub_agent: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            overall: Duration::from_secs(600),
            llm_call: Duration::from_secs(120),
            tool_call: Duration::from_secs(60),
            sub_agent: Duration::from_secs(300),
        }
    }
}

/// Await `fut`, bounded by `timeout` and by `cancel`.
///
/// Returns the future's own result when it finishes in time; a
/// [`MeshError`] with `timeout_kind` when the deadline elapses first; and
/// [`ErrorKind::Cancelled`] when the token fires first. The losing future is
/// dropped, which is what makes cancellation cooperative: all suspension
/// points in this crate live inside such a wrapper.
pub async fn run_with_deadline<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    timeout_kind: ErrorKind,
    fut: F,
) -> Result<T, MeshError>
where
    F: Future<Output = Result<T, MeshError>>,
{
    if cancel.is_cancelled() {
        return Err(MeshError::cancelled());
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(MeshError::cancelled()),
        outcome = tokio::time::timeout(timeout, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(MeshError::new(
                timeout_kind,
                format!("deadline of {:?} elapsed", timeout),
            )),
        },
    }
}
