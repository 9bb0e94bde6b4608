// src/lib.rs

// Import the top-level `agentmesh` module.
pub mod agentmesh;

// Re-export the submodules at the crate root so callers write
// `agentmesh::clients::openai::OpenAiClient` rather than navigating the
// whole hierarchy.
pub use agentmesh::{
    agent, cancel, capability_cache, clients, conditional, config, error, event, event_store,
    fallback, llm, mcp, observer, orchestrator, prompt, registry, session, spill, structured,
    transport,
};

// Re-exporting key items for easier external access.
pub use agentmesh::agent::{AgentLoop, AgentMode, AgentOutcome, AgentSettings, AgentStatus};
pub use agentmesh::config::MeshConfig;
pub use agentmesh::error::{ErrorKind, MeshError};
pub use agentmesh::event::{Event, EventBus, EventContext, EventType};
pub use agentmesh::llm::{LlmClient, Message, Role};
pub use agentmesh::mcp::{McpPool, ServerConfig, ServersDocument};
pub use agentmesh::orchestrator::Orchestrator;
pub use agentmesh::session::SessionManager;
