//! Namespaced tool catalogue and router.
//!
//! The catalogue merges the tool sets of all active servers, namespacing
//! every tool with its server prefix (`<server>/<tool>`), and registers the
//! locally executed virtual tools (spill readers, prompt/resource fetchers)
//! alongside them. It serves schemas to the LLM, routes calls back to the
//! owning server or virtual executor, and rejects calls whose arguments do
//! not satisfy the advertised JSON schema *before* anything is dispatched.
//!
//! Routing is deterministic: a qualified name maps to exactly one entry, and
//! degraded servers are left out of the snapshot entirely so the model never
//! sees their tools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::llm::ToolDefinition;
use crate::agentmesh::mcp::{McpPool, ToolOutcome};

/// A catalogued tool.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Unique `<server>/<tool>` name (bare name for virtual tools).
    pub qualified_name: String,
    /// Bare tool name as the owning server knows it.
    pub display_name: String,
    /// Description surfaced to the LLM.
    pub description: String,
    /// JSON Schema fragment for the arguments.
    pub schema: JsonValue,
    /// Owning server id; `"virtual"` for locally executed tools.
    pub server_id: String,
}

/// Where a catalogued tool executes.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolTarget {
    /// Dispatch to an MCP server: `(server_id, bare_name)`.
    Server(String, String),
    /// Execute locally through the registered [`VirtualToolExecutor`].
    Virtual,
}

/// Locally executed tools registered as first-class catalogue entries.
///
/// Implemented by the spill subsystem
/// ([`VirtualTools`](crate::agentmesh::spill::VirtualTools)).
#[async_trait]
pub trait VirtualToolExecutor: Send + Sync {
    /// The descriptors to merge into the catalogue.
    fn descriptors(&self) -> Vec<ToolDescriptor>;

    /// Execute one virtual tool.
    async fn execute(&self, name: &str, args: JsonValue) -> Result<ToolOutcome, MeshError>;
}

/// Enable/disable filters applied when building a catalogue snapshot.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    /// When set, only these servers contribute tools.
    pub enabled_servers: Option<Vec<String>>,
    /// When set, only these qualified names survive.
    pub enabled_tools: Option<Vec<String>>,
}

impl ToolFilter {
    fn server_enabled(&self, server_id: &str) -> bool {
        match &self.enabled_servers {
            Some(list) => list.iter().any(|s| s == server_id),
            None => true,
        }
    }

    fn tool_enabled(&self, qualified: &str) -> bool {
        match &self.enabled_tools {
            Some(list) => list.iter().any(|t| t == qualified),
            None => true,
        }
    }
}

struct CatalogEntry {
    descriptor: ToolDescriptor,
    target: ToolTarget,
    validator: Option<Arc<jsonschema::Validator>>,
}

/// Immutable catalogue snapshot used for one agent run.
pub struct ToolCatalog {
    pool: Arc<McpPool>,
    entries: HashMap<String, CatalogEntry>,
    order: Vec<String>,
    virtual_executor: Option<Arc<dyn VirtualToolExecutor>>,
}

impl ToolCatalog {
    /// Build a snapshot from the pool's current discoveries, applying the
    /// filters and merging in the virtual tools.
    ///
    /// Degraded servers and servers whose discovery fails are skipped (with a
    /// warning) rather than failing the build; one dead server must not take
    /// the whole session down.
    pub async fn build(
        pool: Arc<McpPool>,
        filter: &ToolFilter,
        virtual_executor: Option<Arc<dyn VirtualToolExecutor>>,
    ) -> Result<Self, MeshError> {
        let mut entries = HashMap::new();
        let mut order = Vec::new();

        for server_id in pool.server_ids() {
            if !filter.server_enabled(&server_id) {
                continue;
            }
            let client = pool.client(&server_id)?;
            if client.is_degraded() {
                log::warn!("skipping degraded server '{}'", server_id);
                continue;
            }
            let tools = match client.list_tools().await {
                Ok(tools) => tools,
                Err(err) => {
                    log::warn!("discovery failed for '{}': {}", server_id, err);
                    continue;
                }
            };

            for tool in tools {
                let qualified = format!("{}/{}", server_id, tool.name);
                if !filter.tool_enabled(&qualified) {
                    continue;
                }
                let descriptor = ToolDescriptor {
                    qualified_name: qualified.clone(),
                    display_name: tool.name.clone(),
                    description: tool.description.clone(),
                    schema: tool.input_schema.clone(),
                    server_id: server_id.clone(),
                };
                let validator = compile_validator(&qualified, &tool.input_schema);
                order.push(qualified.clone());
                entries.insert(
                    qualified,
                    CatalogEntry {
                        descriptor,
                        target: ToolTarget::Server(server_id.clone(), tool.name),
                        validator,
                    },
                );
            }
        }

        if let Some(executor) = &virtual_executor {
            for descriptor in executor.descriptors() {
                let qualified = descriptor.qualified_name.clone();
                if !filter.tool_enabled(&qualified) {
                    continue;
                }
                let validator = compile_validator(&qualified, &descriptor.schema);
                order.push(qualified.clone());
                entries.insert(
                    qualified,
                    CatalogEntry {
                        descriptor,
                        target: ToolTarget::Virtual,
                        validator,
                    },
                );
            }
        }

        Ok(Self {
            pool,
            entries,
            order,
            virtual_executor,
        })
    }

    /// The schema set presented to the LLM, in stable declaration order.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| ToolDefinition {
                name: entry.descriptor.qualified_name.clone(),
                description: entry.descriptor.description.clone(),
                parameters_schema: entry.descriptor.schema.clone(),
            })
            .collect()
    }

    /// Catalogued descriptors in declaration order.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| &entry.descriptor)
            .collect()
    }

    /// Resolve a qualified name to its descriptor and target.
    pub fn route(&self, qualified: &str) -> Result<(&ToolDescriptor, &ToolTarget), MeshError> {
        self.entries
            .get(qualified)
            .map(|entry| (&entry.descriptor, &entry.target))
            .ok_or_else(|| {
                MeshError::new(
                    ErrorKind::ToolError,
                    format!("unknown tool '{}'", qualified),
                )
            })
    }

    /// Validate call arguments against the advertised schema.
    pub fn validate_args(&self, qualified: &str, args: &JsonValue) -> Result<(), MeshError> {
        let entry = self.entries.get(qualified).ok_or_else(|| {
            MeshError::new(
                ErrorKind::ToolError,
                format!("unknown tool '{}'", qualified),
            )
        })?;
        if let Some(validator) = &entry.validator {
            if let Err(err) = validator.validate(args) {
                return Err(MeshError::new(
                    ErrorKind::SchemaViolation,
                    format!("arguments for '{}' rejected: {}", qualified, err),
                ));
            }
        }
        Ok(())
    }

    /// Validate, route, and dispatch one tool call.
    ///
    /// Schema violations are rejected before anything reaches the server.
    pub async fn call(
        &self,
        qualified: &str,
        args: JsonValue,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, MeshError> {
        self.validate_args(qualified, &args)?;
        let (_, target) = self.route(qualified)?;

        match target {
            ToolTarget::Server(server_id, bare_name) => {
                let client = self.pool.client(server_id)?;
                client.call_tool(bare_name, args, timeout, cancel).await
            }
            ToolTarget::Virtual => {
                let executor = self.virtual_executor.as_ref().ok_or_else(|| {
                    MeshError::new(ErrorKind::ToolError, "no virtual executor registered")
                })?;
                executor.execute(qualified, args).await
            }
        }
    }
}

fn compile_validator(qualified: &str, schema: &JsonValue) -> Option<Arc<jsonschema::Validator>> {
    if !schema.is_object() {
        return None;
    }
    match jsonschema::validator_for(schema) {
        Ok(validator) => Some(Arc::new(validator)),
        Err(err) => {
            log::warn!("schema for '{}' does not compile: {}", qualified, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::config::MeshConfig;

    struct EchoVirtual;

    #[async_trait]
    impl VirtualToolExecutor for EchoVirtual {
        fn descriptors(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor {
                qualified_name: "echo_local".to_string(),
                display_name: "echo_local".to_string(),
                description: "Echo arguments back".to_string(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
                server_id: "virtual".to_string(),
            }]
        }

        async fn execute(&self, _name: &str, args: JsonValue) -> Result<ToolOutcome, MeshError> {
            Ok(ToolOutcome {
                content: args["text"].as_str().unwrap_or("").to_string(),
                structured: None,
                is_error: false,
            })
        }
    }

    async fn virtual_only_catalog() -> ToolCatalog {
        let pool = Arc::new(McpPool::new(Vec::new(), &MeshConfig::default()));
        ToolCatalog::build(pool, &ToolFilter::default(), Some(Arc::new(EchoVirtual)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_virtual_tools_are_first_class() {
        let catalog = virtual_only_catalog().await;
        let schemas = catalog.schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "echo_local");

        let (descriptor, target) = catalog.route("echo_local").unwrap();
        assert_eq!(descriptor.server_id, "virtual");
        assert_eq!(*target, ToolTarget::Virtual);
    }

    #[tokio::test]
    async fn test_schema_violation_rejected_before_dispatch() {
        let catalog = virtual_only_catalog().await;
        let err = catalog
            .validate_args("echo_local", &serde_json::json!({"text": 42}))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaViolation);

        let err = catalog
            .call(
                "echo_local",
                serde_json::json!({}),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaViolation);
    }

    #[tokio::test]
    async fn test_valid_call_dispatches() {
        let catalog = virtual_only_catalog().await;
        let outcome = catalog
            .call(
                "echo_local",
                serde_json::json!({"text": "hello"}),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.content, "hello");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_tool_error() {
        let catalog = virtual_only_catalog().await;
        let err = catalog.route("nope/also-nope").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolError);
    }

    #[tokio::test]
    async fn test_enabled_tools_filter() {
        let pool = Arc::new(McpPool::new(Vec::new(), &MeshConfig::default()));
        let filter = ToolFilter {
            enabled_servers: None,
            enabled_tools: Some(vec!["something_else".to_string()]),
        };
        let catalog = ToolCatalog::build(pool, &filter, Some(Arc::new(EchoVirtual)))
            .await
            .unwrap();
        assert!(catalog.schemas().is_empty());
    }
}
