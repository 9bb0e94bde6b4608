//! Large-output spill and its virtual tools.
//!
//! Tool results at or above the configured threshold (default 1000 bytes)
//! are written to the session's spill directory and replaced, in the
//! conversation, by a small reference envelope:
//!
//! ```json
//! {"spilled": true, "path": "...", "length": 2048, "mime": "application/json",
//!  "hint": "use read_large_output / search_large_output / query_large_output"}
//! ```
//!
//! The model then works with the artifact through the virtual tools, which
//! are registered as first-class catalogue entries and executed locally:
//!
//! - `read_large_output(path, offset, length)` — bounded, UTF-8-safe slice.
//! - `search_large_output(path, pattern, max_matches)` — regex scan with
//!   line context, bounded result count.
//! - `query_large_output(path, query)` — a jq-style path/`length`/`keys`
//!   query, JSON artifacts only.
//! - `get_prompt(server, name)` / `get_resource(server, uri)` — pass-through
//!   fetches from the MCP pool.
//!
//! Spill files are content-addressed by a fingerprint of
//! `(tool_name, normalized_args)`, so re-running the same call within a
//! session reuses the same file, and two concurrent identical spills
//! coalesce after the final rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::mcp::{McpPool, ToolOutcome};
use crate::agentmesh::registry::{ToolDescriptor, VirtualToolExecutor};

/// Bookkeeping for one spilled artifact.
#[derive(Debug, Clone)]
pub struct SpillRecord {
    /// Stable hash of `(tool_name, normalized_args)`.
    pub fingerprint: String,
    /// Where the artifact lives.
    pub path: PathBuf,
    /// Size in bytes.
    pub byte_length: usize,
    /// `application/json` or `text/plain`.
    pub mime: String,
    /// Creation time, used by the age sweeper.
    pub created_at: DateTime<Utc>,
    /// Qualified name of the tool that produced the output.
    pub tool_name: String,
}

/// The envelope substituted into the conversation in place of raw bytes.
pub fn envelope_for(record: &SpillRecord) -> String {
    serde_json::json!({
        "spilled": true,
        "path": record.path.to_string_lossy(),
        "length": record.byte_length,
        "mime": record.mime,
        "hint": "use read_large_output / search_large_output / query_large_output",
    })
    .to_string()
}

/// Session-scoped spill storage.
pub struct SpillStore {
    dir: PathBuf,
    threshold: usize,
    records: Mutex<HashMap<String, SpillRecord>>,
}

impl SpillStore {
    /// Open (creating if necessary) a spill directory.
    pub fn open(dir: impl Into<PathBuf>, threshold: usize) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            threshold,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// The spill threshold in bytes.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The spill directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic fingerprint of `(tool_name, normalized_args)`.
    ///
    /// `serde_json` serialises object keys in sorted order, which makes the
    /// serialisation canonical for equal values regardless of insertion
    /// order.
    pub fn fingerprint(tool_name: &str, args: &JsonValue) -> String {
        let normalized = serde_json::to_string(args).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(tool_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(normalized.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    /// Spill `content` if it meets the threshold.
    ///
    /// Returns `None` when the output is small enough to stay inline.
    /// Identical re-runs (same fingerprint) reuse the existing file.
    pub fn maybe_spill(
        &self,
        tool_name: &str,
        args: &JsonValue,
        content: &str,
    ) -> Result<Option<SpillRecord>, MeshError> {
        if content.len() < self.threshold {
            return Ok(None);
        }

        let fingerprint = Self::fingerprint(tool_name, args);
        if let Some(existing) = self.records.lock().expect("records poisoned").get(&fingerprint) {
            return Ok(Some(existing.clone()));
        }

        let is_json = serde_json::from_str::<JsonValue>(content).is_ok();
        let (mime, ext) = if is_json {
            ("application/json", "json")
        } else {
            ("text/plain", "txt")
        };

        let safe_tool = tool_name.replace(['/', '\\'], "_");
        let file_name = format!("{}_{}.{}", safe_tool, fingerprint, ext);
        let path = self.dir.join(&file_name);

        if !path.exists() {
            // Write-then-rename so concurrent identical spills coalesce on
            // the final name instead of interleaving.
            let tmp = self
                .dir
                .join(format!(".{}.{}", file_name, uuid::Uuid::new_v4().simple()));
            std::fs::write(&tmp, content)?;
            std::fs::rename(&tmp, &path)?;
        }

        let record = SpillRecord {
            fingerprint: fingerprint.clone(),
            path,
            byte_length: content.len(),
            mime: mime.to_string(),
            created_at: Utc::now(),
            tool_name: tool_name.to_string(),
        };
        self.records
            .lock()
            .expect("records poisoned")
            .insert(fingerprint, record.clone());
        Ok(Some(record))
    }

    /// Reject paths outside the spill directory.
    fn resolve(&self, path: &str) -> Result<PathBuf, MeshError> {
        let candidate = Path::new(path);
        let canonical = candidate
            .canonicalize()
            .map_err(|e| MeshError::with_source(ErrorKind::ToolError, "no such artifact", e))?;
        let root = self
            .dir
            .canonicalize()
            .map_err(|e| MeshError::with_source(ErrorKind::ToolError, "spill dir missing", e))?;
        if !canonical.starts_with(&root) {
            return Err(MeshError::new(
                ErrorKind::ToolError,
                "path is outside the session spill directory",
            ));
        }
        Ok(canonical)
    }

    /// Bounded, UTF-8-safe slice of an artifact: `length` characters starting
    /// at character `offset`.
    pub fn read_slice(&self, path: &str, offset: usize, length: usize) -> Result<String, MeshError> {
        let path = self.resolve(path)?;
        let content = std::fs::read_to_string(path)?;
        Ok(content.chars().skip(offset).take(length).collect())
    }

    /// Regex scan with one line of context per match, bounded by
    /// `max_matches`.
    pub fn search(
        &self,
        path: &str,
        pattern: &str,
        max_matches: usize,
    ) -> Result<Vec<SearchMatch>, MeshError> {
        let path = self.resolve(path)?;
        let re = regex::Regex::new(pattern).map_err(|e| {
            MeshError::with_source(ErrorKind::ToolError, "invalid search pattern", e)
        })?;
        let content = std::fs::read_to_string(path)?;

        let mut matches = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if matches.len() >= max_matches {
                break;
            }
            if re.is_match(line) {
                matches.push(SearchMatch {
                    line: index + 1,
                    context: line.to_string(),
                });
            }
        }
        Ok(matches)
    }

    /// Evaluate a jq-style query against a JSON artifact.
    pub fn query(&self, path: &str, query: &str) -> Result<JsonValue, MeshError> {
        let resolved = self.resolve(path)?;
        let mime_is_json = {
            let records = self.records.lock().expect("records poisoned");
            records
                .values()
                .find(|r| r.path == resolved)
                .map(|r| r.mime == "application/json")
                // Unknown paths inside the dir fall back to the extension.
                .unwrap_or_else(|| {
                    resolved
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| e == "json")
                        .unwrap_or(false)
                })
        };
        if !mime_is_json {
            return Err(MeshError::new(
                ErrorKind::ToolError,
                "query_large_output only works on JSON artifacts",
            ));
        }
        let content = std::fs::read_to_string(resolved)?;
        let value: JsonValue = serde_json::from_str(&content)?;
        eval_query(&value, query)
    }

    /// Delete artifacts older than `age`. Returns how many were removed.
    pub fn sweep_older_than(&self, age: std::time::Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut records = self.records.lock().expect("records poisoned");
        let stale: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.created_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(record) = records.remove(key) {
                let _ = std::fs::remove_file(&record.path);
            }
        }
        stale.len()
    }

    /// Delete everything; called on session close.
    pub fn clear(&self) {
        let mut records = self.records.lock().expect("records poisoned");
        for (_, record) in records.drain() {
            let _ = std::fs::remove_file(&record.path);
        }
        let _ = std::fs::remove_dir(&self.dir);
    }
}

/// One `search_large_output` hit.
#[derive(Debug, Clone)]
pub struct SearchMatch {
    /// 1-based line number.
    pub line: usize,
    /// The matching line.
    pub context: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// jq-style query subset
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluate a pipeline of stages separated by `|`.
///
/// Supported stages: identity (`.`), field paths with indexing
/// (`.items[0].name`), `length`, `keys`, and `type`. This covers the
/// navigation queries models actually issue against spilled artifacts
/// without pulling in a full jq engine.
fn eval_query(value: &JsonValue, query: &str) -> Result<JsonValue, MeshError> {
    let mut current = value.clone();
    for stage in query.split('|') {
        let stage = stage.trim();
        current = eval_stage(&current, stage)?;
    }
    Ok(current)
}

fn eval_stage(value: &JsonValue, stage: &str) -> Result<JsonValue, MeshError> {
    match stage {
        "" | "." => Ok(value.clone()),
        "length" => match value {
            JsonValue::Array(items) => Ok(JsonValue::from(items.len())),
            JsonValue::Object(map) => Ok(JsonValue::from(map.len())),
            JsonValue::String(s) => Ok(JsonValue::from(s.chars().count())),
            JsonValue::Null => Ok(JsonValue::from(0)),
            _ => Err(query_error(stage, "length expects an array, object, or string")),
        },
        "keys" => match value {
            JsonValue::Object(map) => {
                let mut keys: Vec<String> = map.keys().cloned().collect();
                keys.sort();
                Ok(serde_json::json!(keys))
            }
            _ => Err(query_error(stage, "keys expects an object")),
        },
        "type" => {
            let name = match value {
                JsonValue::Null => "null",
                JsonValue::Bool(_) => "boolean",
                JsonValue::Number(_) => "number",
                JsonValue::String(_) => "string",
                JsonValue::Array(_) => "array",
                JsonValue::Object(_) => "object",
            };
            Ok(JsonValue::from(name))
        }
        path if path.starts_with('.') => eval_path(value, path),
        other => Err(query_error(other, "unsupported stage")),
    }
}

fn eval_path(value: &JsonValue, path: &str) -> Result<JsonValue, MeshError> {
    let mut current = value.clone();
    for segment in path.trim_start_matches('.').split('.') {
        if segment.is_empty() {
            continue;
        }
        let (field, indices) = parse_segment(segment)?;
        if !field.is_empty() {
            current = current
                .get(&field)
                .cloned()
                .unwrap_or(JsonValue::Null);
        }
        for index in indices {
            current = current
                .get(index)
                .cloned()
                .unwrap_or(JsonValue::Null);
        }
    }
    Ok(current)
}

/// Split `items[0][1]` into `("items", [0, 1])`.
fn parse_segment(segment: &str) -> Result<(String, Vec<usize>), MeshError> {
    let mut field = String::new();
    let mut indices = Vec::new();
    let mut rest = segment;

    if let Some(bracket) = rest.find('[') {
        field.push_str(&rest[..bracket]);
        rest = &rest[bracket..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| query_error(segment, "unclosed index"))?;
            let index: usize = stripped[..close]
                .parse()
                .map_err(|_| query_error(segment, "index must be a non-negative integer"))?;
            indices.push(index);
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return Err(query_error(segment, "trailing characters after index"));
        }
    } else {
        field.push_str(rest);
    }

    Ok((field, indices))
}

fn query_error(stage: &str, reason: &str) -> MeshError {
    MeshError::new(
        ErrorKind::ToolError,
        format!("query stage '{}': {}", stage, reason),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Virtual tools
// ─────────────────────────────────────────────────────────────────────────────

/// The locally executed virtual tool set backed by a [`SpillStore`] and the
/// MCP pool.
pub struct VirtualTools {
    store: Arc<SpillStore>,
    pool: Arc<McpPool>,
}

impl VirtualTools {
    /// Wire the virtual tools to a store and pool.
    pub fn new(store: Arc<SpillStore>, pool: Arc<McpPool>) -> Self {
        Self { store, pool }
    }

    fn require_str<'a>(args: &'a JsonValue, key: &str) -> Result<&'a str, MeshError> {
        args.get(key).and_then(|v| v.as_str()).ok_or_else(|| {
            MeshError::new(
                ErrorKind::SchemaViolation,
                format!("missing string argument '{}'", key),
            )
        })
    }
}

#[async_trait]
impl VirtualToolExecutor for VirtualTools {
    fn descriptors(&self) -> Vec<ToolDescriptor> {
        let virtual_descriptor = |name: &str, description: &str, schema: JsonValue| ToolDescriptor {
            qualified_name: name.to_string(),
            display_name: name.to_string(),
            description: description.to_string(),
            schema,
            server_id: "virtual".to_string(),
        };

        vec![
            virtual_descriptor(
                "read_large_output",
                "Read a bounded slice of a spilled tool output.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "offset": {"type": "integer", "minimum": 0},
                        "length": {"type": "integer", "minimum": 1}
                    },
                    "required": ["path", "offset", "length"]
                }),
            ),
            virtual_descriptor(
                "search_large_output",
                "Regex-search a spilled tool output; returns matching lines.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "pattern": {"type": "string"},
                        "max_matches": {"type": "integer", "minimum": 1}
                    },
                    "required": ["path", "pattern"]
                }),
            ),
            virtual_descriptor(
                "query_large_output",
                "Run a jq-style query (paths, length, keys) against a spilled JSON output.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "query": {"type": "string"}
                    },
                    "required": ["path", "query"]
                }),
            ),
            virtual_descriptor(
                "get_prompt",
                "Fetch the full text of a prompt hosted on an MCP server.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string"},
                        "name": {"type": "string"}
                    },
                    "required": ["server", "name"]
                }),
            ),
            virtual_descriptor(
                "get_resource",
                "Fetch the full content of a resource hosted on an MCP server.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string"},
                        "uri": {"type": "string"}
                    },
                    "required": ["server", "uri"]
                }),
            ),
        ]
    }

    async fn execute(&self, name: &str, args: JsonValue) -> Result<ToolOutcome, MeshError> {
        let text_outcome = |content: String| ToolOutcome {
            content,
            structured: None,
            is_error: false,
        };

        match name {
            "read_large_output" => {
                let path = Self::require_str(&args, "path")?;
                let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let length = args
                    .get("length")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(4096) as usize;
                Ok(text_outcome(self.store.read_slice(path, offset, length)?))
            }
            "search_large_output" => {
                let path = Self::require_str(&args, "path")?;
                let pattern = Self::require_str(&args, "pattern")?;
                let max_matches = args
                    .get("max_matches")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(20) as usize;
                let matches = self.store.search(path, pattern, max_matches)?;
                let rendered: Vec<JsonValue> = matches
                    .iter()
                    .map(|m| serde_json::json!({"line": m.line, "context": m.context}))
                    .collect();
                Ok(ToolOutcome {
                    content: serde_json::to_string(&rendered)?,
                    structured: Some(JsonValue::Array(rendered)),
                    is_error: false,
                })
            }
            "query_large_output" => {
                let path = Self::require_str(&args, "path")?;
                let query = Self::require_str(&args, "query")?;
                let value = self.store.query(path, query)?;
                Ok(ToolOutcome {
                    content: value.to_string(),
                    structured: Some(value),
                    is_error: false,
                })
            }
            "get_prompt" => {
                let server = Self::require_str(&args, "server")?;
                let prompt_name = Self::require_str(&args, "name")?;
                let client = self.pool.client(server)?;
                Ok(text_outcome(client.get_prompt(prompt_name, None).await?))
            }
            "get_resource" => {
                let server = Self::require_str(&args, "server")?;
                let uri = Self::require_str(&args, "uri")?;
                let client = self.pool.client(server)?;
                Ok(text_outcome(client.read_resource(uri).await?))
            }
            other => Err(MeshError::new(
                ErrorKind::ToolError,
                format!("unknown virtual tool '{}'", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_threshold(threshold: usize) -> (tempfile::TempDir, SpillStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::open(dir.path().join("spill"), threshold).unwrap();
        (dir, store)
    }

    #[test]
    fn test_small_output_stays_inline() {
        let (_guard, store) = store_with_threshold(1000);
        let spilled = store
            .maybe_spill("echo/say", &serde_json::json!({"text": "hi"}), "hi")
            .unwrap();
        assert!(spilled.is_none());
    }

    #[test]
    fn test_identical_reruns_reuse_the_same_file() {
        let (_guard, store) = store_with_threshold(10);
        let args = serde_json::json!({"q": "rust"});
        let first = store
            .maybe_spill("search/web", &args, "0123456789abcdef")
            .unwrap()
            .unwrap();
        let second = store
            .maybe_spill("search/web", &args, "0123456789abcdef")
            .unwrap()
            .unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = serde_json::json!({"a": 1, "b": 2});
        let b: JsonValue = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(
            SpillStore::fingerprint("tool", &a),
            SpillStore::fingerprint("tool", &b)
        );
    }

    #[test]
    fn test_read_slice_is_char_based() {
        let (_guard, store) = store_with_threshold(4);
        let content = "héllo wörld, this is spilled";
        let record = store
            .maybe_spill("t/x", &serde_json::json!({}), content)
            .unwrap()
            .unwrap();
        let slice = store
            .read_slice(&record.path.to_string_lossy(), 0, 5)
            .unwrap();
        assert_eq!(slice, "héllo");
    }

    #[test]
    fn test_path_outside_store_is_rejected() {
        let (_guard, store) = store_with_threshold(10);
        let err = store.read_slice("/etc/hostname", 0, 10).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolError);
    }

    #[test]
    fn test_query_pipeline() {
        let value = serde_json::json!({
            "items": [{"name": "a"}, {"name": "b"}, {"name": "c"}],
            "meta": {"page": 1}
        });
        assert_eq!(eval_query(&value, ".items | length").unwrap(), 3);
        assert_eq!(eval_query(&value, ".items[1].name").unwrap(), "b");
        assert_eq!(
            eval_query(&value, ".meta | keys").unwrap(),
            serde_json::json!(["page"])
        );
        assert_eq!(eval_query(&value, ".items | type").unwrap(), "array");
    }

    #[test]
    fn test_query_rejects_non_json() {
        let (_guard, store) = store_with_threshold(4);
        let record = store
            .maybe_spill("t/x", &serde_json::json!({}), "plain text artifact")
            .unwrap()
            .unwrap();
        let err = store
            .query(&record.path.to_string_lossy(), ".foo")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolError);
    }

    #[test]
    fn test_search_bounds_matches() {
        let (_guard, store) = store_with_threshold(4);
        let content = "match 1\nmiss\nmatch 2\nmatch 3\n";
        let record = store
            .maybe_spill("t/x", &serde_json::json!({}), content)
            .unwrap()
            .unwrap();
        let matches = store
            .search(&record.path.to_string_lossy(), "match", 2)
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].line, 1);
        assert_eq!(matches[1].line, 3);
    }
}
