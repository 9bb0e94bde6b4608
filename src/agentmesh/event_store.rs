//! Persistence listeners: SQLite event store and live-trace exporter.
//!
//! Both are pluggable [`EventListener`]s — the bus owns the timeline and
//! persistence is opt-in. The SQLite store appends one row per event and
//! maintains the session/preset/workflow tables the session driver reads;
//! the trace exporter batches events and ships them to a configured HTTP
//! endpoint without ever blocking an emit.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};

use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::event::{Event, EventListener};

/// Serialize an event for a row or an export batch.
fn event_to_json(event: &Event) -> serde_json::Value {
    serde_json::json!({
        "id": event.id,
        "timestamp": event.timestamp.to_rfc3339(),
        "event_type": event.event_type.as_str(),
        "session_id": event.session_id,
        "trace_id": event.trace_id,
        "span_id": event.span_id,
        "parent_id": event.parent_id,
        "hierarchy_level": event.hierarchy_level,
        "component": event.component,
        "payload": event.payload,
    })
}

/// SQLite-backed event store.
///
/// Writes are serialized behind a mutex; the store is a shared reader/writer
/// while the agent loop remains the exclusive writer of conversation state.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
    /// session_id → chat_sessions.id, cached to avoid a lookup per event.
    chat_ids: Mutex<HashMap<String, i64>>,
}

impl SqliteEventStore {
    /// Open (and migrate) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        let store = Self {
            conn: Mutex::new(conn),
            chat_ids: Mutex::new(HashMap::new()),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, MeshError> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        let store = Self {
            conn: Mutex::new(conn),
            chat_ids: Mutex::new(HashMap::new()),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), MeshError> {
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        // `selected_folder` is deprecated but stays present: SQLite builds
        // without DROP COLUMN support keep it, so nothing may rely on its
        // absence.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL,
                 chat_session_id INTEGER,
                 event_type TEXT NOT NULL,
                 timestamp TEXT NOT NULL,
                 event_data_json TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
             CREATE INDEX IF NOT EXISTS idx_events_chat_session ON events(chat_session_id);
             CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
             CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);

             CREATE TABLE IF NOT EXISTS chat_sessions (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL UNIQUE,
                 title TEXT,
                 agent_mode TEXT NOT NULL,
                 preset_query_id INTEGER,
                 created_at TEXT NOT NULL,
                 completed_at TEXT,
                 status TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS preset_queries (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 label TEXT NOT NULL,
                 query TEXT NOT NULL,
                 selected_servers_json TEXT NOT NULL,
                 selected_folder TEXT,
                 selected_tools_json TEXT,
                 agent_mode TEXT NOT NULL,
                 is_predefined INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS workflows (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 preset_query_id INTEGER NOT NULL,
                 workflow_status TEXT NOT NULL,
                 selected_options_json TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(sqlite_err)
    }

    /// Insert the chat-session row for a new session.
    pub fn create_chat_session(
        &self,
        session_id: &str,
        title: Option<&str>,
        agent_mode: &str,
        preset_query_id: Option<i64>,
    ) -> Result<i64, MeshError> {
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        conn.execute(
            "INSERT INTO chat_sessions
                 (session_id, title, agent_mode, preset_query_id, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'running')",
            params![
                session_id,
                title,
                agent_mode,
                preset_query_id,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(sqlite_err)?;
        let id = conn.last_insert_rowid();
        self.chat_ids
            .lock()
            .expect("chat id cache poisoned")
            .insert(session_id.to_string(), id);
        Ok(id)
    }

    /// Mark a chat session finished.
    pub fn complete_chat_session(&self, session_id: &str, status: &str) -> Result<(), MeshError> {
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        conn.execute(
            "UPDATE chat_sessions SET completed_at = ?1, status = ?2 WHERE session_id = ?3",
            params![Utc::now().to_rfc3339(), status, session_id],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Store a preset query; returns its id.
    pub fn create_preset_query(
        &self,
        label: &str,
        query: &str,
        selected_servers: &serde_json::Value,
        selected_tools: Option<&serde_json::Value>,
        agent_mode: &str,
        is_predefined: bool,
    ) -> Result<i64, MeshError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        conn.execute(
            "INSERT INTO preset_queries
                 (label, query, selected_servers_json, selected_tools_json,
                  agent_mode, is_predefined, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                label,
                query,
                selected_servers.to_string(),
                selected_tools.map(|v| v.to_string()),
                agent_mode,
                is_predefined as i64,
                now
            ],
        )
        .map_err(sqlite_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Create a workflow row bound to a preset query.
    pub fn create_workflow(
        &self,
        preset_query_id: i64,
        selected_options: Option<&serde_json::Value>,
    ) -> Result<i64, MeshError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        conn.execute(
            "INSERT INTO workflows
                 (preset_query_id, workflow_status, selected_options_json, created_at, updated_at)
             VALUES (?1, 'pending', ?2, ?3, ?3)",
            params![
                preset_query_id,
                selected_options.map(|v| v.to_string()),
                now
            ],
        )
        .map_err(sqlite_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Update a workflow's status.
    pub fn update_workflow_status(&self, workflow_id: i64, status: &str) -> Result<(), MeshError> {
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        conn.execute(
            "UPDATE workflows SET workflow_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, Utc::now().to_rfc3339(), workflow_id],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Count persisted events for a session (used by tests and diagnostics).
    pub fn count_events(&self, session_id: &str) -> Result<i64, MeshError> {
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        conn.query_row(
            "SELECT COUNT(*) FROM events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(sqlite_err)
    }

    /// Event types for a session in insertion order.
    pub fn event_types(&self, session_id: &str) -> Result<Vec<String>, MeshError> {
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        let mut stmt = conn
            .prepare("SELECT event_type FROM events WHERE session_id = ?1 ORDER BY id")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .map_err(sqlite_err)?;
        let mut types = Vec::new();
        for row in rows {
            types.push(row.map_err(sqlite_err)?);
        }
        Ok(types)
    }

    fn chat_id_for(&self, session_id: &str) -> Option<i64> {
        if let Some(id) = self
            .chat_ids
            .lock()
            .expect("chat id cache poisoned")
            .get(session_id)
        {
            return Some(*id);
        }
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        let id = conn
            .query_row(
                "SELECT id FROM chat_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get::<_, i64>(0),
            )
            .ok()?;
        self.chat_ids
            .lock()
            .expect("chat id cache poisoned")
            .insert(session_id.to_string(), id);
        Some(id)
    }
}

fn sqlite_err(err: rusqlite::Error) -> MeshError {
    MeshError::with_source(ErrorKind::Unknown, "sqlite error", err)
}

#[async_trait]
impl EventListener for SqliteEventStore {
    async fn on_event(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let chat_session_id = self.chat_id_for(&event.session_id);
        let conn = self.conn.lock().expect("sqlite conn poisoned");
        conn.execute(
            "INSERT INTO events
                 (session_id, chat_session_id, event_type, timestamp, event_data_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.session_id,
                chat_session_id,
                event.event_type.as_str(),
                event.timestamp.to_rfc3339(),
                event_to_json(event).to_string()
            ],
        )?;
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite_event_store"
    }
}

/// Buffered live-trace exporter.
///
/// Events accumulate in memory; full batches are shipped on a detached task
/// so an emit never waits on the network. Failed exports are logged and
/// forgotten.
pub struct TraceExporter {
    endpoint: String,
    api_key: Option<String>,
    batch_size: usize,
    buffer: Mutex<Vec<serde_json::Value>>,
    client: reqwest::Client,
}

impl TraceExporter {
    /// Create an exporter shipping to `endpoint` in batches of `batch_size`.
    pub fn new(endpoint: &str, api_key: Option<&str>, batch_size: usize) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.map(|k| k.to_string()),
            batch_size: batch_size.max(1),
            buffer: Mutex::new(Vec::new()),
            client: crate::agentmesh::clients::http_pool::get_shared_http_client().clone(),
        }
    }

    fn ship(&self, batch: Vec<serde_json::Value>) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            let mut request = client.post(&endpoint).json(&serde_json::json!({"events": batch}));
            if let Some(key) = api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }
            if let Err(err) = request.send().await {
                log::warn!("trace export failed: {}", err);
            }
        });
    }

    /// Ship whatever is buffered, regardless of batch size.
    pub fn flush(&self) {
        let batch: Vec<serde_json::Value> = {
            let mut buffer = self.buffer.lock().expect("trace buffer poisoned");
            buffer.drain(..).collect()
        };
        if !batch.is_empty() {
            self.ship(batch);
        }
    }
}

#[async_trait]
impl EventListener for TraceExporter {
    async fn on_event(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ready: Option<Vec<serde_json::Value>> = {
            let mut buffer = self.buffer.lock().expect("trace buffer poisoned");
            buffer.push(event_to_json(event));
            if buffer.len() >= self.batch_size {
                Some(buffer.drain(..).collect())
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            self.ship(batch);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "trace_exporter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::event::{EventBus, EventContext, EventType};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_events_are_appended_with_chat_session_id() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store
            .create_chat_session("s1", Some("demo"), "simple", None)
            .unwrap();

        let bus = EventBus::new();
        bus.register(store.clone());
        let ctx = EventContext::new("s1", "agent");
        bus.emit(&ctx, EventType::AgentStart, serde_json::json!({}))
            .await;
        bus.emit(&ctx, EventType::AgentEnd, serde_json::json!({}))
            .await;

        assert_eq!(store.count_events("s1").unwrap(), 2);
        assert_eq!(
            store.event_types("s1").unwrap(),
            vec!["agent_start".to_string(), "agent_end".to_string()]
        );
    }

    #[test]
    fn test_chat_session_lifecycle() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .create_chat_session("s1", None, "react", None)
            .unwrap();
        store.complete_chat_session("s1", "success").unwrap();

        let conn = store.conn.lock().unwrap();
        let (status, completed): (String, Option<String>) = conn
            .query_row(
                "SELECT status, completed_at FROM chat_sessions WHERE session_id = 's1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "success");
        assert!(completed.is_some());
    }

    #[test]
    fn test_preset_and_workflow_rows() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let preset_id = store
            .create_preset_query(
                "daily report",
                "summarize yesterday's issues",
                &serde_json::json!(["github"]),
                Some(&serde_json::json!(["github/list_issues"])),
                "orchestrator",
                true,
            )
            .unwrap();
        let workflow_id = store.create_workflow(preset_id, None).unwrap();
        store
            .update_workflow_status(workflow_id, "completed")
            .unwrap();

        let conn = store.conn.lock().unwrap();
        let status: String = conn
            .query_row(
                "SELECT workflow_status FROM workflows WHERE id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "completed");
    }
}
