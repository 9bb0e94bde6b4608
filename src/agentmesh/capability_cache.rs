//! On-disk cache for MCP capability discovery.
//!
//! Discovery results are cached per `(server_id, endpoint)` so that process
//! restarts do not re-probe every configured server. Entries older than the
//! configured TTL (default 30 minutes) are ignored on load and rewritten on
//! the next successful probe. Fingerprints are never used to skip tool
//! invocations — tools are always called.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::agentmesh::mcp::Discovery;

/// File-backed capability cache.
pub struct CapabilityCache {
    dir: PathBuf,
    ttl: Duration,
}

impl CapabilityCache {
    /// Open (creating if necessary) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, ttl })
    }

    fn entry_path(&self, server_id: &str, endpoint: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(server_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(endpoint.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.dir.join(format!("{}.json", &digest[..32]))
    }

    /// Load a cached discovery if present and still within TTL.
    pub fn load(&self, server_id: &str, endpoint: &str) -> Option<Discovery> {
        let path = self.entry_path(server_id, endpoint);
        let text = std::fs::read_to_string(path).ok()?;
        let discovery: Discovery = serde_json::from_str(&text).ok()?;
        let age = Utc::now().signed_duration_since(discovery.fetched_at);
        if age.to_std().ok()? <= self.ttl {
            Some(discovery)
        } else {
            None
        }
    }

    /// Persist a discovery snapshot. Failures are logged, never surfaced —
    /// the cache is an optimization.
    pub fn store(&self, server_id: &str, endpoint: &str, discovery: &Discovery) {
        let path = self.entry_path(server_id, endpoint);
        match serde_json::to_string(discovery) {
            Ok(text) => {
                if let Err(err) = std::fs::write(&path, text) {
                    log::warn!("capability cache write failed for {}: {}", server_id, err);
                }
            }
            Err(err) => log::warn!("capability cache serialise failed: {}", err),
        }
    }
}
