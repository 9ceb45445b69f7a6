//! Ephemeral response store backing notification deep links.
//!
//! Each notification stores its payload under a short random id so the chat
//! message can carry a link the viewer resolves later. Capacity and age
//! bounds are enforced lazily on save/get; entries are mirrored to disk so
//! a daemon restart does not invalidate links already sent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::GitChange;

/// Most responses kept at once; oldest evicted beyond this.
pub const MAX_STORED_RESPONSES: usize = 100;

/// Responses expire after a day.
pub const RESPONSE_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

const ID_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub id: String,
    pub project_name: String,
    pub response_summary: String,
    pub duration_ms: u64,
    pub git_changes: Vec<GitChange>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub model: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Payload as handed in by the dispatcher; id and timestamp are assigned on
/// save.
#[derive(Debug, Clone, Default)]
pub struct ResponsePayload {
    pub project_name: String,
    pub response_summary: String,
    pub duration_ms: u64,
    pub git_changes: Vec<GitChange>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub model: String,
}

pub struct ResponseCache {
    responses: Mutex<HashMap<String, StoredResponse>>,
    dir: PathBuf,
    max_entries: usize,
    expire: Duration,
}

impl ResponseCache {
    pub fn new(dir: PathBuf) -> Self {
        let cache = Self {
            responses: Mutex::new(HashMap::new()),
            dir,
            max_entries: MAX_STORED_RESPONSES,
            expire: RESPONSE_EXPIRE,
        };
        cache.load_from_disk();
        cache
    }

    #[cfg(test)]
    pub fn with_limits(dir: PathBuf, max_entries: usize, expire: Duration) -> Self {
        let cache = Self {
            responses: Mutex::new(HashMap::new()),
            dir,
            max_entries,
            expire,
        };
        cache.load_from_disk();
        cache
    }

    /// Store a payload and return its short id. Disk mirroring is
    /// best-effort; a failed write never fails the save.
    pub fn save(&self, payload: ResponsePayload) -> String {
        self.cleanup();

        let mut responses = self.responses.lock().unwrap();
        let mut id = short_id();
        while responses.contains_key(&id) {
            id = short_id();
        }

        let entry = StoredResponse {
            id: id.clone(),
            project_name: payload.project_name,
            response_summary: payload.response_summary,
            duration_ms: payload.duration_ms,
            git_changes: payload.git_changes,
            input_tokens: payload.input_tokens,
            output_tokens: payload.output_tokens,
            cache_creation_tokens: payload.cache_creation_tokens,
            cache_read_tokens: payload.cache_read_tokens,
            model: payload.model,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.mirror_to_disk(&entry);
        responses.insert(id.clone(), entry);
        id
    }

    /// Fetch by id, expiring lazily on read.
    pub fn get(&self, id: &str) -> Option<StoredResponse> {
        let mut responses = self.responses.lock().unwrap();
        let entry = responses.get(id)?;
        if self.is_expired(entry.timestamp) {
            responses.remove(id);
            self.remove_from_disk(id);
            return None;
        }
        Some(entry.clone())
    }

    /// Explicit removal path for the chat client's cleanup commands.
    #[allow(dead_code)]
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.responses.lock().unwrap().remove(id).is_some();
        if removed {
            self.remove_from_disk(id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, timestamp: i64) -> bool {
        let age_ms = Utc::now().timestamp_millis().saturating_sub(timestamp);
        age_ms >= 0 && (age_ms as u128) > self.expire.as_millis()
    }

    /// Expire by age, then evict oldest-by-timestamp until under capacity.
    fn cleanup(&self) {
        let mut responses = self.responses.lock().unwrap();

        let expired: Vec<String> = responses
            .values()
            .filter(|e| self.is_expired(e.timestamp))
            .map(|e| e.id.clone())
            .collect();
        for id in expired {
            responses.remove(&id);
            self.remove_from_disk(&id);
        }

        if responses.len() >= self.max_entries {
            let mut by_age: Vec<(String, i64)> = responses
                .values()
                .map(|e| (e.id.clone(), e.timestamp))
                .collect();
            by_age.sort_by_key(|(_, ts)| *ts);
            let excess = responses.len() + 1 - self.max_entries;
            for (id, _) in by_age.into_iter().take(excess) {
                debug!(id = %id, "evicting stored response at capacity");
                responses.remove(&id);
                self.remove_from_disk(&id);
            }
        }
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn mirror_to_disk(&self, entry: &StoredResponse) {
        // Write-then-rename so a crash mid-write never leaves a torn file
        // for the viewer endpoint to read.
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            let path = self.entry_path(&entry.id);
            let tmp = self.dir.join(format!("{}.json.tmp", entry.id));
            let json = serde_json::to_string(entry).map_err(std::io::Error::other)?;
            std::fs::write(&tmp, json)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600));
            }
            std::fs::rename(&tmp, &path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(id = %entry.id, error = %e, "failed to mirror response to disk");
        }
    }

    fn remove_from_disk(&self, id: &str) {
        let _ = std::fs::remove_file(self.entry_path(id));
    }

    /// Reload mirrored entries inside the expiry window; delete stale files
    /// rather than loading them.
    fn load_from_disk(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut responses = self.responses.lock().unwrap();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<StoredResponse>(&raw).ok());
            match parsed {
                Some(stored) if !stored.id.is_empty() && !self.is_expired(stored.timestamp) => {
                    responses.insert(stored.id.clone(), stored);
                }
                _ => {
                    debug!(path = %path.display(), "deleting stale response file");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..ID_LEN].to_string()
}
