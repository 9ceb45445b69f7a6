//! Session registry: one entry per live agent pane.
//!
//! In-memory table with disk persistence and periodic reconciliation against
//! the live tmux server. Two invariants hold across every mutation: at most
//! one session per terminal target, and at most `MAX_SESSIONS` entries with
//! least-recently-active eviction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::tmux::TerminalBridge;

/// Hard cap on tracked sessions.
pub const MAX_SESSIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Busy,
    Blocked,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub terminal_target: String,
    pub project: String,
    pub cwd: String,
    pub label: String,
    pub model: String,
    pub state: SessionState,
    pub last_activity: DateTime<Utc>,
}

/// On-disk form; `last_activity` stays a string so one bad entry never
/// poisons the whole file.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    session_id: String,
    terminal_target: String,
    project: String,
    cwd: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    model: String,
    state: SessionState,
    last_activity: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFile {
    sessions: Vec<PersistedSession>,
}

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ScanSummary {
    pub discovered: Vec<Session>,
    pub removed: Vec<Session>,
    pub total: usize,
    pub changed: bool,
}

#[derive(Debug)]
struct Inner {
    sessions: HashMap<String, Session>,
}

impl Inner {
    fn register(&mut self, session_id: &str, target: &str, project: &str, cwd: &str, label: &str) {
        if !target.is_empty() {
            // One session per pane: a new binding for the same target evicts
            // the stale one.
            let dupes: Vec<String> = self
                .sessions
                .iter()
                .filter(|(id, s)| s.terminal_target == target && id.as_str() != session_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in dupes {
                debug!(evicted = %id, target = target, "evicting duplicate target binding");
                self.sessions.remove(&id);
            }
        }

        if self.sessions.len() >= MAX_SESSIONS && !self.sessions.contains_key(session_id) {
            if let Some(oldest) = self
                .sessions
                .values()
                .min_by_key(|s| s.last_activity)
                .map(|s| s.session_id.clone())
            {
                debug!(evicted = %oldest, "registry full, evicting least-recently-active");
                self.sessions.remove(&oldest);
            }
        }

        self.sessions.insert(
            session_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                terminal_target: target.to_string(),
                project: project.to_string(),
                cwd: cwd.to_string(),
                label: label.to_string(),
                model: String::new(),
                state: SessionState::Idle,
                last_activity: Utc::now(),
            },
        );
    }

    fn update_state(&mut self, session_id: &str, state: SessionState) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.state = state;
            session.last_activity = Utc::now();
        }
    }

    fn by_target(&self, target: &str) -> Option<&Session> {
        self.sessions.values().find(|s| s.terminal_target == target)
    }
}

/// Shared-handle registry; clones refer to the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
    path: PathBuf,
}

impl SessionRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
            })),
            path,
        }
    }

    pub fn register(&self, session_id: &str, target: &str, project: &str, cwd: &str, label: &str) {
        self.inner
            .lock()
            .unwrap()
            .register(session_id, target, project, cwd, label);
    }

    pub fn unregister(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .remove(session_id)
            .is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().unwrap().sessions.get(session_id).cloned()
    }

    pub fn find_by_target(&self, target: &str) -> Option<Session> {
        self.inner.lock().unwrap().by_target(target).cloned()
    }

    pub fn by_project(&self, project: &str) -> Vec<Session> {
        let mut matches: Vec<Session> = self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.project == project)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        matches
    }

    pub fn all(&self) -> Vec<Session> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update_state(&self, session_id: &str, state: SessionState) {
        self.inner.lock().unwrap().update_state(session_id, state);
    }

    /// Label edits arrive from the chat client's session commands.
    #[allow(dead_code)]
    pub fn update_label(&self, session_id: &str, label: &str) {
        if let Some(session) = self.inner.lock().unwrap().sessions.get_mut(session_id) {
            session.label = label.to_string();
        }
    }

    pub fn update_model(&self, session_id: &str, model: &str) {
        if model.is_empty() {
            return;
        }
        if let Some(session) = self.inner.lock().unwrap().sessions.get_mut(session_id) {
            session.model = model.to_string();
        }
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.inner.lock().unwrap().sessions.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    #[cfg(test)]
    pub fn set_last_activity(&self, session_id: &str, at: DateTime<Utc>) {
        if let Some(session) = self.inner.lock().unwrap().sessions.get_mut(session_id) {
            session.last_activity = at;
        }
    }

    /// Persist with write-then-rename so a crash mid-write never corrupts
    /// the sessions file.
    pub fn save(&self) -> Result<()> {
        let data = {
            let inner = self.inner.lock().unwrap();
            let mut sessions: Vec<PersistedSession> = inner
                .sessions
                .values()
                .map(|s| PersistedSession {
                    session_id: s.session_id.clone(),
                    terminal_target: s.terminal_target.clone(),
                    project: s.project.clone(),
                    cwd: s.cwd.clone(),
                    label: s.label.clone(),
                    model: s.model.clone(),
                    state: s.state,
                    last_activity: s.last_activity.to_rfc3339(),
                })
                .collect();
            sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            PersistedFile { sessions }
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&data).context("failed to serialize sessions")?;
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Restore persisted sessions, skipping entries with missing fields or
    /// unparsable timestamps.
    pub fn load(&self) -> Result<usize> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Ok(0), // no persisted sessions
        };
        let parsed: PersistedFile = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding unreadable sessions file");
                return Ok(0);
            }
        };

        let mut loaded = 0;
        let mut inner = self.inner.lock().unwrap();
        for s in parsed.sessions {
            if s.session_id.is_empty() || s.terminal_target.is_empty() || s.project.is_empty() {
                continue;
            }
            let Ok(last_activity) = DateTime::parse_from_rfc3339(&s.last_activity) else {
                continue;
            };
            inner.register(&s.session_id, &s.terminal_target, &s.project, &s.cwd, &s.label);
            if let Some(session) = inner.sessions.get_mut(&s.session_id) {
                session.last_activity = last_activity.with_timezone(&Utc);
                session.state = s.state;
                if !s.model.is_empty() {
                    session.model = s.model;
                }
            }
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Full reconciliation against the live tmux server: drop sessions whose
    /// pane disappeared, discover untracked agent panes under synthetic ids,
    /// and refresh project/cwd for panes that changed directory.
    pub fn refresh_from_scan(&self, bridge: &dyn TerminalBridge) -> ScanSummary {
        let scan = bridge.scan_agent_panes();
        let mut summary = ScanSummary::default();

        // Judge idleness outside the lock; tmux calls are slow.
        let fresh: Vec<(&crate::tmux::PaneInfo, bool)> = scan
            .panes
            .iter()
            .map(|pane| (pane, bridge.is_agent_idle(&pane.target, Some(&scan.tree))))
            .collect();

        let mut inner = self.inner.lock().unwrap();

        let alive: std::collections::HashSet<&str> =
            scan.panes.iter().map(|p| p.target.as_str()).collect();
        let gone: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| !alive.contains(s.terminal_target.as_str()))
            .map(|s| s.session_id.clone())
            .collect();
        for id in gone {
            if let Some(session) = inner.sessions.remove(&id) {
                info!(session = %session.session_id, target = %session.terminal_target, "session pane gone");
                summary.removed.push(session);
            }
        }

        for (pane, idle) in fresh {
            let project = project_from_cwd(&pane.cwd);

            if let Some(existing) = inner.by_target(&pane.target).map(|s| s.session_id.clone()) {
                let session = inner.sessions.get_mut(&existing).unwrap();
                if session.project != project || session.cwd != pane.cwd {
                    session.project = project;
                    session.cwd = pane.cwd.clone();
                    summary.changed = true;
                }
                continue;
            }

            let synthetic = synthetic_session_id(&pane.target);
            inner.register(&synthetic, &pane.target, &project, &pane.cwd, "");
            inner.update_state(
                &synthetic,
                if idle { SessionState::Idle } else { SessionState::Unknown },
            );
            info!(session = %synthetic, target = %pane.target, "discovered agent pane");
            summary.discovered.push(inner.sessions[&synthetic].clone());
        }

        summary.total = inner.sessions.len();
        summary.changed =
            summary.changed || !summary.discovered.is_empty() || !summary.removed.is_empty();
        summary
    }

    /// One periodic housekeeping pass: reconcile and persist only when
    /// something moved.
    pub fn run_scan_cycle(&self, bridge: &dyn TerminalBridge) -> ScanSummary {
        let summary = self.refresh_from_scan(bridge);
        if summary.changed
            && let Err(e) = self.save()
        {
            // Disk trouble must not kill the scan loop; memory stays
            // authoritative for the process lifetime.
            warn!(error = %e, "failed to persist sessions after scan");
        }
        summary
    }
}

/// Synthetic id for panes discovered without a hook announcement.
pub fn synthetic_session_id(target: &str) -> String {
    let slug: String = target
        .chars()
        .map(|c| if c == ':' || c == '.' { '-' } else { c })
        .collect();
    format!("tmux-{slug}")
}

pub fn project_from_cwd(cwd: &str) -> String {
    Path::new(cwd)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::FakeBridge;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    fn registry() -> (SessionRegistry, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        (SessionRegistry::new(tmp.path().join("sessions.json")), tmp)
    }

    #[test]
    fn register_and_get() {
        let (reg, _tmp) = registry();
        reg.register("s1", "work:1.0", "proj", "/home/u/proj", "");
        let session = reg.get("s1").unwrap();
        assert_eq!(session.terminal_target, "work:1.0");
        assert_eq!(session.state, SessionState::Idle);
    }

    #[test]
    fn duplicate_target_evicts_previous_binding() {
        let (reg, _tmp) = registry();
        reg.register("old", "work:1.0", "proj", "/p", "");
        reg.register("new", "work:1.0", "proj", "/p", "");
        assert!(reg.get("old").is_none());
        assert!(reg.get("new").is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_active() {
        let (reg, _tmp) = registry();
        for i in 0..MAX_SESSIONS {
            reg.register(&format!("s{i}"), &format!("t:{i}"), "proj", "/p", "");
        }
        // Make s7 clearly the oldest.
        reg.set_last_activity("s7", Utc::now() - ChronoDuration::hours(2));

        reg.register("overflow", "t:overflow", "proj", "/p", "");
        assert_eq!(reg.len(), MAX_SESSIONS);
        assert!(reg.get("s7").is_none(), "oldest entry should be evicted");
        assert!(reg.get("overflow").is_some());
    }

    #[test]
    fn reregistering_existing_id_does_not_evict_others() {
        let (reg, _tmp) = registry();
        for i in 0..MAX_SESSIONS {
            reg.register(&format!("s{i}"), &format!("t:{i}"), "proj", "/p", "");
        }
        reg.register("s3", "t:3", "proj", "/p", "");
        assert_eq!(reg.len(), MAX_SESSIONS);
    }

    #[test]
    fn update_state_touches_activity() {
        let (reg, _tmp) = registry();
        reg.register("s1", "t:1", "proj", "/p", "");
        reg.set_last_activity("s1", Utc::now() - ChronoDuration::hours(1));
        let before = reg.get("s1").unwrap().last_activity;

        reg.update_state("s1", SessionState::Busy);
        let after = reg.get("s1").unwrap();
        assert_eq!(after.state, SessionState::Busy);
        assert!(after.last_activity > before);
    }

    #[test]
    fn update_model_ignores_empty() {
        let (reg, _tmp) = registry();
        reg.register("s1", "t:1", "proj", "/p", "");
        reg.update_model("s1", "opus");
        reg.update_model("s1", "");
        assert_eq!(reg.get("s1").unwrap().model, "opus");
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.json");

        let reg = SessionRegistry::new(path.clone());
        reg.register("s1", "work:1.0", "proj", "/home/u/proj", "api work");
        reg.update_model("s1", "opus");
        reg.update_state("s1", SessionState::Busy);
        reg.save().unwrap();

        let restored = SessionRegistry::new(path);
        assert_eq!(restored.load().unwrap(), 1);
        let session = restored.get("s1").unwrap();
        assert_eq!(session.project, "proj");
        assert_eq!(session.model, "opus");
        assert_eq!(session.state, SessionState::Busy);
        assert_eq!(session.label, "api work");
    }

    #[test]
    fn load_skips_invalid_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.json");
        std::fs::write(
            &path,
            r#"{"sessions":[
                {"session_id":"good","terminal_target":"t:1","project":"p","cwd":"/p","state":"idle","last_activity":"2026-08-01T10:00:00Z"},
                {"session_id":"","terminal_target":"t:2","project":"p","cwd":"/p","state":"idle","last_activity":"2026-08-01T10:00:00Z"},
                {"session_id":"badtime","terminal_target":"t:3","project":"p","cwd":"/p","state":"idle","last_activity":"not-a-date"}
            ]}"#,
        )
        .unwrap();

        let reg = SessionRegistry::new(path);
        assert_eq!(reg.load().unwrap(), 1);
        assert!(reg.get("good").is_some());
        assert!(reg.get("badtime").is_none());
    }

    #[test]
    fn load_tolerates_missing_and_garbage_files() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(tmp.path().join("missing.json"));
        assert_eq!(reg.load().unwrap(), 0);

        let path = tmp.path().join("garbage.json");
        std::fs::write(&path, "not json").unwrap();
        let reg = SessionRegistry::new(path);
        assert_eq!(reg.load().unwrap(), 0);
    }

    #[test]
    fn save_is_atomic_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.json");
        let reg = SessionRegistry::new(path.clone());
        reg.register("s1", "t:1", "p", "/p", "");
        reg.save().unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn refresh_discovers_new_panes_with_synthetic_ids() {
        let (reg, _tmp) = registry();
        let bridge = FakeBridge::new();
        bridge.add_pane("work:1.0", "/home/u/api", true);

        let summary = reg.refresh_from_scan(&bridge);
        assert_eq!(summary.discovered.len(), 1);
        assert!(summary.changed);

        let session = reg.get("tmux-work-1-0").unwrap();
        assert_eq!(session.project, "api");
        assert_eq!(session.state, SessionState::Idle);
    }

    #[test]
    fn refresh_marks_non_idle_panes_unknown() {
        let (reg, _tmp) = registry();
        let bridge = FakeBridge::new();
        bridge.add_pane("work:2.0", "/home/u/api", false);

        reg.refresh_from_scan(&bridge);
        assert_eq!(reg.get("tmux-work-2-0").unwrap().state, SessionState::Unknown);
    }

    #[test]
    fn refresh_removes_sessions_for_dead_panes() {
        let (reg, _tmp) = registry();
        reg.register("stale", "gone:1.0", "proj", "/p", "");
        let bridge = FakeBridge::new();

        let summary = reg.refresh_from_scan(&bridge);
        assert_eq!(summary.removed.len(), 1);
        assert!(reg.get("stale").is_none());
        assert!(summary.changed);
    }

    #[test]
    fn refresh_updates_changed_cwd_in_place() {
        let (reg, _tmp) = registry();
        reg.register("s1", "work:1.0", "old", "/home/u/old", "");
        let bridge = FakeBridge::new();
        bridge.add_pane("work:1.0", "/home/u/new", true);

        let summary = reg.refresh_from_scan(&bridge);
        assert!(summary.discovered.is_empty());
        assert!(summary.changed);
        let session = reg.get("s1").unwrap();
        assert_eq!(session.project, "new");
        assert_eq!(session.cwd, "/home/u/new");
    }

    #[test]
    fn refresh_with_no_movement_reports_unchanged() {
        let (reg, _tmp) = registry();
        let bridge = FakeBridge::new();
        bridge.add_pane("work:1.0", "/home/u/api", true);
        reg.refresh_from_scan(&bridge);

        let summary = reg.refresh_from_scan(&bridge);
        assert!(!summary.changed);
        assert_eq!(summary.total, 1);
    }

    #[test]
    fn synthetic_id_replaces_separators() {
        assert_eq!(synthetic_session_id("main:2.1"), "tmux-main-2-1");
    }

    #[test]
    fn project_from_cwd_uses_basename() {
        assert_eq!(project_from_cwd("/home/u/api"), "api");
        assert_eq!(project_from_cwd("/"), "unknown");
        assert_eq!(project_from_cwd(""), "unknown");
    }

    proptest! {
        // At most one session per distinct target, and never more than
        // MAX_SESSIONS entries, for any register sequence.
        #[test]
        fn register_sequences_hold_invariants(
            ops in proptest::collection::vec((0u8..8, 0u8..8), 1..64)
        ) {
            let tmp = tempfile::tempdir().unwrap();
            let reg = SessionRegistry::new(tmp.path().join("s.json"));
            for (id, target) in ops {
                reg.register(
                    &format!("s{id}"),
                    &format!("t:{target}"),
                    "proj",
                    "/p",
                    "",
                );

                let all = reg.all();
                prop_assert!(all.len() <= MAX_SESSIONS);
                let mut targets: Vec<&str> =
                    all.iter().map(|s| s.terminal_target.as_str()).collect();
                targets.sort_unstable();
                let before = targets.len();
                targets.dedup();
                prop_assert_eq!(before, targets.len(), "duplicate target binding survived");
            }
        }
    }
}
