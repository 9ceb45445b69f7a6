//! Maps agent-reported session ids to registry entries.
//!
//! Not every agent adapter can report its own pane, so resolution walks a
//! priority chain: exact terminal-target match (the agent told us its pane),
//! then a bounded agent-id cache, then project-name matching with cwd
//! disambiguation. Hits at the strong ends populate the cache for later
//! events that carry less context.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::registry::{SessionRegistry, project_from_cwd};
use crate::state::SessionStateMachine;

/// Bounded agent-session → chat-session cache; FIFO eviction.
pub const MAX_AGENT_CACHE: usize = 100;

/// Seam the event dispatcher talks to: resolution plus the session-lifecycle
/// transitions hooks drive. Supplied at construction so wiring order cannot
/// drop events.
pub trait SessionSink: Send + Sync {
    fn resolve_session_id(
        &self,
        agent_session_id: &str,
        project: &str,
        cwd: Option<&str>,
        terminal_target: Option<&str>,
    ) -> Option<String>;

    /// A session-start hook announced a pane↔session binding.
    fn bind_session(&self, session_id: &str, terminal_target: &str, cwd: &str);

    fn on_stop_hook(&self, session_id: &str);

    fn on_notification_block(&self, session_id: &str);
}

pub struct SessionResolver {
    registry: SessionRegistry,
    state: Arc<SessionStateMachine>,
    cache: Mutex<VecDeque<(String, String)>>,
}

impl SessionResolver {
    pub fn new(registry: SessionRegistry, state: Arc<SessionStateMachine>) -> Self {
        Self {
            registry,
            state,
            cache: Mutex::new(VecDeque::new()),
        }
    }

    fn cache_agent(&self, agent_session_id: &str, session_id: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.retain(|(agent, _)| agent != agent_session_id);
        cache.push_back((agent_session_id.to_string(), session_id.to_string()));
        if cache.len() > MAX_AGENT_CACHE {
            cache.pop_front();
        }
    }

    fn cached(&self, agent_session_id: &str) -> Option<String> {
        let mut cache = self.cache.lock().unwrap();
        let hit = cache
            .iter()
            .find(|(agent, _)| agent == agent_session_id)
            .map(|(_, session)| session.clone())?;
        if self.registry.get(&hit).is_some() {
            return Some(hit);
        }
        // Mapped session vanished; drop the stale entry.
        cache.retain(|(agent, _)| agent != agent_session_id);
        None
    }

    fn find_by_project(&self, project: &str, cwd: Option<&str>) -> Option<String> {
        let matches = self.registry.by_project(project);
        if matches.is_empty() {
            return None;
        }
        let chosen = match cwd {
            Some(cwd) if matches.len() > 1 => matches
                .iter()
                .find(|s| s.cwd == cwd)
                .unwrap_or(&matches[0]),
            _ => &matches[0],
        };
        debug!(session = %chosen.session_id, project = project, "session linked by project");
        Some(chosen.session_id.clone())
    }

    #[cfg(test)]
    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

impl SessionSink for SessionResolver {
    fn resolve_session_id(
        &self,
        agent_session_id: &str,
        project: &str,
        cwd: Option<&str>,
        terminal_target: Option<&str>,
    ) -> Option<String> {
        if let Some(target) = terminal_target.filter(|t| !t.is_empty())
            && let Some(session) = self.registry.find_by_target(target)
        {
            debug!(session = %session.session_id, target = target, "session linked by terminal target");
            if !agent_session_id.is_empty() {
                self.cache_agent(agent_session_id, &session.session_id);
            }
            return Some(session.session_id);
        }

        if !agent_session_id.is_empty()
            && let Some(cached) = self.cached(agent_session_id)
        {
            return Some(cached);
        }

        let resolved = self.find_by_project(project, cwd)?;
        if !agent_session_id.is_empty() {
            self.cache_agent(agent_session_id, &resolved);
        }
        Some(resolved)
    }

    fn bind_session(&self, session_id: &str, terminal_target: &str, cwd: &str) {
        let project = project_from_cwd(cwd);
        self.registry
            .register(session_id, terminal_target, &project, cwd, "");
    }

    fn on_stop_hook(&self, session_id: &str) {
        self.state.on_stop_hook(session_id);
    }

    fn on_notification_block(&self, session_id: &str) {
        self.state.on_notification_block(session_id);
    }
}
