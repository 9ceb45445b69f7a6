//! Agent adapter layer.
//!
//! Each coding agent is wrapped in a provider that knows how to turn its
//! raw hook payload into the one normalized event shape the dispatcher
//! routes. Transcript parsing and hook-script installation live with the
//! agent integrations outside this crate; providers here only read what the
//! hook already delivers.

pub mod claude;

use anyhow::Result;

use crate::channel::GitChange;

/// Normalized result of parsing one hook event.
#[derive(Debug, Clone, Default)]
pub struct AgentEventResult {
    pub session_id: String,
    pub project_name: String,
    pub response_summary: String,
    pub duration_ms: u64,
    pub git_changes: Vec<GitChange>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub model: String,
    pub cwd: String,
    /// Pane the agent reported for itself, when its hook can know it.
    pub tmux_target: Option<String>,
}

/// Trait all agent providers implement.
pub trait AgentProvider: Send + Sync {
    /// Stable name used in hook routing (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Human-readable name for notifications.
    fn display_name(&self) -> &str;

    /// How long to wait after the hook fires before reading agent
    /// artifacts; transcript flushes can lag the hook.
    fn settle_delay(&self) -> std::time::Duration;

    /// Normalize a raw hook payload.
    fn parse_event(&self, raw: &serde_json::Value) -> Result<AgentEventResult>;
}

/// Provider lookup by name.
pub struct AgentRegistry {
    providers: Vec<Box<dyn AgentProvider>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            providers: vec![Box::new(claude::ClaudeCodeProvider::new())],
        }
    }

    #[cfg(test)]
    pub fn with_providers(providers: Vec<Box<dyn AgentProvider>>) -> Self {
        Self { providers }
    }

    pub fn resolve(&self, name: &str) -> Option<&dyn AgentProvider> {
        self.providers
            .iter()
            .map(|p| p.as_ref())
            .find(|p| p.name() == name)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
