//! Claude Code provider.
//!
//! The hook script posts the fields this provider needs directly in the
//! payload; nothing is read from the transcript here. A missing summary
//! degrades to an empty one rather than failing the event.

use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::Value;

use super::{AgentEventResult, AgentProvider};
use crate::registry::project_from_cwd;

const SETTLE_DELAY: Duration = Duration::from_millis(500);

pub struct ClaudeCodeProvider;

impl ClaudeCodeProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClaudeCodeProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u64_field(raw: &Value, key: &str) -> u64 {
    raw.get(key).and_then(Value::as_u64).unwrap_or_default()
}

impl AgentProvider for ClaudeCodeProvider {
    fn name(&self) -> &str {
        "claude-code"
    }

    fn display_name(&self) -> &str {
        "Claude Code"
    }

    fn settle_delay(&self) -> Duration {
        SETTLE_DELAY
    }

    fn parse_event(&self, raw: &Value) -> Result<AgentEventResult> {
        let session_id = str_field(raw, "session_id");
        let cwd = str_field(raw, "cwd");
        if session_id.is_empty() && cwd.is_empty() {
            bail!("payload carries neither session_id nor cwd");
        }

        Ok(AgentEventResult {
            project_name: project_from_cwd(&cwd),
            session_id,
            response_summary: str_field(raw, "summary"),
            duration_ms: u64_field(raw, "duration_ms"),
            git_changes: Vec::new(),
            input_tokens: u64_field(raw, "input_tokens"),
            output_tokens: u64_field(raw, "output_tokens"),
            cache_creation_tokens: u64_field(raw, "cache_creation_tokens"),
            cache_read_tokens: u64_field(raw, "cache_read_tokens"),
            model: str_field(raw, "model"),
            cwd,
            tmux_target: raw
                .get("tmux_target")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}
