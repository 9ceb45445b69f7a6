//! Process-table snapshots for agent-descendant checks.
//!
//! A single `ps` invocation builds a parent→children adjacency map that many
//! pane queries share, so idle checks taken at the same instant never
//! re-enumerate the process table. The descendant search is depth-bounded to
//! stay safe on corrupted ppid chains.

use std::collections::HashMap;
use std::process::Command;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::exec::run_with_timeout;

const PS_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum tree depth searched below a pane's root process.
pub const MAX_DESCENDANT_DEPTH: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
}

/// Snapshot of the process table as a parent→children map.
#[derive(Debug, Default)]
pub struct ProcessTree {
    children: HashMap<u32, Vec<ProcessEntry>>,
}

impl ProcessTree {
    /// Enumerate all processes once. Failure (missing `ps`, timeout) yields
    /// an empty tree so callers degrade to "no descendant" instead of
    /// erroring mid-injection.
    pub fn snapshot() -> Self {
        let mut cmd = Command::new("ps");
        cmd.args(["-e", "-o", "pid=,ppid=,command="]);
        match run_with_timeout(cmd, PS_TIMEOUT) {
            Ok(out) if out.success() => Self::parse(&out.stdout),
            Ok(out) => {
                debug!(stderr = %out.stderr.trim(), "ps failed, using empty process tree");
                Self::default()
            }
            Err(e) => {
                debug!(error = %e, "ps unavailable, using empty process tree");
                Self::default()
            }
        }
    }

    fn parse(output: &str) -> Self {
        // ps pads pid/ppid columns; anchor on the numeric fields.
        let line_pattern = Regex::new(r"^(\d+)\s+(\d+)\s+(.+)$").unwrap();
        let mut children: HashMap<u32, Vec<ProcessEntry>> = HashMap::new();
        for line in output.lines() {
            let Some(caps) = line_pattern.captures(line.trim()) else {
                continue;
            };
            let (Ok(pid), Ok(ppid)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
                continue;
            };
            let command = caps[3].trim().to_string();
            if command.is_empty() {
                continue;
            }
            children
                .entry(ppid)
                .or_default()
                .push(ProcessEntry { pid, command });
        }
        Self { children }
    }

    #[cfg(test)]
    pub fn from_entries(entries: &[(u32, u32, &str)]) -> Self {
        let mut children: HashMap<u32, Vec<ProcessEntry>> = HashMap::new();
        for &(pid, ppid, command) in entries {
            children.entry(ppid).or_default().push(ProcessEntry {
                pid,
                command: command.to_string(),
            });
        }
        Self { children }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Depth-bounded search below `pid` for a command matching `pattern`.
    ///
    /// Iterative worklist over the prebuilt adjacency map; the depth bound
    /// caps traversal even if ppid data forms a cycle.
    pub fn has_descendant(&self, pid: u32, pattern: &Regex, max_depth: u32) -> bool {
        let mut frontier = vec![(pid, 0u32)];
        while let Some((current, depth)) = frontier.pop() {
            if depth >= max_depth {
                continue;
            }
            let Some(kids) = self.children.get(&current) else {
                continue;
            };
            for child in kids {
                if pattern.is_match(&child.command) {
                    return true;
                }
                frontier.push((child.pid, depth + 1));
            }
        }
        false
    }
}

/// Compile the word-boundary, case-insensitive matcher for an agent process
/// name (e.g. "claude" matches "claude --resume" but not "claudette").
pub fn agent_process_pattern(name: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name)))
        .unwrap_or_else(|_| Regex::new(r"\bclaude\b").unwrap())
}
