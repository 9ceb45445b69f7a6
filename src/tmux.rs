//! tmux bridge for tether.
//!
//! Wraps tmux CLI commands for input injection via send-keys, visible-pane
//! capture, agent-pane discovery, and the readiness/liveness checks the
//! injection paths depend on. All tmux subprocess calls carry short timeouts
//! and degrade to "not ready" / "not idle" instead of erroring, so callers
//! can retry or report busy.

use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, warn};

use crate::exec::run_with_timeout;
use crate::process::{MAX_DESCENDANT_DEPTH, ProcessTree, agent_process_pattern};

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of visible lines captured for idle/prompt checks.
pub const DEFAULT_CAPTURE_LINES: u32 = 50;
const UNCOMMITTED_CAPTURE_LINES: u32 = 10;
const TUI_CAPTURE_LINES: u32 = 30;
const TUI_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Pane format for `list-panes -a`: target|title|cwd|pid. The title may
/// itself contain `|`, so parsing anchors on the first and last two fields.
const PANE_FORMAT: &str =
    "#{session_name}:#{window_index}.#{pane_index}|#{pane_title}|#{pane_current_path}|#{pane_pid}";

/// Glyphs that only show up once the agent has rendered a selectable form.
const TUI_INDICATORS: &[&str] = &[
    "❯", "› ", "◯", "◉", "☐", "☒", "[ ]", "[x]", "( )", "(•)",
];

/// Symbolic keys used by the form-injection protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKey {
    Down,
    /// Part of the injection key set even though current answer encodings
    /// only ever walk downward.
    #[allow(dead_code)]
    Up,
    Space,
    Enter,
}

impl SpecialKey {
    fn key_name(self) -> &'static str {
        match self {
            SpecialKey::Down => "Down",
            SpecialKey::Up => "Up",
            SpecialKey::Space => "Space",
            SpecialKey::Enter => "Enter",
        }
    }
}

/// One pane found by the agent scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub target: String,
    pub title: String,
    pub cwd: String,
    pub pane_pid: u32,
}

/// Scan result: agent panes plus the process snapshot they were judged with,
/// so callers can reuse the same tree for follow-up queries.
pub struct ScanOutput {
    pub panes: Vec<PaneInfo>,
    pub tree: ProcessTree,
}

/// Narrow seam over the terminal multiplexer.
///
/// The real implementation shells out to tmux; tests substitute a scripted
/// fake so the registry, state machine, and form injector are exercised
/// without a live server.
pub trait TerminalBridge: Send + Sync {
    /// Type literal text into the pane and submit it with Enter.
    fn send_keys(&self, target: &str, text: &str) -> Result<()>;

    /// Send a single symbolic key (form-injection protocol only).
    fn send_special_key(&self, target: &str, key: SpecialKey) -> Result<()>;

    /// Last `lines` visible lines of the pane.
    fn capture_pane(&self, target: &str, lines: u32) -> Result<String>;

    /// Whether the session component of the target still exists.
    fn is_pane_alive(&self, target: &str) -> bool;

    /// Whether a person has typed text after the prompt that was never
    /// submitted — injecting now would clobber it.
    fn has_uncommitted_input(&self, target: &str) -> bool;

    /// Whether the pane can safely receive injected input.
    ///
    /// Authoritative signal: the agent process is a descendant of the pane.
    /// The prompt-character heuristic runs only as a fallback when no pane
    /// pid or process snapshot is available.
    fn is_agent_idle(&self, target: &str, tree: Option<&ProcessTree>) -> bool;

    /// Whether the pane still hosts the agent (title or process descendant).
    fn is_agent_alive_in_pane(&self, target: &str, tree: Option<&ProcessTree>) -> bool;

    /// All panes across the server that plausibly run the agent.
    fn scan_agent_panes(&self) -> ScanOutput;

    /// Poll the pane until a selectable form UI is visible or the timeout
    /// elapses. Returns false on timeout, never errors.
    fn wait_for_tui_ready(&self, target: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(content) = self.capture_pane(target, TUI_CAPTURE_LINES)
                && looks_like_form_ui(&content)
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(TUI_POLL_INTERVAL);
        }
    }
}

/// tmux-backed bridge.
pub struct TmuxBridge {
    agent_pattern: Regex,
}

impl TmuxBridge {
    pub fn new(agent_process: &str) -> Self {
        Self {
            agent_pattern: agent_process_pattern(agent_process),
        }
    }

    fn run(args: &[&str], timeout: Duration) -> Result<String> {
        let mut cmd = Command::new("tmux");
        cmd.args(args);
        let out = run_with_timeout(cmd, timeout)
            .with_context(|| format!("failed to run tmux {}", args.first().unwrap_or(&"")))?;
        if !out.success() {
            bail!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                out.stderr.trim()
            );
        }
        Ok(out.stdout)
    }

    fn pane_pid(&self, target: &str) -> Result<u32> {
        let out = Self::run(
            &["display-message", "-p", "-t", target, "#{pane_pid}"],
            QUERY_TIMEOUT,
        )?;
        out.trim()
            .parse()
            .with_context(|| format!("tmux returned non-numeric pane pid for '{target}'"))
    }

    fn pane_title(&self, target: &str) -> Result<String> {
        let out = Self::run(
            &["display-message", "-p", "-t", target, "#{pane_title}"],
            QUERY_TIMEOUT,
        )?;
        Ok(out.trim().to_string())
    }
}

impl TerminalBridge for TmuxBridge {
    fn send_keys(&self, target: &str, text: &str) -> Result<()> {
        let line = collapse_to_line(text);
        if !line.is_empty() {
            let escaped = escape_send_text(&line);
            // `-l` sends text literally so punctuation is not interpreted as
            // tmux key names.
            Self::run(
                &["send-keys", "-t", target, "-l", "--", escaped.as_str()],
                CAPTURE_TIMEOUT,
            )
            .with_context(|| format!("failed to send keys to '{target}'"))?;
        }

        // Submit as an explicit second key event so the text and the Enter
        // cannot be reordered or partially applied.
        Self::run(&["send-keys", "-t", target, "C-m"], CAPTURE_TIMEOUT)
            .with_context(|| format!("failed to send Enter to '{target}'"))?;

        debug!(target = target, chars = line.len(), "sent keys");
        Ok(())
    }

    fn send_special_key(&self, target: &str, key: SpecialKey) -> Result<()> {
        Self::run(&["send-keys", "-t", target, key.key_name()], QUERY_TIMEOUT)
            .with_context(|| format!("failed to send {} to '{target}'", key.key_name()))?;
        Ok(())
    }

    fn capture_pane(&self, target: &str, lines: u32) -> Result<String> {
        let start = format!("-{lines}");
        let out = Self::run(
            &["capture-pane", "-t", target, "-p", "-S", start.as_str()],
            CAPTURE_TIMEOUT,
        )?;
        Ok(out.trim_end().to_string())
    }

    fn is_pane_alive(&self, target: &str) -> bool {
        let Some(session) = target.split(':').next().filter(|s| !s.is_empty()) else {
            return false;
        };
        Self::run(&["has-session", "-t", session], QUERY_TIMEOUT).is_ok()
    }

    fn has_uncommitted_input(&self, target: &str) -> bool {
        match self.capture_pane(target, UNCOMMITTED_CAPTURE_LINES) {
            Ok(content) => text_after_prompt(&content),
            Err(_) => false,
        }
    }

    fn is_agent_idle(&self, target: &str, tree: Option<&ProcessTree>) -> bool {
        if let Ok(pid) = self.pane_pid(target) {
            let owned;
            let tree = match tree {
                Some(tree) => tree,
                None => {
                    owned = ProcessTree::snapshot();
                    &owned
                }
            };
            if !tree.is_empty() {
                return tree.has_descendant(pid, &self.agent_pattern, MAX_DESCENDANT_DEPTH);
            }
        }

        // Legacy fallback: prompt characters in the visible tail.
        match self.capture_pane(target, DEFAULT_CAPTURE_LINES) {
            Ok(content) => prompt_line_present(&content),
            Err(e) => {
                warn!(target = target, error = %e, "idle check failed, treating as busy");
                false
            }
        }
    }

    fn is_agent_alive_in_pane(&self, target: &str, tree: Option<&ProcessTree>) -> bool {
        if !self.is_pane_alive(target) {
            return false;
        }
        if let Ok(title) = self.pane_title(target)
            && self.agent_pattern.is_match(&title)
        {
            return true;
        }
        match self.pane_pid(target) {
            Ok(pid) => {
                let owned;
                let tree = match tree {
                    Some(tree) => tree,
                    None => {
                        owned = ProcessTree::snapshot();
                        &owned
                    }
                };
                tree.has_descendant(pid, &self.agent_pattern, MAX_DESCENDANT_DEPTH)
            }
            Err(_) => false,
        }
    }

    fn scan_agent_panes(&self) -> ScanOutput {
        let tree = ProcessTree::snapshot();
        let output = match Self::run(&["list-panes", "-a", "-F", PANE_FORMAT], SCAN_TIMEOUT) {
            Ok(out) => out,
            Err(e) => {
                debug!(error = %e, "pane scan failed, treating as no panes");
                return ScanOutput { panes: Vec::new(), tree };
            }
        };

        let panes = output
            .lines()
            .filter_map(parse_pane_line)
            .filter(|pane| {
                self.agent_pattern.is_match(&pane.title)
                    || tree.has_descendant(pane.pane_pid, &self.agent_pattern, MAX_DESCENDANT_DEPTH)
            })
            .collect();

        ScanOutput { panes, tree }
    }
}

fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 4 {
        return None;
    }
    let target = parts[0].to_string();
    let pane_pid = parts[parts.len() - 1].trim().parse().ok()?;
    let cwd = parts[parts.len() - 2].to_string();
    let title = parts[1..parts.len() - 2].join("|");
    Some(PaneInfo { target, title, cwd, pane_pid })
}

/// Collapse multi-line input to a single line; newlines are not meaningful
/// mid-prompt for the agent's composer.
fn collapse_to_line(text: &str) -> String {
    text.replace('\r', "").replace('\n', " ").trim().to_string()
}

/// tmux treats an argument ending in an unescaped `;` as a command
/// separator even without a shell in between; escape exactly that case.
/// Everything else passes through literally under `send-keys -l --`.
fn escape_send_text(line: &str) -> String {
    match line.strip_suffix(';') {
        Some(head) => format!("{head}\\;"),
        None => line.to_string(),
    }
}

fn prompt_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"[❯>]\s*$").unwrap(),
            Regex::new(r"\$\s*$").unwrap(),
        ]
    })
}

/// Legacy text heuristic: a prompt character on one of the trailing lines.
fn prompt_line_present(content: &str) -> bool {
    content
        .lines()
        .rev()
        .map(str::trim_end)
        .any(|line| prompt_patterns().iter().any(|p| p.is_match(line)))
}

/// Text typed after the prompt marker that was never submitted.
fn text_after_prompt(content: &str) -> bool {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let marker = MARKER.get_or_init(|| Regex::new(r"[❯>]\s*").unwrap());

    for line in content.lines().rev() {
        let line = line.trim_end();
        if let Some(m) = marker.find(line) {
            return !line[m.end()..].trim().is_empty();
        }
    }
    false
}

fn looks_like_form_ui(content: &str) -> bool {
    TUI_INDICATORS.iter().any(|glyph| content.contains(glyph))
}
