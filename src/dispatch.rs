//! Event dispatcher: glue between hook events and everything else.
//!
//! Normalizes per-agent payloads, applies settle delays, resolves chat
//! sessions, drives the session state machine, stores response payloads for
//! deep links, and forwards to the notification channel. Contains no
//! channel- or agent-specific logic itself; every collaborator is injected
//! at construction.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agent::AgentRegistry;
use crate::channel::{AskQuestionEvent, FormChannel, NotificationChannel, NotificationData, QuestionItem};
use crate::form::PendingFormTracker;
use crate::git::collect_git_changes;
use crate::registry::SessionRegistry;
use crate::resolver::SessionSink;
use crate::responses::{ResponseCache, ResponsePayload};
use crate::tunnel::PublicUrlSource;

/// Allow-list for pane targets arriving in hook payloads; anything else is
/// dropped before it can reach a send-keys invocation.
fn target_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_.:/@ -]+$").unwrap())
}

pub fn is_valid_tmux_target(target: &str) -> bool {
    !target.is_empty() && target_pattern().is_match(target)
}

pub struct EventDispatcher {
    agents: AgentRegistry,
    registry: SessionRegistry,
    sessions: Arc<dyn SessionSink>,
    forms: Arc<PendingFormTracker>,
    notifier: Arc<dyn NotificationChannel>,
    form_channel: Arc<dyn FormChannel>,
    responses: Arc<ResponseCache>,
    public_url: Arc<dyn PublicUrlSource>,
    hook_port: u16,
    viewer_base_url: String,
}

impl EventDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: AgentRegistry,
        registry: SessionRegistry,
        sessions: Arc<dyn SessionSink>,
        forms: Arc<PendingFormTracker>,
        notifier: Arc<dyn NotificationChannel>,
        form_channel: Arc<dyn FormChannel>,
        responses: Arc<ResponseCache>,
        public_url: Arc<dyn PublicUrlSource>,
        hook_port: u16,
        viewer_base_url: String,
    ) -> Self {
        Self {
            agents,
            registry,
            sessions,
            forms,
            notifier,
            form_channel,
            responses,
            public_url,
            hook_port,
            viewer_base_url,
        }
    }

    /// An agent finished a turn.
    pub fn handle_stop(&self, agent: &str, raw: &Value) {
        let Some(provider) = self.agents.resolve(agent) else {
            warn!(agent = agent, "stop event for unknown agent");
            return;
        };

        // Transcript and other artifacts can lag the hook firing.
        let settle = provider.settle_delay();
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }

        let mut result = match provider.parse_event(raw) {
            Ok(result) => result,
            Err(e) => {
                warn!(agent = agent, error = %e, "dropping malformed stop payload");
                return;
            }
        };

        if result.git_changes.is_empty() {
            result.git_changes = collect_git_changes(&result.cwd);
        }

        let target = result
            .tmux_target
            .as_deref()
            .filter(|t| is_valid_tmux_target(t));
        let resolved = self.sessions.resolve_session_id(
            &result.session_id,
            &result.project_name,
            Some(&result.cwd),
            target,
        );
        if let Some(session_id) = &resolved {
            self.sessions.on_stop_hook(session_id);
            self.registry.update_model(session_id, &result.model);
        }

        info!(
            agent = agent,
            project = %result.project_name,
            session = resolved.as_deref().unwrap_or("-"),
            "turn completed"
        );

        let data = NotificationData {
            agent: provider.name().to_string(),
            agent_display_name: provider.display_name().to_string(),
            project_name: result.project_name,
            response_summary: result.response_summary,
            duration_ms: result.duration_ms,
            git_changes: result.git_changes,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            cache_creation_tokens: result.cache_creation_tokens,
            cache_read_tokens: result.cache_read_tokens,
            model: result.model,
        };
        let response_url = self.build_response_url(&data);

        if let Err(e) = self.notifier.send_notification(&data, Some(&response_url)) {
            warn!(error = %e, "notification failed");
        }
    }

    /// A session-start hook announced its pane. Untrusted targets are
    /// dropped silently.
    pub fn handle_session_start(&self, raw: &Value) {
        let session_id = raw.get("session_id").and_then(Value::as_str).unwrap_or("");
        let target = raw.get("tmux_target").and_then(Value::as_str).unwrap_or("");
        if session_id.is_empty() || !is_valid_tmux_target(target) {
            debug!(session = session_id, target = target, "dropping untrusted session-start");
            return;
        }
        let cwd = raw.get("cwd").and_then(Value::as_str).unwrap_or("");

        info!(session = session_id, target = target, "session bound to pane");
        self.sessions.bind_session(session_id, target, cwd);
    }

    /// A blocking or idle notification, possibly carrying a structured
    /// question form.
    pub fn handle_notification(&self, agent: &str, raw: &Value) {
        let session_id = raw.get("session_id").and_then(Value::as_str).unwrap_or("");
        let cwd = raw.get("cwd").and_then(Value::as_str).unwrap_or("");
        let message = raw.get("message").and_then(Value::as_str).unwrap_or("");
        let payload_target = raw
            .get("tmux_target")
            .and_then(Value::as_str)
            .filter(|t| is_valid_tmux_target(t));

        let project = crate::registry::project_from_cwd(cwd);
        let resolved =
            self.sessions
                .resolve_session_id(session_id, &project, Some(cwd), payload_target);
        if let Some(resolved) = &resolved {
            self.sessions.on_notification_block(resolved);
        }

        let questions = parse_questions(raw);
        if !questions.is_empty() {
            // Prefer the pane the payload names; fall back to the resolved
            // session's registered pane.
            let target = payload_target.map(str::to_string).or_else(|| {
                resolved
                    .as_deref()
                    .and_then(|sid| self.registry.get(sid))
                    .map(|s| s.terminal_target)
            });

            if let Some(target) = target.filter(|t| !t.is_empty()) {
                let event = AskQuestionEvent {
                    session_id: resolved.clone().unwrap_or_else(|| session_id.to_string()),
                    terminal_target: target,
                    questions,
                };
                self.forms.forward_question(event, self.form_channel.as_ref());
                return;
            }
            warn!(session = session_id, "question event with no resolvable pane");
        }

        let provider = self.agents.resolve(agent);
        let data = NotificationData {
            agent: provider.map(|p| p.name().to_string()).unwrap_or_default(),
            agent_display_name: provider
                .map(|p| p.display_name().to_string())
                .unwrap_or_default(),
            project_name: project,
            response_summary: if message.is_empty() {
                "The agent is waiting for input.".to_string()
            } else {
                message.to_string()
            },
            ..Default::default()
        };
        if let Err(e) = self.notifier.send_notification(&data, None) {
            warn!(error = %e, "blocked notification failed");
        }
    }

    /// Store the payload and build the viewer deep link:
    /// `<viewer>/response/?id=..&api=<tunnel-or-local>&p=..&d=..&a=..`.
    fn build_response_url(&self, data: &NotificationData) -> String {
        let id = self.responses.save(ResponsePayload {
            project_name: data.project_name.clone(),
            response_summary: data.response_summary.clone(),
            duration_ms: data.duration_ms,
            git_changes: data.git_changes.clone(),
            input_tokens: data.input_tokens,
            output_tokens: data.output_tokens,
            cache_creation_tokens: data.cache_creation_tokens,
            cache_read_tokens: data.cache_read_tokens,
            model: data.model.clone(),
        });

        let api_base = self
            .public_url
            .public_url()
            .unwrap_or_else(|| format!("http://localhost:{}", self.hook_port));

        format!(
            "{}/response/?id={}&api={}&p={}&d={}&a={}",
            self.viewer_base_url,
            id,
            encode_query(&api_base),
            encode_query(&data.project_name),
            data.duration_ms,
            encode_query(&data.agent),
        )
    }
}

fn parse_questions(raw: &Value) -> Vec<QuestionItem> {
    raw.get("questions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|q| serde_json::from_value(q.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Minimal percent-encoding for query values.
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::claude::ClaudeCodeProvider;
    use crate::agent::{AgentEventResult, AgentProvider};
    use crate::form::FormInjector;
    use crate::resolver::SessionResolver;
    use crate::state::SessionStateMachine;
    use crate::testsupport::{FakeBridge, RecordingChannel};
    use crate::timers::DeadlineArena;
    use crate::tunnel::NoTunnel;
    use serde_json::json;
    use std::time::{Duration, Instant};

    /// Built-in provider semantics without the production settle delay.
    struct InstantProvider(ClaudeCodeProvider, Duration);

    impl AgentProvider for InstantProvider {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn display_name(&self) -> &str {
            self.0.display_name()
        }
        fn settle_delay(&self) -> Duration {
            self.1
        }
        fn parse_event(&self, raw: &Value) -> anyhow::Result<AgentEventResult> {
            self.0.parse_event(raw)
        }
    }

    struct Harness {
        dispatcher: EventDispatcher,
        registry: crate::registry::SessionRegistry,
        bridge: Arc<FakeBridge>,
        channel: Arc<RecordingChannel>,
        responses: Arc<ResponseCache>,
        _tmp: tempfile::TempDir,
    }

    fn harness(settle: Duration) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let registry = crate::registry::SessionRegistry::new(tmp.path().join("sessions.json"));
        let bridge = Arc::new(FakeBridge::new());
        let state = Arc::new(SessionStateMachine::new(registry.clone(), bridge.clone()));
        let resolver = Arc::new(SessionResolver::new(registry.clone(), state));
        let forms = Arc::new(PendingFormTracker::with_expiry(
            FormInjector::instant(bridge.clone()),
            Arc::new(DeadlineArena::new()),
            Duration::from_secs(600),
        ));
        let channel = Arc::new(RecordingChannel::new());
        let responses = Arc::new(ResponseCache::new(tmp.path().join("responses")));
        let dispatcher = EventDispatcher::new(
            AgentRegistry::with_providers(vec![Box::new(InstantProvider(
                ClaudeCodeProvider::new(),
                settle,
            ))]),
            registry.clone(),
            resolver,
            forms,
            channel.clone(),
            channel.clone(),
            responses.clone(),
            Arc::new(NoTunnel),
            8787,
            "https://viewer.test".to_string(),
        );
        Harness {
            dispatcher,
            registry,
            bridge,
            channel,
            responses,
            _tmp: tmp,
        }
    }

    #[test]
    fn target_allow_list() {
        assert!(is_valid_tmux_target("work:1.0"));
        assert!(is_valid_tmux_target("my session:2.1"));
        assert!(is_valid_tmux_target("a_b-c/d@e"));
        assert!(!is_valid_tmux_target(""));
        assert!(!is_valid_tmux_target("evil;rm -rf"));
        assert!(!is_valid_tmux_target("bad\ntarget"));
        assert!(!is_valid_tmux_target("q$(whoami)"));
    }

    #[test]
    fn stop_event_notifies_with_resolvable_deep_link() {
        let h = harness(Duration::ZERO);
        h.registry.register("s1", "work:1.0", "api", "/home/u/api", "");

        h.dispatcher.handle_stop(
            "claude-code",
            &json!({
                "session_id": "agent-1",
                "cwd": "/home/u/api",
                "summary": "All tests green",
                "duration_ms": 3000,
                "tmux_target": "work:1.0"
            }),
        );

        let notifications = h.channel.notifications();
        assert_eq!(notifications.len(), 1);
        let (data, url) = &notifications[0];
        assert_eq!(data.project_name, "api");
        assert_eq!(data.response_summary, "All tests green");

        // The deep link id must resolve through the response cache.
        let url = url.as_deref().unwrap();
        assert!(url.starts_with("https://viewer.test/response/?id="));
        assert!(url.contains("api=http%3A%2F%2Flocalhost%3A8787"));
        let id = url
            .split("id=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        let stored = h.responses.get(id).unwrap();
        assert_eq!(stored.response_summary, "All tests green");
    }

    #[test]
    fn stop_event_marks_session_idle() {
        let h = harness(Duration::ZERO);
        h.registry.register("s1", "work:1.0", "api", "/home/u/api", "");
        h.registry
            .update_state("s1", crate::registry::SessionState::Busy);

        h.dispatcher.handle_stop(
            "claude-code",
            &json!({"session_id": "agent-1", "cwd": "/home/u/api", "tmux_target": "work:1.0"}),
        );

        assert_eq!(
            h.registry.get("s1").unwrap().state,
            crate::registry::SessionState::Idle
        );
    }

    #[test]
    fn stop_event_respects_settle_delay() {
        let delay = Duration::from_millis(120);
        let h = harness(delay);
        let start = Instant::now();
        h.dispatcher.handle_stop(
            "claude-code",
            &json!({"session_id": "agent-1", "cwd": "/home/u/api"}),
        );
        assert!(start.elapsed() >= delay);
        assert_eq!(h.channel.notifications().len(), 1);
    }

    #[test]
    fn unknown_agent_and_malformed_payload_are_dropped() {
        let h = harness(Duration::ZERO);
        h.dispatcher.handle_stop("ghost-agent", &json!({"cwd": "/p"}));
        h.dispatcher.handle_stop("claude-code", &json!({}));
        assert!(h.channel.notifications().is_empty());
    }

    #[test]
    fn session_start_binds_validated_target() {
        let h = harness(Duration::ZERO);
        h.dispatcher.handle_session_start(&json!({
            "session_id": "s1",
            "tmux_target": "work:1.0",
            "cwd": "/home/u/api"
        }));
        let session = h.registry.get("s1").unwrap();
        assert_eq!(session.terminal_target, "work:1.0");
        assert_eq!(session.project, "api");
    }

    #[test]
    fn session_start_drops_untrusted_targets_silently() {
        let h = harness(Duration::ZERO);
        h.dispatcher.handle_session_start(&json!({
            "session_id": "s1",
            "tmux_target": "bad;injection",
        }));
        h.dispatcher.handle_session_start(&json!({"tmux_target": "work:1.0"}));
        assert!(h.registry.is_empty());
    }

    #[test]
    fn notification_with_questions_starts_form() {
        let h = harness(Duration::ZERO);
        h.registry.register("s1", "work:1.0", "api", "/home/u/api", "");
        h.bridge.set_tui_ready("work:1.0", true);

        h.dispatcher.handle_notification(
            "claude-code",
            &json!({
                "session_id": "agent-1",
                "cwd": "/home/u/api",
                "tmux_target": "work:1.0",
                "questions": [
                    {"question": "Proceed?", "options": [{"label": "Yes"}, {"label": "No"}]}
                ]
            }),
        );

        assert_eq!(h.channel.questions().len(), 1);
        assert_eq!(
            h.registry.get("s1").unwrap().state,
            crate::registry::SessionState::Blocked
        );
    }

    #[test]
    fn notification_without_questions_notifies_blocked() {
        let h = harness(Duration::ZERO);
        h.registry.register("s1", "work:1.0", "api", "/home/u/api", "");

        h.dispatcher.handle_notification(
            "claude-code",
            &json!({
                "session_id": "agent-1",
                "cwd": "/home/u/api",
                "message": "Waiting for permission"
            }),
        );

        let notifications = h.channel.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0.response_summary, "Waiting for permission");
        assert_eq!(
            h.registry.get("s1").unwrap().state,
            crate::registry::SessionState::Blocked
        );
    }

    #[test]
    fn question_without_any_pane_degrades_to_notification() {
        let h = harness(Duration::ZERO);
        h.dispatcher.handle_notification(
            "claude-code",
            &json!({
                "session_id": "agent-1",
                "cwd": "/nowhere/ghost",
                "questions": [{"question": "Pick", "options": [{"label": "a"}]}]
            }),
        );
        assert!(h.channel.questions().is_empty());
        assert_eq!(h.channel.notifications().len(), 1);
    }

    #[test]
    fn encode_query_escapes_reserved_characters() {
        assert_eq!(encode_query("a b&c=d"), "a%20b%26c%3Dd");
        assert_eq!(encode_query("plain-name_1.0~x"), "plain-name_1.0~x");
    }
}
