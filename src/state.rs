//! Session state machine and message injection.
//!
//! Idle → (message injected) → Busy → (stop hook) → Idle, with Blocked for
//! agent-raised questions. The injection path re-verifies pane liveness and
//! idleness against tmux on every attempt instead of trusting the cached
//! state — concurrent hook events and chat replies stay consistent without
//! any shared lock because ground truth is re-read before acting.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::registry::{SessionRegistry, SessionState};
use crate::tmux::TerminalBridge;

/// Ceiling on injected message size; anything longer is truncated.
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

/// Result of one injection attempt. Everything except `Sent` leaves the pane
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    Sent,
    /// Empty or whitespace-only text; nothing to do.
    Empty,
    /// The pane cannot safely receive input right now.
    Busy,
    /// A person is mid-keystroke in the pane; injection would clobber it.
    DesktopActive,
    SessionNotFound,
    /// The backing pane is gone; the session was unregistered.
    TmuxDead,
}

pub struct SessionStateMachine {
    registry: SessionRegistry,
    bridge: Arc<dyn TerminalBridge>,
}

impl SessionStateMachine {
    pub fn new(registry: SessionRegistry, bridge: Arc<dyn TerminalBridge>) -> Self {
        Self { registry, bridge }
    }

    /// Inject free-text into the session's pane, re-deriving liveness and
    /// idle state from tmux before sending anything.
    pub fn inject_message(&self, session_id: &str, text: &str) -> InjectOutcome {
        let Some(session) = self.registry.get(session_id) else {
            return InjectOutcome::SessionNotFound;
        };

        if !self.bridge.is_pane_alive(&session.terminal_target) {
            info!(session = session_id, target = %session.terminal_target, "pane dead, unregistering");
            self.registry.unregister(session_id);
            return InjectOutcome::TmuxDead;
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return InjectOutcome::Empty;
        }

        let safe_text: String = if trimmed.chars().count() > MAX_MESSAGE_LENGTH {
            warn!(session = session_id, "truncating oversized message");
            trimmed.chars().take(MAX_MESSAGE_LENGTH).collect()
        } else {
            trimmed.to_string()
        };

        if self.bridge.has_uncommitted_input(&session.terminal_target) {
            debug!(session = session_id, "uncommitted input in pane, not injecting");
            return InjectOutcome::DesktopActive;
        }

        // Never trust the cached state field; it can be stale the moment a
        // hook and a chat reply interleave.
        if !self.bridge.is_agent_idle(&session.terminal_target, None) {
            return InjectOutcome::Busy;
        }

        match self.bridge.send_keys(&session.terminal_target, &safe_text) {
            Ok(()) => {
                self.registry.update_state(session_id, SessionState::Busy);
                self.registry.touch(session_id);
                InjectOutcome::Sent
            }
            Err(e) => {
                warn!(session = session_id, error = %e, "send failed, unregistering session");
                self.registry.unregister(session_id);
                InjectOutcome::TmuxDead
            }
        }
    }

    /// The agent finished its turn.
    pub fn on_stop_hook(&self, session_id: &str) {
        self.registry.update_state(session_id, SessionState::Idle);
        self.registry.touch(session_id);
    }

    /// The agent raised a blocking question.
    pub fn on_notification_block(&self, session_id: &str) {
        self.registry.update_state(session_id, SessionState::Blocked);
        self.registry.touch(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::FakeBridge;

    fn setup() -> (SessionStateMachine, SessionRegistry, Arc<FakeBridge>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(tmp.path().join("sessions.json"));
        let bridge = Arc::new(FakeBridge::new());
        let machine = SessionStateMachine::new(registry.clone(), bridge.clone());
        (machine, registry, bridge, tmp)
    }

    #[test]
    fn unknown_session_reports_not_found() {
        let (machine, _reg, _bridge, _tmp) = setup();
        assert_eq!(
            machine.inject_message("nope", "hello"),
            InjectOutcome::SessionNotFound
        );
    }

    #[test]
    fn dead_pane_unregisters_even_when_cached_idle() {
        let (machine, reg, _bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        // Cached state says Idle, but the fake reports the pane dead.
        assert_eq!(reg.get("s1").unwrap().state, SessionState::Idle);

        assert_eq!(machine.inject_message("s1", "hello"), InjectOutcome::TmuxDead);
        assert!(reg.get("s1").is_none());
    }

    #[test]
    fn empty_text_is_a_no_op() {
        let (machine, reg, bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        bridge.set_alive("work:1.0", true);
        bridge.set_idle("work:1.0", true);

        assert_eq!(machine.inject_message("s1", "   \n  "), InjectOutcome::Empty);
        assert!(bridge.sent_text("work:1.0").is_empty());
    }

    #[test]
    fn busy_pane_sends_nothing() {
        let (machine, reg, bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        bridge.set_alive("work:1.0", true);
        bridge.set_idle("work:1.0", false);

        assert_eq!(machine.inject_message("s1", "hello"), InjectOutcome::Busy);
        assert!(bridge.sent_text("work:1.0").is_empty());
        // Session stays registered; busy is retryable.
        assert!(reg.get("s1").is_some());
    }

    #[test]
    fn uncommitted_desk_input_blocks_injection() {
        let (machine, reg, bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        bridge.set_alive("work:1.0", true);
        bridge.set_idle("work:1.0", true);
        bridge.set_uncommitted("work:1.0", true);

        assert_eq!(
            machine.inject_message("s1", "hello"),
            InjectOutcome::DesktopActive
        );
        assert!(bridge.sent_text("work:1.0").is_empty());
    }

    #[test]
    fn successful_injection_marks_busy() {
        let (machine, reg, bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        bridge.set_alive("work:1.0", true);
        bridge.set_idle("work:1.0", true);

        assert_eq!(machine.inject_message("s1", "  hello  "), InjectOutcome::Sent);
        assert_eq!(bridge.sent_text("work:1.0"), vec!["hello"]);
        assert_eq!(reg.get("s1").unwrap().state, SessionState::Busy);
    }

    #[test]
    fn oversized_message_is_truncated() {
        let (machine, reg, bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        bridge.set_alive("work:1.0", true);
        bridge.set_idle("work:1.0", true);

        let huge = "x".repeat(MAX_MESSAGE_LENGTH + 500);
        assert_eq!(machine.inject_message("s1", &huge), InjectOutcome::Sent);
        let sent = bridge.sent_text("work:1.0");
        assert_eq!(sent[0].chars().count(), MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn send_failure_unregisters_session() {
        let (machine, reg, bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        bridge.set_alive("work:1.0", true);
        bridge.set_idle("work:1.0", true);
        bridge.fail_sends_to("work:1.0");

        assert_eq!(machine.inject_message("s1", "hello"), InjectOutcome::TmuxDead);
        assert!(reg.get("s1").is_none());
    }

    #[test]
    fn stop_hook_returns_session_to_idle() {
        let (machine, reg, bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        bridge.set_alive("work:1.0", true);
        bridge.set_idle("work:1.0", true);
        machine.inject_message("s1", "go");
        assert_eq!(reg.get("s1").unwrap().state, SessionState::Busy);

        machine.on_stop_hook("s1");
        assert_eq!(reg.get("s1").unwrap().state, SessionState::Idle);
    }

    #[test]
    fn blocking_notification_marks_blocked() {
        let (machine, reg, _bridge, _tmp) = setup();
        reg.register("s1", "work:1.0", "proj", "/p", "");
        machine.on_notification_block("s1");
        assert_eq!(reg.get("s1").unwrap().state, SessionState::Blocked);
    }
}
