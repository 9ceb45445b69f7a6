//! Scripted terminal bridge for tests.
//!
//! Lets registry/state/form/dispatch tests run against deterministic pane
//! state without a live tmux server. Key presses and injected text are
//! recorded in order so tests can assert exact sequences.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};

use crate::channel::{
    ChannelError, FormChannel, NotificationChannel, NotificationData, QuestionItem,
};
use crate::process::ProcessTree;
use crate::tmux::{PaneInfo, ScanOutput, SpecialKey, TerminalBridge};

/// One recorded bridge action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Text { target: String, text: String },
    Key { target: String, key: SpecialKey },
}

#[derive(Default)]
struct FakeState {
    panes: Vec<PaneInfo>,
    alive: HashSet<String>,
    idle: HashSet<String>,
    uncommitted: HashSet<String>,
    tui_ready: HashSet<String>,
    fail_send: HashSet<String>,
    content: HashMap<String, String>,
    events: Vec<BridgeEvent>,
}

pub struct FakeBridge {
    state: Mutex<FakeState>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Add a live agent pane; `idle` controls the injection-safety check.
    pub fn add_pane(&self, target: &str, cwd: &str, idle: bool) {
        let mut state = self.state.lock().unwrap();
        let pane_pid = 1000 + state.panes.len() as u32;
        state.panes.push(PaneInfo {
            target: target.to_string(),
            title: "Claude Code".to_string(),
            cwd: cwd.to_string(),
            pane_pid,
        });
        state.alive.insert(target.to_string());
        if idle {
            state.idle.insert(target.to_string());
        }
    }

    pub fn set_alive(&self, target: &str, alive: bool) {
        let mut state = self.state.lock().unwrap();
        if alive {
            state.alive.insert(target.to_string());
        } else {
            state.alive.remove(target);
        }
    }

    pub fn set_idle(&self, target: &str, idle: bool) {
        let mut state = self.state.lock().unwrap();
        if idle {
            state.idle.insert(target.to_string());
        } else {
            state.idle.remove(target);
        }
    }

    pub fn set_uncommitted(&self, target: &str, uncommitted: bool) {
        let mut state = self.state.lock().unwrap();
        if uncommitted {
            state.uncommitted.insert(target.to_string());
        } else {
            state.uncommitted.remove(target);
        }
    }

    pub fn set_tui_ready(&self, target: &str, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if ready {
            state.tui_ready.insert(target.to_string());
        } else {
            state.tui_ready.remove(target);
        }
    }

    pub fn fail_sends_to(&self, target: &str) {
        self.state.lock().unwrap().fail_send.insert(target.to_string());
    }

    pub fn set_content(&self, target: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .content
            .insert(target.to_string(), content.to_string());
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Only the symbolic keys sent to `target`, in order.
    pub fn keys_for(&self, target: &str) -> Vec<SpecialKey> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Key { target: t, key } if t == target => Some(*key),
                _ => None,
            })
            .collect()
    }

    pub fn sent_text(&self, target: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Text { target: t, text } if t == target => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl TerminalBridge for FakeBridge {
    fn send_keys(&self, target: &str, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send.contains(target) {
            bail!("simulated send failure for '{target}'");
        }
        state.events.push(BridgeEvent::Text {
            target: target.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn send_special_key(&self, target: &str, key: SpecialKey) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send.contains(target) {
            bail!("simulated send failure for '{target}'");
        }
        state.events.push(BridgeEvent::Key {
            target: target.to_string(),
            key,
        });
        Ok(())
    }

    fn capture_pane(&self, target: &str, _lines: u32) -> Result<String> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .content
            .get(target)
            .cloned()
            .unwrap_or_default())
    }

    fn is_pane_alive(&self, target: &str) -> bool {
        self.state.lock().unwrap().alive.contains(target)
    }

    fn has_uncommitted_input(&self, target: &str) -> bool {
        self.state.lock().unwrap().uncommitted.contains(target)
    }

    fn is_agent_idle(&self, target: &str, _tree: Option<&ProcessTree>) -> bool {
        self.state.lock().unwrap().idle.contains(target)
    }

    fn is_agent_alive_in_pane(&self, target: &str, _tree: Option<&ProcessTree>) -> bool {
        self.state.lock().unwrap().alive.contains(target)
    }

    fn scan_agent_panes(&self) -> ScanOutput {
        ScanOutput {
            panes: self.state.lock().unwrap().panes.clone(),
            tree: ProcessTree::default(),
        }
    }

    fn wait_for_tui_ready(&self, target: &str, _timeout: Duration) -> bool {
        self.state.lock().unwrap().tui_ready.contains(target)
    }
}

/// Chat channel that records everything it is asked to send.
#[derive(Default)]
pub struct RecordingChannel {
    next_message_id: AtomicI64,
    notifications: Mutex<Vec<(NotificationData, Option<String>)>>,
    questions: Mutex<Vec<(u64, usize, usize, QuestionItem)>>,
    question_updates: Mutex<Vec<(i64, String)>>,
    keyboard_updates: Mutex<Vec<(i64, BTreeSet<usize>)>>,
    acks: Mutex<Vec<(String, Option<String>)>>,
    texts: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(NotificationData, Option<String>)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn questions(&self) -> Vec<(u64, usize, usize, QuestionItem)> {
        self.questions.lock().unwrap().clone()
    }

    pub fn keyboard_updates(&self) -> usize {
        self.keyboard_updates.lock().unwrap().len()
    }

    pub fn acks(&self) -> Vec<(String, Option<String>)> {
        self.acks.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

impl NotificationChannel for RecordingChannel {
    fn send_notification(
        &self,
        data: &NotificationData,
        response_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.notifications
            .lock()
            .unwrap()
            .push((data.clone(), response_url.map(str::to_string)));
        Ok(())
    }
}

impl FormChannel for RecordingChannel {
    fn send_question(
        &self,
        _session_id: &str,
        pending_id: u64,
        index: usize,
        total: usize,
        question: &QuestionItem,
    ) -> Result<i64, ChannelError> {
        self.questions
            .lock()
            .unwrap()
            .push((pending_id, index, total, question.clone()));
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1000)
    }

    fn update_question(&self, message_id: i64, text: &str) -> Result<(), ChannelError> {
        self.question_updates
            .lock()
            .unwrap()
            .push((message_id, text.to_string()));
        Ok(())
    }

    fn update_keyboard(
        &self,
        message_id: i64,
        _pending_id: u64,
        _index: usize,
        _question: &QuestionItem,
        toggles: &BTreeSet<usize>,
    ) -> Result<(), ChannelError> {
        self.keyboard_updates
            .lock()
            .unwrap()
            .push((message_id, toggles.clone()));
        Ok(())
    }

    fn ack_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChannelError> {
        self.acks
            .lock()
            .unwrap()
            .push((callback_id.to_string(), text.map(str::to_string)));
        Ok(())
    }

    fn send_text(&self, _session_id: &str, text: &str) -> Result<(), ChannelError> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
