//! Structured-question forms: key-press encoding and pending-form tracking.
//!
//! The agent renders multi-question prompts in its own terminal UI; the only
//! way to answer from chat is to drive that UI with arrow/space/enter key
//! presses. The injector encodes answers as exact key sequences; the tracker
//! owns the in-flight forms, serializes callback processing per chat
//! message, and expires what the user never finished.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{AskQuestionEvent, FormChannel, QuestionItem};
use crate::timers::DeadlineArena;
use crate::tmux::{SpecialKey, TerminalBridge};

/// In-flight forms per daemon; the oldest is evicted beyond this.
pub const MAX_PENDING: usize = 50;

/// Unanswered forms are dropped after this long.
pub const FORM_EXPIRE: Duration = Duration::from_secs(10 * 60);

const PROCESSED_CALLBACK_CAP: usize = 200;
const KEY_DELAY: Duration = Duration::from_millis(80);
const TOGGLE_SETTLE: Duration = Duration::from_millis(100);
const TUI_TIMEOUT: Duration = Duration::from_secs(5);
const ADVANCE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum FormError {
    #[error("form UI never became ready on '{0}'")]
    NotReady(String),
    #[error("key injection failed: {0}")]
    Injection(#[from] anyhow::Error),
}

/// Decoded chat callback payload. The wire form is compact to fit platform
/// callback-data limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackData {
    /// `aq:<pendingId>:<qIdx>:<optIdx>`
    AnswerSingle {
        pending_id: u64,
        question: usize,
        option: usize,
    },
    /// `am:<pendingId>:<qIdx>:<optIdx>`
    MultiToggle {
        pending_id: u64,
        question: usize,
        option: usize,
    },
    /// `am:<pendingId>:<qIdx>:c`
    MultiConfirm { pending_id: u64, question: usize },
    /// `chat:<sessionId>`
    OpenChat { session_id: String },
    /// `session_close:<sessionId>`
    CloseSession { session_id: String },
    /// `session_close_yes:<sessionId>`
    CloseSessionConfirm { session_id: String },
}

impl CallbackData {
    pub fn parse(data: &str) -> Option<Self> {
        if let Some(rest) = data.strip_prefix("aq:") {
            let mut parts = rest.splitn(3, ':');
            return Some(CallbackData::AnswerSingle {
                pending_id: parts.next()?.parse().ok()?,
                question: parts.next()?.parse().ok()?,
                option: parts.next()?.parse().ok()?,
            });
        }
        if let Some(rest) = data.strip_prefix("am:") {
            let mut parts = rest.splitn(3, ':');
            let pending_id = parts.next()?.parse().ok()?;
            let question = parts.next()?.parse().ok()?;
            let opt = parts.next()?;
            return Some(if opt == "c" {
                CallbackData::MultiConfirm { pending_id, question }
            } else {
                CallbackData::MultiToggle {
                    pending_id,
                    question,
                    option: opt.parse().ok()?,
                }
            });
        }
        if let Some(rest) = data.strip_prefix("session_close_yes:") {
            return Some(CallbackData::CloseSessionConfirm {
                session_id: rest.to_string(),
            });
        }
        if let Some(rest) = data.strip_prefix("session_close:") {
            return Some(CallbackData::CloseSession {
                session_id: rest.to_string(),
            });
        }
        if let Some(rest) = data.strip_prefix("chat:") {
            return Some(CallbackData::OpenChat {
                session_id: rest.to_string(),
            });
        }
        None
    }

    pub fn encode(&self) -> String {
        match self {
            CallbackData::AnswerSingle {
                pending_id,
                question,
                option,
            } => format!("aq:{pending_id}:{question}:{option}"),
            CallbackData::MultiToggle {
                pending_id,
                question,
                option,
            } => format!("am:{pending_id}:{question}:{option}"),
            CallbackData::MultiConfirm { pending_id, question } => {
                format!("am:{pending_id}:{question}:c")
            }
            CallbackData::OpenChat { session_id } => format!("chat:{session_id}"),
            CallbackData::CloseSession { session_id } => format!("session_close:{session_id}"),
            CallbackData::CloseSessionConfirm { session_id } => {
                format!("session_close_yes:{session_id}")
            }
        }
    }
}

/// Encodes answers as key presses against the agent's rendered option list.
pub struct FormInjector {
    bridge: Arc<dyn TerminalBridge>,
    key_delay: Duration,
    toggle_settle: Duration,
    tui_timeout: Duration,
}

impl FormInjector {
    pub fn new(bridge: Arc<dyn TerminalBridge>) -> Self {
        Self {
            bridge,
            key_delay: KEY_DELAY,
            toggle_settle: TOGGLE_SETTLE,
            tui_timeout: TUI_TIMEOUT,
        }
    }

    /// Zero-delay variant for tests.
    #[cfg(test)]
    pub fn instant(bridge: Arc<dyn TerminalBridge>) -> Self {
        Self {
            bridge,
            key_delay: Duration::ZERO,
            toggle_settle: Duration::ZERO,
            tui_timeout: Duration::ZERO,
        }
    }

    fn delayed_key(&self, target: &str, key: SpecialKey) -> Result<(), FormError> {
        self.bridge.send_special_key(target, key)?;
        std::thread::sleep(self.key_delay);
        Ok(())
    }

    pub fn wait_ready(&self, target: &str) -> bool {
        self.bridge.wait_for_tui_ready(target, self.tui_timeout)
    }

    /// Cursor starts at the top: Down × index, then Enter.
    pub fn inject_single_select(&self, target: &str, option: usize) -> Result<(), FormError> {
        debug!(target = target, option, "injecting single-select");
        for _ in 0..option {
            self.delayed_key(target, SpecialKey::Down)?;
        }
        self.delayed_key(target, SpecialKey::Enter)
    }

    /// Walk the cursor through each selected index in ascending order,
    /// toggling with Space (toggles render asynchronously, hence the settle
    /// delay), then move past the last option to the confirm control.
    pub fn inject_multi_select(
        &self,
        target: &str,
        option_count: usize,
        selected: &[usize],
    ) -> Result<(), FormError> {
        let mut sorted: Vec<usize> = selected.to_vec();
        sorted.sort_unstable();
        debug!(target = target, options = option_count, ?sorted, "injecting multi-select");

        let mut cursor = 0usize;
        for idx in sorted {
            for _ in 0..(idx - cursor) {
                self.delayed_key(target, SpecialKey::Down)?;
            }
            self.delayed_key(target, SpecialKey::Space)?;
            std::thread::sleep(self.toggle_settle);
            cursor = idx;
        }

        for _ in 0..(option_count - cursor + 1) {
            self.delayed_key(target, SpecialKey::Down)?;
        }
        self.delayed_key(target, SpecialKey::Enter)
    }

    pub fn send_enter(&self, target: &str) -> Result<(), FormError> {
        Ok(self.bridge.send_special_key(target, SpecialKey::Enter)?)
    }
}

struct PendingForm {
    pending_id: u64,
    session_id: String,
    terminal_target: String,
    questions: Vec<QuestionItem>,
    current_index: usize,
    answers: HashMap<usize, Vec<usize>>,
    message_ids: HashMap<usize, i64>,
    toggles: HashMap<usize, BTreeSet<usize>>,
    created_at: Instant,
}

#[derive(Default)]
struct TrackerInner {
    pending: HashMap<String, PendingForm>,
    by_id: HashMap<u64, String>,
    next_id: u64,
    processed: VecDeque<String>,
    processed_set: HashSet<String>,
}

impl TrackerInner {
    fn clear_pending(&mut self, session_id: &str, arena: &DeadlineArena) {
        if let Some(form) = self.pending.remove(session_id) {
            self.by_id.remove(&form.pending_id);
        }
        arena.cancel(session_id);
    }
}

/// What became of one callback delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Handled,
    /// Exact duplicate delivery, dropped before processing.
    Duplicate,
    /// The form it referenced no longer exists.
    Expired,
    /// Not a form callback; the chat client routes it elsewhere.
    Ignored,
}

/// Owns in-flight multi-question forms and the callback pipeline.
pub struct PendingFormTracker {
    inner: Mutex<TrackerInner>,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    injector: FormInjector,
    arena: Arc<DeadlineArena>,
    expire: Duration,
    advance_delay: Duration,
}

impl PendingFormTracker {
    pub fn new(injector: FormInjector, arena: Arc<DeadlineArena>) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            locks: Mutex::new(HashMap::new()),
            injector,
            arena,
            expire: FORM_EXPIRE,
            advance_delay: ADVANCE_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_expiry(injector: FormInjector, arena: Arc<DeadlineArena>, expire: Duration) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            locks: Mutex::new(HashMap::new()),
            injector,
            arena,
            expire,
            advance_delay: Duration::ZERO,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn has_pending(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().pending.contains_key(session_id)
    }

    /// Register a new form and send its first question. A form already
    /// pending for the same session is silently retired first.
    pub fn forward_question(&self, event: AskQuestionEvent, channel: &dyn FormChannel) {
        if event.questions.is_empty() || event.terminal_target.is_empty() {
            return;
        }

        let (pending_id, total, first) = {
            let mut inner = self.inner.lock().unwrap();

            if inner.pending.len() >= MAX_PENDING && !inner.pending.contains_key(&event.session_id)
            {
                if let Some(oldest) = inner
                    .pending
                    .values()
                    .min_by_key(|f| f.created_at)
                    .map(|f| f.session_id.clone())
                {
                    warn!(evicted = %oldest, "pending form capacity reached");
                    inner.clear_pending(&oldest, &self.arena);
                }
            }

            inner.clear_pending(&event.session_id, &self.arena);

            inner.next_id += 1;
            let pending_id = inner.next_id;
            let total = event.questions.len();
            let first = event.questions[0].clone();

            info!(
                session = %event.session_id,
                target = %event.terminal_target,
                questions = total,
                pending_id,
                "tracking form"
            );

            inner.by_id.insert(pending_id, event.session_id.clone());
            inner.pending.insert(
                event.session_id.clone(),
                PendingForm {
                    pending_id,
                    session_id: event.session_id.clone(),
                    terminal_target: event.terminal_target.clone(),
                    questions: event.questions,
                    current_index: 0,
                    answers: HashMap::new(),
                    message_ids: HashMap::new(),
                    toggles: HashMap::new(),
                    created_at: Instant::now(),
                },
            );
            self.arena
                .schedule(&event.session_id, Instant::now() + self.expire);

            (pending_id, total, first)
        };

        self.send_question(&event.session_id, pending_id, 0, total, &first, channel);
    }

    fn send_question(
        &self,
        session_id: &str,
        pending_id: u64,
        index: usize,
        total: usize,
        question: &QuestionItem,
        channel: &dyn FormChannel,
    ) {
        match channel.send_question(session_id, pending_id, index, total, question) {
            Ok(message_id) => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(form) = inner.pending.get_mut(session_id) {
                    form.message_ids.insert(index, message_id);
                    if question.multi_select {
                        form.toggles.entry(index).or_default();
                    }
                }
            }
            Err(e) => warn!(session = session_id, error = %e, "failed to send question"),
        }
    }

    /// Process one chat callback. Exact duplicate deliveries are dropped;
    /// everything else is serialized per source message id so rapid taps
    /// cannot race into a double key-injection.
    pub fn handle_callback(
        &self,
        query: &crate::channel::CallbackQuery,
        channel: &dyn FormChannel,
    ) -> CallbackOutcome {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.processed_set.contains(&query.id) {
                debug!(callback = %query.id, "duplicate callback dropped");
                let _ = channel.ack_callback(&query.id, None);
                return CallbackOutcome::Duplicate;
            }
            inner.processed_set.insert(query.id.clone());
            inner.processed.push_back(query.id.clone());
            if inner.processed.len() > PROCESSED_CALLBACK_CAP
                && let Some(evicted) = inner.processed.pop_front()
            {
                inner.processed_set.remove(&evicted);
            }
        }

        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(query.message_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().unwrap();

        match CallbackData::parse(&query.data) {
            Some(CallbackData::AnswerSingle {
                pending_id,
                question,
                option,
            }) => self.handle_single(&query.id, pending_id, question, option, channel),
            Some(CallbackData::MultiToggle {
                pending_id,
                question,
                option,
            }) => self.handle_toggle(&query.id, pending_id, question, option, channel),
            Some(CallbackData::MultiConfirm { pending_id, question }) => {
                self.handle_confirm(&query.id, pending_id, question, channel)
            }
            _ => CallbackOutcome::Ignored,
        }
    }

    /// Snapshot the fields needed to process question `index` of form
    /// `pending_id`, without holding the lock through channel/tmux I/O.
    fn snapshot(
        &self,
        pending_id: u64,
        index: usize,
    ) -> Option<(String, String, QuestionItem, Option<i64>, usize)> {
        let inner = self.inner.lock().unwrap();
        let session_id = inner.by_id.get(&pending_id)?.clone();
        let form = inner.pending.get(&session_id)?;
        let question = form.questions.get(index)?.clone();
        Some((
            session_id,
            form.terminal_target.clone(),
            question,
            form.message_ids.get(&index).copied(),
            form.questions.len(),
        ))
    }

    fn handle_single(
        &self,
        callback_id: &str,
        pending_id: u64,
        question_idx: usize,
        option: usize,
        channel: &dyn FormChannel,
    ) -> CallbackOutcome {
        let Some((session_id, target, question, message_id, total)) =
            self.snapshot(pending_id, question_idx)
        else {
            let _ = channel.ack_callback(callback_id, Some("This question has expired."));
            return CallbackOutcome::Expired;
        };
        if question.option_out_of_range(option) {
            return CallbackOutcome::Ignored;
        }

        let _ = channel.ack_callback(callback_id, Some("Sending…"));

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(form) = inner.pending.get_mut(&session_id) {
                form.answers.insert(question_idx, vec![option]);
            }
        }

        if let Some(message_id) = message_id {
            let label = &question.options[option].label;
            let _ = channel.update_question(
                message_id,
                &format!("Question {}/{total}\nSelected: {label}", question_idx + 1),
            );
        }

        if self.injector.wait_ready(&target) {
            if let Err(e) = self.injector.inject_single_select(&target, option) {
                self.surface_injection_failure(&session_id, &e, channel);
            }
        } else {
            self.surface_injection_failure(
                &session_id,
                &FormError::NotReady(target.clone()),
                channel,
            );
        }

        self.advance(&session_id, channel);
        CallbackOutcome::Handled
    }

    fn handle_toggle(
        &self,
        callback_id: &str,
        pending_id: u64,
        question_idx: usize,
        option: usize,
        channel: &dyn FormChannel,
    ) -> CallbackOutcome {
        let Some((session_id, _target, question, message_id, _total)) =
            self.snapshot(pending_id, question_idx)
        else {
            let _ = channel.ack_callback(callback_id, Some("This question has expired."));
            return CallbackOutcome::Expired;
        };
        if question.option_out_of_range(option) {
            return CallbackOutcome::Ignored;
        }

        let toggles = {
            let mut inner = self.inner.lock().unwrap();
            let Some(form) = inner.pending.get_mut(&session_id) else {
                return CallbackOutcome::Expired;
            };
            let set = form.toggles.entry(question_idx).or_default();
            if !set.remove(&option) {
                set.insert(option);
            }
            set.clone()
        };

        let _ = channel.ack_callback(callback_id, None);
        if let Some(message_id) = message_id {
            let _ = channel.update_keyboard(message_id, pending_id, question_idx, &question, &toggles);
        }
        CallbackOutcome::Handled
    }

    fn handle_confirm(
        &self,
        callback_id: &str,
        pending_id: u64,
        question_idx: usize,
        channel: &dyn FormChannel,
    ) -> CallbackOutcome {
        let Some((session_id, target, question, message_id, total)) =
            self.snapshot(pending_id, question_idx)
        else {
            let _ = channel.ack_callback(callback_id, Some("This question has expired."));
            return CallbackOutcome::Expired;
        };

        let _ = channel.ack_callback(callback_id, Some("Sending…"));

        let selected: Vec<usize> = {
            let mut inner = self.inner.lock().unwrap();
            let Some(form) = inner.pending.get_mut(&session_id) else {
                return CallbackOutcome::Expired;
            };
            let selected: Vec<usize> = form
                .toggles
                .get(&question_idx)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            form.answers.insert(question_idx, selected.clone());
            selected
        };

        if let Some(message_id) = message_id {
            let labels: Vec<&str> = selected
                .iter()
                .filter_map(|&i| question.options.get(i).map(|o| o.label.as_str()))
                .collect();
            let _ = channel.update_question(
                message_id,
                &format!(
                    "Question {}/{total}\nSelected: {}",
                    question_idx + 1,
                    labels.join(", ")
                ),
            );
        }

        if self.injector.wait_ready(&target) {
            if let Err(e) =
                self.injector
                    .inject_multi_select(&target, question.options.len(), &selected)
            {
                self.surface_injection_failure(&session_id, &e, channel);
            }
        } else {
            self.surface_injection_failure(
                &session_id,
                &FormError::NotReady(target.clone()),
                channel,
            );
        }

        self.advance(&session_id, channel);
        CallbackOutcome::Handled
    }

    fn surface_injection_failure(
        &self,
        session_id: &str,
        error: &FormError,
        channel: &dyn FormChannel,
    ) {
        warn!(session = session_id, error = %error, "form injection failed");
        let _ = channel.send_text(
            session_id,
            "Couldn't drive the form in the terminal — answer it in the pane directly.",
        );
    }

    /// Move to the next question, or submit the whole form after the last
    /// one. The extra Enter guards against forms whose final question
    /// auto-advances.
    fn advance(&self, session_id: &str, channel: &dyn FormChannel) {
        let next = {
            let mut inner = self.inner.lock().unwrap();
            let Some(form) = inner.pending.get_mut(session_id) else {
                return;
            };
            form.current_index += 1;
            if form.current_index >= form.questions.len() {
                None
            } else {
                Some((
                    form.pending_id,
                    form.current_index,
                    form.questions.len(),
                    form.questions[form.current_index].clone(),
                    form.terminal_target.clone(),
                ))
            }
        };

        match next {
            Some((pending_id, index, total, question, _target)) => {
                std::thread::sleep(self.advance_delay);
                self.send_question(session_id, pending_id, index, total, &question, channel);
            }
            None => {
                std::thread::sleep(self.advance_delay);
                let completed = {
                    let inner = self.inner.lock().unwrap();
                    inner
                        .pending
                        .get(session_id)
                        .map(|f| (f.terminal_target.clone(), f.answers.len(), f.questions.len()))
                };
                if let Some((target, answered, total)) = completed {
                    if self.injector.wait_ready(&target) {
                        let _ = self.injector.send_enter(&target);
                    }
                    info!(session = session_id, answered, total, "form complete");
                }
                self.inner
                    .lock()
                    .unwrap()
                    .clear_pending(session_id, &self.arena);
                let _ = channel.send_text(session_id, "All questions answered.");
            }
        }
    }

    /// Drop forms whose expiry deadline passed; called from housekeeping.
    pub fn expire_due(&self) {
        for session_id in self.arena.take_due(Instant::now()) {
            info!(session = %session_id, "form expired");
            self.inner
                .lock()
                .unwrap()
                .clear_pending(&session_id, &self.arena);
        }
    }
}

impl QuestionItem {
    fn option_out_of_range(&self, option: usize) -> bool {
        option >= self.options.len()
    }
}
