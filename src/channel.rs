//! External collaborator seams.
//!
//! The chat platform itself (message formatting, command registration,
//! pagination) lives outside this crate. tether only depends on these narrow
//! traits; the shipped `LogChannel` writes everything to the log so the
//! daemon runs standalone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel send failed: {0}")]
    Send(String),
    /// Produced by chat-platform implementations when a message edit is
    /// rejected (deleted message, stale keyboard).
    #[allow(dead_code)]
    #[error("channel edit failed: {0}")]
    Edit(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitChangeStatus {
    Modified,
    Added,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitChange {
    pub file: String,
    pub status: GitChangeStatus,
}

/// Normalized payload for a turn-completed notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationData {
    pub agent: String,
    pub agent_display_name: String,
    pub project_name: String,
    pub response_summary: String,
    pub duration_ms: u64,
    pub git_changes: Vec<GitChange>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One question of a structured prompt rendered by the agent's TUI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub question: String,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub multi_select: bool,
    pub options: Vec<QuestionOption>,
}

/// A structured question event bound to a concrete pane.
#[derive(Debug, Clone)]
pub struct AskQuestionEvent {
    pub session_id: String,
    pub terminal_target: String,
    pub questions: Vec<QuestionItem>,
}

/// A button press arriving from the chat platform. `id` is the platform's
/// delivery id (used for dedup); `message_id` identifies the chat message
/// the button belongs to (used for ordering).
#[derive(Debug, Clone)]
pub struct CallbackQuery {
    pub id: String,
    pub message_id: i64,
    pub data: String,
}

/// Outbound turn-completed / blocked notifications.
pub trait NotificationChannel: Send + Sync {
    fn send_notification(
        &self,
        data: &NotificationData,
        response_url: Option<&str>,
    ) -> Result<(), ChannelError>;
}

/// Chat-side rendering of multi-question forms. Returns platform message ids
/// so answers can edit the message they belong to.
pub trait FormChannel: Send + Sync {
    fn send_question(
        &self,
        session_id: &str,
        pending_id: u64,
        index: usize,
        total: usize,
        question: &QuestionItem,
    ) -> Result<i64, ChannelError>;

    /// Replace a question message with its answered summary.
    fn update_question(&self, message_id: i64, text: &str) -> Result<(), ChannelError>;

    /// Re-render a multi-select keyboard with the current toggle set.
    fn update_keyboard(
        &self,
        message_id: i64,
        pending_id: u64,
        index: usize,
        question: &QuestionItem,
        toggles: &BTreeSet<usize>,
    ) -> Result<(), ChannelError>;

    /// Acknowledge a callback delivery, optionally with a toast text.
    fn ack_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChannelError>;

    fn send_text(&self, session_id: &str, text: &str) -> Result<(), ChannelError>;
}

/// Log-only channel used when no chat platform is attached.
#[derive(Debug, Default)]
pub struct LogChannel;

impl NotificationChannel for LogChannel {
    fn send_notification(
        &self,
        data: &NotificationData,
        response_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        info!(
            project = %data.project_name,
            agent = %data.agent,
            duration_ms = data.duration_ms,
            url = response_url.unwrap_or("-"),
            summary = %data.response_summary,
            "notification"
        );
        Ok(())
    }
}

impl FormChannel for LogChannel {
    fn send_question(
        &self,
        session_id: &str,
        pending_id: u64,
        index: usize,
        total: usize,
        question: &QuestionItem,
    ) -> Result<i64, ChannelError> {
        info!(
            session = session_id,
            pending_id,
            index,
            total,
            question = %question.question,
            "question"
        );
        Ok(pending_id as i64 * 1000 + index as i64)
    }

    fn update_question(&self, message_id: i64, text: &str) -> Result<(), ChannelError> {
        info!(message_id, text, "question update");
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
        info!(message_id, ?toggles, "keyboard update");
        Ok(())
    }

    fn ack_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChannelError> {
        info!(callback_id, text = text.unwrap_or(""), "callback ack");
        Ok(())
    }

    fn send_text(&self, session_id: &str, text: &str) -> Result<(), ChannelError> {
        info!(session = session_id, text, "message");
        Ok(())
    }
}
