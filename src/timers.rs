//! Deadline arena for pending-state expiry.
//!
//! One inspectable table of `(id, deadline)` entries instead of ad hoc
//! per-map timers. Owners schedule an id when pending state is created,
//! cancel it on normal completion, and the housekeeping tick collects due
//! ids and expires the state they guard.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Default)]
pub struct DeadlineArena {
    entries: Mutex<HashMap<String, Instant>>,
}

impl DeadlineArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule (or reschedule) `id` to fire at `deadline`.
    pub fn schedule(&self, id: &str, deadline: Instant) {
        self.entries.lock().unwrap().insert(id.to_string(), deadline);
    }

    /// Cancel-on-complete. Returns whether anything was pending.
    pub fn cancel(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    /// Remove and return every id whose deadline has passed.
    pub fn take_due(&self, now: Instant) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            entries.remove(id);
        }
        due
    }

    /// Currently-scheduled ids, for inspection.
    #[allow(dead_code)]
    pub fn pending(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
