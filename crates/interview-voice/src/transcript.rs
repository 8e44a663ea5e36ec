//! Append-only transcript of a session.
//!
//! A partial entry is rewritten in place (same id) until finalized; after that it is frozen and
//! later partials open a new entry. At most one trailing partial exists per speaker, and a new
//! speaker's partial closes any other open partial first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Ai,
}

impl Speaker {
    /// Chat role used when the entry is sent to the completion collaborator.
    pub fn chat_role(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Ai => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub speaker: Speaker,
    pub text: String,
    pub is_partial: bool,
    /// Set on AI entries cut short by a barge-in. The text is kept as generated.
    #[serde(default)]
    pub interrupted: bool,
}

impl TranscriptEntry {
    fn new(speaker: Speaker, text: String, is_partial: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            speaker,
            text,
            is_partial,
            interrupted: false,
        }
    }
}

/// Role-tagged message for the completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn get(&self, id: Uuid) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Index of the open partial for `speaker`, if any.
    fn open_partial_index(&self, speaker: Speaker) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|e| e.speaker == speaker)
            .filter(|&i| self.entries[i].is_partial)
    }

    pub fn open_partial(&self, speaker: Speaker) -> Option<&TranscriptEntry> {
        self.open_partial_index(speaker).map(|i| &self.entries[i])
    }

    fn close_other_partials(&mut self, speaker: Speaker) {
        for entry in self.entries.iter_mut().filter(|e| e.speaker != speaker && e.is_partial) {
            entry.is_partial = false;
        }
    }

    /// Replace the open partial's text for `speaker`, or open a new partial.
    /// Empty text is ignored and returns `None`.
    pub fn upsert_partial(&mut self, speaker: Speaker, text: &str) -> Option<&TranscriptEntry> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.close_other_partials(speaker);
        match self.open_partial_index(speaker) {
            Some(i) => {
                let entry = &mut self.entries[i];
                entry.text = text.to_string();
                entry.timestamp = Utc::now();
                Some(&self.entries[i])
            }
            None => {
                self.entries.push(TranscriptEntry::new(speaker, text.to_string(), true));
                self.entries.last()
            }
        }
    }

    /// Close the speaker's open partial with `text` (or its last partial text when `text` is
    /// empty). Without an open partial, non-empty text appends a final entry; empty text
    /// produces no entry.
    pub fn finalize(&mut self, speaker: Speaker, text: &str) -> Option<&TranscriptEntry> {
        let text = text.trim();
        self.close_other_partials(speaker);
        match self.open_partial_index(speaker) {
            Some(i) => {
                let entry = &mut self.entries[i];
                if !text.is_empty() {
                    entry.text = text.to_string();
                }
                entry.is_partial = false;
                entry.timestamp = Utc::now();
                Some(&self.entries[i])
            }
            None if text.is_empty() => None,
            None => {
                self.entries.push(TranscriptEntry::new(speaker, text.to_string(), false));
                self.entries.last()
            }
        }
    }

    /// Append a final entry. Equivalent to `finalize` when no partial is open.
    pub fn append(&mut self, speaker: Speaker, text: &str) -> Option<&TranscriptEntry> {
        self.finalize(speaker, text)
    }

    /// Flag an AI entry as interrupted. Returns false if the id is unknown.
    pub fn mark_interrupted(&mut self, id: Uuid) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.interrupted = true;
                true
            }
            None => false,
        }
    }

    /// Finalized entries as chat messages, oldest first.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .filter(|e| !e.is_partial)
            .map(|e| ChatMessage {
                role: e.speaker.chat_role().to_string(),
                content: e.text.clone(),
            })
            .collect()
    }

    /// True when the newest finalized entry is the user's (a reply is still owed).
    pub fn last_is_unanswered_user(&self) -> bool {
        self.entries
            .iter()
            .rev()
            .find(|e| !e.is_partial)
            .is_some_and(|e| e.speaker == Speaker::User)
    }
}

/// Shared handle over a [`TranscriptLog`]. The lock is never held across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    inner: Arc<Mutex<TranscriptLog>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TranscriptLog> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn upsert_partial(&self, speaker: Speaker, text: &str) -> Option<TranscriptEntry> {
        self.lock().upsert_partial(speaker, text).cloned()
    }

    pub fn finalize(&self, speaker: Speaker, text: &str) -> Option<TranscriptEntry> {
        self.lock().finalize(speaker, text).cloned()
    }

    pub fn append(&self, speaker: Speaker, text: &str) -> Option<TranscriptEntry> {
        self.lock().append(speaker, text).cloned()
    }

    pub fn mark_interrupted(&self, id: Uuid) -> bool {
        self.lock().mark_interrupted(id)
    }

    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.lock().to_messages()
    }

    pub fn last_is_unanswered_user(&self) -> bool {
        self.lock().last_is_unanswered_user()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<TranscriptEntry> {
        self.lock().get(id).cloned()
    }

    /// Owned copy for observers and persistence.
    pub fn snapshot(&self) -> TranscriptLog {
        self.lock().clone()
    }
}
