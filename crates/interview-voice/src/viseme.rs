//! Approximate visemes for lip-sync when the synthesis provider supplies none.
//!
//! Letter classes, not phonemes: timing is a rough guide for the avatar renderer. Offsets are
//! relative to the start of the clip's playback, never wall-clock time.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Length of one generated viseme.
pub const VISEME_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisemeEvent {
    pub phoneme: String,
    pub timestamp_offset_ms: u64,
    pub duration_ms: u64,
}

/// Immutable viseme sequence for one utterance. Cloning shares the same buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisemeTrack {
    events: Arc<[VisemeEvent]>,
}

impl VisemeTrack {
    pub fn new(events: Vec<VisemeEvent>) -> Self {
        Self {
            events: events.into(),
        }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(generate_visemes(text))
    }

    pub fn events(&self) -> &[VisemeEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// End offset of the last viseme.
    pub fn duration_ms(&self) -> u64 {
        self.events
            .last()
            .map(|v| v.timestamp_offset_ms + v.duration_ms)
            .unwrap_or(0)
    }
}

fn letter_viseme(c: char) -> &'static str {
    match c {
        'a' | 'e' | 'i' | 'o' | 'u' | 'h' | 'j' | 'k' | 'l' => "ah",
        'b' | 'c' | 'd' | 'f' | 'g' | 'm' | 'n' | 'p' => "mm",
        'q' | 'r' | 's' | 't' => "ss",
        'v' | 'w' | 'x' | 'y' | 'z' => "ff",
        _ => "ah",
    }
}

/// Open, one viseme per letter, close; laid end to end per word.
pub fn generate_visemes(text: &str) -> Vec<VisemeEvent> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    for word in text.split_whitespace() {
        let letters = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase);
        let shapes = std::iter::once("ah")
            .chain(letters.map(letter_viseme))
            .chain(std::iter::once("mm"));
        for shape in shapes {
            out.push(VisemeEvent {
                phoneme: shape.to_string(),
                timestamp_offset_ms: offset,
                duration_ms: VISEME_MS,
            });
            offset += VISEME_MS;
        }
    }
    out
}
