//! **Speech recognition engine**: the on-device recognizer the capture pipeline drives.
//!
//! The engine is imperative (start/stop) and reports progress as [`RecognizerEvent`]s on the
//! channel handed to `start`. Implement [`SpeechRecognizer`] for a platform engine; use
//! [`PlaceholderRecognizer`] to replay scripted utterances without a microphone.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Events emitted by a recognition engine while capturing.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    /// The engine heard the start of speech.
    SpeechStarted,
    /// The engine believes speech ended (no final yet).
    SpeechEnded,
    /// In-progress transcription; supersedes earlier partials of the same utterance.
    Partial(String),
    /// Terminal transcription of the utterance.
    Final(String),
    Error(String),
    /// Input level, 0.0..=1.0, for UI meters.
    Volume(f32),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecognizerError {
    /// Permission denied or no engine on this device.
    #[error("recognizer unavailable: {0}")]
    Unavailable(String),
    #[error("recognizer failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Whether the engine exists and microphone permission is granted.
    async fn is_available(&self) -> bool;

    /// Begin continuous recognition, reporting on `events` until stopped.
    async fn start(
        &self,
        locale: &str,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> Result<(), RecognizerError>;

    async fn stop(&self) -> Result<(), RecognizerError>;
}

/// Replays scripted utterances: each `start` speaks the next one word by word as partials,
/// then a final. With the script exhausted it listens silently.
pub struct PlaceholderRecognizer {
    utterances: Mutex<VecDeque<String>>,
    word_delay: Duration,
    available: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaceholderRecognizer {
    pub fn new<I, S>(utterances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            utterances: Mutex::new(utterances.into_iter().map(Into::into).collect()),
            word_delay: Duration::from_millis(250),
            available: true,
            task: Mutex::new(None),
        }
    }

    /// An engine that reports no permission.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::<String>::new())
        }
    }

    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    fn abort_running(&self) {
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl SpeechRecognizer for PlaceholderRecognizer {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn start(
        &self,
        locale: &str,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> Result<(), RecognizerError> {
        if !self.available {
            return Err(RecognizerError::Unavailable("placeholder has no microphone".to_string()));
        }
        self.abort_running();
        let next = self
            .utterances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        let Some(utterance) = next else {
            debug!(locale, "PlaceholderRecognizer: script exhausted, listening silently");
            return Ok(());
        };
        let delay = self.word_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events.send(RecognizerEvent::SpeechStarted).is_err() {
                return;
            }
            let mut heard = String::new();
            for word in utterance.split_whitespace() {
                tokio::time::sleep(delay).await;
                if !heard.is_empty() {
                    heard.push(' ');
                }
                heard.push_str(word);
                if events.send(RecognizerEvent::Partial(heard.clone())).is_err() {
                    return;
                }
            }
            tokio::time::sleep(delay).await;
            let _ = events.send(RecognizerEvent::SpeechEnded);
            let _ = events.send(RecognizerEvent::Final(utterance));
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), RecognizerError> {
        self.abort_running();
        Ok(())
    }
}
