//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use interview_voice::{
    CompletionClient, CompletionRequest, RecognizerError, RecognizerEvent, SpeechRecognizer, SpeechSynthesizer,
    SynthesizedSpeech, VoiceError, VoiceResult, VoiceSettings,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Recognizer driven by the test: events are injected with [`ManualRecognizer::emit`].
#[derive(Default)]
pub struct ManualRecognizer {
    sender: Mutex<Option<mpsc::UnboundedSender<RecognizerEvent>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    unavailable: bool,
    failures_left: AtomicUsize,
}

impl ManualRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// The next `n` starts fail with a transient error.
    pub fn failing_starts(n: usize) -> Self {
        let recognizer = Self::default();
        recognizer.failures_left.store(n, Ordering::SeqCst);
        recognizer
    }

    /// Deliver an event to the running capture. False when not started.
    pub fn emit(&self, event: RecognizerEvent) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for ManualRecognizer {
    async fn is_available(&self) -> bool {
        !self.unavailable
    }

    async fn start(&self, _locale: &str, events: mpsc::UnboundedSender<RecognizerEvent>) -> Result<(), RecognizerError> {
        if self.unavailable {
            return Err(RecognizerError::Unavailable("microphone permission denied".into()));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RecognizerError::Failed("engine busy".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.sender.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn stop(&self) -> Result<(), RecognizerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

/// Synthesizer that records what it was asked to say and returns `bytes_per_char` bytes of
/// audio per character, so playback length on a `PacedOutput` is predictable.
pub struct RecordingTts {
    spoken: Mutex<Vec<String>>,
    bytes_per_char: usize,
    fail: bool,
    available: bool,
}

impl RecordingTts {
    pub fn new(bytes_per_char: usize) -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            bytes_per_char,
            fail: false,
            available: true,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(1)
        }
    }

    /// Reports itself unreachable before the session starts.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(1)
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingTts {
    fn name(&self) -> &str {
        "recording"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceSettings, _streaming: bool) -> VoiceResult<SynthesizedSpeech> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(VoiceError::Synthesis("503 Service Unavailable".into()));
        }
        Ok(SynthesizedSpeech::clip(vec![0; text.len() * self.bytes_per_char]))
    }
}

/// Completion double: scripted replies (or errors) after an optional delay; records requests.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<VoiceResult<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        let completion = Self::new(Vec::<String>::new());
        completion
            .replies
            .lock()
            .unwrap()
            .push_back(Err(VoiceError::Completion("timeout".into())));
        completion
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, request: CompletionRequest) -> VoiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Could you tell me more?".to_string()))
    }
}

/// Poll `cond` every 10 ms (virtual time under `start_paused`) for up to two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
