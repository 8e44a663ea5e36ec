//! Speech capture pipeline: drives the recognition engine for one user utterance at a time.
//!
//! Implements the "gap logic" for a recognizer that never says when the user is done: every
//! partial re-arms a silence timer, and when it elapses the pending partial is finalized and
//! capture stops. Partials are throttled to one event per `partial_interval` so downstream
//! observers only see the newest text, never an interleaving.

use crate::barge_in::BargeInCoordinator;
use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::recognizer::{RecognizerError, RecognizerEvent, SpeechRecognizer};
use crate::transcript::{Speaker, Transcript};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a capture session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called.
    Requested,
    /// No partial arrived within the silence timeout.
    Silence,
    /// The engine delivered its final result.
    EngineFinal,
    /// The engine reported an error.
    Error,
}

/// Events published by the capture pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Started,
    /// Newest in-progress text of the current utterance (speaker = user).
    Partial { entry_id: Uuid, text: String },
    /// Terminal text of the utterance; emitted once, always before `Stopped`.
    Final { entry_id: Uuid, text: String },
    Stopped { reason: StopReason },
    /// Engine failure. Capture is already stopped when this arrives.
    Error { message: String },
    Volume(f32),
}

#[derive(Debug, Default)]
struct CaptureState {
    is_listening: bool,
    /// Latest engine partial for the current utterance; may be ahead of what was emitted.
    partial_text: String,
    emitted_text: String,
    last_partial_emit: Option<Instant>,
    /// Bumped on every start and stop so a stale event loop can tell it has been superseded.
    generation: u64,
}

struct CaptureInner {
    recognizer: Arc<dyn SpeechRecognizer>,
    config: CaptureConfig,
    transcript: Transcript,
    state: Mutex<CaptureState>,
    events: broadcast::Sender<CaptureEvent>,
    barge_in: Mutex<Option<Arc<BargeInCoordinator>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes start/stop so engine calls never overlap.
    ops: tokio::sync::Mutex<()>,
}

/// Handle to the capture pipeline. Cloning shares the same pipeline.
#[derive(Clone)]
pub struct CapturePipeline {
    inner: Arc<CaptureInner>,
}

impl CapturePipeline {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        config: CaptureConfig,
        transcript: Transcript,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(CaptureInner {
                recognizer,
                config,
                transcript,
                state: Mutex::new(CaptureState::default()),
                events,
                barge_in: Mutex::new(None),
                task: Mutex::new(None),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Route capture-start signals through `coordinator` so AI speech is cut before listening.
    pub fn with_barge_in(self, coordinator: Arc<BargeInCoordinator>) -> Self {
        *lock(&self.inner.barge_in) = Some(coordinator);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.state).is_listening
    }

    /// Latest engine partial of the utterance in progress (empty when idle).
    pub fn partial_text(&self) -> String {
        lock(&self.inner.state).partial_text.clone()
    }

    /// Succeeds when the engine exists and has microphone permission.
    pub async fn ready(&self) -> VoiceResult<()> {
        if self.inner.recognizer.is_available().await {
            Ok(())
        } else {
            Err(VoiceError::CaptureUnavailable(
                "speech recognition unavailable or permission denied".to_string(),
            ))
        }
    }

    /// Begin capturing one utterance. No-op while already listening.
    pub async fn start(&self) -> VoiceResult<()> {
        let _op = self.inner.ops.lock().await;
        if self.is_listening() {
            return Ok(());
        }

        // Any AI audio must be gone before the microphone is ours.
        self.inner.signal_capture_started();

        self.ready().await?;
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        self.inner.start_engine(engine_tx).await?;

        let generation = {
            let mut st = lock(&self.inner.state);
            st.is_listening = true;
            st.partial_text.clear();
            st.emitted_text.clear();
            st.last_partial_emit = None;
            st.generation += 1;
            st.generation
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(engine_rx, generation).await });
        if let Some(old) = lock(&self.inner.task).replace(handle) {
            old.abort();
        }

        info!(locale = %self.inner.config.locale, "Capture: listening");
        self.inner.emit(CaptureEvent::Started);
        Ok(())
    }

    /// Halt capture. A pending partial is finalized into the transcript before this returns.
    pub async fn stop(&self) -> VoiceResult<()> {
        let _op = self.inner.ops.lock().await;
        if let Some(task) = lock(&self.inner.task).take() {
            task.abort();
        }
        self.inner.finish(None, StopReason::Requested).await;
        Ok(())
    }
}

impl CaptureInner {
    fn emit(&self, event: CaptureEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn signal_capture_started(&self) {
        let coordinator = lock(&self.barge_in).clone();
        if let Some(coordinator) = coordinator {
            coordinator.on_capture_started();
        }
    }

    async fn start_engine(&self, events: mpsc::UnboundedSender<RecognizerEvent>) -> VoiceResult<()> {
        let mut attempt = 0;
        loop {
            match self.recognizer.start(&self.config.locale, events.clone()).await {
                Ok(()) => return Ok(()),
                Err(RecognizerError::Unavailable(msg)) => {
                    return Err(VoiceError::CaptureUnavailable(msg));
                }
                Err(RecognizerError::Failed(msg)) if attempt < self.config.start_retries => {
                    attempt += 1;
                    warn!(attempt, "Capture: engine start failed ({}), retrying", msg);
                }
                Err(RecognizerError::Failed(msg)) => return Err(VoiceError::Capture(msg)),
            }
        }
    }

    /// Event loop for one utterance.
    async fn run(self: Arc<Self>, mut engine_rx: mpsc::UnboundedReceiver<RecognizerEvent>, generation: u64) {
        let silence_timeout = self.config.silence_timeout();
        let interval = self.config.partial_interval();
        let mut silence_deadline: Option<Instant> = None;
        let mut flush_at: Option<Instant> = None;
        let mut engine_open = true;

        loop {
            tokio::select! {
                event = engine_rx.recv(), if engine_open => {
                    let Some(event) = event else {
                        debug!("Capture: engine channel closed");
                        engine_open = false;
                        silence_deadline.get_or_insert_with(|| Instant::now() + silence_timeout);
                        continue;
                    };
                    match event {
                        RecognizerEvent::Partial(text) => {
                            let now = Instant::now();
                            silence_deadline = Some(now + silence_timeout);
                            let due = {
                                let mut st = lock(&self.state);
                                if st.generation != generation {
                                    return;
                                }
                                st.partial_text = text;
                                st.last_partial_emit.map_or(now, |t| t + interval)
                            };
                            if due <= now {
                                flush_at = None;
                                self.emit_partial(generation);
                            } else {
                                flush_at.get_or_insert(due);
                            }
                        }
                        RecognizerEvent::Final(text) => {
                            {
                                let mut st = lock(&self.state);
                                if st.generation != generation {
                                    return;
                                }
                                if !text.trim().is_empty() {
                                    st.partial_text = text;
                                }
                            }
                            self.finish(Some(generation), StopReason::EngineFinal).await;
                            return;
                        }
                        // Only partials and SpeechEnded move the silence deadline.
                        RecognizerEvent::SpeechStarted => self.signal_capture_started(),
                        RecognizerEvent::SpeechEnded => {
                            silence_deadline = Some(Instant::now() + silence_timeout);
                        }
                        RecognizerEvent::Error(message) => {
                            warn!("Capture: engine error: {}", message);
                            self.finish(Some(generation), StopReason::Error).await;
                            self.emit(CaptureEvent::Error { message });
                            return;
                        }
                        RecognizerEvent::Volume(level) => self.emit(CaptureEvent::Volume(level)),
                    }
                }
                _ = sleep_opt(silence_deadline) => {
                    info!("Capture: {:?} of silence, ending turn", silence_timeout);
                    self.finish(Some(generation), StopReason::Silence).await;
                    return;
                }
                _ = sleep_opt(flush_at) => {
                    flush_at = None;
                    self.emit_partial(generation);
                }
            }
        }
    }

    /// Publish the newest partial if it changed since the last emission.
    fn emit_partial(&self, generation: u64) {
        let event = {
            let mut st = lock(&self.state);
            if st.generation != generation || !st.is_listening || st.partial_text == st.emitted_text {
                return;
            }
            let Some(entry) = self.transcript.upsert_partial(Speaker::User, &st.partial_text) else {
                return;
            };
            st.emitted_text = st.partial_text.clone();
            st.last_partial_emit = Some(Instant::now());
            CaptureEvent::Partial {
                entry_id: entry.id,
                text: entry.text,
            }
        };
        debug!(?event, "Capture: partial");
        self.emit(event);
    }

    /// Stop listening: finalize whatever partial exists, stop the engine, announce `Stopped`.
    /// `expected` restricts the call to the capture session that spawned the caller.
    async fn finish(&self, expected: Option<u64>, reason: StopReason) {
        let finalized = {
            let mut st = lock(&self.state);
            if !st.is_listening || expected.is_some_and(|g| g != st.generation) {
                return;
            }
            st.is_listening = false;
            st.generation += 1;
            st.last_partial_emit = None;
            st.emitted_text.clear();
            let pending = std::mem::take(&mut st.partial_text);
            self.transcript.finalize(Speaker::User, &pending)
        };
        if expected.is_some() {
            // Called from the event loop itself; nothing left to abort.
            lock(&self.task).take();
        }

        if let Some(entry) = finalized {
            info!(entry_id = %entry.id, "Capture: final \"{}\"", entry.text);
            self.emit(CaptureEvent::Final {
                entry_id: entry.id,
                text: entry.text,
            });
        }

        if let Err(e) = self.recognizer.stop().await {
            warn!("Capture: engine stop failed: {}", e);
        }
        debug!(?reason, "Capture: stopped");
        self.emit(CaptureEvent::Stopped { reason });
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
