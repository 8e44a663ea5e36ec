//! **Speech synthesis pipeline**: ordered queue of utterances with one in flight at a time.
//!
//! ```text
//!   enqueue(text, priority) ──► queue ──► worker ──► provider.synthesize ──► chunks
//!                                   ▲                    │ (error: fallback once)   │
//!                                   │                    ▼                          ▼
//!   cancel() ── clears queue, ──────┘               output.append ◄── buffer ≥ min_buffer_bytes
//!               stops output, drops in-flight            │
//!                                                        ▼
//!                                               Started { visemes } … wait_until_end … Completed
//! ```
//!
//! High-priority items jump ahead of every queued normal item (FIFO among themselves).
//! Ordering is decided when the worker dequeues, so an item already in flight is never
//! displaced. `cancel()` is synchronous and idempotent: after it returns nothing is queued,
//! nothing is in flight, and the output has been told to stop.

pub mod output;
pub mod provider;

pub use output::{AudioOutput, NullOutput, PacedOutput};
#[cfg(feature = "playback")]
pub use output::RodioOutput;
pub use provider::{
    AudioChunkStream, ElevenLabsTts, OpenAiTts, PlaceholderTts, SpeechSynthesizer, SynthesizedSpeech, SystemVoiceTts,
};

use crate::config::SynthesisConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::viseme::VisemeTrack;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Identifies one enqueued utterance for the lifetime of its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tts-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Spoken before anything still queued (greetings, fallback replies).
    High,
    Normal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Queued { id: ItemId, priority: Priority },
    /// First audio reached the output. Viseme offsets are relative to this moment.
    Started { id: ItemId, visemes: VisemeTrack },
    Completed { id: ItemId },
    Cancelled { id: ItemId },
    /// The primary provider failed; this item is being spoken by the fallback voice.
    Degraded { id: ItemId, reason: String },
    Failed { id: ItemId, error: String },
}

/// Handle to one enqueued utterance.
#[derive(Debug)]
pub struct SynthesisTicket {
    id: ItemId,
    done: oneshot::Receiver<VoiceResult<()>>,
}

impl SynthesisTicket {
    pub fn id(&self) -> ItemId {
        self.id
    }

    /// Resolves when the item finished playing, failed, or was cancelled
    /// (`Err(VoiceError::Cancelled)`).
    pub async fn completed(self) -> VoiceResult<()> {
        self.done.await.unwrap_or(Err(VoiceError::Cancelled))
    }
}

/// What a `cancel()` call removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelReport {
    pub in_flight: Option<ItemId>,
    pub dropped: Vec<ItemId>,
}

impl CancelReport {
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.dropped.is_empty()
    }

    /// Every cancelled id, in-flight first.
    pub fn ids(&self) -> Vec<ItemId> {
        self.in_flight.iter().chain(self.dropped.iter()).copied().collect()
    }
}

struct QueueItem {
    id: ItemId,
    text: String,
    priority: Priority,
    done: oneshot::Sender<VoiceResult<()>>,
}

struct InFlight {
    id: ItemId,
    cancel: oneshot::Sender<()>,
    done: oneshot::Sender<VoiceResult<()>>,
}

#[derive(Default)]
struct SynthesisState {
    queue: VecDeque<QueueItem>,
    in_flight: Option<InFlight>,
    playing: bool,
    streaming: bool,
    next_id: u64,
    worker_started: bool,
}

impl SynthesisState {
    fn is_current(&self, id: ItemId) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.id == id)
    }
}

/// Error from playing one item; `started` says whether any audio reached the output.
struct PlayError {
    started: bool,
    error: VoiceError,
}

struct SynthesisInner {
    provider: Arc<dyn SpeechSynthesizer>,
    fallback: Option<Arc<dyn SpeechSynthesizer>>,
    output: Arc<dyn AudioOutput>,
    config: SynthesisConfig,
    state: Mutex<SynthesisState>,
    wake: Arc<Notify>,
    events: broadcast::Sender<SynthesisEvent>,
    visemes: broadcast::Sender<(ItemId, VisemeTrack)>,
}

impl Drop for SynthesisInner {
    fn drop(&mut self) {
        // Lets an idle worker observe that the pipeline is gone.
        self.wake.notify_one();
    }
}

/// Cloneable handle; all clones share one queue and one worker.
#[derive(Clone)]
pub struct SynthesisPipeline {
    inner: Arc<SynthesisInner>,
}

impl SynthesisPipeline {
    pub fn new(provider: Arc<dyn SpeechSynthesizer>, output: Arc<dyn AudioOutput>, config: SynthesisConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (visemes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SynthesisInner {
                provider,
                fallback: None,
                output,
                config,
                state: Mutex::new(SynthesisState::default()),
                wake: Arc::new(Notify::new()),
                events,
                visemes,
            }),
        }
    }

    /// Lower-fidelity voice used once per item when the primary provider fails.
    /// Call before the pipeline is cloned or used.
    pub fn with_fallback(mut self, fallback: Arc<dyn SpeechSynthesizer>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.fallback = Some(fallback),
            None => warn!("SynthesisPipeline: fallback ignored, pipeline already shared"),
        }
        self
    }

    /// Queue `text`. Must be called from within a Tokio runtime (the worker is spawned lazily).
    pub fn enqueue(&self, text: impl Into<String>, priority: Priority) -> SynthesisTicket {
        let (done_tx, done_rx) = oneshot::channel();
        let text = text.into();
        let id = {
            let mut st = self.inner.lock();
            st.next_id += 1;
            let id = ItemId(st.next_id);
            let item = QueueItem {
                id,
                text,
                priority,
                done: done_tx,
            };
            match priority {
                Priority::High => {
                    let at = st
                        .queue
                        .iter()
                        .position(|q| q.priority == Priority::Normal)
                        .unwrap_or(st.queue.len());
                    st.queue.insert(at, item);
                }
                Priority::Normal => st.queue.push_back(item),
            }
            if !st.worker_started {
                st.worker_started = true;
                tokio::spawn(run_worker(Arc::downgrade(&self.inner), Arc::clone(&self.inner.wake)));
            }
            id
        };
        debug!(%id, ?priority, "SynthesisPipeline: queued");
        self.inner.emit(SynthesisEvent::Queued { id, priority });
        self.inner.wake.notify_one();
        SynthesisTicket { id, done: done_rx }
    }

    /// Drop everything queued, abandon the in-flight item, and stop the output. No-op when idle.
    pub fn cancel(&self) -> CancelReport {
        let (in_flight, dropped) = {
            let mut st = self.inner.lock();
            let in_flight = st.in_flight.take();
            let dropped: Vec<QueueItem> = st.queue.drain(..).collect();
            st.playing = false;
            st.streaming = false;
            if in_flight.is_some() {
                self.inner.output.stop();
            }
            (in_flight, dropped)
        };

        let mut report = CancelReport::default();
        if let Some(f) = in_flight {
            // The worker drops its synthesis future (and any open stream) on this signal.
            let _ = f.cancel.send(());
            report.in_flight = Some(f.id);
        }
        report.dropped = dropped.into_iter().map(|q| q.id).collect();
        if !report.is_empty() {
            info!(in_flight = ?report.in_flight, dropped = report.dropped.len(), "SynthesisPipeline: cancelled");
            for id in report.ids() {
                self.inner.emit(SynthesisEvent::Cancelled { id });
            }
        }
        report
    }

    /// Succeeds when the primary voice, or failing that the fallback, is available.
    pub async fn ready(&self) -> VoiceResult<()> {
        if self.inner.provider.is_available().await {
            return Ok(());
        }
        if let Some(fallback) = &self.inner.fallback {
            if fallback.is_available().await {
                warn!(provider = self.inner.provider.name(), fallback = fallback.name(),
                    "SynthesisPipeline: primary voice unavailable, starting on fallback");
                return Ok(());
            }
        }
        Err(VoiceError::Synthesis(format!(
            "no voice available ({} unreachable)",
            self.inner.provider.name()
        )))
    }

    /// Audio is being produced by the output device.
    pub fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }

    /// Audio is still arriving from the provider.
    pub fn is_streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    /// Something is in flight or waiting in the queue.
    pub fn is_active(&self) -> bool {
        let st = self.inner.lock();
        st.in_flight.is_some() || !st.queue.is_empty()
    }

    pub fn in_flight(&self) -> Option<ItemId> {
        self.inner.lock().in_flight.as_ref().map(|f| f.id)
    }

    /// Queued ids in play order, excluding the in-flight item.
    pub fn queued(&self) -> Vec<ItemId> {
        self.inner.lock().queue.iter().map(|q| q.id).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SynthesisEvent> {
        self.inner.events.subscribe()
    }

    /// Viseme track of each item as its playback starts.
    pub fn visemes(&self) -> impl Stream<Item = (ItemId, VisemeTrack)> + Send + 'static {
        BroadcastStream::new(self.inner.visemes.subscribe()).filter_map(|r| async move { r.ok() })
    }
}

impl std::fmt::Debug for SynthesisPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("SynthesisPipeline")
            .field("provider", &self.inner.provider.name())
            .field("in_flight", &st.in_flight.as_ref().map(|item| item.id))
            .field("queued", &st.queue.len())
            .field("playing", &st.playing)
            .finish()
    }
}

async fn run_worker(inner: Weak<SynthesisInner>, wake: Arc<Notify>) {
    loop {
        let Some(pipeline) = inner.upgrade() else { break };
        let Some((id, text, cancel_rx)) = pipeline.dequeue() else {
            drop(pipeline);
            wake.notified().await;
            continue;
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel_rx => None,
            result = pipeline.process(id, &text) => Some(result),
        };
        match outcome {
            Some(result) => pipeline.complete(id, result),
            None => debug!(%id, "SynthesisPipeline: in-flight item abandoned"),
        }
    }
    debug!("SynthesisPipeline: worker exiting");
}

impl SynthesisInner {
    fn lock(&self) -> MutexGuard<'_, SynthesisState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: SynthesisEvent) {
        let _ = self.events.send(event);
    }

    fn dequeue(&self) -> Option<(ItemId, String, oneshot::Receiver<()>)> {
        let mut st = self.lock();
        if st.in_flight.is_some() {
            return None;
        }
        let item = st.queue.pop_front()?;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        st.in_flight = Some(InFlight {
            id: item.id,
            cancel: cancel_tx,
            done: item.done,
        });
        Some((item.id, item.text, cancel_rx))
    }

    /// Resolve the item unless `cancel()` got to it first.
    fn complete(&self, id: ItemId, result: VoiceResult<()>) {
        let finished = {
            let mut st = self.lock();
            if !st.is_current(id) {
                return;
            }
            st.playing = false;
            st.streaming = false;
            st.in_flight.take()
        };
        let Some(f) = finished else { return };
        match &result {
            Ok(()) => {
                debug!(%id, "SynthesisPipeline: completed");
                self.emit(SynthesisEvent::Completed { id });
            }
            Err(e) => {
                error!(%id, error = %e, "SynthesisPipeline: item failed");
                self.emit(SynthesisEvent::Failed { id, error: e.to_string() });
            }
        }
        let _ = f.done.send(result);
    }

    async fn process(&self, id: ItemId, text: &str) -> VoiceResult<()> {
        let voice = &self.config.voice;
        let primary = match self.provider.synthesize(text, voice, self.config.streaming).await {
            Ok(speech) => self.play(id, text, speech).await,
            Err(error) => Err(PlayError { started: false, error }),
        };
        let error = match primary {
            Ok(()) => return Ok(()),
            Err(PlayError { started: true, error }) => return Err(error),
            Err(PlayError { error, .. }) if error.is_cancelled() => return Err(error),
            Err(PlayError { error, .. }) => error,
        };

        let Some(fallback) = &self.fallback else { return Err(error) };
        warn!(%id, provider = self.provider.name(), fallback = fallback.name(), error = %error,
            "SynthesisPipeline: primary voice failed, degrading");
        self.emit(SynthesisEvent::Degraded {
            id,
            reason: error.to_string(),
        });
        let speech = fallback.synthesize(text, voice, false).await?;
        self.play(id, text, speech).await.map_err(|e| e.error)
    }

    async fn play(&self, id: ItemId, text: &str, speech: SynthesizedSpeech) -> Result<(), PlayError> {
        let visemes = speech
            .visemes
            .map(VisemeTrack::new)
            .unwrap_or_else(|| VisemeTrack::from_text(text));
        let min_buffer = if self.config.streaming {
            self.config.min_buffer_bytes.max(1)
        } else {
            usize::MAX
        };
        let mut chunks = speech.chunks;
        let mut buffer = Vec::new();
        let mut started = false;

        self.set_streaming(id, true);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|error| PlayError { started, error })?;
            buffer.extend_from_slice(&chunk);
            if buffer.len() >= min_buffer {
                self.append(id, std::mem::take(&mut buffer), &mut started, &visemes)?;
            }
        }
        self.set_streaming(id, false);
        if !buffer.is_empty() {
            self.append(id, buffer, &mut started, &visemes)?;
        }

        if started {
            self.output.wait_until_end().await;
        }
        Ok(())
    }

    /// Hand audio to the output. Holding the state lock keeps this ordered against `cancel()`:
    /// audio is never appended after the output was stopped for this item.
    fn append(&self, id: ItemId, audio: Vec<u8>, started: &mut bool, visemes: &VisemeTrack) -> Result<(), PlayError> {
        let first = {
            let mut st = self.lock();
            if !st.is_current(id) {
                return Err(PlayError {
                    started: true,
                    error: VoiceError::Cancelled,
                });
            }
            self.output.append(audio).map_err(|error| PlayError {
                started: *started,
                error,
            })?;
            st.playing = true;
            let first = !*started;
            *started = true;
            first
        };
        if first {
            debug!(%id, visemes = visemes.events().len(), "SynthesisPipeline: playback started");
            self.emit(SynthesisEvent::Started {
                id,
                visemes: visemes.clone(),
            });
            let _ = self.visemes.send((id, visemes.clone()));
        }
        Ok(())
    }

    fn set_streaming(&self, id: ItemId, streaming: bool) {
        let mut st = self.lock();
        if st.is_current(id) {
            st.streaming = streaming;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceSettings;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns the text bytes as audio, optionally failing.
    struct EchoTts {
        fail: bool,
        calls: AtomicUsize,
    }

    impl EchoTts {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for EchoTts {
        fn name(&self) -> &str {
            "echo"
        }

        async fn synthesize(&self, text: &str, _voice: &VoiceSettings, _streaming: bool) -> VoiceResult<SynthesizedSpeech> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VoiceError::Synthesis("quota exceeded".into()));
            }
            let bytes = text.as_bytes().to_vec();
            let half = bytes.len() / 2;
            let chunks = vec![Ok(bytes[..half].to_vec()), Ok(bytes[half..].to_vec())];
            Ok(SynthesizedSpeech::streamed(stream::iter(chunks).boxed()))
        }
    }

    fn config() -> SynthesisConfig {
        SynthesisConfig {
            min_buffer_bytes: 4,
            ..SynthesisConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn item_plays_and_completes() {
        let pipeline = SynthesisPipeline::new(EchoTts::new(false), Arc::new(PacedOutput::new(10)), config());
        let mut events = pipeline.subscribe();
        let ticket = pipeline.enqueue("hello world", Priority::Normal);
        let id = ticket.id();
        ticket.completed().await.unwrap();

        assert!(!pipeline.is_active());
        assert_eq!(events.recv().await.unwrap(), SynthesisEvent::Queued { id, priority: Priority::Normal });
        match events.recv().await.unwrap() {
            SynthesisEvent::Started { id: started, visemes } => {
                assert_eq!(started, id);
                assert!(!visemes.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events.recv().await.unwrap(), SynthesisEvent::Completed { id });
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_clears_queue_and_resolves_tickets() {
        let pipeline = SynthesisPipeline::new(EchoTts::new(false), Arc::new(PacedOutput::new(10)), config());
        let first = pipeline.enqueue("a long answer about the outcome", Priority::Normal);
        let second = pipeline.enqueue("and more", Priority::Normal);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pipeline.is_playing());

        let report = pipeline.cancel();
        assert_eq!(report.in_flight, Some(first.id()));
        assert_eq!(report.dropped, vec![second.id()]);
        assert!(!pipeline.is_active() && !pipeline.is_playing() && !pipeline.is_streaming());
        assert!(pipeline.queued().is_empty());

        assert!(first.completed().await.unwrap_err().is_cancelled());
        assert!(second.completed().await.unwrap_err().is_cancelled());

        // Idempotent.
        assert!(pipeline.cancel().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_provider_degrades_to_fallback_once() {
        let primary = EchoTts::new(true);
        let fallback = EchoTts::new(false);
        let pipeline = SynthesisPipeline::new(primary.clone(), Arc::new(NullOutput), config())
            .with_fallback(fallback.clone());
        let mut events = pipeline.subscribe();

        pipeline.enqueue("fine", Priority::Normal).completed().await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);

        let mut degraded = false;
        while let Ok(ev) = events.try_recv() {
            degraded |= matches!(ev, SynthesisEvent::Degraded { .. });
        }
        assert!(degraded);
    }

    #[tokio::test]
    async fn failure_without_fallback_surfaces_synthesis_error() {
        let pipeline = SynthesisPipeline::new(EchoTts::new(true), Arc::new(NullOutput), config());
        let err = pipeline.enqueue("fine", Priority::Normal).completed().await.unwrap_err();
        assert!(matches!(err, VoiceError::Synthesis(_)));
        assert!(!pipeline.is_active());
    }

    #[tokio::test]
    async fn high_priority_waits_behind_other_high_items() {
        let pipeline = SynthesisPipeline::new(Arc::new(PlaceholderTts), Arc::new(NullOutput), config());
        let n1 = pipeline.enqueue("n1", Priority::Normal);
        let h1 = pipeline.enqueue("h1", Priority::High);
        let h2 = pipeline.enqueue("h2", Priority::High);
        assert_eq!(pipeline.queued(), vec![h1.id(), h2.id(), n1.id()]);
    }

    /// Sets its flag when dropped, i.e. when the chunk stream holding it is closed.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Streams 8-byte chunks every 100 ms, forever.
    struct TrickleTts {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SpeechSynthesizer for TrickleTts {
        fn name(&self) -> &str {
            "trickle"
        }

        async fn synthesize(&self, _text: &str, _voice: &VoiceSettings, _streaming: bool) -> VoiceResult<SynthesizedSpeech> {
            let flag = DropFlag(Arc::clone(&self.closed));
            let chunks = stream::unfold(flag, |flag| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Some((Ok::<_, VoiceError>(vec![0u8; 8]), flag))
            });
            Ok(SynthesizedSpeech::streamed(chunks.boxed()))
        }
    }

    /// Counts appends; playback never ends on its own.
    #[derive(Default)]
    struct CountingOutput {
        appends: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl AudioOutput for CountingOutput {
        fn append(&self, _audio: Vec<u8>) -> VoiceResult<()> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_until_end(&self) {
            std::future::pending::<()>().await
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn is_playing(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_stream_closes_provider_stream() {
        let closed = Arc::new(AtomicBool::new(false));
        let output = Arc::new(CountingOutput::default());
        let pipeline = SynthesisPipeline::new(
            Arc::new(TrickleTts {
                closed: Arc::clone(&closed),
            }),
            output.clone(),
            config(),
        );
        let ticket = pipeline.enqueue("a long streamed answer", Priority::Normal);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(pipeline.is_streaming());
        let appended = output.appends.load(Ordering::SeqCst);
        assert!(appended >= 1);

        let report = pipeline.cancel();
        assert_eq!(report.in_flight, Some(ticket.id()));
        assert_eq!(output.stops.load(Ordering::SeqCst), 1);
        assert!(!pipeline.is_streaming());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(output.appends.load(Ordering::SeqCst), appended);
        assert!(closed.load(Ordering::SeqCst));
        assert!(ticket.completed().await.unwrap_err().is_cancelled());
    }
}
