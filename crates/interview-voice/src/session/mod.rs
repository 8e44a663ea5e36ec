//! **Session controller**: owns the pipelines and sequences interview turns.
//!
//! ```text
//!            ┌──────────────── SessionHandle (commands, watch<SessionSnapshot>) ───────────────┐
//!            ▼                                                                                 │
//!   ┌─────────────────┐  final   ┌────────────┐  reply   ┌───────────────┐  completed           │
//!   │ CapturePipeline │ ───────► │ completion │ ───────► │ SynthesisPipe │ ──────► listen again │
//!   └─────────────────┘          └────────────┘          └───────────────┘                      │
//!            │ capture started                                   ▲                              │
//!            └──────────► BargeInCoordinator ── cancel() ────────┘                              │
//! ```
//!
//! Everything runs on one task: commands, capture events, completion replies, synthesis
//! completions, barge-ins and the one-second countdown are turned into events and handled in
//! order. Each turn has a number; replies and completions carrying an older number are
//! discarded, so a barge-in or pause can never be raced by a stale reply.

pub mod machine;
pub mod record;

pub use machine::{SessionMachine, SessionPhase, Tick};
pub use record::{Feedback, JsonFileStore, MemoryStore, SessionRecord, SessionStore};

use crate::barge_in::{BargeInCoordinator, BargeInEvent};
use crate::capture::{CaptureEvent, CapturePipeline, StopReason};
use crate::completion::{CompletionClient, CompletionRequest};
use crate::config::EngineConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::recognizer::SpeechRecognizer;
use crate::synthesis::{AudioOutput, ItemId, Priority, SpeechSynthesizer, SynthesisPipeline};
use crate::transcript::{Speaker, Transcript};
use crate::viseme::VisemeTrack;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the current turn is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStage {
    Idle,
    Listening,
    /// Waiting for the completion reply.
    Thinking,
    Speaking,
}

/// Observable session state for the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub phase: SessionPhase,
    pub stage: TurnStage,
    pub remaining_secs: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub barge_ins: u64,
    /// Latest error surfaced to the user; the session may still be running.
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub enum SessionCommand {
    Start,
    Pause,
    Resume,
    End,
    /// User wants the floor: start capturing now, cutting off AI speech if needed.
    Listen,
    Save {
        score: Option<u8>,
        feedback: Option<Feedback>,
        reply: oneshot::Sender<VoiceResult<SessionRecord>>,
    },
}

/// External collaborators a session is assembled from.
pub struct SessionParts {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    /// Degraded local voice for when `synthesizer` fails.
    pub fallback_voice: Option<Arc<dyn SpeechSynthesizer>>,
    pub output: Arc<dyn AudioOutput>,
    pub completion: Arc<dyn CompletionClient>,
    pub store: Option<Arc<dyn SessionStore>>,
}

/// Completions from tasks the controller spawned, tagged with the turn they belong to.
enum Internal {
    Reply { turn: u64, result: VoiceResult<String> },
    SpeechDone { turn: u64, item: ItemId, result: VoiceResult<()> },
}

struct Speaking {
    item: ItemId,
    entry: Option<Uuid>,
}

pub struct SessionController {
    id: Uuid,
    config: EngineConfig,
    machine: SessionMachine,
    stage: TurnStage,
    turn: u64,
    capture_retried: bool,
    speaking: Option<Speaking>,
    last_error: Option<String>,
    reset_countdown: bool,

    transcript: Transcript,
    capture: CapturePipeline,
    synthesis: SynthesisPipeline,
    barge_in: Arc<BargeInCoordinator>,
    completion: Arc<dyn CompletionClient>,
    store: Option<Arc<dyn SessionStore>>,

    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    pub fn new(parts: SessionParts, config: EngineConfig) -> Self {
        let id = Uuid::new_v4();
        let transcript = Transcript::new();
        let mut synthesis = SynthesisPipeline::new(parts.synthesizer, parts.output, config.synthesis.clone());
        if let Some(fallback) = parts.fallback_voice {
            synthesis = synthesis.with_fallback(fallback);
        }
        let barge_in = Arc::new(BargeInCoordinator::new(synthesis.clone()));
        let capture = CapturePipeline::new(parts.recognizer, config.capture.clone(), transcript.clone())
            .with_barge_in(Arc::clone(&barge_in));
        let machine = SessionMachine::new(config.session.duration_secs);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            session_id: id,
            phase: machine.phase(),
            stage: TurnStage::Idle,
            remaining_secs: machine.remaining_secs(),
            started_at: None,
            barge_ins: 0,
            last_error: None,
        });

        Self {
            id,
            config,
            machine,
            stage: TurnStage::Idle,
            turn: 0,
            capture_retried: false,
            speaking: None,
            last_error: None,
            reset_countdown: false,
            transcript,
            capture,
            synthesis,
            barge_in,
            completion: parts.completion,
            store: parts.store,
            internal_tx,
            internal_rx: Some(internal_rx),
            snapshot_tx,
        }
    }

    /// Run the controller on its own task.
    pub fn spawn(mut self) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let id = self.id;
        let snapshot = self.snapshot_tx.subscribe();
        let transcript = self.transcript.clone();
        let capture = self.capture.clone();
        let synthesis = self.synthesis.clone();
        let barge_in = Arc::clone(&self.barge_in);
        let internal_rx = self.internal_rx.take();
        let task = tokio::spawn(async move {
            if let Some(internal_rx) = internal_rx {
                self.run(commands_rx, internal_rx).await;
            }
        });
        SessionHandle {
            id,
            commands: commands_tx,
            snapshot,
            transcript,
            capture,
            synthesis,
            barge_in,
            task: Some(task),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>, mut internal: mpsc::UnboundedReceiver<Internal>) {
        let mut capture_rx = self.capture.subscribe();
        let mut barge_rx = self.barge_in.subscribe();
        let second = Duration::from_secs(1);
        let mut countdown = interval_at(Instant::now() + second, second);
        countdown.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(session = %self.id, role = %self.config.session.role, "Session: controller running");
        loop {
            enum Event {
                Command(SessionCommand),
                CommandsClosed,
                Internal(Internal),
                Capture(CaptureEvent),
                BargeIn(BargeInEvent),
                Tick,
                Lagged(&'static str, u64),
            }

            let active = self.machine.phase() == SessionPhase::Active;
            let event = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::CommandsClosed,
                },
                Some(ev) = internal.recv() => Event::Internal(ev),
                ev = capture_rx.recv() => match ev {
                    Ok(ev) => Event::Capture(ev),
                    Err(RecvError::Lagged(n)) => Event::Lagged("capture", n),
                    Err(RecvError::Closed) => continue,
                },
                ev = barge_rx.recv() => match ev {
                    Ok(ev) => Event::BargeIn(ev),
                    Err(RecvError::Lagged(n)) => Event::Lagged("barge-in", n),
                    Err(RecvError::Closed) => continue,
                },
                _ = countdown.tick(), if active => Event::Tick,
            };

            match event {
                Event::Command(cmd) => self.on_command(cmd).await,
                Event::CommandsClosed => break,
                Event::Internal(Internal::Reply { turn, result }) => self.on_reply(turn, result),
                Event::Internal(Internal::SpeechDone { turn, item, result }) => {
                    self.on_speech_done(turn, item, result).await
                }
                Event::Capture(ev) => self.on_capture(ev).await,
                Event::BargeIn(ev) => self.on_barge_in(ev).await,
                Event::Tick => self.on_tick().await,
                Event::Lagged(source, n) => warn!(source, skipped = n, "Session: event receiver lagged"),
            }

            if self.reset_countdown {
                countdown.reset();
                self.reset_countdown = false;
            }
            self.publish();
        }

        if self.machine.phase() != SessionPhase::Ended {
            let _ = self.machine.end(Instant::now());
            self.stop_turn().await;
        }
        info!(session = %self.id, "Session: controller stopped");
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            session_id: self.id,
            phase: self.machine.phase(),
            stage: self.stage,
            remaining_secs: self.machine.remaining_secs(),
            started_at: self.machine.started_at(),
            barge_ins: self.barge_in.count(),
            last_error: self.last_error.clone(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn surface(&mut self, error: &VoiceError) {
        error!(session = %self.id, error = %error, "Session: error surfaced");
        self.last_error = Some(error.to_string());
    }

    async fn on_command(&mut self, cmd: SessionCommand) {
        let result = match cmd {
            SessionCommand::Start => self.start().await,
            SessionCommand::Pause => self.pause().await,
            SessionCommand::Resume => self.resume().await,
            SessionCommand::End => self.end().await,
            SessionCommand::Listen => {
                if self.machine.phase() == SessionPhase::Active && self.stage != TurnStage::Listening {
                    self.listen().await;
                }
                Ok(())
            }
            SessionCommand::Save { score, feedback, reply } => {
                let _ = reply.send(self.save(score, feedback).await);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(session = %self.id, error = %e, "Session: command rejected");
        }
    }

    async fn start(&mut self) -> VoiceResult<()> {
        self.machine.prepare()?;
        self.publish();

        let ready = match self.capture.ready().await {
            Ok(()) => self.synthesis.ready().await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            self.surface(&e);
            self.machine.end(Instant::now())?;
            return Ok(());
        }

        self.machine.activate(Instant::now())?;
        self.reset_countdown = true;
        info!(session = %self.id, secs = self.machine.remaining_secs(), "Session: active");
        match self.config.session.greeting.clone() {
            Some(greeting) if !greeting.trim().is_empty() => self.speak(greeting, Priority::High),
            _ => self.listen().await,
        }
        Ok(())
    }

    async fn pause(&mut self) -> VoiceResult<()> {
        self.machine.pause()?;
        self.stop_turn().await;
        info!(session = %self.id, "Session: paused");
        Ok(())
    }

    async fn resume(&mut self) -> VoiceResult<()> {
        self.machine.resume()?;
        self.reset_countdown = true;
        info!(session = %self.id, "Session: resumed");
        if self.transcript.last_is_unanswered_user() {
            self.turn += 1;
            self.request_reply();
        } else {
            self.listen().await;
        }
        Ok(())
    }

    async fn end(&mut self) -> VoiceResult<()> {
        self.machine.end(Instant::now())?;
        self.stop_turn().await;
        info!(session = %self.id, "Session: ended");
        Ok(())
    }

    async fn save(&mut self, score: Option<u8>, feedback: Option<Feedback>) -> VoiceResult<SessionRecord> {
        let phase = self.machine.phase();
        if phase != SessionPhase::Ended {
            return Err(VoiceError::InvalidTransition {
                from: phase.to_string(),
                to: "saved".to_string(),
            });
        }
        let log = self.transcript.snapshot();
        let record = SessionRecord {
            session_id: self.id,
            role: self.config.session.role.clone(),
            interview_type: self.config.session.interview_type.clone(),
            started_at: self.machine.started_at(),
            ended_at: self.machine.ended_at(),
            duration_secs: self.machine.duration(Instant::now()).as_secs(),
            transcript: log.entries().iter().filter(|e| !e.is_partial).cloned().collect(),
            score,
            feedback,
        };
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| VoiceError::Persistence("no session store configured".to_string()))?;
        store.save(&record).await?;
        info!(session = %self.id, entries = record.transcript.len(), "Session: saved");
        Ok(record)
    }

    async fn on_tick(&mut self) {
        match self.machine.tick(Instant::now()) {
            Tick::Expired => {
                info!(session = %self.id, "Session: time is up");
                self.stop_turn().await;
            }
            Tick::Remaining(secs) if secs % 60 == 0 => debug!(session = %self.id, secs, "Session: countdown"),
            _ => {}
        }
    }

    /// Abandon the current turn: stop listening, silence the AI, forget pending replies.
    async fn stop_turn(&mut self) {
        self.turn += 1;
        self.stage = TurnStage::Idle;
        if let Err(e) = self.capture.stop().await {
            warn!(error = %e, "Session: capture stop failed");
        }
        let report = self.synthesis.cancel();
        if let Some(speaking) = self.speaking.take() {
            if report.ids().contains(&speaking.item) {
                self.mark_interrupted(speaking.entry);
            }
        }
    }

    /// Step 1 of a turn: hand the floor to the user.
    async fn listen(&mut self) {
        self.turn += 1;
        self.stage = TurnStage::Listening;
        if let Err(e) = self.capture.start().await {
            self.stage = TurnStage::Idle;
            self.surface(&e);
        }
    }

    fn request_reply(&mut self) {
        self.stage = TurnStage::Thinking;
        let turn = self.turn;
        let request = CompletionRequest {
            messages: self.transcript.to_messages(),
            role_context: self.config.session.role_context(),
        };
        let completion = Arc::clone(&self.completion);
        let tx = self.internal_tx.clone();
        debug!(turn, messages = request.messages.len(), "Session: requesting reply");
        tokio::spawn(async move {
            let result = completion.complete(request).await;
            let _ = tx.send(Internal::Reply { turn, result });
        });
    }

    fn speak(&mut self, text: String, priority: Priority) {
        let entry = self.transcript.append(Speaker::Ai, &text).map(|e| e.id);
        let ticket = self.synthesis.enqueue(text, priority);
        let item = ticket.id();
        self.stage = TurnStage::Speaking;
        self.speaking = Some(Speaking { item, entry });

        let turn = self.turn;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = ticket.completed().await;
            let _ = tx.send(Internal::SpeechDone { turn, item, result });
        });
    }

    fn mark_interrupted(&self, entry: Option<Uuid>) {
        if let Some(id) = entry {
            self.transcript.mark_interrupted(id);
        }
    }

    async fn on_capture(&mut self, event: CaptureEvent) {
        let listening = self.machine.phase() == SessionPhase::Active && self.stage == TurnStage::Listening;
        match event {
            CaptureEvent::Final { text, .. } if listening => {
                debug!(chars = text.len(), "Session: user turn finished");
                self.capture_retried = false;
                self.request_reply();
            }
            CaptureEvent::Stopped {
                reason: StopReason::Silence | StopReason::EngineFinal,
            } if listening => {
                debug!("Session: nothing heard, listening again");
                // The retried capture ended cleanly; a later error gets its own retry.
                self.capture_retried = false;
                self.listen().await;
            }
            CaptureEvent::Error { message } if listening => {
                if self.capture_retried {
                    self.stage = TurnStage::Idle;
                    self.surface(&VoiceError::Capture(message));
                } else {
                    warn!(error = %message, "Session: capture error, retrying once");
                    self.capture_retried = true;
                    self.listen().await;
                }
            }
            _ => {}
        }
    }

    fn on_reply(&mut self, turn: u64, result: VoiceResult<String>) {
        if turn != self.turn || self.stage != TurnStage::Thinking || self.machine.phase() != SessionPhase::Active {
            debug!(turn, current = self.turn, "Session: discarding stale reply");
            return;
        }
        match result {
            Ok(reply) => self.speak(reply, Priority::Normal),
            Err(e) => {
                self.surface(&e);
                let fallback = self.config.session.fallback_reply.clone();
                self.speak(fallback, Priority::High);
            }
        }
    }

    async fn on_speech_done(&mut self, turn: u64, item: ItemId, result: VoiceResult<()>) {
        let current = self.speaking.as_ref().is_some_and(|s| s.item == item);
        if turn != self.turn || !current {
            return;
        }
        self.speaking = None;
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return,
            // The reply is already in the transcript; the turn goes on without audio.
            Err(e) => self.surface(&e),
        }
        if self.machine.phase() == SessionPhase::Active {
            self.listen().await;
        }
    }

    async fn on_barge_in(&mut self, event: BargeInEvent) {
        let cut_off = self
            .speaking
            .as_ref()
            .is_some_and(|s| event.cancelled.contains(&s.item));
        if cut_off {
            if let Some(speaking) = self.speaking.take() {
                self.mark_interrupted(speaking.entry);
            }
        }
        info!(session = %self.id, cancelled = event.cancelled.len(), "Session: barge-in");
        if self.machine.phase() == SessionPhase::Active && self.stage != TurnStage::Listening {
            self.listen().await;
        }
    }
}

/// Client side of a running session.
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    transcript: Transcript,
    capture: CapturePipeline,
    synthesis: SynthesisPipeline,
    barge_in: Arc<BargeInCoordinator>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn send(&self, command: SessionCommand) -> VoiceResult<()> {
        self.commands.send(command).await?;
        Ok(())
    }

    pub async fn start(&self) -> VoiceResult<()> {
        self.send(SessionCommand::Start).await
    }

    pub async fn pause(&self) -> VoiceResult<()> {
        self.send(SessionCommand::Pause).await
    }

    pub async fn resume(&self) -> VoiceResult<()> {
        self.send(SessionCommand::Resume).await
    }

    pub async fn end(&self) -> VoiceResult<()> {
        self.send(SessionCommand::End).await
    }

    pub async fn listen(&self) -> VoiceResult<()> {
        self.send(SessionCommand::Listen).await
    }

    /// Persist the ended session through the configured store.
    pub async fn save(&self, score: Option<u8>, feedback: Option<Feedback>) -> VoiceResult<SessionRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Save { score, feedback, reply }).await?;
        rx.await
            .map_err(|_| VoiceError::ChannelSend("session controller stopped".to_string()))?
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the snapshot satisfies `f`.
    pub async fn wait_for(&self, f: impl FnMut(&SessionSnapshot) -> bool) -> VoiceResult<SessionSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(f)
            .await
            .map_err(|_| VoiceError::ChannelSend("session controller stopped".to_string()))?;
        Ok(snapshot.clone())
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn capture_events(&self) -> broadcast::Receiver<CaptureEvent> {
        self.capture.subscribe()
    }

    pub fn synthesis_events(&self) -> broadcast::Receiver<crate::synthesis::SynthesisEvent> {
        self.synthesis.subscribe()
    }

    pub fn barge_ins(&self) -> broadcast::Receiver<BargeInEvent> {
        self.barge_in.subscribe()
    }

    /// Viseme track for each AI utterance as it starts playing.
    pub fn visemes(&self) -> impl Stream<Item = (ItemId, VisemeTrack)> + Send + 'static {
        self.synthesis.visemes()
    }

    pub fn is_listening(&self) -> bool {
        self.capture.is_listening()
    }

    pub fn is_playing(&self) -> bool {
        self.synthesis.is_playing()
    }

    /// Close the command channel and wait for the controller to wind down.
    pub async fn shutdown(mut self) {
        let task = self.task.take();
        drop(self);
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Session: controller task failed");
            }
        }
    }
}
