//! Whole-session behaviour: turn protocol, countdown, barge-in, failure paths, persistence.

mod common;

use common::{eventually, ManualRecognizer, RecordingTts, ScriptedCompletion};
use interview_voice::{
    EngineConfig, Feedback, MemoryStore, PacedOutput, RecognizerEvent, SessionController, SessionHandle,
    SessionParts, SessionPhase, SessionStore, Speaker, SpeechSynthesizer, TurnStage, VoiceError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::assert_ok;

const QUESTION: &str = "Tell me about a challenge you faced";
const REPLY: &str = "That's a great start. What was the outcome?";
const GREETING: &str = "Hi, I'm your interviewer today. Let's begin with a quick introduction about yourself.";

struct Harness {
    handle: SessionHandle,
    recognizer: Arc<ManualRecognizer>,
    tts: Arc<RecordingTts>,
    completion: Arc<ScriptedCompletion>,
    store: Arc<MemoryStore>,
}

/// Audio plays at 1000 bytes/s; `bytes_per_char` sets how long each utterance lasts.
fn harness(config: EngineConfig, recognizer: ManualRecognizer, completion: ScriptedCompletion, bytes_per_char: usize) -> Harness {
    harness_with(config, recognizer, completion, RecordingTts::new(bytes_per_char), None)
}

fn harness_with(
    config: EngineConfig,
    recognizer: ManualRecognizer,
    completion: ScriptedCompletion,
    tts: RecordingTts,
    fallback_voice: Option<Arc<RecordingTts>>,
) -> Harness {
    common::init_tracing();
    let recognizer = Arc::new(recognizer);
    let tts = Arc::new(tts);
    let completion = Arc::new(completion);
    let store = Arc::new(MemoryStore::new());
    let parts = SessionParts {
        recognizer: recognizer.clone(),
        synthesizer: tts.clone(),
        fallback_voice: fallback_voice.map(|v| v as Arc<dyn SpeechSynthesizer>),
        output: Arc::new(PacedOutput::new(1000)),
        completion: completion.clone(),
        store: Some(store.clone()),
    };
    Harness {
        handle: SessionController::new(parts, config).spawn(),
        recognizer,
        tts,
        completion,
        store,
    }
}

fn with_greeting(greeting: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.session.greeting = Some(greeting.to_string());
    config
}

fn answer(h: &Harness, text: &str) {
    assert!(h.recognizer.emit(RecognizerEvent::Partial(text.split_whitespace().next().unwrap_or("").into())));
    assert!(h.recognizer.emit(RecognizerEvent::Final(text.into())));
}

#[tokio::test(start_paused = true)]
async fn end_to_end_turn() {
    let h = harness(EngineConfig::default(), ManualRecognizer::new(), ScriptedCompletion::new([REPLY]), 10);
    assert_ok!(h.handle.start().await);
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert_eq!(snapshot.remaining_secs, 900);
    assert_eq!(h.recognizer.starts(), 1);

    answer(&h, QUESTION);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Speaking).await);

    let log = h.handle.transcript().snapshot();
    let entries = log.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!((entries[0].speaker, entries[0].text.as_str()), (Speaker::User, QUESTION));
    assert_eq!((entries[1].speaker, entries[1].text.as_str()), (Speaker::Ai, REPLY));
    assert!(entries.iter().all(|e| !e.is_partial));

    let request = &h.completion.requests()[0];
    assert_eq!(request.messages.last().unwrap().content, QUESTION);
    assert!(request.role_context.contains("Software Engineer"));

    // Capture stays off while the reply plays.
    let speaking_since = Instant::now();
    assert!(!h.handle.is_listening());
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    assert!(speaking_since.elapsed() >= Duration::from_millis(REPLY.len() as u64 * 10));
    assert!(!h.handle.is_playing());
    assert_eq!(h.recognizer.starts(), 2);
    assert_eq!(h.tts.spoken(), vec![REPLY]);
    assert!(!h.handle.transcript().snapshot().entries()[1].interrupted);
    assert_eq!(h.handle.snapshot().barge_ins, 0);
}

#[tokio::test(start_paused = true)]
async fn greeting_is_spoken_before_first_capture() {
    let h = harness(with_greeting(GREETING), ManualRecognizer::new(), ScriptedCompletion::new([REPLY]), 1);
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Speaking).await);
    assert_eq!(h.recognizer.starts(), 0);

    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    assert_eq!(h.recognizer.starts(), 1);
    assert_eq!(h.tts.spoken(), vec![GREETING]);
    let log = h.handle.transcript().snapshot();
    assert_eq!(log.entries()[0].speaker, Speaker::Ai);
}

#[tokio::test(start_paused = true)]
async fn countdown_expiry_ends_session_mid_speech() {
    let mut config = with_greeting(GREETING);
    config.session.duration_secs = 1;
    // 1000 bytes per char: the greeting outlasts the countdown by far.
    let h = harness(config, ManualRecognizer::new(), ScriptedCompletion::new([REPLY]), 1000);
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Speaking).await);

    let snapshot = assert_ok!(h.handle.wait_for(|s| s.phase == SessionPhase::Ended).await);
    assert_eq!(snapshot.remaining_secs, 0);
    assert_eq!(snapshot.stage, TurnStage::Idle);
    assert!(!h.handle.is_listening());
    assert!(!h.handle.is_playing());
    let greeting = h.handle.transcript().snapshot().entries()[0].clone();
    assert!(greeting.interrupted);
}

#[tokio::test(start_paused = true)]
async fn listen_barges_in_and_ai_does_not_resume() {
    let h = harness(with_greeting(GREETING), ManualRecognizer::new(), ScriptedCompletion::new([REPLY]), 1000);
    let mut barge_ins = h.handle.barge_ins();
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Speaking).await);
    eventually(|| h.handle.is_playing()).await;

    assert_ok!(h.handle.listen().await);
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    assert_eq!(snapshot.barge_ins, 1);
    assert!(h.handle.is_listening());
    assert!(!h.handle.is_playing());
    assert!(barge_ins.recv().await.is_ok());

    let transcript = h.handle.transcript().clone();
    eventually(move || transcript.snapshot().entries()[0].interrupted).await;

    // The user's answer gets a reply; the greeting is never replayed.
    answer(&h, QUESTION);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Speaking).await);
    assert_eq!(h.tts.spoken(), vec![GREETING, REPLY]);
    assert!(barge_ins.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn completion_failure_speaks_fallback_and_continues() {
    let config = EngineConfig::default();
    let fallback = config.session.fallback_reply.clone();
    let h = harness(config, ManualRecognizer::new(), ScriptedCompletion::failing(), 1);
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);

    answer(&h, QUESTION);
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Speaking).await);
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert!(snapshot.last_error.unwrap().contains("timeout"));

    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    assert_eq!(h.tts.spoken(), vec![fallback.as_str()]);
    let log = h.handle.transcript().snapshot();
    assert_eq!(log.last().unwrap().text, fallback);
}

#[tokio::test(start_paused = true)]
async fn superseded_reply_is_discarded() {
    let completion = ScriptedCompletion::new([REPLY]).with_delay(Duration::from_secs(5));
    let h = harness(EngineConfig::default(), ManualRecognizer::new(), completion, 1);
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);

    answer(&h, QUESTION);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Thinking).await);
    assert_ok!(h.handle.listen().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.completion.calls(), 1);
    assert!(h.tts.spoken().is_empty());
    assert_eq!(h.handle.snapshot().stage, TurnStage::Listening);
    assert!(h
        .handle
        .transcript()
        .snapshot()
        .entries()
        .iter()
        .all(|e| e.speaker == Speaker::User));
}

#[tokio::test(start_paused = true)]
async fn resume_requests_owed_reply() {
    let completion = ScriptedCompletion::new(["stale", REPLY]).with_delay(Duration::from_secs(2));
    let h = harness(EngineConfig::default(), ManualRecognizer::new(), completion, 1);
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    answer(&h, QUESTION);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Thinking).await);

    assert_ok!(h.handle.pause().await);
    let paused = assert_ok!(h.handle.wait_for(|s| s.phase == SessionPhase::Paused).await);
    assert_eq!(paused.stage, TurnStage::Idle);
    tokio::time::sleep(Duration::from_secs(3)).await;
    // Countdown is frozen while paused and the in-flight reply was dropped.
    assert_eq!(h.handle.snapshot().remaining_secs, paused.remaining_secs);
    assert!(h.tts.spoken().is_empty());

    assert_ok!(h.handle.resume().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Speaking).await);
    assert_eq!(h.completion.calls(), 2);
    assert_eq!(h.tts.spoken(), vec![REPLY]);
}

#[tokio::test(start_paused = true)]
async fn unavailable_capture_ends_session() {
    let h = harness(EngineConfig::default(), ManualRecognizer::unavailable(), ScriptedCompletion::new([REPLY]), 1);
    assert_ok!(h.handle.start().await);
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.phase == SessionPhase::Ended).await);
    assert!(snapshot.last_error.unwrap().contains("unavailable"));
    assert!(snapshot.started_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn save_after_end_persists_record() {
    let h = harness(EngineConfig::default(), ManualRecognizer::new(), ScriptedCompletion::new([REPLY]), 1);
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);

    let err = h.handle.save(Some(80), None).await.unwrap_err();
    assert!(matches!(err, VoiceError::InvalidTransition { .. }));

    answer(&h, QUESTION);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Speaking).await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    assert_ok!(h.handle.end().await);
    assert_ok!(h.handle.wait_for(|s| s.phase == SessionPhase::Ended).await);

    let feedback = Feedback {
        strengths: vec!["Clear situation".into()],
        improvements: vec!["Quantify the result".into()],
        learnings: vec![],
    };
    let record = assert_ok!(h.handle.save(Some(80), Some(feedback.clone())).await);
    assert_eq!(record.session_id, h.handle.id());
    assert_eq!(record.transcript.len(), 2);
    assert_eq!(record.feedback, Some(feedback));
    assert_eq!(h.store.load(record.session_id).await.unwrap(), Some(record));

    h.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn both_voices_failing_keeps_reply_and_listens_again() {
    let fallback = Arc::new(RecordingTts::failing());
    let h = harness_with(
        EngineConfig::default(),
        ManualRecognizer::new(),
        ScriptedCompletion::new([REPLY]),
        RecordingTts::failing(),
        Some(fallback.clone()),
    );
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);

    answer(&h, QUESTION);
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.last_error.is_some()).await);
    assert!(snapshot.last_error.unwrap().contains("503"));
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert_eq!(h.recognizer.starts(), 2);

    assert_eq!(h.tts.spoken(), vec![REPLY]);
    assert_eq!(fallback.spoken(), vec![REPLY]);
    let log = h.handle.transcript().snapshot();
    let last = log.entries().last().unwrap();
    assert_eq!((last.speaker, last.text.as_str()), (Speaker::Ai, REPLY));
}

#[tokio::test(start_paused = true)]
async fn capture_error_is_retried_once_then_surfaced() {
    let h = harness(EngineConfig::default(), ManualRecognizer::new(), ScriptedCompletion::new([REPLY]), 1);
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);

    assert!(h.recognizer.emit(RecognizerEvent::Error("network".into())));
    eventually(|| h.recognizer.starts() == 2).await;
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.stage, TurnStage::Listening);
    assert!(snapshot.last_error.is_none());

    assert!(h.recognizer.emit(RecognizerEvent::Error("network".into())));
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.last_error.is_some()).await);
    assert_eq!(snapshot.stage, TurnStage::Idle);
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert!(snapshot.last_error.unwrap().contains("network"));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.recognizer.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn clean_capture_after_retry_restores_the_retry() {
    let h = harness(EngineConfig::default(), ManualRecognizer::new(), ScriptedCompletion::new([REPLY]), 1);
    assert_ok!(h.handle.start().await);
    assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);

    assert!(h.recognizer.emit(RecognizerEvent::Error("network".into())));
    eventually(|| h.recognizer.starts() == 2).await;

    // The retried capture hears nothing and ends on silence.
    assert!(h.recognizer.emit(RecognizerEvent::SpeechEnded));
    tokio::time::sleep(Duration::from_millis(2100)).await;
    eventually(|| h.recognizer.starts() == 3).await;

    assert!(h.recognizer.emit(RecognizerEvent::Error("network".into())));
    eventually(|| h.recognizer.starts() == 4).await;
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.stage, TurnStage::Listening);
    assert!(snapshot.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn unavailable_voice_ends_session_before_activation() {
    let h = harness_with(
        EngineConfig::default(),
        ManualRecognizer::new(),
        ScriptedCompletion::new([REPLY]),
        RecordingTts::unavailable(),
        None,
    );
    assert_ok!(h.handle.start().await);
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.phase == SessionPhase::Ended).await);
    assert!(snapshot.last_error.unwrap().contains("no voice available"));
    assert!(snapshot.started_at.is_none());
    assert_eq!(h.recognizer.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn available_fallback_voice_lets_session_start() {
    let h = harness_with(
        EngineConfig::default(),
        ManualRecognizer::new(),
        ScriptedCompletion::new([REPLY]),
        RecordingTts::unavailable(),
        Some(Arc::new(RecordingTts::new(1))),
    );
    assert_ok!(h.handle.start().await);
    let snapshot = assert_ok!(h.handle.wait_for(|s| s.stage == TurnStage::Listening).await);
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert!(snapshot.last_error.is_none());
}
