//! Mock Interview Demo: full turn loop with optional hosted providers.
//!
//! - **Recognizer**: `PlaceholderRecognizer` replays a scripted candidate.
//! - **Completion**: `OpenAiCompletion` if `COMPLETION_API_KEY` / `OPENAI_API_KEY` is set, else canned replies.
//! - **TTS**: `ElevenLabsTts` if `ELEVENLABS_API_KEY`, else `OpenAiTts` if `TTS_API_KEY`, else silent.
//!   `espeak-ng` is the degraded voice when the hosted one fails.
//! - **Output**: speakers with `--features playback`, otherwise paced (headless) playback.
//!
//! Set `INTERVIEW_SESSIONS_DIR` to keep the saved session as JSON.

use anyhow::Context;
use futures::StreamExt;
use interview_voice::{
    AudioOutput, CompletionClient, ElevenLabsTts, EngineConfig, JsonFileStore, MemoryStore, OpenAiCompletion,
    OpenAiTts, PacedOutput, PlaceholderCompletion, PlaceholderRecognizer, PlaceholderTts, SessionController,
    SessionHandle, SessionParts, SessionPhase, SessionStore, Speaker, SpeechSynthesizer, SystemVoiceTts, TurnStage,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CANDIDATE: [&str; 3] = [
    "Hi, I'm a final year computer science student and I've interned on a payments team",
    "Our release was late because a migration failed, so I wrote a rollback plan and we shipped a week later",
    "I learned to raise risks early instead of hoping they go away",
];

fn pick_tts() -> Arc<dyn SpeechSynthesizer> {
    if let Ok(tts) = ElevenLabsTts::from_env() {
        info!("TTS: ElevenLabs");
        return Arc::new(tts);
    }
    match OpenAiTts::from_env() {
        Ok(tts) => {
            info!("TTS: OpenAI-compatible");
            Arc::new(tts)
        }
        Err(_) => {
            info!("TTS: placeholder (set ELEVENLABS_API_KEY or TTS_API_KEY to hear the interviewer)");
            Arc::new(PlaceholderTts)
        }
    }
}

fn pick_output() -> Arc<dyn AudioOutput> {
    #[cfg(feature = "playback")]
    {
        match interview_voice::RodioOutput::new() {
            Ok(out) => return Arc::new(out),
            Err(e) => warn!("No audio device ({}), using paced playback", e),
        }
    }
    Arc::new(PacedOutput::default())
}

fn pick_store() -> Arc<dyn SessionStore> {
    match std::env::var("INTERVIEW_SESSIONS_DIR") {
        Ok(dir) => Arc::new(JsonFileStore::new(dir)),
        Err(_) => Arc::new(MemoryStore::new()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    let completion: Arc<dyn CompletionClient> = match OpenAiCompletion::new(config.completion.clone()) {
        Ok(client) => {
            info!(model = %config.completion.model, "Completion: OpenAI-compatible");
            Arc::new(client)
        }
        Err(_) => {
            info!("Completion: canned replies (set COMPLETION_API_KEY for a live interviewer)");
            Arc::new(PlaceholderCompletion::default())
        }
    };

    let parts = SessionParts {
        recognizer: Arc::new(PlaceholderRecognizer::new(CANDIDATE)),
        synthesizer: pick_tts(),
        fallback_voice: Some(Arc::new(SystemVoiceTts::default())),
        output: pick_output(),
        completion,
        store: Some(pick_store()),
    };
    let handle = SessionController::new(parts, config).spawn();

    let mut visemes = Box::pin(handle.visemes());
    tokio::spawn(async move {
        while let Some((id, track)) = visemes.next().await {
            info!(%id, frames = track.events().len(), ms = track.duration_ms(), "Avatar: lip-sync track");
        }
    });

    info!("Mock interview starting. Press Ctrl+C to end early.");
    handle.start().await?;

    // Done once every scripted answer has been replied to and the floor is back with the user.
    let answered = |h: &SessionHandle| {
        let log = h.transcript().snapshot();
        let user_turns = log
            .entries()
            .iter()
            .filter(|e| !e.is_partial && e.speaker == Speaker::User)
            .count();
        user_turns == CANDIDATE.len() && !log.last_is_unanswered_user()
    };

    let mut snapshots = handle.watch();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = snapshots.borrow_and_update().clone();
                info!(phase = %s.phase, stage = ?s.stage, remaining = s.remaining_secs, barge_ins = s.barge_ins, "Session");
                if let Some(err) = &s.last_error {
                    warn!(error = %err, "Session reported an error");
                }
                if s.phase == SessionPhase::Ended || (s.stage == TurnStage::Listening && answered(&handle)) {
                    break;
                }
            }
        }
    }

    handle.end().await?;
    handle
        .wait_for(|s| s.phase == SessionPhase::Ended)
        .await
        .context("session controller stopped early")?;

    for entry in handle.transcript().snapshot().entries() {
        let mark = if entry.interrupted { " (interrupted)" } else { "" };
        println!("[{}] {}{}", entry.speaker.chat_role(), entry.text, mark);
    }

    match tokio::time::timeout(Duration::from_secs(5), handle.save(None, None)).await {
        Ok(Ok(record)) => info!(session = %record.session_id, secs = record.duration_secs, "Session saved"),
        Ok(Err(e)) => warn!(error = %e, "Session not saved"),
        Err(_) => warn!("Timed out saving session"),
    }
    handle.shutdown().await;
    Ok(())
}
