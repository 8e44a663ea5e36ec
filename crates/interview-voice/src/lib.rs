//! # Interview Voice - Turn-Taking Engine
//!
//! Real-time voice turn coordination for a spoken mock interview: the user talks, the
//! recognizer transcribes, the completion service replies, the reply is spoken back, and the
//! user can cut the AI off at any moment (barge-in).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Session Controller                          │
//! │  ┌──────────────┐  final  ┌──────────────┐  reply ┌────────────┐ │
//! │  │   Capture    │ ──────► │  Completion  │ ─────► │ Synthesis  │ │
//! │  │ (recognizer, │         │ (OpenAI API) │        │  (queue,   │ │
//! │  │  300ms/2s)   │         └──────────────┘        │  visemes)  │ │
//! │  └──────────────┘                                 └────────────┘ │
//! │         │ capture started                               ▲        │
//! │         └──────────► Barge-in Coordinator ── cancel ────┘        │
//! │                                                                  │
//! │  Transcript Log ◄── user entries (capture), ai entries (session) │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod barge_in;
pub mod capture;
pub mod completion;
pub mod config;
pub mod error;
pub mod recognizer;
pub mod session;
pub mod synthesis;
pub mod transcript;
pub mod viseme;

pub use barge_in::{BargeInCoordinator, BargeInEvent};
pub use capture::{CaptureEvent, CapturePipeline, StopReason};
pub use completion::{CompletionClient, CompletionRequest, OpenAiCompletion, PlaceholderCompletion};
pub use config::{CaptureConfig, CompletionConfig, EngineConfig, SessionConfig, SynthesisConfig, VoiceSettings};
pub use error::{VoiceError, VoiceResult};
pub use recognizer::{PlaceholderRecognizer, RecognizerError, RecognizerEvent, SpeechRecognizer};
pub use session::{
    Feedback, JsonFileStore, MemoryStore, SessionCommand, SessionController, SessionHandle, SessionParts,
    SessionPhase, SessionRecord, SessionSnapshot, SessionStore, TurnStage,
};
#[cfg(feature = "playback")]
pub use synthesis::RodioOutput;
pub use synthesis::{
    AudioOutput, CancelReport, ElevenLabsTts, ItemId, NullOutput, OpenAiTts, PacedOutput, PlaceholderTts, Priority,
    SpeechSynthesizer, SynthesisEvent, SynthesisPipeline, SynthesisTicket, SynthesizedSpeech, SystemVoiceTts,
};
pub use transcript::{ChatMessage, Speaker, Transcript, TranscriptEntry, TranscriptLog};
pub use viseme::{generate_visemes, VisemeEvent, VisemeTrack};
