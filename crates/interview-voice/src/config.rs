//! Engine configuration: capture timing, voice parameters, completion endpoint and session length.
//!
//! Three ways in, all landing on the same serde structs:
//! - [`EngineConfig::from_env`] reads flat `INTERVIEW_*` / provider variables (see table below).
//! - [`EngineConfig::load`] layers a TOML file and `INTERVIEW__SECTION__FIELD` overrides via `config`.
//! - [`EngineConfig::from_toml_str`] parses a TOML document directly.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | INTERVIEW_LOCALE | en-US | Recognition locale passed to the engine. |
//! | INTERVIEW_PARTIAL_INTERVAL_MS | 300 | Minimum gap between partial transcript events. |
//! | INTERVIEW_SILENCE_TIMEOUT_MS | 2000 | Silence after the last partial that ends the user's turn. |
//! | INTERVIEW_TTS_STREAMING | true | Request chunked audio and start playback on the first buffer. |
//! | INTERVIEW_DURATION_SECS | 900 | Countdown length of one session. |
//! | INTERVIEW_ROLE | Software Engineer | Role the candidate is interviewing for. |
//! | INTERVIEW_TYPE | behavioral | Interview flavour passed as role context. |
//! | INTERVIEW_GREETING | (unset) | Opening line spoken before the first capture. |
//! | ELEVENLABS_VOICE_ID | pNInz6obpgDQGcFmaJgB | Voice identity for synthesis. |
//! | COMPLETION_API_URL | https://api.openai.com/v1 | OpenAI-compatible base URL. |
//! | COMPLETION_API_KEY / OPENAI_API_KEY | (unset) | Bearer key for completions. |
//! | COMPLETION_MODEL | gpt-4o-mini | Chat model. |
//! | COMPLETION_STREAM | false | Use SSE streaming and concatenate deltas. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly, professional hiring manager running a \
    practice interview with a university student. Keep every reply to one or two spoken \
    sentences. Ask questions that fit the candidate's chosen role, use natural conversational \
    fillers, and when an answer is vague, ask about the situation, task, action and result. \
    Stay in character for the whole interview.";

const DEFAULT_FALLBACK_REPLY: &str = "Sorry, I didn't quite catch that. Could you say it again?";

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_partial_interval_ms() -> u64 {
    300
}

fn default_silence_timeout_ms() -> u64 {
    2000
}

fn default_start_retries() -> u32 {
    1
}

fn default_min_buffer_bytes() -> usize {
    4096
}

fn default_true() -> bool {
    true
}

fn default_voice_id() -> String {
    "pNInz6obpgDQGcFmaJgB".to_string()
}

fn default_voice_model() -> String {
    "eleven_monolingual_v1".to_string()
}

fn default_half() -> f32 {
    0.5
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    150
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_duration_secs() -> u32 {
    900
}

fn default_role() -> String {
    "Software Engineer".to_string()
}

fn default_interview_type() -> String {
    "behavioral".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_fallback_reply() -> String {
    DEFAULT_FALLBACK_REPLY.to_string()
}

/// Speech capture timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Partial events are emitted at most once per this interval (default 300ms).
    #[serde(default = "default_partial_interval_ms")]
    pub partial_interval_ms: u64,
    /// Silence after the last partial that auto-stops capture (default 2000ms).
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    /// Local retries for a transient engine start failure (default 1).
    #[serde(default = "default_start_retries")]
    pub start_retries: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            locale: default_locale(),
            partial_interval_ms: default_partial_interval_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
            start_retries: default_start_retries(),
        }
    }
}

impl CaptureConfig {
    pub fn partial_interval(&self) -> Duration {
        Duration::from_millis(self.partial_interval_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

/// Voice identity and tuning knobs sent to the synthesis provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_voice_model")]
    pub model_id: String,
    #[serde(default = "default_half")]
    pub stability: f32,
    #[serde(default = "default_half")]
    pub similarity_boost: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice_id: default_voice_id(),
            model_id: default_voice_model(),
            stability: default_half(),
            similarity_boost: default_half(),
        }
    }
}

/// Synthesis pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Bytes buffered before the first append to the output in streaming mode.
    #[serde(default = "default_min_buffer_bytes")]
    pub min_buffer_bytes: usize,
    /// Ask the provider for a chunk stream instead of a single clip.
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub voice: VoiceSettings,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            min_buffer_bytes: default_min_buffer_bytes(),
            streaming: true,
            voice: VoiceSettings::default(),
        }
    }
}

/// OpenAI-compatible completion endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            stream: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("stream", &self.stream)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Interview session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Countdown length in seconds (default 15 minutes).
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u32,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_interview_type")]
    pub interview_type: String,
    /// Spoken with high priority before the first capture, if set.
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Conversational reply used when the completion request fails.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            role: default_role(),
            interview_type: default_interview_type(),
            greeting: None,
            system_prompt: default_system_prompt(),
            fallback_reply: default_fallback_reply(),
        }
    }
}

impl SessionConfig {
    /// Role/context string handed to the completion collaborator with every request.
    pub fn role_context(&self) -> String {
        format!(
            "{}\n\nRole: {}\nInterview type: {}",
            self.system_prompt, self.role, self.interview_type
        )
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Load from flat environment variables. Unset or unparsable values take their defaults;
    /// the result is validated like a TOML-loaded config.
    pub fn from_env() -> VoiceResult<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> VoiceResult<Self> {
        let string = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let capture = CaptureConfig {
            locale: string("INTERVIEW_LOCALE").unwrap_or_else(default_locale),
            partial_interval_ms: parse_or(string("INTERVIEW_PARTIAL_INTERVAL_MS"), default_partial_interval_ms()),
            silence_timeout_ms: parse_or(string("INTERVIEW_SILENCE_TIMEOUT_MS"), default_silence_timeout_ms()),
            start_retries: default_start_retries(),
        };
        let synthesis = SynthesisConfig {
            streaming: flag_or(string("INTERVIEW_TTS_STREAMING"), true),
            voice: VoiceSettings {
                voice_id: string("ELEVENLABS_VOICE_ID").unwrap_or_else(default_voice_id),
                ..VoiceSettings::default()
            },
            ..SynthesisConfig::default()
        };
        let completion = CompletionConfig {
            api_url: string("COMPLETION_API_URL").unwrap_or_else(default_api_url),
            api_key: string("COMPLETION_API_KEY")
                .or_else(|| string("OPENAI_API_KEY"))
                .unwrap_or_default(),
            model: string("COMPLETION_MODEL").unwrap_or_else(default_model),
            stream: flag_or(string("COMPLETION_STREAM"), false),
            ..CompletionConfig::default()
        };
        let session = SessionConfig {
            // Parsed as u32 so an out-of-range value falls back instead of wrapping.
            duration_secs: parse_or(string("INTERVIEW_DURATION_SECS"), default_duration_secs()),
            role: string("INTERVIEW_ROLE").unwrap_or_else(default_role),
            interview_type: string("INTERVIEW_TYPE").unwrap_or_else(default_interview_type),
            greeting: string("INTERVIEW_GREETING"),
            ..SessionConfig::default()
        };
        let cfg = Self {
            capture,
            synthesis,
            completion,
            session,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a TOML file, then apply `INTERVIEW__SECTION__FIELD` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> VoiceResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("INTERVIEW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(s: &str) -> VoiceResult<Self> {
        let cfg: EngineConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the pipelines cannot honour.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.capture.partial_interval_ms == 0 {
            return Err(VoiceError::Config("partial_interval_ms must be > 0".to_string()));
        }
        if self.capture.silence_timeout_ms <= self.capture.partial_interval_ms {
            return Err(VoiceError::Config(format!(
                "silence_timeout_ms ({}) must exceed partial_interval_ms ({})",
                self.capture.silence_timeout_ms, self.capture.partial_interval_ms
            )));
        }
        let voice = &self.synthesis.voice;
        for (name, value) in [("stability", voice.stability), ("similarity_boost", voice.similarity_boost)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(VoiceError::Config(format!("{} must be within 0.0..=1.0, got {}", name, value)));
            }
        }
        if self.session.duration_secs == 0 {
            return Err(VoiceError::Config("duration_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

fn flag_or(value: Option<String>, default: bool) -> bool {
    value.map_or(default, |v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
