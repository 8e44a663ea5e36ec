//! Speech synthesis providers: text + voice parameters in, audio bytes out.
//!
//! Every provider answers with a [`SynthesizedSpeech`] whose audio is a chunk stream. A batch
//! response is simply a one-chunk stream, so the pipeline has a single playback and
//! cancellation path for both modes.

use crate::config::VoiceSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::viseme::VisemeEvent;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Maximum text size for one synthesis request (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for the local voice process.
const SYSTEM_VOICE_TIMEOUT: Duration = Duration::from_secs(30);

pub type AudioChunkStream = BoxStream<'static, VoiceResult<Vec<u8>>>;

/// Audio for one utterance, plus visemes when the provider supplies them.
pub struct SynthesizedSpeech {
    pub chunks: AudioChunkStream,
    pub visemes: Option<Vec<VisemeEvent>>,
}

impl SynthesizedSpeech {
    /// A complete clip delivered at once.
    pub fn clip(bytes: Vec<u8>) -> Self {
        Self {
            chunks: stream::iter(vec![Ok(bytes)]).boxed(),
            visemes: None,
        }
    }

    /// Audio that arrives incrementally.
    pub fn streamed(chunks: AudioChunkStream) -> Self {
        Self {
            chunks,
            visemes: None,
        }
    }

    pub fn with_visemes(mut self, visemes: Vec<VisemeEvent>) -> Self {
        self.visemes = Some(visemes);
        self
    }
}

impl std::fmt::Debug for SynthesizedSpeech {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesizedSpeech")
            .field("visemes", &self.visemes.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Backend that turns text into audio. Implement for a hosted voice API or a local engine.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether the backend can be reached at all. Checked once before a session goes active.
    async fn is_available(&self) -> bool {
        true
    }

    /// Synthesize `text`. With `streaming` set, providers that can should return audio as it is
    /// produced; others may ignore the hint and return a clip.
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSettings,
        streaming: bool,
    ) -> VoiceResult<SynthesizedSpeech>;
}

/// Silent provider: returns no audio, so nothing plays and the item completes at once.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl SpeechSynthesizer for PlaceholderTts {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn synthesize(&self, _text: &str, _voice: &VoiceSettings, _streaming: bool) -> VoiceResult<SynthesizedSpeech> {
        Ok(SynthesizedSpeech::clip(Vec::new()))
    }
}

fn check_input(text: &str) -> VoiceResult<()> {
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Synthesis(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

fn http_client(timeout: Duration) -> VoiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| VoiceError::Synthesis(e.to_string()))
}

/// Turn an HTTP response into a clip or a chunk stream. Non-2xx is a synthesis error.
async fn into_speech(res: reqwest::Response, streaming: bool, provider: &str) -> VoiceResult<SynthesizedSpeech> {
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(VoiceError::Synthesis(format!("{} API error {}: {}", provider, status, body)));
    }
    if streaming {
        let chunks = res
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| VoiceError::Synthesis(e.to_string()))
            })
            .boxed();
        Ok(SynthesizedSpeech::streamed(chunks))
    } else {
        let bytes = res.bytes().await.map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if bytes.is_empty() {
            return Err(VoiceError::Synthesis(format!("{} returned empty audio", provider)));
        }
        Ok(SynthesizedSpeech::clip(bytes.to_vec()))
    }
}

/// ElevenLabs text-to-speech (`/text-to-speech/{voice_id}` and its `/stream` variant).
/// Uses `ELEVENLABS_API_URL` (default https://api.elevenlabs.io/v1) and `ELEVENLABS_API_KEY`.
#[derive(Debug, Clone)]
pub struct ElevenLabsTts {
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("ELEVENLABS_API_URL")
            .unwrap_or_else(|_| "https://api.elevenlabs.io/v1".to_string());
        let api_key = std::env::var("ELEVENLABS_API_KEY")
            .map_err(|_| VoiceError::Config("TTS requires ELEVENLABS_API_KEY".to_string()))?;
        Self::new(base_url, api_key)
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> VoiceResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: http_client(Duration::from_secs(60))?,
        })
    }

    fn endpoint(&self, voice: &VoiceSettings, streaming: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        if streaming {
            format!("{}/text-to-speech/{}/stream", base, voice.voice_id)
        } else {
            format!("{}/text-to-speech/{}", base, voice.voice_id)
        }
    }
}

fn elevenlabs_body(text: &str, voice: &VoiceSettings) -> serde_json::Value {
    serde_json::json!({
        "text": text,
        "model_id": voice.model_id,
        "voice_settings": {
            "stability": voice.stability,
            "similarity_boost": voice.similarity_boost,
        },
    })
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsTts {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, voice: &VoiceSettings, streaming: bool) -> VoiceResult<SynthesizedSpeech> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SynthesizedSpeech::clip(Vec::new()));
        }
        check_input(text)?;
        let url = self.endpoint(voice, streaming);
        debug!(%url, streaming, "ElevenLabs: requesting speech");
        let res = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&elevenlabs_body(text, voice))
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        into_speech(res, streaming, "ElevenLabs").await
    }
}

/// OpenAI-compatible `/audio/speech` backend (OpenAI, OpenRouter, local gateways).
/// Uses `TTS_API_URL` (default https://api.openai.com/v1), `TTS_API_KEY`, `TTS_MODEL`, `TTS_VOICE`.
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    pub base_url: String,
    api_key: String,
    /// tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// OpenAI voice name (alloy, echo, fable, onyx, nova, shimmer).
    pub voice: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "nova".to_string());
        Ok(Self::new(base_url, api_key, model)?.with_voice(voice))
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> VoiceResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: "nova".to_string(),
            client: http_client(Duration::from_secs(60))?,
        })
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiTts {
    fn name(&self) -> &str {
        "openai"
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceSettings, streaming: bool) -> VoiceResult<SynthesizedSpeech> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SynthesizedSpeech::clip(Vec::new()));
        }
        check_input(text)?;
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "mp3",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        into_speech(res, streaming, "OpenAI TTS").await
    }
}

/// Lower-fidelity local voice: pipes text to a command that writes WAV to stdout
/// (default `espeak-ng --stdin --stdout`). Used as the degraded path when the hosted voice fails.
#[derive(Debug, Clone)]
pub struct SystemVoiceTts {
    program: PathBuf,
    args: Vec<String>,
}

impl Default for SystemVoiceTts {
    fn default() -> Self {
        Self::new("espeak-ng", ["--stdin", "--stdout"])
    }
}

impl SystemVoiceTts {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    async fn run(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Synthesis(format!("failed to spawn {:?}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            // Dropping stdin closes it so the process sees EOF.
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(VoiceError::Synthesis(format!(
                "{:?} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl SpeechSynthesizer for SystemVoiceTts {
    fn name(&self) -> &str {
        "system-voice"
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceSettings, _streaming: bool) -> VoiceResult<SynthesizedSpeech> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SynthesizedSpeech::clip(Vec::new()));
        }
        check_input(text)?;
        let audio = tokio::time::timeout(SYSTEM_VOICE_TIMEOUT, self.run(text))
            .await
            .map_err(|_| VoiceError::Synthesis(format!("{:?} timed out", self.program)))??;
        if audio.is_empty() {
            return Err(VoiceError::Synthesis(format!("{:?} produced no audio", self.program)));
        }
        Ok(SynthesizedSpeech::clip(audio))
    }
}
