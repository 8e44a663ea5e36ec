//! Audio sinks for synthesized speech.
//!
//! `stop()` is the barge-in kill-switch: it must silence the device immediately and drop
//! anything queued. `wait_until_end()` returns once everything appended so far has played (or
//! was stopped).

use crate::error::VoiceResult;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Queue encoded audio (WAV/MP3) behind whatever is already playing.
    fn append(&self, audio: Vec<u8>) -> VoiceResult<()>;

    async fn wait_until_end(&self);

    /// Stop playback now and clear the queue.
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// Discards audio. Playback finishes as soon as it starts.
#[derive(Debug, Default)]
pub struct NullOutput;

#[async_trait]
impl AudioOutput for NullOutput {
    fn append(&self, _audio: Vec<u8>) -> VoiceResult<()> {
        Ok(())
    }

    async fn wait_until_end(&self) {}

    fn stop(&self) {}

    fn is_playing(&self) -> bool {
        false
    }
}

/// Headless sink that "plays" audio in real time at a fixed byte rate, without a device.
/// Gives barge-in something to interrupt when running without speakers.
#[derive(Debug)]
pub struct PacedOutput {
    bytes_per_sec: u64,
    ends_at: Mutex<Option<Instant>>,
    stopped: Notify,
}

impl Default for PacedOutput {
    /// 128 kbit/s, the usual MP3 rate of hosted voices.
    fn default() -> Self {
        Self::new(16_000)
    }
}

impl PacedOutput {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            ends_at: Mutex::new(None),
            stopped: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.ends_at.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn duration_of(&self, len: usize) -> Duration {
        Duration::from_millis(len as u64 * 1000 / self.bytes_per_sec)
    }
}

#[async_trait]
impl AudioOutput for PacedOutput {
    fn append(&self, audio: Vec<u8>) -> VoiceResult<()> {
        let now = Instant::now();
        let mut ends_at = self.lock();
        let start = match *ends_at {
            Some(end) if end > now => end,
            _ => now,
        };
        *ends_at = Some(start + self.duration_of(audio.len()));
        Ok(())
    }

    async fn wait_until_end(&self) {
        loop {
            let notified = self.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(end) = *self.lock() else { return };
            tokio::select! {
                _ = tokio::time::sleep_until(end) => {
                    let mut ends_at = self.lock();
                    // Appends while we slept push the end further out.
                    if *ends_at == Some(end) || ends_at.is_none() {
                        *ends_at = None;
                        return;
                    }
                }
                _ = &mut notified => return,
            }
        }
    }

    fn stop(&self) {
        *self.lock() = None;
        self.stopped.notify_waiters();
    }

    fn is_playing(&self) -> bool {
        self.lock().is_some_and(|end| end > Instant::now())
    }
}

#[cfg(feature = "playback")]
pub use rodio_output::RodioOutput;

#[cfg(feature = "playback")]
mod rodio_output {
    use super::AudioOutput;
    use crate::error::{VoiceError, VoiceResult};
    use async_trait::async_trait;
    use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
    use std::io::Cursor;
    use std::sync::{mpsc, Arc, Mutex, MutexGuard};
    use tracing::{info, warn};

    /// Speaker playback through a `rodio::Sink` on the default output device.
    ///
    /// `OutputStream` is not `Send`, so it lives on a dedicated thread for as long as this
    /// value does; the sink is rebuilt after every `stop()`.
    pub struct RodioOutput {
        handle: OutputStreamHandle,
        sink: Mutex<Arc<Sink>>,
        _shutdown: mpsc::Sender<()>,
    }

    impl RodioOutput {
        pub fn new() -> VoiceResult<Self> {
            let (ready_tx, ready_rx) = mpsc::channel();
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            std::thread::Builder::new()
                .name("rodio-output".into())
                .spawn(move || match OutputStream::try_default() {
                    Ok((stream, handle)) => {
                        let _ = ready_tx.send(Ok(handle));
                        // Blocks until the RodioOutput is dropped.
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                    }
                })?;
            let handle = ready_rx
                .recv()
                .map_err(|_| VoiceError::Playback("output thread exited".to_string()))??;
            let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
            info!("RodioOutput: sink ready for playback");
            Ok(Self {
                handle,
                sink: Mutex::new(Arc::new(sink)),
                _shutdown: shutdown_tx,
            })
        }

        fn sink(&self) -> MutexGuard<'_, Arc<Sink>> {
            self.sink.lock().unwrap_or_else(|p| p.into_inner())
        }
    }

    #[async_trait]
    impl AudioOutput for RodioOutput {
        fn append(&self, audio: Vec<u8>) -> VoiceResult<()> {
            if audio.is_empty() {
                return Ok(());
            }
            match rodio::Decoder::new(Cursor::new(audio)) {
                Ok(source) => {
                    self.sink().append(source.convert_samples::<f32>());
                    Ok(())
                }
                // A streamed fragment can split a frame; skip it rather than fail the utterance.
                Err(e) => {
                    warn!(error = %e, "RodioOutput: could not decode audio chunk, skipping");
                    Ok(())
                }
            }
        }

        async fn wait_until_end(&self) {
            let sink = Arc::clone(&self.sink());
            let _ = tokio::task::spawn_blocking(move || sink.sleep_until_end()).await;
        }

        fn stop(&self) {
            let mut sink = self.sink();
            sink.stop();
            match Sink::try_new(&self.handle) {
                Ok(fresh) => *sink = Arc::new(fresh),
                Err(e) => warn!(error = %e, "RodioOutput: could not recreate sink"),
            }
            info!("RodioOutput: stopped");
        }

        fn is_playing(&self) -> bool {
            !self.sink().empty()
        }
    }
}
