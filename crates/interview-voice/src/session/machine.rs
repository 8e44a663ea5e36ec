//! Pure session phase machine: no I/O, no tasks, time passed in by the caller.
//!
//! ```text
//!   idle ──► preparing ──► active ⇄ paused
//!     │          │            │        │
//!     └──────────┴────────────┴────────┴──► ended (terminal)
//! ```

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Preparing,
    Active,
    Paused,
    Ended,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Preparing => "preparing",
            SessionPhase::Active => "active",
            SessionPhase::Paused => "paused",
            SessionPhase::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Result of a countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Not active; the countdown did not move.
    Ignored,
    Remaining(u32),
    /// The countdown reached zero and the session is now ended.
    Expired,
}

#[derive(Debug, Clone)]
pub struct SessionMachine {
    phase: SessionPhase,
    remaining_secs: u32,
    /// Set on first activation, never changed afterwards.
    started: Option<(Instant, DateTime<Utc>)>,
    ended: Option<(Instant, DateTime<Utc>)>,
}

impl SessionMachine {
    pub fn new(duration_secs: u32) -> Self {
        Self {
            phase: SessionPhase::Idle,
            remaining_secs: duration_secs,
            started: None,
            ended: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn remaining_secs(&self) -> u32 {
        self.remaining_secs
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started.map(|(_, wall)| wall)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended.map(|(_, wall)| wall)
    }

    /// Time since activation; frozen once ended, zero before activation.
    pub fn duration(&self, now: Instant) -> Duration {
        match (self.started, self.ended) {
            (Some((start, _)), Some((end, _))) => end.saturating_duration_since(start),
            (Some((start, _)), None) => now.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    fn transition(&mut self, allowed: &[SessionPhase], to: SessionPhase) -> VoiceResult<()> {
        if !allowed.contains(&self.phase) {
            return Err(VoiceError::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        Ok(())
    }

    pub fn prepare(&mut self) -> VoiceResult<()> {
        self.transition(&[SessionPhase::Idle], SessionPhase::Preparing)
    }

    /// Pipelines are ready. Stamps the start time on first activation.
    pub fn activate(&mut self, now: Instant) -> VoiceResult<()> {
        self.transition(&[SessionPhase::Preparing], SessionPhase::Active)?;
        if self.started.is_none() {
            self.started = Some((now, Utc::now()));
        }
        Ok(())
    }

    pub fn pause(&mut self) -> VoiceResult<()> {
        self.transition(&[SessionPhase::Active], SessionPhase::Paused)
    }

    pub fn resume(&mut self) -> VoiceResult<()> {
        self.transition(&[SessionPhase::Paused], SessionPhase::Active)
    }

    /// Any non-terminal phase may end.
    pub fn end(&mut self, now: Instant) -> VoiceResult<()> {
        self.transition(
            &[
                SessionPhase::Idle,
                SessionPhase::Preparing,
                SessionPhase::Active,
                SessionPhase::Paused,
            ],
            SessionPhase::Ended,
        )?;
        self.ended = Some((now, Utc::now()));
        Ok(())
    }

    /// One second of countdown. Only counts while active.
    pub fn tick(&mut self, now: Instant) -> Tick {
        if self.phase != SessionPhase::Active {
            return Tick::Ignored;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        if self.remaining_secs == 0 {
            // Active -> Ended is always allowed.
            let _ = self.end(now);
            return Tick::Expired;
        }
        Tick::Remaining(self.remaining_secs)
    }
}
