//! **Barge-in coordinator**: the user talking over the AI silences it.
//!
//! Capture calls [`BargeInCoordinator::on_capture_started`] whenever it starts listening or the
//! engine hears speech. If synthesis is active at that moment, everything queued or playing is
//! cancelled in one step and a [`BargeInEvent`] is published. When synthesis is idle nothing
//! happens, so a barge-in fires at most once per AI turn.

use crate::synthesis::{ItemId, SynthesisPipeline};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct BargeInEvent {
    /// Items that were in flight or queued, in-flight first.
    pub cancelled: Vec<ItemId>,
    pub at: DateTime<Utc>,
}

pub struct BargeInCoordinator {
    synthesis: SynthesisPipeline,
    events: broadcast::Sender<BargeInEvent>,
    count: AtomicU64,
}

impl BargeInCoordinator {
    pub fn new(synthesis: SynthesisPipeline) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            synthesis,
            events,
            count: AtomicU64::new(0),
        }
    }

    /// Called by capture as the user starts speaking. Returns true if AI speech was cut off.
    pub fn on_capture_started(&self) -> bool {
        if !self.synthesis.is_active() {
            return false;
        }
        self.interrupt().is_some()
    }

    /// Cancel all synthesis now, whatever its state. `None` if there was nothing to cancel.
    pub fn interrupt(&self) -> Option<BargeInEvent> {
        let report = self.synthesis.cancel();
        if report.is_empty() {
            return None;
        }
        let event = BargeInEvent {
            cancelled: report.ids(),
            at: Utc::now(),
        };
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(count = n, cancelled = event.cancelled.len(), "Barge-in: user interrupted AI speech");
        let _ = self.events.send(event.clone());
        Some(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BargeInEvent> {
        self.events.subscribe()
    }

    /// Barge-ins since creation.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for BargeInCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BargeInCoordinator")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
