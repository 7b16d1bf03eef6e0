//! In-process event bus (§4.H).
//!
//! Two broadcast channels back one logical bus: a small, never-dropped
//! channel for status-affecting events, and a larger, lossy one for
//! high-volume progress frames. `broadcast`'s own lag-skipping is exactly
//! the "slow subscribers drop progress, never drop status" semantics asked
//! for — we just need to keep the two event classes on separate channels so
//! a burst of progress frames can't push a status change out of a slow
//! subscriber's buffer.

use dlman_types::CoreEvent;
use tokio::sync::broadcast;

const STATUS_CAPACITY: usize = 256;
const PROGRESS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    status_tx: broadcast::Sender<CoreEvent>,
    progress_tx: broadcast::Sender<CoreEvent>,
}

/// A subscriber's view of the bus: two receivers the caller should poll
/// together (e.g. via `tokio::select!`).
pub struct EventSubscription {
    pub status: broadcast::Receiver<CoreEvent>,
    pub progress: broadcast::Receiver<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (progress_tx, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            status_tx,
            progress_tx,
        }
    }

    pub fn publish(&self, event: CoreEvent) {
        if event.is_high_priority() {
            let _ = self.status_tx.send(event);
        } else {
            let _ = self.progress_tx.send(event);
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            status: self.status_tx.subscribe(),
            progress: self.progress_tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
