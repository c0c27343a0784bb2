//! Throttled progress reporting.
//!
//! Download and install stages push raw progress here; the emitter turns
//! it into a bounded event stream the host can consume. `Downloading`
//! ticks arrive per network chunk and are throttled to a minimum interval
//! per instance; phase transitions are rare and semantically significant,
//! so they always go out immediately. When the consumer lags and the
//! channel fills, ticks are dropped instead of stalling the download.

use crate::config::ProgressConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

/// Lifecycle phase of an update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    /// Streaming the payload from the channel.
    Downloading,
    /// Verifying the payload checksum.
    Verifying,
    /// Moving the payload into place and committing.
    Installing,
    /// The install committed.
    Done,
    /// The update failed; the previous bundle remains active.
    Failed,
}

/// Snapshot of update progress, emitted to the host boundary.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Instance the event belongs to.
    pub instance_id: String,
    /// Current phase.
    pub phase: ProgressPhase,
    /// Payload bytes received so far.
    pub bytes_received: u64,
    /// Total payload bytes, when known (0 otherwise).
    pub bytes_total: u64,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

struct EmitState {
    last_phase: ProgressPhase,
    last_emit: Instant,
}

/// Converts raw progress callbacks into the throttled event stream.
pub struct ProgressEmitter {
    tx: mpsc::Sender<ProgressEvent>,
    min_interval: Duration,
    state: Mutex<HashMap<String, EmitState>>,
}

impl ProgressEmitter {
    /// Create an emitter and the stream the host consumes.
    #[must_use]
    pub fn new(config: &ProgressConfig) -> (Self, ReceiverStream<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        let emitter = Self {
            tx,
            min_interval: Duration::from_millis(config.min_emit_interval_ms),
            state: Mutex::new(HashMap::new()),
        };
        (emitter, ReceiverStream::new(rx))
    }

    /// Report progress for an instance. Applies the throttling policy and
    /// forwards to the host stream; never blocks.
    pub fn emit(&self, instance_id: &str, phase: ProgressPhase, bytes_received: u64, bytes_total: u64) {
        if !self.should_emit(instance_id, phase) {
            return;
        }

        let event = ProgressEvent {
            instance_id: instance_id.to_owned(),
            phase,
            bytes_received,
            bytes_total,
            timestamp: Utc::now(),
        };
        // A full channel drops the event; phase transitions are rare enough
        // that in practice only Downloading ticks are shed.
        if self.tx.try_send(event).is_err() {
            trace!(instance_id, ?phase, "progress consumer lagging, event dropped");
        }
    }

    /// Throttle decision. Same-phase `Downloading` events are suppressed
    /// inside the minimum interval; everything else passes.
    fn should_emit(&self, instance_id: &str, phase: ProgressPhase) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        match state.get_mut(instance_id) {
            Some(prev) => {
                let same_phase = prev.last_phase == phase;
                if same_phase
                    && phase == ProgressPhase::Downloading
                    && now.duration_since(prev.last_emit) < self.min_interval
                {
                    return false;
                }
                prev.last_phase = phase;
                prev.last_emit = now;
                true
            }
            None => {
                state.insert(
                    instance_id.to_owned(),
                    EmitState {
                        last_phase: phase,
                        last_emit: now,
                    },
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn emitter(interval_ms: u64) -> (ProgressEmitter, ReceiverStream<ProgressEvent>) {
        ProgressEmitter::new(&ProgressConfig {
            min_emit_interval_ms: interval_ms,
            event_buffer: 256,
        })
    }

    fn drain(rx: ReceiverStream<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut rx = rx.into_inner();
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn downloading_ticks_are_throttled() {
        let (emitter, rx) = emitter(10_000);
        for i in 0..50 {
            emitter.emit("default", ProgressPhase::Downloading, i * 1024, 51_200);
        }
        let events = drain(rx);
        // Only the first tick of the burst gets through the interval.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bytes_received, 0);
    }

    #[tokio::test]
    async fn phase_transitions_are_never_throttled() {
        let (emitter, rx) = emitter(10_000);
        emitter.emit("default", ProgressPhase::Downloading, 0, 100);
        emitter.emit("default", ProgressPhase::Downloading, 50, 100);
        emitter.emit("default", ProgressPhase::Verifying, 100, 100);
        emitter.emit("default", ProgressPhase::Installing, 100, 100);
        emitter.emit("default", ProgressPhase::Done, 100, 100);

        let phases: Vec<_> = drain(rx).into_iter().map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![
                ProgressPhase::Downloading,
                ProgressPhase::Verifying,
                ProgressPhase::Installing,
                ProgressPhase::Done,
            ]
        );
    }

    #[tokio::test]
    async fn zero_interval_emits_every_tick() {
        let (emitter, rx) = emitter(0);
        for i in 0..5 {
            emitter.emit("default", ProgressPhase::Downloading, i, 5);
        }
        assert_eq!(drain(rx).len(), 5);
    }

    #[tokio::test]
    async fn throttle_state_is_per_instance() {
        let (emitter, rx) = emitter(10_000);
        emitter.emit("a", ProgressPhase::Downloading, 0, 10);
        emitter.emit("b", ProgressPhase::Downloading, 0, 10);
        // Each instance's first tick passes independently.
        let events = drain(rx);
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].instance_id, events[1].instance_id);
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (emitter, rx) = ProgressEmitter::new(&ProgressConfig {
            min_emit_interval_ms: 0,
            event_buffer: 2,
        });
        for i in 0..10 {
            emitter.emit("default", ProgressPhase::Downloading, i, 10);
        }
        // Capacity bounds what arrives; nothing deadlocked.
        assert_eq!(drain(rx).len(), 2);
    }

    #[tokio::test]
    async fn failed_phase_emits_after_downloading_burst() {
        let (emitter, rx) = emitter(10_000);
        emitter.emit("default", ProgressPhase::Downloading, 0, 100);
        emitter.emit("default", ProgressPhase::Downloading, 10, 100);
        emitter.emit("default", ProgressPhase::Failed, 10, 100);
        let phases: Vec<_> = drain(rx).into_iter().map(|e| e.phase).collect();
        assert_eq!(phases, vec![ProgressPhase::Downloading, ProgressPhase::Failed]);
    }
}
