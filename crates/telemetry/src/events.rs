// events.rs - Pipeline event stream: lossy frame progress, lossless lifecycle
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;

use crate::windows::TimingSnapshot;

/// Orchestrator state as observed by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Ready,
    Running,
    Paused,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }
}

/// Rolling stage shares carried on every progress event.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageShares {
    pub grab_pct: f64,
    pub infer_pct: f64,
    pub depth_pct: f64,
    pub housekeeping_pct: f64,
    pub warming: bool,
}

impl From<&TimingSnapshot> for StageShares {
    fn from(snap: &TimingSnapshot) -> Self {
        Self {
            grab_pct: snap.grab.share_pct,
            infer_pct: snap.infer.share_pct,
            depth_pct: snap.depth.share_pct,
            housekeeping_pct: snap.housekeeping.share_pct,
            warming: snap.stages().iter().any(|s| s.warming),
        }
    }
}

/// Per-frame progress event. The stream is lossy: subscribers must tolerate
/// dropped events.
#[derive(Debug, Clone)]
pub struct FrameProgress {
    pub index: u64,
    pub global_fps: f64,
    pub stage_shares: StageShares,
    pub detection_count: usize,
    /// Mean of the per-detection depth means over in-range detections with
    /// valid depth; None when no such detection exists on this frame.
    pub depth_mean_m: Option<f32>,
    pub wall_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    DepthMapStale,
    SkipClamped,
    FontUnavailable,
    WriterIo,
    DepthRetrieveFailed,
    GrabTransient,
    InferTransient,
}

/// Lossless lifecycle-channel events.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    State {
        state: LifecycleState,
        reason: Option<String>,
    },
    InitProgress {
        pct: u8,
        message: String,
    },
    CommandRejected {
        command: String,
        reason: String,
    },
    Warning {
        kind: WarningKind,
        detail: String,
    },
}

/// Producer side held by the orchestrator. Emission never blocks: progress
/// uses a bounded channel with drop-on-full, lifecycle an unbounded one.
#[derive(Clone)]
pub struct EventBus {
    progress_tx: SyncSender<FrameProgress>,
    lifecycle_tx: Sender<LifecycleEvent>,
    dropped_progress: Arc<AtomicU64>,
}

impl EventBus {
    pub fn progress(&self, event: FrameProgress) {
        match self.progress_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_progress.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn lifecycle(&self, event: LifecycleEvent) {
        let _ = self.lifecycle_tx.send(event);
    }

    pub fn state(&self, state: LifecycleState, reason: Option<String>) {
        self.lifecycle(LifecycleEvent::State { state, reason });
    }

    pub fn warn(&self, kind: WarningKind, detail: impl Into<String>) {
        self.lifecycle(LifecycleEvent::Warning {
            kind,
            detail: detail.into(),
        });
    }

    pub fn dropped_progress(&self) -> u64 {
        self.dropped_progress.load(Ordering::Relaxed)
    }
}

/// Consumer side handed to the host.
pub struct EventSubscriber {
    pub progress: Receiver<FrameProgress>,
    pub lifecycle: Receiver<LifecycleEvent>,
}

pub fn event_channel(progress_capacity: usize) -> (EventBus, EventSubscriber) {
    let (progress_tx, progress_rx) = mpsc::sync_channel(progress_capacity.max(1));
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel();
    (
        EventBus {
            progress_tx,
            lifecycle_tx,
            dropped_progress: Arc::new(AtomicU64::new(0)),
        },
        EventSubscriber {
            progress: progress_rx,
            lifecycle: lifecycle_rx,
        },
    )
}
