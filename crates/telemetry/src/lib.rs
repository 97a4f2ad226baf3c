// telemetry - latency measurement and pipeline event stream
pub mod events;
pub mod json;
pub mod log;
pub mod time;
pub mod windows;

pub use events::{
    event_channel, EventBus, EventSubscriber, FrameProgress, LifecycleEvent, LifecycleState,
    StageShares, WarningKind,
};
pub use time::{now_ns, since_ms};
pub use windows::{
    RollingWindow, StageRecord, TimingCore, TimingSnapshot, SHARE_MIN_SAMPLES, SPLIT_MIN_SAMPLES,
    STAGE_WINDOW,
};

/// Emit a single latency record to the human-readable backend.
pub fn record_ms(name: &str, start_ns: u64) {
    log::emit(name, time::since_ms(start_ns));
}
