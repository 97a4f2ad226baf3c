use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use telemetry::{
    event_channel, EventBus, EventSubscriber, FrameProgress, LifecycleEvent, LifecycleState,
    StageRecord, StageShares, TimingCore, WarningKind,
};

use crate::camera::StereoCamera;
use crate::control::{
    command_channel, Command, CommandReceiver, CommandSender, CommandWait, DepthRate,
};
use crate::depth::{DepthExtractor, DepthMap};
use crate::detector::Detector;
use crate::packets::{
    CameraError, DepthStats, DetectorError, FatalError, FrameResult, GrabOutcome,
};
use crate::session::{write_stats_json, RunSettings, SessionOutcome, SessionStats};
use crate::writer::{ArtifactWriter, WriterConfig, WriterTotals};

/// Frame-index decimation for depth retrieval: a frame is a depth frame iff
/// its index is a multiple of the interval.
#[derive(Debug, Clone, Copy)]
pub struct DepthSchedule {
    interval: u64,
}

impl DepthSchedule {
    pub fn from_rate(rate: DepthRate, native_fps: f64) -> Self {
        let interval = match rate {
            DepthRate::EveryFrame => 1,
            DepthRate::EveryN(n) => n.max(1) as u64,
            DepthRate::Hz(hz) => {
                if hz > 0.0 && native_fps > 0.0 {
                    ((native_fps / hz as f64).round() as u64).max(1)
                } else {
                    1
                }
            }
        };
        Self { interval }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn should_sample(&self, index: u64) -> bool {
        index % self.interval == 0
    }
}

pub fn describe_rate(rate: DepthRate) -> String {
    match rate {
        DepthRate::EveryFrame => "every_frame".to_string(),
        DepthRate::Hz(hz) => format!("{hz}Hz"),
        DepthRate::EveryN(n) => format!("every_{n}_frames"),
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub depth_rate: DepthRate,
    pub depth_min_m: f32,
    pub depth_max_m: f32,
    pub staleness_frames: u64,
    pub warmup_grabs: u32,
    pub progress_capacity: usize,
    pub output_root: PathBuf,
    pub writer: WriterConfig,
    pub settings: RunSettings,
    /// Bounded wake-up latency while Ready or Paused.
    pub pause_poll: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            depth_rate: DepthRate::EveryFrame,
            depth_min_m: 1.0,
            depth_max_m: 40.0,
            staleness_frames: 30,
            warmup_grabs: 2,
            progress_capacity: 512,
            output_root: PathBuf::from("runs"),
            writer: WriterConfig {
                save_annotated: false,
                save_labels: false,
                jpeg_quality: 85,
                font_path: PathBuf::new(),
            },
            settings: RunSettings {
                source: String::new(),
                depth_preset: "balanced".to_string(),
                depth_schedule: "every_frame".to_string(),
                confidence_threshold: 0.25,
            },
            pause_poll: Duration::from_millis(100),
        }
    }
}

/// Builder for a pipeline session.
pub struct PipelineBuilder {
    cfg: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            cfg: PipelineConfig::default(),
        }
    }

    pub fn with_depth_rate(mut self, rate: DepthRate) -> Self {
        self.cfg.depth_rate = rate;
        self.cfg.settings.depth_schedule = describe_rate(rate);
        self
    }

    pub fn with_depth_bounds(mut self, min_m: f32, max_m: f32) -> Self {
        self.cfg.depth_min_m = min_m;
        self.cfg.depth_max_m = max_m;
        self
    }

    pub fn with_staleness_frames(mut self, frames: u64) -> Self {
        self.cfg.staleness_frames = frames;
        self
    }

    pub fn with_warmup_grabs(mut self, grabs: u32) -> Self {
        self.cfg.warmup_grabs = grabs;
        self
    }

    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.cfg.progress_capacity = capacity;
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cfg.output_root = root.into();
        self
    }

    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.cfg.writer = writer;
        self
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.cfg.settings = settings;
        self
    }

    pub fn with_pause_poll(mut self, poll: Duration) -> Self {
        self.cfg.pause_poll = poll;
        self
    }

    /// Spawns the orchestrator thread. Camera and detector are constructed
    /// inside that thread and exclusively owned by it for the session
    /// lifetime; initialization milestones surface on the lifecycle stream.
    pub fn spawn<C, D, FC, FD>(self, camera_factory: FC, detector_factory: FD) -> PipelineHandle
    where
        C: StereoCamera + 'static,
        D: Detector + 'static,
        FC: FnOnce() -> Result<C, CameraError> + Send + 'static,
        FD: FnOnce() -> Result<D, DetectorError> + Send + 'static,
    {
        let (commands, command_rx) = command_channel();
        let (bus, events) = event_channel(self.cfg.progress_capacity);
        let cfg = self.cfg;

        let thread = thread::spawn(move || run(camera_factory, detector_factory, cfg, bus, command_rx));

        PipelineHandle {
            commands,
            events: Some(events),
            thread: Some(thread),
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-side handle: command producer, event subscriber and the session join.
pub struct PipelineHandle {
    commands: CommandSender,
    events: Option<EventSubscriber>,
    thread: Option<thread::JoinHandle<SessionReport>>,
}

impl PipelineHandle {
    pub fn send(&self, cmd: Command) {
        self.commands.send(cmd);
    }

    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    /// Hands the event receivers to the host; valid once per session.
    pub fn take_events(&mut self) -> EventSubscriber {
        self.events.take().expect("events already taken")
    }

    /// Blocks until the session reaches a terminal state.
    pub fn join(mut self) -> SessionReport {
        match self.thread.take() {
            Some(handle) => match handle.join() {
                Ok(report) => report,
                Err(_) => SessionReport::panicked(),
            },
            None => SessionReport::panicked(),
        }
    }
}

/// Final session summary returned from `join`.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub stats_path: Option<PathBuf>,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub frames_with_detections: u64,
    pub frames_empty: u64,
    pub detections_total: u64,
    pub writer: WriterTotals,
    pub dropped_progress_events: u64,
}

impl SessionReport {
    fn panicked() -> Self {
        Self {
            outcome: SessionOutcome::Failed(FatalError::UnsupportedOperation),
            stats_path: None,
            frames_processed: 0,
            frames_skipped: 0,
            frames_with_detections: 0,
            frames_empty: 0,
            detections_total: 0,
            writer: WriterTotals::default(),
            dropped_progress_events: 0,
        }
    }
}

enum Transition {
    None,
    Paused,
    Stopped,
}

struct Orchestrator<C: StereoCamera, D: Detector> {
    camera: C,
    detector: D,
    cfg: PipelineConfig,
    schedule: DepthSchedule,
    extractor: DepthExtractor,
    timing: TimingCore,
    stats: SessionStats,
    bus: EventBus,
    commands: CommandReceiver,
    writer: Option<ArtifactWriter>,
    session_dir: Option<PathBuf>,
    last_depth: Option<DepthMap>,
    last_depth_index: i64,
    stale_warned: bool,
    stop_requested: bool,
}

fn run<C, D, FC, FD>(
    camera_factory: FC,
    detector_factory: FD,
    cfg: PipelineConfig,
    bus: EventBus,
    commands: CommandReceiver,
) -> SessionReport
where
    C: StereoCamera,
    D: Detector,
    FC: FnOnce() -> Result<C, CameraError>,
    FD: FnOnce() -> Result<D, DetectorError>,
{
    bus.state(LifecycleState::Initializing, None);
    bus.lifecycle(LifecycleEvent::InitProgress {
        pct: 0,
        message: "opening camera".to_string(),
    });

    let mut camera = match camera_factory() {
        Ok(camera) => camera,
        Err(e) => return fail_before_running(&bus, FatalError::from(&e)),
    };

    bus.lifecycle(LifecycleEvent::InitProgress {
        pct: 30,
        message: "warming depth backend".to_string(),
    });

    // Some depth backends only deliver usable maps after a couple of grabs;
    // their outputs are discarded.
    for i in 0..cfg.warmup_grabs {
        match camera.grab() {
            GrabOutcome::Frame | GrabOutcome::Transient(_) => {}
            GrabOutcome::EndOfSession => break,
            GrabOutcome::Fatal(reason) => {
                return fail_before_running(&bus, FatalError::CameraFault(reason));
            }
        }
        bus.lifecycle(LifecycleEvent::InitProgress {
            pct: (30 + (i + 1) * 45 / cfg.warmup_grabs.max(1)).min(75) as u8,
            message: "warming depth backend".to_string(),
        });
    }
    if !camera.is_live() && camera.current_index() >= 0 {
        if let Err(e) = camera.seek(0) {
            return fail_before_running(&bus, FatalError::from(&e));
        }
    }

    bus.lifecycle(LifecycleEvent::InitProgress {
        pct: 80,
        message: "loading engine".to_string(),
    });

    let detector = match detector_factory() {
        Ok(detector) => detector,
        Err(_) => return fail_before_running(&bus, FatalError::EngineLoadFailure),
    };

    bus.lifecycle(LifecycleEvent::InitProgress {
        pct: 95,
        message: "finalizing".to_string(),
    });

    let schedule = DepthSchedule::from_rate(cfg.depth_rate, camera.native_fps());
    let extractor = DepthExtractor::new(cfg.depth_min_m, cfg.depth_max_m);

    let mut orchestrator = Orchestrator {
        camera,
        detector,
        schedule,
        extractor,
        timing: TimingCore::new(),
        stats: SessionStats::new(),
        bus,
        commands,
        writer: None,
        session_dir: None,
        last_depth: None,
        last_depth_index: -1,
        stale_warned: false,
        stop_requested: false,
        cfg,
    };

    orchestrator.bus.lifecycle(LifecycleEvent::InitProgress {
        pct: 100,
        message: match orchestrator.camera.frames_total() {
            Some(total) => format!("ready, {total} frames"),
            None => "ready".to_string(),
        },
    });
    orchestrator.bus.state(LifecycleState::Ready, None);

    match orchestrator.ready_loop() {
        Some(outcome) => orchestrator.finish(outcome),
        None => {
            let outcome = orchestrator.running_loop();
            orchestrator.finish(outcome)
        }
    }
}

fn fail_before_running(bus: &EventBus, error: FatalError) -> SessionReport {
    bus.state(LifecycleState::Failed, Some(error.to_string()));
    SessionReport {
        outcome: SessionOutcome::Failed(error),
        stats_path: None,
        frames_processed: 0,
        frames_skipped: 0,
        frames_with_detections: 0,
        frames_empty: 0,
        detections_total: 0,
        writer: WriterTotals::default(),
        dropped_progress_events: 0,
    }
}

impl<C: StereoCamera, D: Detector> Orchestrator<C, D> {
    /// Awaits Start. Returns Some(outcome) when the session terminates
    /// without ever running.
    fn ready_loop(&mut self) -> Option<SessionOutcome> {
        loop {
            match self.commands.wait_next(self.cfg.pause_poll) {
                CommandWait::Command(Command::Start) => {
                    self.enter_running();
                    return None;
                }
                CommandWait::Command(Command::Stop) => {
                    self.stop_requested = true;
                    return Some(SessionOutcome::Stopped);
                }
                CommandWait::Command(other) => self.reject(&other, "session is not running"),
                CommandWait::TimedOut => {}
                CommandWait::Disconnected => return Some(SessionOutcome::Stopped),
            }
        }
    }

    fn enter_running(&mut self) {
        if !self.stats.reached_running() {
            self.stats.mark_running();
            // Output directory is named by the session start timestamp but
            // only materializes when an artifact or stats flush needs it.
            let dir = self
                .cfg
                .output_root
                .join(format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S")));
            if self.cfg.writer.enabled() {
                self.writer = Some(ArtifactWriter::spawn(
                    dir.join("frames"),
                    self.cfg.writer.clone(),
                    self.bus.clone(),
                ));
            }
            self.session_dir = Some(dir);
        }
        self.bus.state(LifecycleState::Running, None);
    }

    fn running_loop(&mut self) -> SessionOutcome {
        loop {
            // Commands are consulted at exactly one point per iteration.
            while let Some(cmd) = self.commands.try_next() {
                match self.apply_running(cmd) {
                    Transition::None => {}
                    Transition::Paused => {
                        if let Some(outcome) = self.pause_loop() {
                            return outcome;
                        }
                    }
                    Transition::Stopped => return SessionOutcome::Stopped,
                }
            }

            let t0 = Instant::now();
            match self.camera.grab() {
                GrabOutcome::Frame => {}
                GrabOutcome::EndOfSession => return SessionOutcome::Ended,
                GrabOutcome::Transient(reason) => {
                    self.stats.record_skip();
                    self.stats.errors.grab_transient += 1;
                    self.bus.warn(WarningKind::GrabTransient, reason);
                    continue;
                }
                GrabOutcome::Fatal(reason) => {
                    // A stop enqueued before the fault surfaced wins over it.
                    return if self.stop_requested || self.pending_stop() {
                        SessionOutcome::Stopped
                    } else {
                        SessionOutcome::Failed(FatalError::CameraFault(reason))
                    };
                }
            }
            let t1 = Instant::now();
            let index = self.camera.current_index().max(0) as u64;

            let left = match self.camera.retrieve_left() {
                Ok(image) => image,
                Err(e) => {
                    self.stats.record_skip();
                    self.stats.errors.grab_transient += 1;
                    self.bus.warn(WarningKind::GrabTransient, e.to_string());
                    continue;
                }
            };

            let detections = match self.detector.infer(&left) {
                Ok(detections) => detections,
                Err(DetectorError::Infer(reason)) => {
                    self.stats.record_skip();
                    self.stats.errors.infer_transient += 1;
                    self.bus.warn(WarningKind::InferTransient, reason);
                    continue;
                }
                Err(DetectorError::EngineLoad(_)) => {
                    return SessionOutcome::Failed(FatalError::EngineLoadFailure);
                }
            };
            let t2 = Instant::now();

            if self.schedule.should_sample(index) {
                match self.camera.retrieve_depth(None) {
                    Ok(map) => {
                        self.last_depth = Some(map);
                        self.last_depth_index = index as i64;
                        self.stale_warned = false;
                    }
                    Err(e) => {
                        // Degrades to a non-depth frame.
                        self.stats.errors.depth_retrieve += 1;
                        self.bus.warn(WarningKind::DepthRetrieveFailed, e.to_string());
                    }
                }
            }

            let depth_stats: Vec<DepthStats> = match &self.last_depth {
                Some(map) => {
                    let age = index as i64 - self.last_depth_index;
                    if age > self.cfg.staleness_frames as i64 && !self.stale_warned {
                        self.stale_warned = true;
                        self.bus.warn(
                            WarningKind::DepthMapStale,
                            format!("reused depth map is {age} frames old"),
                        );
                    }
                    self.extractor.extract(map, &detections)
                }
                None => detections.iter().map(|_| DepthStats::NO_DEPTH).collect(),
            };
            let t3 = Instant::now();

            if let Some(writer) = &self.writer {
                writer.dispatch(index, &left, &detections, &depth_stats);
            }

            let now = Instant::now();
            let timings = StageRecord {
                grab_ns: (t1 - t0).as_nanos() as u64,
                infer_ns: (t2 - t1).as_nanos() as u64,
                depth_ns: (t3 - t2).as_nanos() as u64,
                housekeeping_ns: (now - t3).as_nanos() as u64,
            };
            let wall_ns = (now - t0).as_nanos() as u64;
            let had_detections = !detections.is_empty();
            self.timing.push(timings, wall_ns, had_detections);

            let result = FrameResult {
                index,
                detections,
                depth: depth_stats,
                timings,
                wall_ns,
            };
            self.stats.record_frame(&result);

            let snapshot = self.timing.snapshot();
            self.bus.progress(FrameProgress {
                index,
                global_fps: self.stats.global_fps(),
                stage_shares: StageShares::from(&snapshot),
                detection_count: result.detections.len(),
                depth_mean_m: result.depth_summary_m(),
                wall_ms: wall_ns as f64 / 1_000_000.0,
            });
        }
    }

    fn apply_running(&mut self, cmd: Command) -> Transition {
        match cmd {
            Command::Pause => {
                self.bus.state(LifecycleState::Paused, None);
                Transition::Paused
            }
            Command::Stop => {
                self.stop_requested = true;
                Transition::Stopped
            }
            Command::ReconfigureDepth(rate) => {
                self.reconfigure_depth(rate);
                Transition::None
            }
            Command::Start => {
                self.reject(&Command::Start, "already running");
                Transition::None
            }
            Command::Resume => {
                self.reject(&Command::Resume, "not paused");
                Transition::None
            }
            cmd @ Command::Skip { .. } => {
                self.reject(&cmd, "Skip is only valid while paused");
                Transition::None
            }
        }
    }

    /// Paused: no frames are grabbed; wakes up at a bounded latency to drain
    /// commands. Returns Some(outcome) when the session terminates from
    /// Paused.
    fn pause_loop(&mut self) -> Option<SessionOutcome> {
        loop {
            match self.commands.wait_next(self.cfg.pause_poll) {
                CommandWait::Command(Command::Resume) => {
                    self.bus.state(LifecycleState::Running, None);
                    return None;
                }
                CommandWait::Command(Command::Stop) => {
                    self.stop_requested = true;
                    return Some(SessionOutcome::Stopped);
                }
                CommandWait::Command(Command::Skip { frames }) => self.apply_skip(frames),
                CommandWait::Command(Command::ReconfigureDepth(rate)) => {
                    self.reconfigure_depth(rate)
                }
                CommandWait::Command(other) => self.reject(&other, "invalid while paused"),
                CommandWait::TimedOut => {}
                CommandWait::Disconnected => return Some(SessionOutcome::Stopped),
            }
        }
    }

    fn reconfigure_depth(&mut self, rate: DepthRate) {
        // Takes effect on the next frame; the last depth map is retained.
        self.schedule = DepthSchedule::from_rate(rate, self.camera.native_fps());
        self.cfg.settings.depth_schedule = describe_rate(rate);
    }

    fn apply_skip(&mut self, frames: u64) {
        if frames == 0 {
            self.reject(&Command::Skip { frames }, "Skip requires n >= 1");
            return;
        }
        if self.camera.is_live() {
            self.reject(&Command::Skip { frames }, "SkipOnLive");
            return;
        }

        let current = self.camera.current_index();
        let mut target = (current + frames as i64).max(0) as u64;
        if let Some(total) = self.camera.frames_total() {
            if total == 0 {
                self.reject(&Command::Skip { frames }, "source has no frames");
                return;
            }
            if target >= total {
                target = total - 1;
                self.bus.warn(
                    WarningKind::SkipClamped,
                    format!("skip clamped to last frame {target}"),
                );
            }
        }

        match self.camera.seek(target) {
            Ok(()) => {
                // The retained map now belongs to a far-past frame.
                self.last_depth = None;
                self.last_depth_index = -1;
                self.stale_warned = false;
            }
            Err(e) => self.reject(&Command::Skip { frames }, &e.to_string()),
        }
    }

    fn pending_stop(&mut self) -> bool {
        let mut found = false;
        while let Some(cmd) = self.commands.try_next() {
            if matches!(cmd, Command::Stop) {
                found = true;
            }
        }
        found
    }

    fn reject(&mut self, cmd: &Command, reason: &str) {
        self.stats.errors.commands_rejected += 1;
        self.bus.lifecycle(LifecycleEvent::CommandRejected {
            command: cmd.name().to_string(),
            reason: reason.to_string(),
        });
    }

    fn finish(mut self, outcome: SessionOutcome) -> SessionReport {
        // Drain and join the writer first so its counters are final.
        let writer_totals = self.writer.take().map(ArtifactWriter::finish).unwrap_or_default();
        self.stats.errors.writer_io = writer_totals.io_errors;

        // A session that reached Running always flushes stats, including
        // fatal terminations.
        let stats_path = if self.stats.reached_running() {
            let dir = self
                .session_dir
                .clone()
                .unwrap_or_else(|| self.cfg.output_root.clone());
            let path = dir.join("stats.json");
            match write_stats_json(&path, &self.stats, &outcome, writer_totals, &self.cfg.settings)
            {
                Ok(()) => Some(path),
                Err(e) => {
                    self.bus.warn(WarningKind::WriterIo, format!("stats flush: {e}"));
                    None
                }
            }
        } else {
            None
        };

        let report = SessionReport {
            outcome: outcome.clone(),
            stats_path,
            frames_processed: self.stats.frames_processed,
            frames_skipped: self.stats.frames_skipped,
            frames_with_detections: self.stats.frames_with_detections,
            frames_empty: self.stats.frames_empty,
            detections_total: self.stats.detections_total,
            writer: writer_totals,
            dropped_progress_events: self.bus.dropped_progress(),
        };

        match &outcome {
            SessionOutcome::Failed(e) => {
                self.bus.state(LifecycleState::Failed, Some(e.to_string()))
            }
            SessionOutcome::Ended => self
                .bus
                .state(LifecycleState::Stopped, Some("end-of-session".to_string())),
            SessionOutcome::Stopped => self.bus.state(LifecycleState::Stopped, None),
        }

        // Camera and engine are released exactly once when the orchestrator
        // drops here, regardless of the terminal state.
        report
    }
}
