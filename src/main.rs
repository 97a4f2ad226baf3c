use anyhow::Result;

fn main() -> Result<()> {
    let args = CliArgs::parse(std::env::args().skip(1))?;
    if args.help {
        print_usage();
        return Ok(());
    }

    let mut cfg = match &args.config_path {
        Some(path) => config::AppConfig::from_file(path)?,
        None => config::AppConfig::default(),
    };
    args.apply(&mut cfg);

    run(cfg, args.bench_grab)
}

#[derive(Default)]
struct CliArgs {
    help: bool,
    config_path: Option<String>,
    svo: Option<String>,
    live: bool,
    engine: Option<String>,
    save_images: bool,
    save_labels: bool,
    depth_hz: Option<f32>,
    depth_every: Option<u32>,
    bench_grab: bool,
}

impl CliArgs {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self> {
        let mut out = CliArgs::default();
        let mut args = args;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => out.help = true,
                "--config" => out.config_path = Some(expect_value(&mut args, "--config")?),
                "--svo" => out.svo = Some(expect_value(&mut args, "--svo")?),
                "--live" => out.live = true,
                "--engine" => out.engine = Some(expect_value(&mut args, "--engine")?),
                "--save-images" => out.save_images = true,
                "--save-labels" => out.save_labels = true,
                "--depth-hz" => {
                    out.depth_hz = Some(expect_value(&mut args, "--depth-hz")?.parse()?)
                }
                "--depth-every" => {
                    out.depth_every = Some(expect_value(&mut args, "--depth-every")?.parse()?)
                }
                "--bench-grab" => out.bench_grab = true,
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }
        Ok(out)
    }

    fn apply(&self, cfg: &mut config::AppConfig) {
        if let Some(svo) = &self.svo {
            cfg.camera.svo_path = Some(svo.clone());
        }
        if self.live {
            cfg.camera.svo_path = None;
        }
        if let Some(engine) = &self.engine {
            cfg.detector.engine = engine.clone();
        }
        if self.save_images {
            cfg.writer.save_annotated = true;
        }
        if self.save_labels {
            cfg.writer.save_labels = true;
        }
        if let Some(hz) = self.depth_hz {
            cfg.depth.hz = Some(hz);
            cfg.depth.every_frames = None;
        }
        if let Some(n) = self.depth_every {
            cfg.depth.every_frames = Some(n);
        }
    }
}

fn expect_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .ok_or_else(|| anyhow::anyhow!("{flag} needs a value"))
}

fn print_usage() {
    eprintln!("skytrack - stereo inference pipeline");
    eprintln!();
    eprintln!("usage: skytrack [options]");
    eprintln!("  --config <path>     TOML configuration file");
    eprintln!("  --svo <path>        recorded session file");
    eprintln!("  --live              open a live device instead");
    eprintln!("  --engine <path>     detector engine/model file");
    eprintln!("  --save-images       write annotated JPEGs");
    eprintln!("  --save-labels       write YOLO label files");
    eprintln!("  --depth-hz <hz>     target depth rate");
    eprintln!("  --depth-every <n>   depth every n frames");
    eprintln!("  --bench-grab        grab/depth throughput only, no inference");
}

#[cfg(not(feature = "zed-sdk"))]
fn run(_cfg: config::AppConfig, _bench_grab: bool) -> Result<()> {
    anyhow::bail!("this binary was built without the zed-sdk feature; rebuild with `--features zed-sdk` to open cameras")
}

#[cfg(feature = "zed-sdk")]
fn run(cfg: config::AppConfig, bench_grab: bool) -> Result<()> {
    use skytrack::detector::{DetectorOptions, NullDetector, OrtDetector};
    use skytrack::zed::ZedCamera;
    use skytrack::{CameraConfig, SourceDescriptor};
    use std::path::PathBuf;

    let source = match &cfg.camera.svo_path {
        Some(path) => SourceDescriptor::Recorded {
            path: PathBuf::from(path),
        },
        None => SourceDescriptor::Live {
            device_id: Some(cfg.camera.device_id),
        },
    };
    let camera_cfg = CameraConfig::from(&cfg.camera);

    if bench_grab {
        let factory = {
            let source = source.clone();
            let camera_cfg = camera_cfg.clone();
            move || ZedCamera::open(&source, &camera_cfg)
        };
        run_session(&cfg, source.describe(), factory, || Ok(NullDetector))
    } else {
        let engine = PathBuf::from(&cfg.detector.engine);
        let opts = DetectorOptions {
            confidence_threshold: cfg.detector.confidence_threshold,
            nms_threshold: cfg.detector.nms_threshold,
            input_size: cfg.detector.input_size,
            max_detections: cfg.detector.max_detections,
            ..DetectorOptions::default()
        };
        let factory = {
            let source = source.clone();
            let camera_cfg = camera_cfg.clone();
            move || ZedCamera::open(&source, &camera_cfg)
        };
        run_session(&cfg, source.describe(), factory, move || {
            OrtDetector::load(&engine, opts)
        })
    }
}

#[cfg(feature = "zed-sdk")]
fn run_session<C, D, FC, FD>(
    cfg: &config::AppConfig,
    source: String,
    camera_factory: FC,
    detector_factory: FD,
) -> Result<()>
where
    C: skytrack::StereoCamera + 'static,
    D: skytrack::Detector + 'static,
    FC: FnOnce() -> Result<C, skytrack::CameraError> + Send + 'static,
    FD: FnOnce() -> Result<D, skytrack::DetectorError> + Send + 'static,
{
    use skytrack::pipeline::describe_rate;
    use skytrack::{Command, DepthRate, PipelineBuilder, RunSettings, WriterConfig};
    use telemetry::LifecycleEvent;

    let depth_rate = if let Some(n) = cfg.depth.every_frames {
        DepthRate::EveryN(n)
    } else if let Some(hz) = cfg.depth.hz {
        DepthRate::Hz(hz)
    } else {
        DepthRate::EveryFrame
    };

    let mut handle = PipelineBuilder::new()
        .with_depth_rate(depth_rate)
        .with_depth_bounds(cfg.camera.depth_min_m, cfg.camera.depth_max_m)
        .with_staleness_frames(cfg.depth.staleness_frames)
        .with_warmup_grabs(cfg.camera.warmup_grabs)
        .with_progress_capacity(cfg.telemetry.progress_capacity)
        .with_output_root(&cfg.writer.output_root)
        .with_writer(WriterConfig::from(&cfg.writer))
        .with_settings(RunSettings {
            source,
            depth_preset: cfg.camera.depth_preset.as_str().to_string(),
            depth_schedule: describe_rate(depth_rate),
            confidence_threshold: cfg.detector.confidence_threshold,
        })
        .spawn(camera_factory, detector_factory);

    handle.send(Command::Start);

    // Lifecycle drains on this thread; progress on a sibling.
    let events = handle.take_events();
    let progress_rx = events.progress;
    let lifecycle_rx = events.lifecycle;

    let printer = std::thread::spawn(move || {
        let mut last_printed = 0u64;
        while let Ok(p) = progress_rx.recv() {
            if p.index >= last_printed + 30 || p.index == 0 {
                last_printed = p.index;
                eprintln!(
                    "frame {} | fps {:.1} | objects {} | depth {} | grab {:.0}% infer {:.0}% depth {:.0}%",
                    p.index,
                    p.global_fps,
                    p.detection_count,
                    p.depth_mean_m
                        .map(|d| format!("{d:.2}m"))
                        .unwrap_or_else(|| "--".to_string()),
                    p.stage_shares.grab_pct,
                    p.stage_shares.infer_pct,
                    p.stage_shares.depth_pct,
                );
            }
        }
    });

    for event in lifecycle_rx.iter() {
        match event {
            LifecycleEvent::InitProgress { pct, message } => {
                eprintln!("[init {pct:>3}%] {message}");
            }
            LifecycleEvent::State { state, reason } => {
                match reason {
                    Some(reason) => eprintln!("[state] {} ({reason})", state.as_str()),
                    None => eprintln!("[state] {}", state.as_str()),
                }
                if matches!(
                    state,
                    telemetry::LifecycleState::Stopped | telemetry::LifecycleState::Failed
                ) {
                    break;
                }
            }
            LifecycleEvent::CommandRejected { command, reason } => {
                eprintln!("[reject] {command}: {reason}");
            }
            LifecycleEvent::Warning { kind, detail } => {
                eprintln!("[warn] {kind:?}: {detail}");
            }
        }
    }

    let _ = printer.join();

    let report = handle.join();
    eprintln!(
        "session {}: {} frames ({} with detections, {} empty, {} skipped), {} detections",
        report.outcome.as_str(),
        report.frames_processed,
        report.frames_with_detections,
        report.frames_empty,
        report.frames_skipped,
        report.detections_total,
    );
    if let Some(path) = &report.stats_path {
        eprintln!("stats written to {}", path.display());
    }
    Ok(())
}
