// skytrack - real-time stereo inference pipeline for target tracking
pub mod camera;
pub mod control;
pub mod depth;
pub mod detector;
pub mod packets;
pub mod pipeline;
pub mod post;
pub mod session;
pub mod writer;

#[cfg(feature = "zed-sdk")]
pub mod zed;

// Re-export key types for convenience
pub use camera::{CameraConfig, Roi, SourceDescriptor, StereoCamera};
pub use control::{Command, CommandSender, DepthRate};
pub use depth::{DepthExtractor, DepthMap};
pub use detector::{Detector, DetectorOptions, NullDetector, OrtDetector};
pub use packets::{
    BBox, CameraError, ClippedRect, DepthStats, Detection, DetectorError, FatalError, FrameResult,
    GrabOutcome, CLASS_IN_RANGE, CLASS_OUT_OF_RANGE,
};
pub use pipeline::{
    DepthSchedule, PipelineBuilder, PipelineConfig, PipelineHandle, SessionReport,
};
pub use session::{RunSettings, SessionOutcome, SessionStats};
pub use writer::{ArtifactWriter, WriterConfig, WriterTotals};
