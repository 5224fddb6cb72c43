//! Pollinator Camera Kernel (PCK)
//!
//! This crate implements the core pipeline for an unattended, field-deployed
//! camera monitor: once per captured frame it decides whether a biologically
//! interesting event (e.g. a pollinator visit) is occurring, and if so records
//! bounded-duration video and stills under a storage-conserving duty-cycle cap.
//! It is designed to run indefinitely without an operator and to self-heal
//! from camera or recorder failures.
//!
//! # Architecture
//!
//! Data flows through five stages, each behind its own seam:
//!
//! 1. **FrameSource** (`capture`): acquisition thread publishing a
//!    latest-frame-wins stream from a camera handle.
//! 2. **RunningThreshold** (`detect`): adaptive per-class running-statistics
//!    thresholder over a score vector.
//! 3. **DutyCycleTrigger** (`trigger`): pure state machine converting a
//!    boolean trigger signal plus a clock into activate/deactivate edges
//!    under a duty-cycle budget.
//! 4. **TriggeredRecording** (`record`): binds trigger edges to a `Recorder`
//!    backend, manages filenames, periodic stills and event metadata.
//! 5. **Monitor** (`monitor`): per-cycle glue - pulls frames, reloads config,
//!    evaluates ROIs, drives the trigger, persists events, beats the
//!    liveness heartbeat.
//!
//! Inference is an external collaborator reached through the
//! [`detect::Inference`] trait; this crate only consumes score vectors.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Local};
use image::RgbImage;

pub mod capture;
pub mod config;
pub mod detect;
pub mod events;
pub mod monitor;
pub mod record;
pub mod trigger;

pub use capture::{open_camera, CameraLocator, CameraStream, FrameSource, SyntheticCamera};
pub use config::{
    CameraConfig, CaptureProperties, ConfigStore, DaemonConfig, DetectorConfig, RecordingConfig,
    RoiSpec,
};
pub use detect::{
    scores_from_detections, BBox, ClassRegistry, Decision, Inference, InferenceMetadata,
    InferenceOutput, ModelKind, RunningThreshold, ScoreVector, ScriptedInference,
};
pub use events::{
    EventRecord, EventSink, FileHeartbeat, Heartbeat, JsonEventLog, MemoryEventSink, RoiDetection,
};
pub use monitor::{CameraFactory, Monitor, MonitorOptions, MonitorSetup, RecorderFactory};
pub use record::{MjpegRecorder, Recorder, StubRecorder, TriggeredRecording};
pub use trigger::{DutyCycleTrigger, TriggerPhase, TriggerUpdate};

// -------------------- Frames --------------------

/// A captured image plus its timestamps.
///
/// `captured_at` is monotonic and drives every timing decision in the
/// pipeline; `wall_clock` exists only for filenames and event metadata.
/// Frames are not persisted unless explicitly saved.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: Instant,
    pub wall_clock: DateTime<Local>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
            wall_clock: Local::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .field("wall_clock", &self.wall_clock)
            .finish()
    }
}

// -------------------- Capture Errors --------------------

/// Failure modes of `FrameSource::next_frame`.
///
/// Capture-thread failures surface only through this type, never as
/// cross-thread panics. `Timeout` is transient; `SourceDead` means the
/// acquisition thread has terminated and the whole source must be restarted.
#[derive(Clone, Debug)]
pub enum CaptureError {
    /// No new frame was published before the deadline.
    Timeout,
    /// The acquisition thread has terminated; restart the FrameSource.
    SourceDead(String),
    /// The acquisition thread published a read failure (retry mode).
    Frame(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Timeout => write!(f, "no new frame within timeout"),
            CaptureError::SourceDead(reason) => write!(f, "frame source dead: {}", reason),
            CaptureError::Frame(reason) => write!(f, "frame read failed: {}", reason),
        }
    }
}

impl std::error::Error for CaptureError {}

// -------------------- Host Identity --------------------

/// Host name used to prefix still/event filenames so that files from many
/// field units can be pooled without collisions.
pub fn hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "pcam".to_string())
}
