//! Recording orchestration.
//!
//! [`TriggeredRecording`] translates trigger edges into storage side effects:
//! it opens and closes the video sink through a [`Recorder`] backend, names
//! files from timestamp + camera name + sequence index, writes event stills,
//! and runs the unconditional periodic-still timer that produces a baseline
//! record even absent detections.
//!
//! Backend failures are surfaced to the orchestration loop and abandon the
//! current activation; they are never retried here and never stop the
//! trigger state machine.

mod mjpeg;
mod stub;

#[cfg(feature = "recorder-gstreamer")]
pub mod gst;

pub use mjpeg::MjpegRecorder;
pub use stub::{RecorderCall, StubRecorder};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::RecordingConfig;
use crate::Frame;

// -------------------- Recorder Backend Contract --------------------

/// Video sink backend.
///
/// Two admissible strategies: a simple per-frame muxed writer fed through
/// `new_image`, or a continuously running stream graph into which a file
/// sink is spliced live, preserving a short buffered pre-roll. The
/// orchestrator only sees this contract.
pub trait Recorder: Send {
    /// Open a sink at `path`. The parent directory already exists.
    fn start_saving(&mut self, path: &Path) -> Result<()>;

    /// Close the open sink, flushing buffered media.
    fn stop_saving(&mut self) -> Result<()>;

    /// Offer the latest frame to push-based backends. Called every cycle
    /// regardless of trigger state; pull-based backends ignore it.
    fn new_image(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    /// Backend liveness; a dead backend makes the orchestrator rebuild.
    fn is_alive(&self) -> bool {
        true
    }

    /// Path of the open sink, if any.
    fn current_path(&self) -> Option<&Path>;

    /// Extension for files this backend produces (no leading dot).
    fn file_extension(&self) -> &'static str;

    /// Flush and close any open sink before the backend is dropped.
    fn shutdown(&mut self) -> Result<()> {
        if self.current_path().is_some() {
            self.stop_saving()?;
        }
        Ok(())
    }
}

// -------------------- Triggered Recording --------------------

/// Binds trigger edges to a recorder backend and the still store.
pub struct TriggeredRecording {
    name: String,
    hostname: String,
    video_dir: PathBuf,
    still_dir: PathBuf,
    config: RecordingConfig,
    /// `None` when `save_video` is off; stills and metadata still flow.
    recorder: Option<Box<dyn Recorder>>,
    /// Monotonically increasing per-session video index.
    sequence: i64,
    video_path: Option<PathBuf>,
    last_still: Option<Instant>,
}

impl TriggeredRecording {
    pub fn new(
        name: &str,
        video_dir: impl Into<PathBuf>,
        still_dir: impl Into<PathBuf>,
        config: RecordingConfig,
        recorder: Option<Box<dyn Recorder>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            hostname: crate::hostname(),
            video_dir: video_dir.into(),
            still_dir: still_dir.into(),
            config,
            recorder,
            sequence: -1,
            video_path: None,
            last_still: None,
        }
    }

    /// Open a new video sink for an activation at wall-clock time `at`.
    ///
    /// Returns the new path and sequence index for event metadata, or `None`
    /// when video saving is disabled.
    pub fn activate(&mut self, at: DateTime<Local>) -> Result<Option<(PathBuf, u64)>> {
        let Some(recorder) = self.recorder.as_mut() else {
            return Ok(None);
        };

        // a sink left open from an abandoned activation is closed first
        if recorder.current_path().is_some() {
            log::warn!("{}: sink still open on activate, closing first", self.name);
            recorder.stop_saving()?;
        }

        self.sequence += 1;
        let dir = self.video_dir.join(at.format("%y%m%d").to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create video dir {}", dir.display()))?;
        let path = dir.join(format!(
            "{}_{}.{}",
            at.format("%H%M%S_%6f"),
            self.name,
            recorder.file_extension()
        ));

        log::info!("{}: saving video to {}", self.name, path.display());
        recorder
            .start_saving(&path)
            .with_context(|| format!("start saving {}", path.display()))?;
        self.video_path = Some(path.clone());
        Ok(Some((path, self.sequence as u64)))
    }

    /// Close the video sink, if open.
    pub fn deactivate(&mut self) -> Result<()> {
        let Some(recorder) = self.recorder.as_mut() else {
            return Ok(());
        };
        if recorder.current_path().is_some() {
            log::info!("{}: stop recording", self.name);
            recorder.stop_saving()?;
        }
        self.video_path = None;
        Ok(())
    }

    /// Offer the latest frame. Called every cycle regardless of trigger
    /// state. Independently runs the periodic-still timer; returns the path
    /// of a periodic still when one was saved this cycle.
    pub fn new_image(&mut self, frame: &Frame) -> Result<Option<PathBuf>> {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.new_image(frame)?;
        }

        if self.config.periodic_still <= 0.0 {
            return Ok(None);
        }
        let due = self
            .last_still
            .map(|at| at.elapsed().as_secs_f64() >= self.config.periodic_still)
            .unwrap_or(true);
        if !due {
            return Ok(None);
        }
        let path = self.save_image(frame)?;
        self.last_still = Some(Instant::now());
        Ok(Some(path))
    }

    /// Encode and write a still under the per-day directory; returns the
    /// path for event metadata.
    pub fn save_image(&mut self, frame: &Frame) -> Result<PathBuf> {
        let dir = self
            .still_dir
            .join(frame.wall_clock.format("%y%m%d").to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create still dir {}", dir.display()))?;
        let path = dir.join(format!(
            "{}_{}_{}.jpg",
            self.hostname,
            frame.wall_clock.format("%H%M%S_%6f"),
            self.name
        ));
        log::info!("{}: saving still to {}", self.name, path.display());
        frame
            .image
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .with_context(|| format!("write still {}", path.display()))?;
        Ok(path)
    }

    /// Backend liveness. A missing backend (video saving disabled) counts as
    /// alive so the orchestration loop does not rebuild in a loop.
    pub fn recorder_alive(&self) -> bool {
        self.recorder
            .as_ref()
            .map(|recorder| recorder.is_alive())
            .unwrap_or(true)
    }

    pub fn video_path(&self) -> Option<&Path> {
        self.video_path.as_deref()
    }

    /// Sequence index of the most recent activation, if any.
    pub fn sequence(&self) -> Option<u64> {
        (self.sequence >= 0).then_some(self.sequence as u64)
    }

    /// Flush and close the backend sink. Called before the orchestrator is
    /// rebuilt or the pipeline shuts down.
    pub fn shutdown(&mut self) {
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.shutdown() {
                log::warn!("{}: recorder shutdown failed: {}", self.name, e);
            }
        }
        self.video_path = None;
    }
}

// -------------------- Tests --------------------
