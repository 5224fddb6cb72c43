//! Per-camera orchestration loop.
//!
//! [`Monitor`] owns one camera pipeline end to end: it pulls frames from the
//! [`FrameSource`], reloads the config snapshot when its file changes, runs
//! per-ROI crop/resize/inference/thresholding to obtain the cycle's trigger
//! signal, drives the [`DutyCycleTrigger`] and [`TriggeredRecording`],
//! persists event records, and beats the liveness heartbeat.
//!
//! Self-healing: a dead capture thread is restarted with a fresh camera
//! handle, a dead recorder backend is rebuilt, and transient inference or
//! storage failures skip the cycle instead of crashing. Fatal errors (a
//! camera that cannot be reopened, semantically invalid config) propagate
//! out of [`Monitor::update`] so an external supervisor can restart the
//! whole process.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::capture::{CameraStream, FrameSource};
use crate::config::{CameraConfig, CaptureProperties, ConfigStore};
use crate::detect::{
    scores_from_detections, BBox, ClassRegistry, Inference, InferenceOutput, RunningThreshold,
};
use crate::events::{timestamp_string, EventRecord, EventSink, Heartbeat, RoiDetection};
use crate::record::{Recorder, TriggeredRecording};
use crate::trigger::DutyCycleTrigger;
use crate::{CaptureError, Frame};

/// Builds a camera handle with the given properties; called at start and
/// whenever the capture thread must be restarted.
pub type CameraFactory = Box<dyn FnMut(&CaptureProperties) -> Result<Box<dyn CameraStream>>>;

/// Builds a recorder backend; called whenever the recording orchestrator is
/// (re)built with video saving enabled.
pub type RecorderFactory = Box<dyn FnMut() -> Result<Box<dyn Recorder>>>;

#[derive(Clone, Debug)]
pub struct MonitorOptions {
    /// Reopen the camera on read failures instead of letting the capture
    /// thread die.
    pub retry: bool,
    /// Save an event still on triggered cycles.
    pub capture_stills: bool,
    /// Analysis cadence; `next_frame` waits 1.5x this per cycle.
    pub analysis_period: std::time::Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            retry: false,
            capture_stills: true,
            analysis_period: std::time::Duration::from_secs(1),
        }
    }
}

/// Everything a [`Monitor`] needs at construction.
pub struct MonitorSetup {
    pub name: String,
    pub data_dir: PathBuf,
    pub store: ConfigStore,
    pub camera_factory: CameraFactory,
    pub recorder_factory: RecorderFactory,
    pub inference: Box<dyn Inference>,
    pub events: Box<dyn EventSink>,
    pub heartbeat: Option<Box<dyn Heartbeat>>,
    pub options: MonitorOptions,
}

struct DataDirs {
    videos: PathBuf,
    stills: PathBuf,
    configs: PathBuf,
}

impl DataDirs {
    fn create(data_dir: &Path, name: &str) -> Result<Self> {
        let dirs = Self {
            videos: data_dir.join("videos").join(name),
            stills: data_dir.join("stills").join(name),
            configs: data_dir.join("configs").join(name),
        };
        for dir in [&dirs.videos, &dirs.stills, &dirs.configs] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create data dir {}", dir.display()))?;
        }
        Ok(dirs)
    }
}

/// Pixel rectangle as `(top, bottom, left, right)`, plus its own detector.
struct Roi {
    rect: (u32, u32, u32, u32),
    detector: RunningThreshold,
}

#[derive(Default)]
struct CycleAnalysis {
    triggered: bool,
    detections: Vec<Vec<RoiDetection>>,
    bboxes: Vec<Vec<BBox>>,
    indices: Vec<Vec<usize>>,
    rois: Vec<[u32; 4]>,
}

pub struct Monitor {
    name: String,
    options: MonitorOptions,
    store: ConfigStore,
    config: CameraConfig,
    config_mtime: Option<SystemTime>,
    camera_factory: CameraFactory,
    recorder_factory: RecorderFactory,
    inference: Box<dyn Inference>,
    registry: ClassRegistry,
    n_classes: usize,
    input_width: u32,
    input_height: u32,
    source: FrameSource,
    /// `None` forces a rebuild (with fresh detectors) on the next frame.
    rois: Option<Vec<Roi>>,
    trigger: DutyCycleTrigger,
    recording: TriggeredRecording,
    events: Box<dyn EventSink>,
    heartbeat: Option<Box<dyn Heartbeat>>,
    dirs: DataDirs,
}

impl Monitor {
    pub fn new(mut setup: MonitorSetup) -> Result<Self> {
        let dirs = DataDirs::create(&setup.data_dir, &setup.name)?;

        let config = setup.store.load(&setup.name, &CameraConfig::default())?;
        let config_mtime = setup.store.modified_time(&setup.name);
        if config_mtime.is_none() {
            setup.store.save(&config, &setup.name)?;
        }
        let config_mtime = setup.store.modified_time(&setup.name);

        let metadata = setup.inference.metadata();
        let registry = ClassRegistry::from_labels(&metadata.labels);
        let n_classes = metadata.n_classes();
        if n_classes == 0 {
            bail!("inference endpoint reports zero classes");
        }
        let (input_width, input_height) = (metadata.input_width, metadata.input_height);
        log::info!(
            "{}: inference endpoint with {} classes, {}x{} input",
            setup.name,
            n_classes,
            input_width,
            input_height
        );

        let stream = (setup.camera_factory)(&config.properties)?;
        let source = FrameSource::spawn(stream, setup.options.retry, setup.options.analysis_period)?;

        let trigger = DutyCycleTrigger::new(&config.recording)?;
        let recorder = if config.recording.save_video {
            Some((setup.recorder_factory)()?)
        } else {
            None
        };
        let recording = TriggeredRecording::new(
            &setup.name,
            dirs.videos.clone(),
            dirs.stills.clone(),
            config.recording.clone(),
            recorder,
        );

        let mut monitor = Self {
            name: setup.name,
            options: setup.options,
            store: setup.store,
            config,
            config_mtime,
            camera_factory: setup.camera_factory,
            recorder_factory: setup.recorder_factory,
            inference: setup.inference,
            registry,
            n_classes,
            input_width,
            input_height,
            source,
            rois: None,
            trigger,
            recording,
            events: setup.events,
            heartbeat: setup.heartbeat,
            dirs,
        };
        monitor.log_config_snapshot();
        Ok(monitor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn trigger_active(&self) -> bool {
        self.trigger.is_active()
    }

    /// One orchestration cycle. Transient failures are logged and skipped;
    /// only unrecoverable conditions return an error.
    pub fn update(&mut self) -> Result<()> {
        let timeout = self.options.analysis_period.mul_f64(1.5);
        let frame = match self.source.next_frame(timeout) {
            Ok(frame) => frame,
            Err(CaptureError::Timeout) => {
                if self.source.is_alive() {
                    log::info!("{}: frame grab timed out, waiting", self.name);
                } else {
                    log::info!("{}: capture thread stopped, restarting", self.name);
                    self.restart_source()?;
                }
                return Ok(());
            }
            Err(CaptureError::SourceDead(reason)) => {
                log::warn!("{}: capture thread died ({}), restarting", self.name, reason);
                self.restart_source()?;
                return Ok(());
            }
            Err(CaptureError::Frame(message)) => {
                log::warn!("{}: image error: {}", self.name, message);
                return Ok(());
            }
        };

        self.reload_config()?;

        if !self.recording.recorder_alive() {
            log::info!("{}: recorder backend stopped, rebuilding", self.name);
            self.rebuild_recording()?;
        }

        // recorder push + unconditional periodic stills
        let periodic_still = match self.recording.new_image(&frame) {
            Ok(path) => path,
            Err(e) => {
                log::warn!("{}: recorder write failed: {}", self.name, e);
                None
            }
        };

        if self.rois.is_none() {
            self.rois = Some(self.build_rois(frame.width(), frame.height())?);
        }

        let analysis = match self.analyze(&frame) {
            Ok(analysis) => analysis,
            Err(e) => {
                // the trigger still consumes a not-fired sample so its
                // timing stays honest across skipped cycles
                log::warn!("{}: analysis failed, skipping cycle: {}", self.name, e);
                CycleAnalysis::default()
            }
        };

        let mut still_path = periodic_still;
        if analysis.triggered {
            log::debug!("{}: triggered on {:?}", self.name, analysis.indices);
            if self.options.capture_stills {
                match self.recording.save_image(&frame) {
                    Ok(path) => still_path = Some(path),
                    Err(e) => log::warn!("{}: event still failed: {}", self.name, e),
                }
            }
        }

        let update = self.trigger.evaluate(analysis.triggered, frame.captured_at);
        let mut sequence = self.recording.sequence();
        if update.activated {
            match self.recording.activate(frame.wall_clock) {
                Ok(Some((_, seq))) => sequence = Some(seq),
                Ok(None) => {}
                Err(e) => {
                    // activation abandoned; the state machine continues
                    log::error!("{}: failed to start recording: {}", self.name, e);
                }
            }
        }
        if update.deactivated {
            if let Err(e) = self.recording.deactivate() {
                log::error!("{}: failed to stop recording: {}", self.name, e);
            }
        }

        if analysis.triggered || update.activated || update.deactivated {
            let record = EventRecord {
                timestamp: timestamp_string(frame.wall_clock),
                camera_name: self.name.clone(),
                state: update.phase.as_str().to_string(),
                active: self.trigger.is_active(),
                detection: analysis.triggered,
                detections: analysis.detections,
                bboxes: analysis.bboxes,
                indices: analysis.indices,
                rois: analysis.rois,
                still_path,
                video_path: self.recording.video_path().map(Path::to_path_buf),
                sequence,
                config: self.config.clone(),
            };
            if let Err(e) = self.events.append(&record) {
                log::warn!("{}: event record failed: {}", self.name, e);
            }
        }

        if let Some(heartbeat) = self.heartbeat.as_mut() {
            if let Err(e) = heartbeat.beat() {
                log::warn!("{}: heartbeat failed: {}", self.name, e);
            }
        }
        Ok(())
    }

    /// Run until `stop` is raised, then shut down cleanly.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.update()?;
        }
        self.shutdown();
        Ok(())
    }

    /// Close the recorder sink and join the capture thread.
    pub fn shutdown(&mut self) {
        self.recording.shutdown();
        self.source.stop();
    }

    // ------------------------------------------------------------------
    // config reload
    // ------------------------------------------------------------------

    /// Reload the config snapshot when the store's file changed, then
    /// rebuild exactly the components the diff touches. Unreadable files are
    /// logged and the previous snapshot kept; semantically invalid values
    /// (e.g. a zero duty cycle) are fatal, as at construction.
    fn reload_config(&mut self) -> Result<()> {
        let mtime = self.store.modified_time(&self.name);
        if mtime == self.config_mtime {
            return Ok(());
        }
        log::info!("{}: reloading config", self.name);
        let old = self.config.clone();
        let new = match self.store.load(&self.name, &old) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("{}: config load failed, keeping previous: {}", self.name, e);
                return Ok(());
            }
        };
        self.config = new;
        self.config_mtime = mtime;
        if self.config == old {
            return Ok(());
        }

        if self.config.rois != old.rois || self.config.detector != old.detector {
            // rebuilt from the next frame, with fresh running statistics
            self.rois = None;
        }
        if self.config.recording != old.recording {
            self.rebuild_recording()?;
        }
        if self.config.properties != old.properties {
            self.source.set_properties(self.config.properties.clone());
            // frame geometry may change; recompute pixel rectangles
            self.rois = None;
        }
        self.log_config_snapshot();
        Ok(())
    }

    /// Archive the active snapshot so every deployed configuration remains
    /// reconstructable from the data directory.
    fn log_config_snapshot(&self) {
        let path = self
            .dirs
            .configs
            .join(format!("{}.json", timestamp_string(chrono::Local::now())));
        match serde_json::to_string_pretty(&self.config) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    log::warn!("{}: config snapshot write failed: {}", self.name, e);
                }
            }
            Err(e) => log::warn!("{}: config snapshot encode failed: {}", self.name, e),
        }
    }

    // ------------------------------------------------------------------
    // component rebuilds
    // ------------------------------------------------------------------

    fn restart_source(&mut self) -> Result<()> {
        self.source.stop();
        let stream = (self.camera_factory)(&self.config.properties)?;
        self.source =
            FrameSource::spawn(stream, self.options.retry, self.options.analysis_period)?;
        Ok(())
    }

    fn rebuild_recording(&mut self) -> Result<()> {
        log::debug!("{}: rebuilding trigger and recording", self.name);
        self.trigger = DutyCycleTrigger::new(&self.config.recording)?;
        self.recording.shutdown();
        let recorder = if self.config.recording.save_video {
            Some((self.recorder_factory)()?)
        } else {
            None
        };
        self.recording = TriggeredRecording::new(
            &self.name,
            self.dirs.videos.clone(),
            self.dirs.stills.clone(),
            self.config.recording.clone(),
            recorder,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // analysis
    // ------------------------------------------------------------------

    /// Compute ROI pixel rectangles for the current frame geometry and give
    /// each its own detector instance.
    fn build_rois(&self, width: u32, height: u32) -> Result<Vec<Roi>> {
        let mut rects = Vec::new();
        match &self.config.rois {
            None => {
                // one centered square covering the short dimension
                let dim = width.min(height);
                let left = (width - dim) / 2;
                let top = (height - dim) / 2;
                rects.push((top, top + dim, left, left + dim));
            }
            Some(specs) => {
                for spec in specs {
                    let dim = (width.min(height) as f32 * spec.size) as u32;
                    let left = (spec.left * width as f32) as u32;
                    let top = (spec.top * height as f32) as u32;
                    let right = left + dim;
                    let bottom = top + dim;
                    if dim == 0 || right > width || bottom > height {
                        return Err(anyhow!(
                            "roi {:?} out of bounds for {}x{} frame",
                            spec,
                            width,
                            height
                        ));
                    }
                    rects.push((top, bottom, left, right));
                }
            }
        }

        log::debug!("{}: built {} roi(s) for {}x{}", self.name, rects.len(), width, height);
        rects
            .into_iter()
            .map(|rect| {
                Ok(Roi {
                    rect,
                    detector: RunningThreshold::new(
                        self.n_classes,
                        &self.config.detector,
                        &self.registry,
                    )?,
                })
            })
            .collect()
    }

    /// Per-ROI crop/resize/inference/threshold pass producing the cycle's
    /// trigger signal and event metadata.
    fn analyze(&mut self, frame: &Frame) -> Result<CycleAnalysis> {
        let rois = self
            .rois
            .as_mut()
            .ok_or_else(|| anyhow!("rois not built"))?;

        let mut analysis = CycleAnalysis::default();
        for roi in rois.iter_mut() {
            let (top, bottom, left, right) = roi.rect;
            let patch =
                image::imageops::crop_imm(&frame.image, left, top, right - left, bottom - top)
                    .to_image();
            let resized = image::imageops::resize(
                &patch,
                self.input_width,
                self.input_height,
                image::imageops::FilterType::Triangle,
            );

            let (scores, bboxes) = match self.inference.run(&resized)? {
                InferenceOutput::Scores(scores) => (scores, Vec::new()),
                InferenceOutput::Detections(detections) => {
                    let scores = scores_from_detections(&detections, self.n_classes);
                    (scores, detections)
                }
            };
            if scores.len() != self.n_classes {
                bail!(
                    "score vector length {} does not match {} classes",
                    scores.len(),
                    self.n_classes
                );
            }

            let decision = roi.detector.check(&scores);
            if decision.fired {
                analysis.triggered = true;
            }

            let mut by_score = decision.indices.clone();
            by_score.sort_by(|a, b| {
                scores[*b]
                    .partial_cmp(&scores[*a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            analysis.detections.push(
                by_score
                    .iter()
                    .map(|&index| RoiDetection {
                        label: self
                            .registry
                            .label(index)
                            .unwrap_or("unknown")
                            .to_string(),
                        score: scores[index],
                    })
                    .collect(),
            );
            analysis.bboxes.push(
                bboxes
                    .into_iter()
                    .filter(|bbox| decision.indices.contains(&bbox.class))
                    .collect(),
            );
            analysis.indices.push(decision.indices);
            analysis.rois.push([top, bottom, left, right]);
        }
        Ok(analysis)
    }
}

// -------------------- Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCamera;
    use crate::config::{DetectorConfig, RecordingConfig, RoiSpec};
    use crate::detect::ScriptedInference;
    use crate::events::MemoryEventSink;
    use std::time::Duration;

    fn small_properties() -> CaptureProperties {
        CaptureProperties {
            frame_width: 64,
            frame_height: 48,
            fps: 100,
            ..CaptureProperties::default()
        }
    }

    fn setup_with_config(dir: &Path, config: &CameraConfig) -> MonitorSetup {
        let store = ConfigStore::new(dir.join("working"), dir.join("static"));
        store.save(config, "cam0").expect("save config");
        MonitorSetup {
            name: "cam0".to_string(),
            data_dir: dir.join("data"),
            store,
            camera_factory: Box::new(|props| {
                Ok(Box::new(
                    SyntheticCamera::new("cam0").with_properties(props.clone()),
                ))
            }),
            recorder_factory: Box::new(|| {
                let (stub, _) = crate::record::StubRecorder::new();
                Ok(Box::new(stub))
            }),
            inference: Box::new(
                ScriptedInference::new(4, 0.1).with_input_size(32, 32),
            ),
            events: Box::new(MemoryEventSink::new()),
            heartbeat: None,
            options: MonitorOptions {
                retry: false,
                capture_stills: true,
                analysis_period: Duration::from_millis(20),
            },
        }
    }

    fn test_config() -> CameraConfig {
        CameraConfig {
            properties: small_properties(),
            detector: DetectorConfig {
                min_n: 3,
                threshold: 0.5,
                ..DetectorConfig::default()
            },
            recording: RecordingConfig {
                periodic_still: 0.0,
                ..RecordingConfig::default()
            },
            ..CameraConfig::default()
        }
    }

    #[test]
    fn default_roi_is_a_centered_square() {
        let dir = tempfile::tempdir().expect("tempdir");
        let monitor = Monitor::new(setup_with_config(dir.path(), &test_config())).expect("monitor");
        let rois = monitor.build_rois(64, 48).expect("rois");
        assert_eq!(rois.len(), 1);
        assert_eq!(rois[0].rect, (0, 48, 8, 56));
    }

    #[test]
    fn fractional_rois_map_to_pixels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config();
        config.rois = Some(vec![RoiSpec {
            left: 0.25,
            top: 0.0,
            size: 0.5,
        }]);
        let monitor = Monitor::new(setup_with_config(dir.path(), &config)).expect("monitor");
        let rois = monitor.build_rois(64, 48).expect("rois");
        assert_eq!(rois[0].rect, (0, 24, 16, 40));
    }

    #[test]
    fn out_of_bounds_roi_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config();
        config.rois = Some(vec![RoiSpec {
            left: 0.9,
            top: 0.9,
            size: 0.5,
        }]);
        let monitor = Monitor::new(setup_with_config(dir.path(), &config)).expect("monitor");
        assert!(monitor.build_rois(64, 48).is_err());
    }

    #[test]
    fn update_runs_quiet_cycles_without_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = MemoryEventSink::new();
        let records = sink.records();
        let mut setup = setup_with_config(dir.path(), &test_config());
        setup.events = Box::new(sink);
        let mut monitor = Monitor::new(setup).expect("monitor");

        for _ in 0..5 {
            monitor.update().expect("update");
        }
        assert!(records.lock().unwrap().is_empty());
        assert!(!monitor.trigger_active());
        monitor.shutdown();
    }
}
