//! Per-camera configuration snapshots and their on-disk store.
//!
//! A [`CameraConfig`] is an immutable snapshot: reload replaces the whole
//! value, never patches fields, so the orchestration loop can diff old vs.
//! new and rebuild exactly the components a change touches.
//!
//! The store keeps two copies per camera name: a working file on a tmpfs-like
//! directory (shared with whatever edits configs at runtime) and a
//! non-volatile static file. The working file wins when both exist; the
//! static file is promoted into the working directory on first load; when
//! neither exists the supplied default is returned and persisted.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const DEFAULT_DATA_DIR: &str = "/mnt/data";
const DEFAULT_WORKING_CFG_DIR: &str = "/dev/shm/pcam";
const DEFAULT_ANALYSIS_PERIOD_S: f64 = 1.0;

// -------------------- Camera Config Snapshot --------------------

/// Fractional region of interest: `left`/`top` are 0..1 scaled by frame
/// width/height, `size` is 0..1 scaled by `min(width, height)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoiSpec {
    pub left: f32,
    pub top: f32,
    pub size: f32,
}

/// Parameters for the adaptive anomaly detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Warm-up sample count and ring-buffer length.
    pub min_n: usize,
    /// Deviation bound in standard deviations.
    pub n_std: f32,
    /// Floor on the per-class deviation bound.
    pub min_dev: f32,
    /// Static score threshold, checked regardless of warm-up state.
    pub threshold: f32,
    /// Allow-mask spec, e.g. `"+insects,-1103:1589"`. Empty allows all.
    pub allow: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_n: 10,
            n_std: 3.0,
            min_dev: 0.1,
            threshold: 0.9,
            allow: String::new(),
        }
    }
}

/// Parameters for the duty-cycle trigger and recording orchestrator.
/// All times are seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub save_video: bool,
    /// Target fraction of wall-clock time recording is permitted while
    /// continuously triggered. Must be in (0, 1]; 1.0 disables hold-off.
    pub duty_cycle: f64,
    /// Post-roll after the trigger falls.
    pub post_time: f64,
    /// Minimum recording duration once activated.
    pub min_time: f64,
    /// Maximum continuous recording duration while triggered.
    pub max_time: f64,
    /// Save a baseline still every N seconds regardless of detections.
    /// 0 disables periodic stills.
    pub periodic_still: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            save_video: false,
            duty_cycle: 0.1,
            post_time: 2.0,
            min_time: 10.0,
            max_time: 20.0,
            periodic_still: 5.0,
        }
    }
}

/// Capture-hardware properties applied to the camera handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureProperties {
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps: u32,
    pub autofocus: bool,
    /// Manual focus position (1-999, larger = closer focal distance).
    pub focus: u32,
}

impl Default for CaptureProperties {
    fn default() -> Self {
        Self {
            frame_width: 2592,
            frame_height: 1944,
            fps: 30,
            autofocus: false,
            focus: 356,
        }
    }
}

/// Whole per-camera configuration snapshot.
///
/// `rois: None` means one auto-computed centered square ROI.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub rois: Option<Vec<RoiSpec>>,
    pub detector: DetectorConfig,
    pub recording: RecordingConfig,
    pub properties: CaptureProperties,
}

// -------------------- Config Store --------------------

/// Loads and saves per-camera configs by camera name.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    working_dir: PathBuf,
    static_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(working_dir: impl Into<PathBuf>, static_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            static_dir: static_dir.into(),
        }
    }

    fn working_file(&self, name: &str) -> PathBuf {
        self.working_dir.join(format!("{}.json", name))
    }

    fn static_file(&self, name: &str) -> PathBuf {
        self.static_dir.join(format!("{}.json", name))
    }

    /// Modification time of the working file, used by the orchestration loop
    /// to decide whether a reload is needed. `None` when no file exists yet.
    pub fn modified_time(&self, name: &str) -> Option<SystemTime> {
        std::fs::metadata(self.working_file(name))
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// Load the config for `name`, falling back to `default` when no file
    /// exists. A static file with no working copy is promoted into the
    /// working directory so later edits are picked up by the mtime probe.
    pub fn load(&self, name: &str, default: &CameraConfig) -> Result<CameraConfig> {
        let wfn = self.working_file(name);
        let path = if wfn.exists() {
            wfn
        } else {
            let sfn = self.static_file(name);
            if !sfn.exists() {
                log::debug!("no config for {}, using default", name);
                return Ok(default.clone());
            }
            std::fs::create_dir_all(&self.working_dir)
                .with_context(|| format!("create config dir {}", self.working_dir.display()))?;
            std::fs::copy(&sfn, &wfn)
                .with_context(|| format!("copy static config {}", sfn.display()))?;
            sfn
        };
        read_config_file(&path)
    }

    /// Save `config` into the working directory.
    pub fn save(&self, config: &CameraConfig, name: &str) -> Result<()> {
        write_config_file(&self.working_file(name), &self.working_dir, config)
    }

    /// Save `config` into the non-volatile static directory.
    pub fn save_static(&self, config: &CameraConfig, name: &str) -> Result<()> {
        write_config_file(&self.static_file(name), &self.static_dir, config)
    }
}

fn read_config_file(path: &Path) -> Result<CameraConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

fn write_config_file(path: &Path, dir: &Path, config: &CameraConfig) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create config dir {}", dir.display()))?;
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json).with_context(|| format!("write config file {}", path.display()))?;
    Ok(())
}

// -------------------- Daemon Config --------------------

/// Process-level settings for `pcamd`, overridable via `PCAM_*` environment
/// variables.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Root for videos/, stills/, detections/, configs/ and heartbeat files.
    pub data_dir: PathBuf,
    /// Working (volatile) per-camera config directory.
    pub working_cfg_dir: PathBuf,
    /// Non-volatile per-camera config directory.
    pub static_cfg_dir: PathBuf,
    /// Frame analysis period; `next_frame` waits 1.5x this per cycle.
    pub analysis_period: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let static_cfg_dir = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".pcam"))
            .unwrap_or_else(|_| PathBuf::from(".pcam"));
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            working_cfg_dir: PathBuf::from(DEFAULT_WORKING_CFG_DIR),
            static_cfg_dir,
            analysis_period: Duration::from_secs_f64(DEFAULT_ANALYSIS_PERIOD_S),
        }
    }
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("PCAM_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("PCAM_WORKING_CFG_DIR") {
            if !dir.trim().is_empty() {
                self.working_cfg_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("PCAM_STATIC_CFG_DIR") {
            if !dir.trim().is_empty() {
                self.static_cfg_dir = PathBuf::from(dir);
            }
        }
        if let Ok(period) = std::env::var("PCAM_ANALYSIS_PERIOD") {
            let seconds: f64 = period
                .parse()
                .map_err(|_| anyhow!("PCAM_ANALYSIS_PERIOD must be a number of seconds"))?;
            self.analysis_period = Duration::from_secs_f64(seconds.max(0.0));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.analysis_period.is_zero() {
            return Err(anyhow!("analysis period must be greater than zero"));
        }
        Ok(())
    }

    pub fn config_store(&self) -> ConfigStore {
        ConfigStore::new(&self.working_cfg_dir, &self.static_cfg_dir)
    }
}

// -------------------- Tests --------------------
