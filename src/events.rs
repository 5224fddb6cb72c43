//! Event metadata and liveness heartbeats.
//!
//! The core populates one [`EventRecord`] per cycle in which a detection or
//! a trigger transition occurred; persistence belongs to an external logger
//! behind the [`EventSink`] trait. The default sink writes one JSON file per
//! event into a per-day directory, so field units can be harvested by
//! syncing a directory tree.
//!
//! A [`Heartbeat`] is beaten at the end of every successful cycle; it goes
//! quiet on fatal failure, which is what an external watchdog keys on to
//! restart the process.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::CameraConfig;
use crate::detect::BBox;

// -------------------- Event Records --------------------

/// One label/score pair reported for an ROI, sorted by descending score.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoiDetection {
    pub label: String,
    pub score: f32,
}

/// Structured record persisted when a detection or trigger transition
/// occurred.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    /// `yymmdd_HHMMSS_micros` wall-clock stamp of the analyzed frame.
    pub timestamp: String,
    pub camera_name: String,
    /// Trigger input phase this cycle (`rising_edge`, `high`, ...).
    pub state: String,
    /// Whether recording was active after this cycle.
    pub active: bool,
    /// Whether the per-cycle detection trigger was set.
    pub detection: bool,
    /// Per-ROI label/score pairs for firing classes, best first.
    pub detections: Vec<Vec<RoiDetection>>,
    /// Per-ROI bounding boxes for firing classes (detector endpoints only).
    pub bboxes: Vec<Vec<BBox>>,
    /// Per-ROI firing class indices.
    pub indices: Vec<Vec<usize>>,
    /// Per-ROI pixel rectangles as `[top, bottom, left, right]`.
    pub rois: Vec<[u32; 4]>,
    pub still_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
    /// Video sequence index of the most recent activation.
    pub sequence: Option<u64>,
    /// Config snapshot in effect for this cycle.
    pub config: CameraConfig,
}

/// Wall-clock stamp format shared by event records and filenames.
pub fn timestamp_string(at: DateTime<Local>) -> String {
    at.format("%y%m%d_%H%M%S_%6f").to_string()
}

/// External event logger boundary.
pub trait EventSink {
    fn append(&mut self, record: &EventRecord) -> Result<()>;
}

/// Writes one JSON file per event under `<dir>/<yymmdd>/`.
pub struct JsonEventLog {
    dir: PathBuf,
    hostname: String,
}

impl JsonEventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            hostname: crate::hostname(),
        }
    }
}

impl EventSink for JsonEventLog {
    fn append(&mut self, record: &EventRecord) -> Result<()> {
        let day = record.timestamp.get(..6).unwrap_or(&record.timestamp);
        let dir = self.dir.join(day);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create event dir {}", dir.display()))?;
        let path = dir.join(format!(
            "{}-{}-{}.json",
            self.hostname, record.timestamp, record.camera_name
        ));
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json)
            .with_context(|| format!("write event record {}", path.display()))?;
        log::debug!("event record written to {}", path.display());
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Clone, Default)]
pub struct MemoryEventSink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Arc<Mutex<Vec<EventRecord>>> {
        self.records.clone()
    }
}

impl EventSink for MemoryEventSink {
    fn append(&mut self, record: &EventRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// -------------------- Heartbeats --------------------

/// Liveness signal beaten once per successful cycle.
pub trait Heartbeat {
    fn beat(&mut self) -> Result<()>;
}

/// Writes the current epoch seconds to a file, rate-limited to `interval`.
/// An external watchdog restarts the process when the file goes stale.
pub struct FileHeartbeat {
    path: PathBuf,
    interval: Duration,
    last: Option<Instant>,
}

impl FileHeartbeat {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last: None,
        }
    }
}

impl Heartbeat for FileHeartbeat {
    fn beat(&mut self) -> Result<()> {
        if let Some(last) = self.last {
            if last.elapsed() < self.interval {
                return Ok(());
            }
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create heartbeat dir {}", parent.display()))?;
        }
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        std::fs::write(&self.path, format!("{}\n", epoch))
            .with_context(|| format!("write heartbeat {}", self.path.display()))?;
        self.last = Some(Instant::now());
        log::debug!("heartbeat written to {}", self.path.display());
        Ok(())
    }
}

// -------------------- Tests --------------------
