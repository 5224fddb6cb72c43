//! Stub recorder for tests: records the backend call sequence.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::Recorder;
use crate::Frame;

#[derive(Clone, Debug)]
pub enum RecorderCall {
    Start(PathBuf),
    Stop,
    Image,
}

pub type CallLog = Arc<Mutex<Vec<RecorderCall>>>;

/// In-memory recorder backend. Tests inspect the shared call log and can
/// flip `alive` or arm `fail_next_start` to exercise failure paths.
pub struct StubRecorder {
    calls: CallLog,
    current: Option<PathBuf>,
    alive: Arc<AtomicBool>,
    fail_next_start: bool,
}

impl StubRecorder {
    pub fn new() -> (Self, CallLog) {
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        let stub = Self {
            calls: calls.clone(),
            current: None,
            alive: Arc::new(AtomicBool::new(true)),
            fail_next_start: false,
        };
        (stub, calls)
    }

    /// Handle for flipping liveness from outside the backend.
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    pub fn fail_next_start(mut self) -> Self {
        self.fail_next_start = true;
        self
    }
}

impl Recorder for StubRecorder {
    fn start_saving(&mut self, path: &Path) -> Result<()> {
        if self.fail_next_start {
            self.fail_next_start = false;
            return Err(anyhow!("stub recorder refused to open sink"));
        }
        self.calls
            .lock()
            .unwrap()
            .push(RecorderCall::Start(path.to_path_buf()));
        self.current = Some(path.to_path_buf());
        Ok(())
    }

    fn stop_saving(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push(RecorderCall::Stop);
        self.current = None;
        Ok(())
    }

    fn new_image(&mut self, _frame: &Frame) -> Result<()> {
        if self.current.is_some() {
            self.calls.lock().unwrap().push(RecorderCall::Image);
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn current_path(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    fn file_extension(&self) -> &'static str {
        "stub"
    }
}
