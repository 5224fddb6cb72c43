//! Frame acquisition.
//!
//! [`FrameSource`] runs one producer thread per camera and exposes only the
//! most recent frame, decoupling the acquisition rate from the analysis rate.
//!
//! The cross-thread surface is a single-slot buffer guarded by a condition
//! variable: publishing overwrites the slot and bumps a sequence counter, so
//! a frame that is not consumed before the next arrives is simply discarded
//! (latest-wins, no queueing, no backpressure on the hardware).
//!
//! Frames are drawn from the camera at its native rate but published at most
//! once per configured interval; between publishes the thread grabs and
//! discards frames to bound memory and CPU.

mod camera;

pub use camera::{open_camera, CameraLocator, CameraStream, SyntheticCamera};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::CaptureProperties;
use crate::{CaptureError, Frame};

struct Slot {
    seq: u64,
    frame: Option<Frame>,
    error: Option<String>,
    /// Set exactly once, when the producer thread exits.
    dead: Option<String>,
}

struct Shared {
    slot: Mutex<Slot>,
    cond: Condvar,
    stop: AtomicBool,
    /// Pending property update, applied by the producer between reads.
    properties: Mutex<Option<CaptureProperties>>,
}

impl Shared {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        // A poisoned slot only means the producer panicked mid-publish; the
        // slot contents are still plain data, so recover the guard.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_frame(&self, frame: Frame) {
        let mut slot = self.lock_slot();
        slot.seq += 1;
        slot.frame = Some(frame);
        slot.error = None;
        self.cond.notify_all();
    }

    fn publish_error(&self, message: String) {
        let mut slot = self.lock_slot();
        slot.seq += 1;
        slot.frame = None;
        slot.error = Some(message);
        self.cond.notify_all();
    }

    fn mark_dead(&self, reason: String) {
        let mut slot = self.lock_slot();
        if slot.dead.is_none() {
            slot.dead = Some(reason);
        }
        self.cond.notify_all();
    }
}

/// Latest-frame-wins acquisition thread around a [`CameraStream`].
pub struct FrameSource {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    last_seq: u64,
    description: String,
}

impl FrameSource {
    /// Start the producer thread. `publish_interval` bounds how often frames
    /// are published to the consumer; excess hardware frames are grabbed and
    /// discarded.
    pub fn spawn(
        stream: Box<dyn CameraStream>,
        retry: bool,
        publish_interval: Duration,
    ) -> anyhow::Result<Self> {
        let description = stream.describe();
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                seq: 0,
                frame: None,
                error: None,
                dead: None,
            }),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            properties: Mutex::new(None),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("pcam-capture {}", description))
            .spawn(move || producer_loop(stream, retry, publish_interval, thread_shared))?;

        log::info!("started capture thread for {}", description);
        Ok(Self {
            shared,
            handle: Some(handle),
            last_seq: 0,
            description,
        })
    }

    /// Block until a new frame is published or `timeout` elapses.
    ///
    /// Once the producer thread has terminated this returns
    /// [`CaptureError::SourceDead`] immediately instead of blocking; the
    /// caller must restart the whole source.
    pub fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let last_seq = self.last_seq;
        let guard = self.shared.lock_slot();
        let (slot, _timed_out) = self
            .shared
            .cond
            .wait_timeout_while(guard, timeout, |slot| {
                slot.seq == last_seq && slot.dead.is_none()
            })
            .unwrap_or_else(|e| e.into_inner());

        if slot.seq != self.last_seq {
            self.last_seq = slot.seq;
            if let Some(message) = &slot.error {
                return Err(CaptureError::Frame(message.clone()));
            }
            if let Some(frame) = &slot.frame {
                return Ok(frame.clone());
            }
        }
        if let Some(reason) = &slot.dead {
            return Err(CaptureError::SourceDead(reason.clone()));
        }
        Err(CaptureError::Timeout)
    }

    /// Queue a property update; the producer applies it between reads.
    pub fn set_properties(&self, properties: CaptureProperties) {
        *self
            .shared
            .properties
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(properties);
    }

    pub fn is_alive(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    /// Cooperative shutdown: raise the stop flag and join the thread. The
    /// producer checks the flag between reads, so the join is bounded by one
    /// camera read.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("capture thread for {} panicked", self.description);
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn producer_loop(
    mut stream: Box<dyn CameraStream>,
    retry: bool,
    publish_interval: Duration,
    shared: Arc<Shared>,
) {
    let mut last_publish: Option<Instant> = None;
    let mut exit_reason = "stopped".to_string();

    while !shared.stop.load(Ordering::Relaxed) {
        if let Some(properties) = shared
            .properties
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            if let Err(e) = stream.set_properties(&properties) {
                log::warn!("failed to apply properties on {}: {}", stream.describe(), e);
            }
        }

        let due = last_publish
            .map(|at| at.elapsed() >= publish_interval)
            .unwrap_or(true);

        let result = if due {
            stream.read_frame().map(Some)
        } else {
            // rate limited: drain the hardware without publishing
            stream.grab().map(|_| None)
        };

        match result {
            Ok(Some(frame)) => {
                last_publish = Some(Instant::now());
                shared.publish_frame(frame);
            }
            Ok(None) => {}
            Err(e) => {
                let message = format!("{:#}", e);
                if !retry {
                    log::error!("capture failed on {}: {}", stream.describe(), message);
                    shared.publish_error(message.clone());
                    exit_reason = message;
                    break;
                }
                log::info!("restarting capture on {}: {}", stream.describe(), message);
                shared.publish_error(message);
                if let Err(e) = stream.reopen() {
                    let message = format!("reopen failed: {:#}", e);
                    log::error!("{} on {}", message, stream.describe());
                    exit_reason = message;
                    break;
                }
            }
        }
    }

    shared.mark_dead(exit_reason);
}

// -------------------- Tests --------------------
