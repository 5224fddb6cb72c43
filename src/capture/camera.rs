//! Camera handles and locator resolution.
//!
//! A camera is addressed by a locator string resolved *once* at construction
//! into an explicit [`CameraLocator`] variant - network address, local device
//! node, or synthetic stub - rather than re-inspected ad hoc.
//!
//! The [`CameraStream`] trait is the handle contract the acquisition thread
//! drives: read a frame, grab-and-discard a frame (rate limiting), apply
//! capture properties, reopen after a failure.
//!
//! The synthetic `stub://` backend is always available so the whole pipeline
//! can run and be tested without hardware; real device/stream backends plug
//! in behind the same trait.

use anyhow::{bail, Result};
use image::RgbImage;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::CaptureProperties;
use crate::Frame;

// -------------------- Locators --------------------

/// Camera address, resolved once from a locator string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CameraLocator {
    /// IP camera reached over the network (address or host:port).
    Network(String),
    /// Local device node, e.g. `/dev/video0`.
    Device(PathBuf),
    /// Synthetic in-process camera (`stub://name`), for tests and dry runs.
    Stub(String),
}

impl CameraLocator {
    pub fn parse(loc: &str) -> Result<Self> {
        static ADDR_RE: OnceLock<Regex> = OnceLock::new();
        let addr_re = ADDR_RE.get_or_init(|| {
            Regex::new(r"^\d{1,3}(\.\d{1,3}){3}(:\d+)?$").expect("address regex")
        });

        let loc = loc.trim();
        if loc.is_empty() {
            bail!("camera locator must not be empty");
        }
        if let Some(name) = loc.strip_prefix("stub://") {
            return Ok(CameraLocator::Stub(name.to_string()));
        }
        if addr_re.is_match(loc) {
            return Ok(CameraLocator::Network(loc.to_string()));
        }
        Ok(CameraLocator::Device(PathBuf::from(loc)))
    }

    /// Short name derived from the locator, used when the operator does not
    /// supply one: device stem for device nodes, the address with dots
    /// flattened for network cameras.
    pub fn default_name(&self) -> String {
        match self {
            CameraLocator::Network(addr) => addr.replace([':', '.'], "-"),
            CameraLocator::Device(path) => path
                .file_name()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "camera".to_string()),
            CameraLocator::Stub(name) => name.clone(),
        }
    }
}

// -------------------- Camera Stream Contract --------------------

/// Handle driven by the acquisition thread.
pub trait CameraStream: Send {
    /// Block until the next frame is available and return it.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Acquire and discard a frame without decoding/publishing it. Used by
    /// the rate limiter to drain hardware without backpressure.
    fn grab(&mut self) -> Result<()> {
        self.read_frame().map(|_| ())
    }

    /// Apply capture properties (resolution, fps, focus).
    fn set_properties(&mut self, properties: &CaptureProperties) -> Result<()>;

    /// Reopen the handle after a read failure, keeping the same properties.
    fn reopen(&mut self) -> Result<()>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

/// Open a camera stream for a resolved locator.
///
/// Only the synthetic backend is compiled into the default build; network
/// and device backends are expected to be provided by feature-gated
/// implementations of [`CameraStream`].
pub fn open_camera(
    locator: &CameraLocator,
    properties: &CaptureProperties,
) -> Result<Box<dyn CameraStream>> {
    match locator {
        CameraLocator::Stub(name) => {
            let mut camera = SyntheticCamera::new(name);
            camera.set_properties(properties)?;
            Ok(Box::new(camera))
        }
        CameraLocator::Network(addr) => {
            bail!("no network capture backend compiled in for {}", addr)
        }
        CameraLocator::Device(path) => {
            bail!(
                "no device capture backend compiled in for {}",
                path.display()
            )
        }
    }
}

// -------------------- Synthetic Camera --------------------

/// Synthetic camera for tests and hardware-free dry runs.
///
/// Produces a slowly changing pixel pattern at the configured frame rate and
/// can be scripted to fail after a fixed number of reads, which is how the
/// capture-thread failure paths are exercised.
pub struct SyntheticCamera {
    name: String,
    properties: CaptureProperties,
    frame_count: u64,
    scene_state: u8,
    fail_after: Option<u64>,
    fail_permanently: bool,
    paced: bool,
}

impl SyntheticCamera {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: CaptureProperties::default(),
            frame_count: 0,
            scene_state: 0,
            fail_after: None,
            fail_permanently: false,
            paced: true,
        }
    }

    /// Fail every read once `n` frames have been produced. `reopen` clears
    /// the failure unless [`Self::fail_permanently`] was also set.
    pub fn fail_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Keep failing even after `reopen`, simulating an unplugged camera.
    pub fn fail_permanently(mut self) -> Self {
        self.fail_permanently = true;
        self
    }

    /// Disable the per-frame sleep so unit tests run at full speed.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn with_properties(mut self, properties: CaptureProperties) -> Self {
        self.properties = properties;
        self
    }

    fn check_failure(&self) -> Result<()> {
        if let Some(n) = self.fail_after {
            if self.frame_count >= n {
                bail!("synthetic read failure on {}", self.name);
            }
        }
        Ok(())
    }

    fn pace(&self) {
        if self.paced && self.properties.fps > 0 {
            std::thread::sleep(Duration::from_secs_f64(1.0 / self.properties.fps as f64));
        }
    }

    /// Generate a frame-varying pixel pattern. The scene "changes" every 50
    /// frames so downstream statistics see occasional motion-like shifts.
    fn generate_pixels(&mut self) -> RgbImage {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let width = self.properties.frame_width.max(1);
        let height = self.properties.frame_height.max(1);
        let count = self.frame_count;
        let state = self.scene_state as u64;
        RgbImage::from_fn(width, height, |x, y| {
            let i = (y as u64 * width as u64 + x as u64) * 3;
            image::Rgb([
                ((i + count + state) % 256) as u8,
                ((i + 1 + count + state) % 256) as u8,
                ((i + 2 + count + state) % 256) as u8,
            ])
        })
    }
}

impl CameraStream for SyntheticCamera {
    fn read_frame(&mut self) -> Result<Frame> {
        self.check_failure()?;
        self.pace();
        let image = self.generate_pixels();
        self.frame_count += 1;
        Ok(Frame::new(image))
    }

    fn grab(&mut self) -> Result<()> {
        self.check_failure()?;
        self.pace();
        self.frame_count += 1;
        Ok(())
    }

    fn set_properties(&mut self, properties: &CaptureProperties) -> Result<()> {
        log::debug!(
            "SyntheticCamera {}: set properties {}x{} @ {} fps",
            self.name,
            properties.frame_width,
            properties.frame_height,
            properties.fps
        );
        self.properties = properties.clone();
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        if self.fail_permanently {
            bail!("synthetic camera {} cannot be reopened", self.name);
        }
        self.fail_after = None;
        log::info!("SyntheticCamera {}: reopened", self.name);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.name)
    }
}

// -------------------- Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_resolves_network_addresses() {
        assert_eq!(
            CameraLocator::parse("192.168.0.4").unwrap(),
            CameraLocator::Network("192.168.0.4".to_string())
        );
        assert_eq!(
            CameraLocator::parse("10.0.0.2:554").unwrap(),
            CameraLocator::Network("10.0.0.2:554".to_string())
        );
    }

    #[test]
    fn locator_resolves_device_paths_and_stubs() {
        assert_eq!(
            CameraLocator::parse("/dev/video0").unwrap(),
            CameraLocator::Device(PathBuf::from("/dev/video0"))
        );
        assert_eq!(
            CameraLocator::parse("stub://bench").unwrap(),
            CameraLocator::Stub("bench".to_string())
        );
        assert!(CameraLocator::parse("  ").is_err());
    }

    #[test]
    fn locator_default_names() {
        assert_eq!(
            CameraLocator::parse("/dev/video2").unwrap().default_name(),
            "video2"
        );
        assert_eq!(
            CameraLocator::parse("stub://bench").unwrap().default_name(),
            "bench"
        );
    }

    #[test]
    fn synthetic_camera_produces_configured_frames() {
        let props = CaptureProperties {
            frame_width: 32,
            frame_height: 24,
            fps: 0,
            ..CaptureProperties::default()
        };
        let mut camera = SyntheticCamera::new("test").unpaced().with_properties(props);
        let frame = camera.read_frame().expect("frame");
        assert_eq!(frame.width(), 32);
        assert_eq!(frame.height(), 24);
    }

    #[test]
    fn synthetic_camera_failure_and_reopen() {
        let mut camera = SyntheticCamera::new("test").unpaced().fail_after(1);
        assert!(camera.read_frame().is_ok());
        assert!(camera.read_frame().is_err());
        assert!(camera.grab().is_err());
        camera.reopen().expect("reopen");
        assert!(camera.read_frame().is_ok());
    }

    #[test]
    fn open_camera_supports_only_stub_by_default() {
        let locator = CameraLocator::parse("stub://bench").unwrap();
        assert!(open_camera(&locator, &CaptureProperties::default()).is_ok());
        let locator = CameraLocator::parse("192.168.0.4").unwrap();
        assert!(open_camera(&locator, &CaptureProperties::default()).is_err());
    }
}
