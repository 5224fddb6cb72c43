//! Per-frame muxed writer (strategy a).
//!
//! Encodes each pushed frame as JPEG and appends it to the open sink. The
//! resulting `.mjpeg` file is a plain concatenated-JPEG stream, which common
//! players and transcoders accept directly. No pre-roll: footage starts at
//! the activation instant.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::Recorder;
use crate::Frame;

const JPEG_QUALITY: u8 = 85;

pub struct MjpegRecorder {
    sink: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    frames_written: u64,
}

impl MjpegRecorder {
    pub fn new() -> Self {
        Self {
            sink: None,
            path: None,
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Default for MjpegRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder for MjpegRecorder {
    fn start_saving(&mut self, path: &Path) -> Result<()> {
        if self.sink.is_some() {
            return Err(anyhow!(
                "mjpeg sink already open at {:?}, stop_saving first",
                self.path
            ));
        }
        let file =
            File::create(path).with_context(|| format!("open video sink {}", path.display()))?;
        self.sink = Some(BufWriter::new(file));
        self.path = Some(path.to_path_buf());
        self.frames_written = 0;
        Ok(())
    }

    fn stop_saving(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush().context("flush video sink")?;
        }
        log::debug!(
            "mjpeg sink closed after {} frames: {:?}",
            self.frames_written,
            self.path
        );
        self.path = None;
        Ok(())
    }

    fn new_image(&mut self, frame: &Frame) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let mut encoder = JpegEncoder::new_with_quality(sink, JPEG_QUALITY);
        encoder
            .encode_image(&frame.image)
            .context("encode frame into video sink")?;
        self.frames_written += 1;
        Ok(())
    }

    fn current_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn file_extension(&self) -> &'static str {
        "mjpeg"
    }
}
