//! GStreamer splice recorder (strategy b).
//!
//! A continuously running source graph keeps several seconds of encoded
//! media queued upstream of a swappable sink:
//!
//! ```text
//! rtspsrc ! capsfilter ! queue (leaky, ~7s) ! fakesink
//! ```
//!
//! `start_saving` splices a `depay ! parse ! mp4mux ! filesink` chain in
//! place of the fakesink on an idle pad probe; the queued media drains into
//! the new sink first, so footage begins a few seconds *before* the
//! activation instant (pre-roll). `stop_saving` sends EOS down the recording
//! chain and splices the fakesink back.
//!
//! Live pad surgery runs on streaming threads; all element handles are kept
//! behind a shared state mutex and only touched from idle probes.

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Recorder;

/// Seconds of media held in the pre-roll queue.
const PREROLL_SECS: u64 = 5;
/// Queue cap; media older than this is leaked downstream-first.
const QUEUE_MAX_SECS: u64 = 7;

/// Video encoding carried by the source; selects depay/parse elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEncoding {
    H264,
    H265,
}

impl StreamEncoding {
    fn depay(&self) -> &'static str {
        match self {
            StreamEncoding::H264 => "rtph264depay",
            StreamEncoding::H265 => "rtph265depay",
        }
    }

    fn parse(&self) -> &'static str {
        match self {
            StreamEncoding::H264 => "h264parse",
            StreamEncoding::H265 => "h265parse",
        }
    }
}

#[derive(Clone, Debug)]
pub struct GstRecorderConfig {
    /// Stream URL (`rtsp://...`) or device node for `v4l2src`.
    pub url: String,
    pub encoding: StreamEncoding,
}

struct SpliceState {
    /// Elements of the live recording chain, in link order.
    chain: Vec<gst::Element>,
    fakesink: Option<gst::Element>,
    last_error: Option<String>,
}

pub struct GstRecorder {
    config: GstRecorderConfig,
    pipeline: gst::Pipeline,
    queue: gst::Element,
    state: Arc<Mutex<SpliceState>>,
    current: Option<PathBuf>,
}

impl GstRecorder {
    pub fn new(config: GstRecorderConfig) -> Result<Self> {
        gst::init().context("initialize gstreamer")?;

        let description = if config.url.starts_with("rtsp") {
            format!(
                "rtspsrc name=src0 location=\"{}\" ! \
                 capsfilter name=caps0 caps=application/x-rtp,media=video ! \
                 queue name=queue0 max-size-bytes=0 max-size-buffers=0 leaky=downstream \
                 silent=true max-size-time={} min-threshold-time={} ! \
                 fakesink name=fakesink0 sync=false",
                config.url,
                QUEUE_MAX_SECS * 1_000_000_000,
                PREROLL_SECS * 1_000_000_000,
            )
        } else {
            format!(
                "v4l2src device=\"{}\" ! jpegdec ! \
                 queue name=queue0 max-size-bytes=0 max-size-buffers=0 leaky=downstream \
                 silent=true max-size-time={} min-threshold-time={} ! \
                 fakesink name=fakesink0 sync=false",
                config.url,
                QUEUE_MAX_SECS * 1_000_000_000,
                PREROLL_SECS * 1_000_000_000,
            )
        };

        let pipeline = gst::parse_launch(&description)
            .context("build recorder pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("recorder pipeline is not a Pipeline"))?;

        let queue = pipeline
            .by_name("queue0")
            .context("queue element missing from pipeline")?;
        let fakesink = pipeline
            .by_name("fakesink0")
            .context("fakesink element missing from pipeline")?;

        let state = Arc::new(Mutex::new(SpliceState {
            chain: Vec::new(),
            fakesink: Some(fakesink),
            last_error: None,
        }));

        Ok(Self {
            config,
            pipeline,
            queue,
            state,
            current: None,
        })
    }

    /// Start the source graph; the pre-roll queue begins filling.
    pub fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("set recorder pipeline to Playing")?;
        log::info!("GstRecorder: streaming from {}", self.config.url);
        Ok(())
    }

    fn poll_bus(&self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(0)) {
            use gst::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }

    fn build_chain(
        pipeline: &gst::Pipeline,
        encoding: StreamEncoding,
        path: &Path,
    ) -> Result<Vec<gst::Element>> {
        let depay = gst::ElementFactory::make(encoding.depay())
            .name("depay0")
            .build()
            .context("make depay element")?;
        let parse = gst::ElementFactory::make(encoding.parse())
            .name("parse0")
            .build()
            .context("make parse element")?;
        let mux = gst::ElementFactory::make("mp4mux")
            .name("mux0")
            .build()
            .context("make mp4mux element")?;
        let filesink = gst::ElementFactory::make("filesink")
            .name("filesink0")
            .property("location", path.to_string_lossy().as_ref())
            .property("async", false)
            .property("sync", false)
            .build()
            .context("make filesink element")?;

        let chain = vec![depay, parse, mux, filesink];
        for element in &chain {
            pipeline.add(element).context("add recording element")?;
        }
        for pair in chain.windows(2) {
            pair[0].link(&pair[1]).context("link recording chain")?;
        }
        Ok(chain)
    }
}

impl Recorder for GstRecorder {
    fn start_saving(&mut self, path: &Path) -> Result<()> {
        self.poll_bus();
        let src_pad = self
            .queue
            .static_pad("src")
            .context("queue has no src pad")?;

        let pipeline = self.pipeline.clone();
        let state = self.state.clone();
        let encoding = self.config.encoding;
        let target = path.to_path_buf();

        src_pad.add_probe(gst::PadProbeType::IDLE, move |pad, _info| {
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(peer) = pad.peer() {
                let _ = pad.unlink(&peer);
            }
            if let Some(fakesink) = guard.fakesink.take() {
                let _ = pipeline.remove(&fakesink);
                let _ = fakesink.set_state(gst::State::Null);
            }
            match Self::build_chain(&pipeline, encoding, &target) {
                Ok(chain) => {
                    if let Some(sink_pad) = chain[0].static_pad("sink") {
                        if let Err(e) = pad.link(&sink_pad) {
                            guard.last_error = Some(format!("link recording chain: {}", e));
                        }
                    }
                    for element in &chain {
                        let _ = element.sync_state_with_parent();
                    }
                    guard.chain = chain;
                }
                Err(e) => {
                    guard.last_error = Some(format!("build recording chain: {}", e));
                }
            }
            gst::PadProbeReturn::Remove
        });

        self.current = Some(path.to_path_buf());
        Ok(())
    }

    fn stop_saving(&mut self) -> Result<()> {
        let src_pad = self
            .queue
            .static_pad("src")
            .context("queue has no src pad")?;

        let pipeline = self.pipeline.clone();
        let state = self.state.clone();

        src_pad.add_probe(gst::PadProbeType::IDLE, move |pad, _info| {
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(peer) = pad.peer() {
                let _ = pad.unlink(&peer);
                // EOS makes the muxer finalize the file before teardown
                let _ = peer.send_event(gst::event::Eos::new());
            }
            for element in guard.chain.drain(..) {
                let _ = element.set_state(gst::State::Null);
                let _ = pipeline.remove(&element);
            }
            match gst::ElementFactory::make("fakesink")
                .name("fakesink0")
                .property("sync", false)
                .build()
            {
                Ok(fakesink) => {
                    let _ = pipeline.add(&fakesink);
                    if let Some(sink_pad) = fakesink.static_pad("sink") {
                        let _ = pad.link(&sink_pad);
                    }
                    let _ = fakesink.sync_state_with_parent();
                    guard.fakesink = Some(fakesink);
                }
                Err(e) => {
                    guard.last_error = Some(format!("restore fakesink: {}", e));
                }
            }
            gst::PadProbeReturn::Remove
        });

        self.current = None;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.poll_bus();
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_error
            .is_none()
    }

    fn current_path(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    fn file_extension(&self) -> &'static str {
        "mp4"
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.current.is_some() {
            self.stop_saving()?;
            // give the idle probe a moment to finalize the file
            std::thread::sleep(Duration::from_millis(200));
        }
        self.pipeline
            .send_event(gst::event::Eos::new())
            .then_some(())
            .ok_or_else(|| anyhow!("failed to send EOS to recorder pipeline"))?;
        self.pipeline
            .set_state(gst::State::Null)
            .context("stop recorder pipeline")?;
        Ok(())
    }
}

impl Drop for GstRecorder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
