//! pcamd - pollinator camera daemon
//!
//! Runs one camera pipeline: frame acquisition, per-ROI inference and
//! adaptive thresholding, duty-cycle-limited triggered recording, periodic
//! stills, event metadata and liveness heartbeats.
//!
//! The inference endpoint is an external collaborator; without one
//! configured, `--fake` drives the pipeline with a scripted endpoint that
//! spikes periodically, and the default scripted endpoint never fires (the
//! pipeline still produces periodic stills and heartbeats).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pcam_kernel::{
    open_camera, CameraLocator, DaemonConfig, FileHeartbeat, JsonEventLog, MjpegRecorder, Monitor,
    MonitorOptions, MonitorSetup, ScriptedInference,
};

/// Number of classes exposed by the scripted fallback endpoint.
const SCRIPTED_CLASSES: usize = 16;
/// `--fake` spikes this class every N cycles.
const FAKE_SPIKE_PERIOD: u64 = 30;
const FAKE_SPIKE_CLASS: usize = 7;

#[derive(Parser, Debug)]
#[command(name = "pcamd", about = "Pollinator camera monitor daemon")]
struct Args {
    /// Camera locator: ip address, /dev/videoX, or stub://name
    #[arg(short, long)]
    loc: String,

    /// Camera name (overrides automatic name detection)
    #[arg(short, long)]
    name: Option<String>,

    /// Retry on acquisition errors instead of restarting the source
    #[arg(short, long)]
    retry: bool,

    /// Drive the pipeline with a periodically spiking scripted endpoint
    #[arg(short, long)]
    fake: bool,

    /// Save single images when triggered
    #[arg(short, long)]
    capture_stills: bool,

    /// Data directory root (overrides PCAM_DATA_DIR)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut daemon = DaemonConfig::load()?;
    if let Some(data_dir) = &args.data_dir {
        daemon.data_dir = data_dir.clone();
    }

    let locator = CameraLocator::parse(&args.loc)?;
    let name = args.name.clone().unwrap_or_else(|| locator.default_name());
    log::info!("pcamd starting: camera {} at {:?}", name, locator);

    let stop = Arc::new(AtomicBool::new(false));
    let ctrlc_stop = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        ctrlc_stop.store(true, Ordering::Relaxed);
    })
    .context("install signal handler")?;

    let inference: Box<ScriptedInference> = if args.fake {
        log::info!(
            "faking detections: class {} spikes every {} cycles",
            FAKE_SPIKE_CLASS,
            FAKE_SPIKE_PERIOD
        );
        Box::new(
            ScriptedInference::new(SCRIPTED_CLASSES, 0.05).with_periodic_spike(
                FAKE_SPIKE_PERIOD,
                FAKE_SPIKE_CLASS,
                0.95,
            ),
        )
    } else {
        log::warn!("no inference endpoint configured; detections will not fire");
        Box::new(ScriptedInference::new(SCRIPTED_CLASSES, 0.0))
    };

    let events = JsonEventLog::new(daemon.data_dir.join("detections").join(&name));
    let heartbeat = FileHeartbeat::new(
        daemon.data_dir.join("heartbeat").join(&name),
        Duration::from_secs(5),
    );

    let camera_locator = locator.clone();
    let setup = MonitorSetup {
        name: name.clone(),
        data_dir: daemon.data_dir.clone(),
        store: daemon.config_store(),
        camera_factory: Box::new(move |props| open_camera(&camera_locator, props)),
        recorder_factory: Box::new(|| Ok(Box::new(MjpegRecorder::new()))),
        inference,
        events: Box::new(events),
        heartbeat: Some(Box::new(heartbeat)),
        options: MonitorOptions {
            retry: args.retry,
            capture_stills: args.capture_stills,
            analysis_period: daemon.analysis_period,
        },
    };

    let mut monitor = Monitor::new(setup)?;
    log::info!(
        "{}: running (analysis period {:?}, data dir {})",
        monitor.name(),
        daemon.analysis_period,
        daemon.data_dir.display()
    );

    let result = monitor.run(&stop);
    if let Err(e) = &result {
        log::error!("{}: pipeline failed: {:#}", name, e);
    }
    result
}
