//! Config store and live-reload integration tests.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use pcam_kernel::{
    CameraConfig, CaptureProperties, ConfigStore, DaemonConfig, DetectorConfig, MemoryEventSink,
    Monitor, MonitorOptions, MonitorSetup, Recorder, RecordingConfig, ScriptedInference,
    StubRecorder, SyntheticCamera,
};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PCAM_DATA_DIR",
        "PCAM_WORKING_CFG_DIR",
        "PCAM_STATIC_CFG_DIR",
        "PCAM_ANALYSIS_PERIOD",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn daemon_config_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PCAM_DATA_DIR", "/tmp/pcam-test-data");
    std::env::set_var("PCAM_ANALYSIS_PERIOD", "0.5");

    let cfg = DaemonConfig::load().expect("load daemon config");
    assert_eq!(cfg.data_dir, Path::new("/tmp/pcam-test-data"));
    assert_eq!(cfg.analysis_period, Duration::from_millis(500));

    clear_env();
}

#[test]
fn daemon_config_rejects_bad_period() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PCAM_ANALYSIS_PERIOD", "not-a-number");
    assert!(DaemonConfig::load().is_err());

    std::env::set_var("PCAM_ANALYSIS_PERIOD", "0");
    assert!(DaemonConfig::load().is_err());

    clear_env();
}

fn test_config() -> CameraConfig {
    CameraConfig {
        detector: DetectorConfig {
            min_n: 3,
            threshold: 0.5,
            ..DetectorConfig::default()
        },
        recording: RecordingConfig {
            save_video: false,
            duty_cycle: 1.0,
            periodic_still: 0.0,
            ..RecordingConfig::default()
        },
        properties: CaptureProperties {
            frame_width: 64,
            frame_height: 48,
            fps: 100,
            ..CaptureProperties::default()
        },
        ..CameraConfig::default()
    }
}

fn monitor_for(dir: &Path, store: ConfigStore) -> Monitor {
    Monitor::new(MonitorSetup {
        name: "cam0".to_string(),
        data_dir: dir.join("data"),
        store,
        camera_factory: Box::new(|props| {
            Ok(Box::new(
                SyntheticCamera::new("cam0").with_properties(props.clone()),
            ))
        }),
        recorder_factory: Box::new(|| {
            let (stub, _) = StubRecorder::new();
            Ok(Box::new(stub) as Box<dyn Recorder>)
        }),
        inference: Box::new(ScriptedInference::new(4, 0.1).with_input_size(32, 32)),
        events: Box::new(MemoryEventSink::new()),
        heartbeat: None,
        options: MonitorOptions {
            retry: false,
            capture_stills: false,
            analysis_period: Duration::from_millis(20),
        },
    })
    .expect("monitor")
}

#[test]
fn changed_config_file_is_picked_up_mid_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ConfigStore::new(dir.path().join("working"), dir.path().join("static"));
    store.save(&test_config(), "cam0").expect("save");

    let mut monitor = monitor_for(dir.path(), store.clone());
    for _ in 0..3 {
        monitor.update().expect("update");
    }
    assert_eq!(monitor.config().recording.duty_cycle, 1.0);

    // rewrite the working file with new recording parameters; the mtime
    // probe picks it up on the next cycle
    std::thread::sleep(Duration::from_millis(30));
    let mut changed = test_config();
    changed.recording.duty_cycle = 0.5;
    changed.detector.threshold = 0.7;
    store.save(&changed, "cam0").expect("save changed");

    let mut reloaded = false;
    for _ in 0..20 {
        monitor.update().expect("update");
        if monitor.config().recording.duty_cycle == 0.5 {
            reloaded = true;
            break;
        }
    }
    monitor.shutdown();
    assert!(reloaded, "config change was not picked up");
}

#[test]
fn default_config_is_persisted_on_first_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ConfigStore::new(dir.path().join("working"), dir.path().join("static"));
    // no file saved: the monitor starts from defaults and persists them
    let monitor = monitor_for(dir.path(), store.clone());
    assert!(store.modified_time("cam0").is_some());
    let persisted = store
        .load("cam0", &CameraConfig::default())
        .expect("load persisted default");
    assert_eq!(&persisted, monitor.config());
}

#[test]
fn unreadable_config_keeps_the_previous_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let working = dir.path().join("working");
    let store = ConfigStore::new(&working, dir.path().join("static"));
    store.save(&test_config(), "cam0").expect("save");

    let mut monitor = monitor_for(dir.path(), store);
    monitor.update().expect("update");

    std::thread::sleep(Duration::from_millis(30));
    std::fs::write(working.join("cam0.json"), "{ not json").expect("corrupt file");

    for _ in 0..5 {
        monitor.update().expect("update survives corrupt config");
    }
    assert_eq!(monitor.config().recording.duty_cycle, 1.0);
    monitor.shutdown();
}
