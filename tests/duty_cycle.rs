//! Virtual-clock tests for the duty-cycle trigger.
//!
//! The trigger is a pure function of `(triggered, now)`, so these tests step
//! a simulated clock and measure how much wall-clock time the trigger keeps
//! recording active under different input signals.

use std::time::{Duration, Instant};

use pcam_kernel::{DutyCycleTrigger, RecordingConfig};

struct RunStats {
    on_time: f64,
    activations: usize,
    deactivations: usize,
    duty: f64,
}

/// Drive the trigger for `total_s` simulated seconds in `step_s` increments,
/// with the input signal given by `input(t)`.
fn run_trigger(
    trigger: &mut DutyCycleTrigger,
    total_s: f64,
    step_s: f64,
    input: impl Fn(f64) -> bool,
) -> RunStats {
    let t0 = Instant::now();
    let mut on_time = 0.0;
    let mut activations = 0;
    let mut deactivations = 0;

    let steps = (total_s / step_s).round() as u64;
    for i in 0..=steps {
        let t = i as f64 * step_s;
        let now = t0 + Duration::from_secs_f64(t);
        let update = trigger.evaluate(input(t), now);
        if update.activated {
            activations += 1;
        }
        if update.deactivated {
            deactivations += 1;
        }
        if trigger.is_active() {
            on_time += step_s;
        }
    }

    RunStats {
        on_time,
        activations,
        deactivations,
        duty: on_time / total_s,
    }
}

fn config(duty_cycle: f64, post: f64, min: f64, max: f64) -> RecordingConfig {
    RecordingConfig {
        duty_cycle,
        post_time: post,
        min_time: min,
        max_time: max,
        ..RecordingConfig::default()
    }
}

#[test]
fn sustained_high_converges_to_the_duty_cycle() {
    // duty 0.1, max 10, post 1: each cycle records 10 s then holds off
    // (10 + 1) * 9 = 99 s, an active fraction of 10/109 ~ 0.092
    let mut trigger = DutyCycleTrigger::new(&config(0.1, 1.0, 3.0, 10.0)).unwrap();
    let stats = run_trigger(&mut trigger, 5000.0, 0.25, |_| true);
    assert!(
        (stats.duty - 0.1).abs() < 0.015,
        "measured duty {} not within tolerance of 0.1",
        stats.duty
    );
    assert!(stats.activations > 10);
}

#[test]
fn convergence_holds_across_duty_cycles() {
    for duty in [0.05, 0.1, 0.2, 0.5, 0.9] {
        let mut trigger = DutyCycleTrigger::new(&config(duty, 1.0, 3.0, 10.0)).unwrap();
        let stats = run_trigger(&mut trigger, 5000.0, 0.1, |_| true);
        let error = (stats.duty - duty).abs();
        assert!(
            error <= duty * 0.15,
            "duty {}: measured {} (error {})",
            duty,
            stats.duty,
            error
        );
    }
}

#[test]
fn full_duty_cycle_records_continuously() {
    let mut trigger = DutyCycleTrigger::new(&config(1.0, 1.0, 3.0, 10.0)).unwrap();
    let stats = run_trigger(&mut trigger, 1000.0, 0.25, |_| true);
    assert!(stats.duty > 0.99, "measured duty {}", stats.duty);
    assert_eq!(stats.activations, 1);
    assert_eq!(stats.deactivations, 0);
}

#[test]
fn no_input_means_no_recording() {
    let mut trigger = DutyCycleTrigger::new(&config(0.1, 1.0, 3.0, 10.0)).unwrap();
    let stats = run_trigger(&mut trigger, 100.0, 0.25, |_| false);
    assert_eq!(stats.on_time, 0.0);
    assert_eq!(stats.activations, 0);
}

#[test]
fn brief_event_records_for_min_time() {
    // the trigger is high for only 0.2 s; post_time alone would stop at
    // ~1.2 s but min_time keeps recording active until 3 s
    let mut trigger = DutyCycleTrigger::new(&config(0.1, 1.0, 3.0, 10.0)).unwrap();
    let stats = run_trigger(&mut trigger, 10.0, 0.05, |t| t < 0.2);
    assert!(
        (stats.on_time - 3.0).abs() < 0.2,
        "on_time {} not ~min_time",
        stats.on_time
    );
    assert_eq!(stats.activations, 1);
    assert_eq!(stats.deactivations, 1);
}

#[test]
fn sustained_event_records_for_max_time_per_burst() {
    let mut trigger = DutyCycleTrigger::new(&config(0.1, 1.0, 3.0, 10.0)).unwrap();
    // 15 s is shorter than max_time + hold-off, so exactly one burst
    let stats = run_trigger(&mut trigger, 15.0, 0.05, |_| true);
    assert!(
        (stats.on_time - 10.0).abs() < 0.2,
        "on_time {} not ~max_time",
        stats.on_time
    );
    assert_eq!(stats.activations, 1);
    assert_eq!(stats.deactivations, 1);
}

#[test]
fn post_roll_extends_past_the_falling_edge() {
    // high for 5 s (min_time already satisfied), then post_time of 2 s
    let mut trigger = DutyCycleTrigger::new(&config(0.1, 2.0, 3.0, 10.0)).unwrap();
    let stats = run_trigger(&mut trigger, 15.0, 0.05, |t| t < 5.0);
    assert!(
        (stats.on_time - 7.0).abs() < 0.2,
        "on_time {} not ~5s event + 2s post-roll",
        stats.on_time
    );
}

#[test]
fn hold_off_is_cancelled_by_a_falling_edge() {
    // high long enough to enter hold-off at t=10, falls at t=20: recording
    // resumes immediately for the post-roll instead of waiting out the
    // 99 s hold-off
    let mut trigger = DutyCycleTrigger::new(&config(0.1, 1.0, 3.0, 10.0)).unwrap();
    let stats = run_trigger(&mut trigger, 30.0, 0.05, |t| t < 20.0);
    assert_eq!(stats.activations, 2);
    assert_eq!(stats.deactivations, 2);
    // burst one: 10 s; burst two: min_time (3 s) from the falling edge
    assert!(
        (stats.on_time - 13.0).abs() < 0.3,
        "on_time {} not ~13s",
        stats.on_time
    );
}
