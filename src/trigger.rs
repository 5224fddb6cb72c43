//! Duty-cycle trigger state machine.
//!
//! [`DutyCycleTrigger`] converts a per-cycle boolean trigger signal plus a
//! monotonic clock into activate/deactivate edges under a duty-cycle budget.
//! It is a pure state machine: it owns no I/O and no clock, so it can be
//! driven standalone with a virtual clock in tests.
//!
//! Behavior over a camera session:
//!
//! - rising edge while inactive: activate.
//! - input stays high: after `max_time` of continuous recording (and unless
//!   `duty_cycle == 1.0`) deactivate and schedule a hold-off of
//!   `(max_time + post_time) * (1/duty_cycle - 1)`, which makes the long-run
//!   active fraction converge to `duty_cycle`.
//! - input stays high through the hold-off: reactivate once it expires.
//! - falling edge: remember the fall time and keep recording; a falling edge
//!   during a hold-off cancels the hold-off and reactivates immediately.
//! - input stays low while active: deactivate once both `post_time` has
//!   elapsed since the fall *and* `min_time` has elapsed since activation -
//!   `min_time` keeps recording past `post_time` when the event was brief.
//!
//! All timing is duration-based against the caller-supplied clock, so
//! cycle-time jitter does not perturb duty-cycle correctness.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::config::RecordingConfig;

/// Input phase observed for one evaluation, derived from the previous and
/// current trigger signal. Recorded in event metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriggerPhase {
    RisingEdge,
    High,
    FallingEdge,
    #[default]
    Low,
}

impl TriggerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerPhase::RisingEdge => "rising_edge",
            TriggerPhase::High => "high",
            TriggerPhase::FallingEdge => "falling_edge",
            TriggerPhase::Low => "low",
        }
    }
}

/// Edges emitted by one evaluation. At most one of `activated`/`deactivated`
/// is set per cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerUpdate {
    pub activated: bool,
    pub deactivated: bool,
    pub phase: TriggerPhase,
}

/// Duty-cycle-limited trigger.
///
/// The hold-off duration is derived once at construction from the recording
/// parameters; reconstruct the trigger (do not mutate it) when any of
/// `duty_cycle`/`post_time`/`min_time`/`max_time` changes. An in-flight
/// `hold_off_until` is deliberately not recomputed across that boundary.
#[derive(Debug)]
pub struct DutyCycleTrigger {
    duty_cycle: f64,
    post_time: Duration,
    min_time: Duration,
    max_time: Duration,
    hold_off: Duration,

    /// Previous cycle's input signal.
    triggered: bool,
    active: bool,
    start: Option<Instant>,
    rising: Option<Instant>,
    falling: Option<Instant>,
    hold_off_until: Option<Instant>,
}

impl DutyCycleTrigger {
    pub fn new(config: &RecordingConfig) -> Result<Self> {
        if !config.duty_cycle.is_finite()
            || config.duty_cycle <= 0.0
            || config.duty_cycle > 1.0
        {
            return Err(anyhow!(
                "invalid duty cycle {}: must be in (0, 1]",
                config.duty_cycle
            ));
        }
        for (name, value) in [
            ("post_time", config.post_time),
            ("min_time", config.min_time),
            ("max_time", config.max_time),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("invalid {} {}: must be >= 0", name, value));
            }
        }

        let hold_off_s = (config.max_time + config.post_time) * (1.0 / config.duty_cycle - 1.0);
        Ok(Self {
            duty_cycle: config.duty_cycle,
            post_time: Duration::from_secs_f64(config.post_time),
            min_time: Duration::from_secs_f64(config.min_time),
            max_time: Duration::from_secs_f64(config.max_time),
            hold_off: Duration::from_secs_f64(hold_off_s),
            triggered: false,
            active: false,
            start: None,
            rising: None,
            falling: None,
            hold_off_until: None,
        })
    }

    /// Recording is currently active (between an activate and its matching
    /// deactivate edge).
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Hold-off duration derived at construction.
    pub fn hold_off_duration(&self) -> Duration {
        self.hold_off
    }

    fn activate(&mut self, now: Instant, update: &mut TriggerUpdate) {
        self.start = Some(now);
        self.active = true;
        update.activated = true;
    }

    fn deactivate(&mut self, update: &mut TriggerUpdate) {
        self.active = false;
        update.deactivated = true;
    }

    fn rising_edge(&mut self, now: Instant, update: &mut TriggerUpdate) {
        self.rising = Some(now);
        if !self.active {
            self.activate(now, update);
        }
    }

    fn falling_edge(&mut self, now: Instant, update: &mut TriggerUpdate) {
        self.falling = Some(now);
        // a fall cancels any scheduled hold-off; if the hold-off had already
        // deactivated us, resume recording for the post-roll
        self.hold_off_until = None;
        if !self.active {
            self.activate(now, update);
        }
    }

    fn high(&mut self, now: Instant, update: &mut TriggerUpdate) {
        if self.rising.is_none() {
            self.rising_edge(now, update);
        }
        if self.active {
            let start = self.start.unwrap_or(now);
            if now.duration_since(start) >= self.max_time && self.duty_cycle != 1.0 {
                self.deactivate(update);
                self.hold_off_until = Some(now + self.hold_off);
            }
        } else if let Some(until) = self.hold_off_until {
            if now >= until {
                self.activate(now, update);
            }
        }
    }

    fn low(&mut self, now: Instant, update: &mut TriggerUpdate) {
        if !self.active {
            return;
        }
        if self.falling.is_none() {
            self.falling_edge(now, update);
        }
        let falling = self.falling.unwrap_or(now);
        let start = self.start.unwrap_or(now);
        if now.duration_since(falling) >= self.post_time
            && now.duration_since(start) >= self.min_time
        {
            self.deactivate(update);
        }
    }

    /// Consume one `(triggered, now)` sample and emit any edge.
    pub fn evaluate(&mut self, triggered: bool, now: Instant) -> TriggerUpdate {
        let mut update = TriggerUpdate::default();
        if self.triggered {
            if triggered {
                update.phase = TriggerPhase::High;
                self.high(now, &mut update);
            } else {
                update.phase = TriggerPhase::FallingEdge;
                self.falling_edge(now, &mut update);
            }
        } else if triggered {
            update.phase = TriggerPhase::RisingEdge;
            self.rising_edge(now, &mut update);
        } else {
            update.phase = TriggerPhase::Low;
            self.low(now, &mut update);
        }
        self.triggered = triggered;
        update
    }
}

// -------------------- Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(duty_cycle: f64, post: f64, min: f64, max: f64) -> RecordingConfig {
        RecordingConfig {
            duty_cycle,
            post_time: post,
            min_time: min,
            max_time: max,
            ..RecordingConfig::default()
        }
    }

    fn trigger(duty_cycle: f64, post: f64, min: f64, max: f64) -> DutyCycleTrigger {
        DutyCycleTrigger::new(&config(duty_cycle, post, min, max)).expect("trigger")
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn construction_rejects_bad_parameters() {
        assert!(DutyCycleTrigger::new(&config(0.0, 1.0, 1.0, 1.0)).is_err());
        assert!(DutyCycleTrigger::new(&config(-0.5, 1.0, 1.0, 1.0)).is_err());
        assert!(DutyCycleTrigger::new(&config(1.5, 1.0, 1.0, 1.0)).is_err());
        assert!(DutyCycleTrigger::new(&config(0.5, -1.0, 1.0, 1.0)).is_err());
        assert!(DutyCycleTrigger::new(&config(0.5, 1.0, 1.0, 1.0)).is_ok());
    }

    #[test]
    fn rising_edge_activates_once() {
        let mut trig = trigger(0.1, 1.0, 3.0, 10.0);
        let t0 = Instant::now();

        let up = trig.evaluate(true, t0);
        assert!(up.activated && !up.deactivated);
        assert_eq!(up.phase, TriggerPhase::RisingEdge);
        assert!(trig.is_active());

        let up = trig.evaluate(true, t0 + secs(1.0));
        assert!(!up.activated && !up.deactivated);
        assert_eq!(up.phase, TriggerPhase::High);
    }

    #[test]
    fn full_duty_cycle_never_enters_hold_off() {
        let mut trig = trigger(1.0, 1.0, 3.0, 10.0);
        let t0 = Instant::now();
        trig.evaluate(true, t0);
        // far beyond max_time, still active: hold-off is disabled
        for i in 1..2000 {
            let up = trig.evaluate(true, t0 + secs(i as f64 * 0.5));
            assert!(!up.deactivated);
            assert!(trig.is_active());
        }
    }

    #[test]
    fn max_time_deactivates_then_hold_off_reactivates() {
        let mut trig = trigger(0.1, 1.0, 3.0, 10.0);
        // hold-off = (10 + 1) * 9 = 99 s
        assert!((trig.hold_off_duration().as_secs_f64() - 99.0).abs() < 1e-9);
        let t0 = Instant::now();

        trig.evaluate(true, t0);
        let up = trig.evaluate(true, t0 + secs(10.0));
        assert!(up.deactivated);
        assert!(!trig.is_active());

        // held off while input stays high
        let up = trig.evaluate(true, t0 + secs(60.0));
        assert!(!up.activated);

        // reactivates once the hold-off expires
        let up = trig.evaluate(true, t0 + secs(109.5));
        assert!(up.activated);
        assert!(trig.is_active());
    }

    #[test]
    fn falling_edge_during_hold_off_reactivates() {
        let mut trig = trigger(0.1, 1.0, 3.0, 10.0);
        let t0 = Instant::now();

        trig.evaluate(true, t0);
        assert!(trig.evaluate(true, t0 + secs(10.0)).deactivated);

        // the trigger falls mid-hold-off: resume recording for the post-roll
        let up = trig.evaluate(false, t0 + secs(20.0));
        assert_eq!(up.phase, TriggerPhase::FallingEdge);
        assert!(up.activated);

        // start was reset at reactivation, so min_time applies again
        let up = trig.evaluate(false, t0 + secs(22.0));
        assert!(!up.deactivated);
        let up = trig.evaluate(false, t0 + secs(23.5));
        assert!(up.deactivated);
    }

    #[test]
    fn min_time_extends_recording_past_post_time() {
        let mut trig = trigger(0.1, 1.0, 5.0, 10.0);
        let t0 = Instant::now();

        trig.evaluate(true, t0);
        // trigger falls almost immediately
        let up = trig.evaluate(false, t0 + secs(0.2));
        assert_eq!(up.phase, TriggerPhase::FallingEdge);

        // post_time alone would end recording at 1.2 s, but min_time holds
        // it active until 5 s from the start
        assert!(!trig.evaluate(false, t0 + secs(2.0)).deactivated);
        assert!(!trig.evaluate(false, t0 + secs(4.9)).deactivated);
        let up = trig.evaluate(false, t0 + secs(5.0));
        assert!(up.deactivated);
    }

    #[test]
    fn post_time_governs_when_min_time_already_met() {
        let mut trig = trigger(0.1, 2.0, 1.0, 10.0);
        let t0 = Instant::now();

        trig.evaluate(true, t0);
        trig.evaluate(true, t0 + secs(4.0));
        trig.evaluate(false, t0 + secs(5.0)); // falling edge
        assert!(!trig.evaluate(false, t0 + secs(6.5)).deactivated);
        assert!(trig.evaluate(false, t0 + secs(7.0)).deactivated);
    }

    #[test]
    fn low_input_stays_inactive() {
        let mut trig = trigger(0.1, 1.0, 3.0, 10.0);
        let t0 = Instant::now();
        for i in 0..100 {
            let up = trig.evaluate(false, t0 + secs(i as f64));
            assert!(!up.activated && !up.deactivated);
            assert_eq!(up.phase, TriggerPhase::Low);
        }
        assert!(!trig.is_active());
    }
}
