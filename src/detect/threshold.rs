//! Adaptive running threshold.
//!
//! [`RunningThreshold`] decides once per cycle whether a score vector
//! represents a reportable event. A static threshold catches outright
//! high-confidence scores; an adaptive per-class deviation test, armed once
//! `min_n` samples have been seen, catches departures from the recent
//! running mean while resisting both false triggers (the `min_dev` floor
//! keeps a flat-lined class from firing on noise) and anomaly starvation
//! (the ring buffer keeps adapting, so a changed baseline stops firing).
//!
//! Each vector is tested against the statistics of the *previous* `min_n`
//! samples and only then pushed into the ring; including the sample under
//! test in its own baseline would inflate the deviation bound enough to mask
//! single-frame spikes entirely.

use anyhow::Result;

use super::mask::{build_allow_mask, parse_allow_spec};
use super::registry::ClassRegistry;
use crate::config::DetectorConfig;

/// Outcome of one `check` call.
#[derive(Clone, Debug, Default)]
pub struct Decision {
    /// Any allow-masked class fired this cycle.
    pub fired: bool,
    /// Indices of the masked classes that fired, ascending.
    pub indices: Vec<usize>,
}

/// Per-ROI adaptive thresholder over fixed-length score vectors.
///
/// Rebuilt (never mutated in place) whenever the ROI or detector config
/// changes; the ring buffer resets only through that rebuild.
pub struct RunningThreshold {
    n_classes: usize,
    min_n: usize,
    n_std: f32,
    min_dev: f32,
    static_threshold: f32,
    allow: Vec<bool>,
    /// Ring buffer of the last `min_n` score vectors.
    buffers: Vec<Vec<f32>>,
    next_slot: usize,
    pushes: usize,
}

impl RunningThreshold {
    /// Construct from detector config. Fails on a malformed allow spec -
    /// configuration errors surface here, never during steady-state checks.
    pub fn new(n_classes: usize, config: &DetectorConfig, registry: &ClassRegistry) -> Result<Self> {
        let tokens = parse_allow_spec(&config.allow)?;
        let allow = build_allow_mask(n_classes, &tokens, registry)?;
        Ok(Self {
            n_classes,
            min_n: config.min_n.max(1),
            n_std: config.n_std,
            min_dev: config.min_dev,
            static_threshold: config.threshold,
            allow,
            buffers: Vec::new(),
            next_slot: 0,
            pushes: 0,
        })
    }

    fn push(&mut self, scores: &[f32]) {
        if self.buffers.len() < self.min_n {
            self.buffers.push(scores.to_vec());
        } else {
            self.buffers[self.next_slot].copy_from_slice(scores);
        }
        self.next_slot = (self.next_slot + 1) % self.min_n;
        self.pushes += 1;
    }

    fn warm(&self) -> bool {
        self.pushes >= self.min_n
    }

    /// Per-class mean and standard deviation over the full ring buffer.
    fn stats(&self) -> (Vec<f32>, Vec<f32>) {
        let n = self.buffers.len() as f32;
        let mut mean = vec![0.0f32; self.n_classes];
        for sample in &self.buffers {
            for (acc, value) in mean.iter_mut().zip(sample) {
                *acc += value;
            }
        }
        for acc in &mut mean {
            *acc /= n;
        }

        let mut std = vec![0.0f32; self.n_classes];
        for sample in &self.buffers {
            for ((acc, value), m) in std.iter_mut().zip(sample).zip(&mean) {
                let d = value - m;
                *acc += d * d;
            }
        }
        for acc in &mut std {
            *acc = (*acc / n).sqrt();
        }
        (mean, std)
    }

    /// Check one score vector, then absorb it into the running window.
    /// `scores` must have length `n_classes`.
    pub fn check(&mut self, scores: &[f32]) -> Decision {
        debug_assert_eq!(scores.len(), self.n_classes);

        // warm-up: only the static threshold applies
        let adaptive = if self.warm() { Some(self.stats()) } else { None };

        let mut indices = Vec::new();
        for (class, &score) in scores.iter().enumerate() {
            if !self.allow[class] {
                continue;
            }
            let mut fired = score > self.static_threshold;
            if !fired {
                if let Some((mean, std)) = &adaptive {
                    let bound = (self.n_std * std[class]).max(self.min_dev);
                    fired = (score - mean[class]).abs() > bound;
                }
            }
            if fired {
                indices.push(class);
            }
        }

        self.push(scores);

        Decision {
            fired: !indices.is_empty(),
            indices,
        }
    }

    pub fn allow_mask(&self) -> &[bool] {
        &self.allow
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(n_classes: usize, config: DetectorConfig) -> RunningThreshold {
        let labels: Vec<String> = (0..n_classes).map(|i| format!("class{}", i)).collect();
        let registry = ClassRegistry::from_labels(&labels);
        RunningThreshold::new(n_classes, &config, &registry).expect("detector")
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            min_n: 5,
            n_std: 3.0,
            min_dev: 0.05,
            threshold: 0.9,
            allow: String::new(),
        }
    }

    #[test]
    fn warm_up_uses_only_the_static_threshold() {
        let mut det = detector(3, config());
        // wild swings during warm-up do not fire as long as they stay below
        // the static threshold
        for scores in [[0.0, 0.8, 0.0], [0.8, 0.0, 0.8], [0.0, 0.8, 0.0]] {
            let decision = det.check(&scores);
            assert!(!decision.fired, "fired during warm-up on {:?}", scores);
        }
        // a static-threshold crossing fires even during warm-up
        let decision = det.check(&[0.0, 0.95, 0.0]);
        assert!(decision.fired);
        assert_eq!(decision.indices, vec![1]);
    }

    #[test]
    fn baseline_within_bounds_never_fires_once_warm() {
        let mut det = detector(4, config());
        let baseline = [0.1, 0.2, 0.1, 0.3];
        for _ in 0..20 {
            let decision = det.check(&baseline);
            assert!(!decision.fired);
        }
    }

    #[test]
    fn deviating_class_fires_with_its_index() {
        let mut det = detector(10, config());
        // varied warm-up so the running std is nonzero but small
        for i in 0..8 {
            let mut scores = [0.1f32; 10];
            scores[3] += (i % 3) as f32 * 0.01;
            assert!(!det.check(&scores).fired);
        }
        // class 7 jumps well above its deviation bound but below the static
        // threshold - only the adaptive test can catch it
        let mut scores = [0.1f32; 10];
        scores[7] = 0.8;
        let decision = det.check(&scores);
        assert!(decision.fired);
        assert!(decision.indices.contains(&7));
    }

    #[test]
    fn window_adapts_so_a_spike_does_not_refire() {
        let mut det = detector(2, config());
        for _ in 0..6 {
            assert!(!det.check(&[0.1, 0.1]).fired);
        }
        assert!(det.check(&[0.1, 0.8]).fired);
        // once the spike is in the window it widens the bound; a return to
        // baseline does not fire again
        assert!(!det.check(&[0.1, 0.1]).fired);
    }

    #[test]
    fn min_dev_floor_suppresses_noise_on_flat_classes() {
        let mut det = detector(2, DetectorConfig {
            min_dev: 0.2,
            ..config()
        });
        for _ in 0..10 {
            assert!(!det.check(&[0.1, 0.1]).fired);
        }
        // a constant feed has std 0; without the floor any wiggle would fire
        assert!(!det.check(&[0.25, 0.1]).fired);
    }

    #[test]
    fn allow_mask_suppresses_denied_classes() {
        let mut det = detector(4, DetectorConfig {
            allow: "+1".to_string(),
            ..config()
        });
        let decision = det.check(&[0.95, 0.95, 0.95, 0.95]);
        assert!(decision.fired);
        assert_eq!(decision.indices, vec![1]);

        let mut det = detector(4, DetectorConfig {
            allow: "-0:4".to_string(),
            ..config()
        });
        let decision = det.check(&[0.95, 0.95, 0.95, 0.95]);
        assert!(!decision.fired);
        assert!(decision.indices.is_empty());
    }

    #[test]
    fn malformed_allow_spec_fails_construction() {
        let labels: Vec<String> = (0..4).map(|i| format!("class{}", i)).collect();
        let registry = ClassRegistry::from_labels(&labels);
        let bad = DetectorConfig {
            allow: "+nosuchgroup".to_string(),
            ..config()
        };
        assert!(RunningThreshold::new(4, &bad, &registry).is_err());
    }
}
