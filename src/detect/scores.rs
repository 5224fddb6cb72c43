//! Inference-endpoint contract.
//!
//! Model internals live outside this crate; the pipeline only consumes score
//! vectors. An endpoint is either a classifier (one confidence per class) or
//! a detection network whose `(class, score, bbox)` outputs are remapped to a
//! classifier-shaped vector by taking the max score per class.

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-length vector of per-class confidences. The length (`n_classes`) is
/// set once per session from the endpoint metadata.
pub type ScoreVector = Vec<f32>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    Classifier,
    Detector,
}

/// Endpoint metadata, fixed for a camera session.
#[derive(Clone, Debug)]
pub struct InferenceMetadata {
    pub labels: Vec<String>,
    /// Input patch size the endpoint expects; ROIs are resized to this.
    pub input_width: u32,
    pub input_height: u32,
    pub kind: ModelKind,
}

impl InferenceMetadata {
    pub fn n_classes(&self) -> usize {
        self.labels.len()
    }
}

/// One detection from a detection-network endpoint. `rect` is
/// `[top, left, bottom, right]` normalized to 0..1 of the input patch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BBox {
    pub class: usize,
    pub score: f32,
    pub rect: [f32; 4],
}

/// Raw endpoint output for one input patch.
#[derive(Clone, Debug)]
pub enum InferenceOutput {
    Scores(ScoreVector),
    Detections(Vec<BBox>),
}

/// External inference endpoint.
pub trait Inference {
    fn metadata(&self) -> &InferenceMetadata;

    /// Run inference on one cropped/resized patch.
    fn run(&mut self, image: &RgbImage) -> Result<InferenceOutput>;
}

/// Remap detection-network output to a classifier-shaped score vector by
/// taking the max score per class. Detections with out-of-range class ids
/// are logged and skipped.
pub fn scores_from_detections(detections: &[BBox], n_classes: usize) -> ScoreVector {
    let mut scores = vec![0.0f32; n_classes];
    for det in detections {
        if det.class >= n_classes {
            log::warn!(
                "detection class id {} out of range for {} classes, skipping",
                det.class,
                n_classes
            );
            continue;
        }
        if det.score > scores[det.class] {
            scores[det.class] = det.score;
        }
    }
    scores
}

// -------------------- Scripted endpoint --------------------

/// Scripted endpoint for tests and hardware-free dry runs: plays back queued
/// score vectors, then settles on a baseline value. With a spike period it
/// injects a high score on one class every N runs, which is how `pcamd
/// --fake` exercises the full trigger/recording path.
pub struct ScriptedInference {
    metadata: InferenceMetadata,
    script: VecDeque<ScoreVector>,
    baseline: f32,
    spike: Option<SpikeSchedule>,
    runs: u64,
}

struct SpikeSchedule {
    every: u64,
    class: usize,
    score: f32,
}

impl ScriptedInference {
    pub fn new(n_classes: usize, baseline: f32) -> Self {
        let labels = (0..n_classes).map(|i| format!("class{}", i)).collect();
        Self {
            metadata: InferenceMetadata {
                labels,
                input_width: 224,
                input_height: 224,
                kind: ModelKind::Classifier,
            },
            script: VecDeque::new(),
            baseline,
            spike: None,
            runs: 0,
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.metadata.labels = labels;
        self
    }

    pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
        self.metadata.input_width = width;
        self.metadata.input_height = height;
        self
    }

    /// Queue explicit score vectors, played back before the baseline.
    pub fn with_script(mut self, script: Vec<ScoreVector>) -> Self {
        self.script = script.into();
        self
    }

    /// Inject a spike of `score` on `class` every `every` runs.
    pub fn with_periodic_spike(mut self, every: u64, class: usize, score: f32) -> Self {
        self.spike = Some(SpikeSchedule {
            every: every.max(1),
            class,
            score,
        });
        self
    }
}

impl Inference for ScriptedInference {
    fn metadata(&self) -> &InferenceMetadata {
        &self.metadata
    }

    fn run(&mut self, _image: &RgbImage) -> Result<InferenceOutput> {
        self.runs += 1;
        if let Some(scripted) = self.script.pop_front() {
            return Ok(InferenceOutput::Scores(scripted));
        }
        let mut scores = vec![self.baseline; self.metadata.n_classes()];
        if let Some(spike) = &self.spike {
            if self.runs % spike.every == 0 && spike.class < scores.len() {
                scores[spike.class] = spike.score;
            }
        }
        Ok(InferenceOutput::Scores(scores))
    }
}

// -------------------- Tests --------------------
