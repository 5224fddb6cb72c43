//! Detection: score-vector consumption and adaptive thresholding.
//!
//! - `scores`: the inference-endpoint contract and score-vector remapping
//! - `registry`: explicit class-name -> index registry per camera session
//! - `mask`: the allow-mask mini-language
//! - `threshold`: the adaptive running-statistics thresholder

mod mask;
mod registry;
mod scores;
mod threshold;

pub use mask::{build_allow_mask, parse_allow_spec, MaskOp, MaskToken};
pub use registry::ClassRegistry;
pub use scores::{
    scores_from_detections, BBox, Inference, InferenceMetadata, InferenceOutput, ModelKind,
    ScoreVector, ScriptedInference,
};
pub use threshold::{Decision, RunningThreshold};
