//! Smelt Training
//!
//! Feedback-validated parameter-efficient fine-tuning primitives:
//! - Normalizing heterogeneous dataset directories into one token-budgeted
//!   example stream (`dataset`)
//! - Loading validation cases and generating candidate answers
//!   (`validation`, `answers`)
//! - Grading answers with a second model despite unreliable structured
//!   output (`grading`)
//! - Driving repeated training+grading cycles (`controller`)
//!
//! The model-serving runtime itself stays behind the `smelt-runtime` traits.

pub mod answers;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod error;
pub mod grading;
pub mod validation;

#[cfg(test)]
pub(crate) mod testutil;

pub use answers::{collect_answers, AnswerSet, GenerationOptions};
pub use config::{
    LoraConfig, MergerConfig, OperationConfig, PipelineConfig, TrainerConfig, ValidationConfig,
};
pub use controller::{
    device_policy, LoopReport, RunHistory, TrainingPass, TunedArtifacts, ValidationLoop,
    VerdictRecord,
};
pub use dataset::{
    scan, EncodedExample, EncodingOptions, SourceFormat, SHUFFLE_SEED, TEMPLATE_MARGIN,
    TURN_OVERHEAD_TOKENS,
};
pub use error::{Result, TrainingError};
pub use grading::{grade, GradeOutcome, GradingOptions, VerdictStatistics};
pub use validation::{load_validation_dir, PromptKind, ValidationCase};
