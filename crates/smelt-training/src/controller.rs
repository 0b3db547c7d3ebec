//! Validation loop controller.
//!
//! Orchestrates repeated training+grading cycles and decides whether to
//! continue. Two modes:
//!
//! - **Post-hoc**: training runs to completion, then the stored adapter is
//!   reloaded fresh and graded once (decoupled lifetimes).
//! - **In-place**: the resident training model is graded after every pass;
//!   the loop retrains while the verdict is false.
//!
//! Teardown is unconditional: however a run exits, the grader is unloaded
//! and the run history is logged and reset.

use crate::answers::{collect_answers, GenerationOptions};
use crate::config::PipelineConfig;
use crate::error::{Result, TrainingError};
use crate::grading::{grade, GradingOptions};
use crate::validation::load_validation_dir;
use chrono::{DateTime, Utc};
use serde::Serialize;
use smelt_runtime::{plan_load, Device, DevicePolicy, ModelHandle, ModelRuntime, ModelSlot};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// The opaque "train one pass" capability provided by the training driver.
///
/// One pass means whatever the driver configured (typically the full epoch
/// budget); iteration/epoch ceilings are the driver's concern.
pub trait TrainingPass {
    /// Runs one training pass over the already-resident model.
    fn run_pass(&mut self) -> Result<()>;

    /// The resident tuned model.
    fn tuned(&self) -> &ModelHandle;

    /// Where the trained adapter is (or will be) stored.
    fn adapter_dir(&self) -> &Path;

    /// The interface handed to the external merge/export step.
    fn artifacts(&self) -> TunedArtifacts<'_> {
        TunedArtifacts { model: self.tuned(), adapter_dir: self.adapter_dir() }
    }
}

/// A trained model plus its adapter location, consumed by the merge step.
pub struct TunedArtifacts<'a> {
    pub model: &'a ModelHandle,
    pub adapter_dir: &'a Path,
}

/// One grading verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerdictRecord {
    pub passed: bool,
    pub percentage: u32,
}

/// Every verdict from every iteration, in order. Process-scoped: exists
/// only between loop start and teardown.
pub type RunHistory = Vec<VerdictRecord>;

/// Summary of one training loop run.
#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub iterations: u32,
    /// Verdict of the last in-place validation, if any ran.
    pub final_verdict: Option<bool>,
    pub history: RunHistory,
}

/// Derives the device policy from configuration plus a host probe.
#[must_use]
pub fn device_policy(config: &PipelineConfig, accelerator_available: bool) -> DevicePolicy {
    DevicePolicy {
        preferred: Device::from_config(&config.operation.device),
        accelerator_available,
        quantization_enabled: config.lora.q_lora,
    }
}

/// Holds at most one grader handle and the run history for one loop.
///
/// The primary model is never owned here: in-place mode borrows the
/// trainer's resident handle, post-hoc mode loads and releases its own copy
/// within a single call.
pub struct ValidationLoop<'a> {
    runtime: &'a dyn ModelRuntime,
    config: &'a PipelineConfig,
    policy: DevicePolicy,
    grader: ModelSlot,
    history: RunHistory,
}

impl<'a> ValidationLoop<'a> {
    #[must_use]
    pub fn new(
        runtime: &'a dyn ModelRuntime,
        config: &'a PipelineConfig,
        policy: DevicePolicy,
    ) -> Self {
        Self { runtime, config, policy, grader: ModelSlot::empty(), history: RunHistory::new() }
    }

    #[must_use]
    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Runs the training loop: one pass per iteration on the same resident
    /// handle, grading in place after each pass when configured, until a
    /// pass (or the first iteration in post-hoc mode).
    ///
    /// Teardown runs on every exit path, including errors.
    pub fn run(&mut self, pass: &mut dyn TrainingPass) -> Result<LoopReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "training loop started");

        let result = self.run_inner(pass);
        let history = self.finish();
        let (iterations, final_verdict) = result?;

        Ok(LoopReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            iterations,
            final_verdict,
            history,
        })
    }

    fn run_inner(&mut self, pass: &mut dyn TrainingPass) -> Result<(u32, Option<bool>)> {
        let in_place = self.config.validation.validate && self.config.validation.in_place;
        let mut iterations = 0u32;
        let mut final_verdict = None;
        loop {
            iterations += 1;
            info!(iteration = iterations, "training pass");
            pass.run_pass()?;

            if !in_place {
                break;
            }
            let passed = self.validate_in_place(pass.tuned())?;
            final_verdict = Some(passed);
            if passed {
                break;
            }
        }
        info!(iterations, "training finished");
        Ok((iterations, final_verdict))
    }

    /// Grades the resident training model without reloading it. The grader
    /// is loaded lazily once and stays resident across iterations.
    pub fn validate_in_place(&mut self, model: &ModelHandle) -> Result<bool> {
        let v = &self.config.validation;
        if !v.validate || !v.in_place {
            return Ok(true);
        }
        info!("in-place validation");

        let cases = load_validation_dir(&v.validation_dir)?;
        let answers = collect_answers(model, &cases, &self.generation_options())?;

        let grading_options = self.grading_options();
        let outcome = {
            let grader = self.ensure_grader()?;
            grade(&answers, grader, &grading_options)?
        };
        self.history.push(VerdictRecord { passed: outcome.passed, percentage: outcome.percentage });
        Ok(outcome.passed)
    }

    /// Post-hoc validation: reloads the stored adapter fresh, generates
    /// answers, swaps the candidate for the grader, and grades.
    ///
    /// Runs teardown on every exit path.
    pub fn validate(&mut self) -> Result<bool> {
        let result = self.post_hoc();
        self.finish();
        result
    }

    fn post_hoc(&mut self) -> Result<bool> {
        let v = &self.config.validation;
        let t = &self.config.trainer;
        if !v.validate || v.in_place {
            return Ok(true);
        }
        if !t.store_adapter {
            return Err(TrainingError::Config(
                "validation requires trainer.store_adapter (the adapter is reloaded from disk)"
                    .to_string(),
            ));
        }
        info!("validation");

        // Candidate phase: load base + adapter, generate, release before the
        // grader takes its place in device memory.
        let spec = plan_load(
            &t.base_model_dir,
            Some(&t.adapter_dir),
            false,
            v.quantize_model,
            &self.policy,
        );
        let candidate = self.runtime.load(&spec)?;
        let answers = load_validation_dir(&v.validation_dir)
            .and_then(|cases| collect_answers(&candidate, &cases, &self.generation_options()));
        info!(model = %candidate.source.display(), "releasing candidate model");
        drop(candidate);
        self.runtime.reclaim();
        let answers = answers?;

        // Grader phase.
        let grading_options = self.grading_options();
        let graded = {
            let grader = self.ensure_grader()?;
            grade(&answers, grader, &grading_options)
        };
        let runtime = self.runtime;
        self.grader.unload(runtime);
        let outcome = graded?;

        self.history.push(VerdictRecord { passed: outcome.passed, percentage: outcome.percentage });
        Ok(outcome.passed)
    }

    fn ensure_grader(&mut self) -> Result<&ModelHandle> {
        if !self.grader.is_loaded() {
            let v = &self.config.validation;
            let spec = plan_load(
                &v.grader_model_dir,
                None,
                v.grader_on_cpu,
                v.quantize_grader,
                &self.policy,
            );
            self.grader.place(self.runtime.load(&spec)?);
        }
        self.grader
            .handle()
            .ok_or_else(|| TrainingError::Config("grader model is not resident".to_string()))
    }

    /// Teardown: unloads the grader if loaded, logs the run history, and
    /// resets it to empty. Safe to call more than once.
    pub fn finish(&mut self) -> RunHistory {
        let runtime = self.runtime;
        self.grader.unload(runtime);
        let history = std::mem::take(&mut self.history);
        if !history.is_empty() {
            info!(history = ?history, "validation statistics");
        }
        history
    }

    fn generation_options(&self) -> GenerationOptions {
        let v = &self.config.validation;
        GenerationOptions { passes: v.passes, max_new_tokens: v.gen_max_tokens }
    }

    fn grading_options(&self) -> GradingOptions {
        let v = &self.config.validation;
        GradingOptions { max_new_tokens: v.gen_max_tokens, expected_percent: v.expected_percent }
    }
}
