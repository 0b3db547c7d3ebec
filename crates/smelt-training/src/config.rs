//! Pipeline configuration.
//!
//! The configuration file is TOML with one table per pipeline stage. Parsing
//! is lenient about omitted keys (serde defaults mirror the tool's historical
//! defaults); `validate` and `preflight` reject combinations that would only
//! fail after expensive work had already happened.

use crate::error::{Result, TrainingError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub operation: OperationConfig,
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub lora: LoraConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub merger: MergerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Device target as the runtime names it; "cpu" disables acceleration.
    pub device: String,
    pub purge_target_directories: bool,
    /// Echo rendered chat templates while encoding, for debugging datasets.
    pub show_chat_template: bool,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            purge_target_directories: false,
            show_chat_template: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainerConfig {
    pub train: bool,
    pub store_adapter: bool,
    pub base_model_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub workdir: PathBuf,
    pub adapter_dir: PathBuf,
    /// Hard ceiling on every encoded example, in tokens.
    pub max_seq_length: usize,
    /// Chat template file overriding the model's own while encoding the
    /// dataset.
    #[serde(default)]
    pub custom_prompt_template: Option<PathBuf>,
    #[serde(default)]
    pub epochs: Option<u32>,
    #[serde(default)]
    pub per_device_batch_size: Option<u32>,
    #[serde(default)]
    pub auto_batch_size: bool,
    #[serde(default)]
    pub gradient_accumulation_steps: Option<u32>,
    #[serde(default)]
    pub gradient_checkpointing: bool,
    #[serde(default)]
    pub group_by_length: bool,
    #[serde(default)]
    pub packing: bool,
    #[serde(default)]
    pub optimizer: Option<String>,
    #[serde(default)]
    pub scheduler: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Enables quantized loads across the pipeline (QLoRA-style training).
    pub q_lora: bool,
    pub rank: u32,
    pub alpha: u32,
    pub dropout: f64,
    pub bias: String,
    pub task_type: String,
    pub target_layers: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            q_lora: false,
            rank: 64,
            alpha: 16,
            dropout: 0.1,
            bias: "none".to_string(),
            task_type: "CAUSAL_LM".to_string(),
            target_layers: vec!["q_proj".to_string(), "k_proj".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub validate: bool,
    /// Grade the resident training model after every pass instead of a
    /// reloaded copy after training completes.
    pub in_place: bool,
    pub abort_on_fail: bool,
    /// Generated answers per validation case.
    pub passes: u32,
    pub gen_max_tokens: u32,
    /// Pass threshold, percent.
    pub expected_percent: u32,
    pub quantize_model: bool,
    pub quantize_grader: bool,
    pub grader_on_cpu: bool,
    pub validation_dir: PathBuf,
    pub grader_model_dir: PathBuf,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            validate: false,
            in_place: false,
            abort_on_fail: false,
            passes: 10,
            gen_max_tokens: 100,
            expected_percent: 70,
            quantize_model: false,
            quantize_grader: false,
            grader_on_cpu: false,
            validation_dir: PathBuf::new(),
            grader_model_dir: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    pub merge_full: bool,
    pub full_model_dir: PathBuf,
}

impl PipelineConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    /// Returns `TrainingError::Config` on parse failure or invalid settings.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| TrainingError::Config(format!("cannot parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    /// Returns `TrainingError::Config` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::Config(format!(
                "cannot read configuration file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Structural checks on individual settings.
    pub fn validate(&self) -> Result<()> {
        if self.trainer.max_seq_length == 0 {
            return Err(TrainingError::Config("trainer.max_seq_length must be >= 1".to_string()));
        }
        if self.validation.passes == 0 {
            return Err(TrainingError::Config("validation.passes must be >= 1".to_string()));
        }
        if self.validation.expected_percent > 100 {
            return Err(TrainingError::Config(
                "validation.expected_percent must be <= 100".to_string(),
            ));
        }
        Ok(())
    }

    /// Cross-setting checks that must fail before any training work begins.
    pub fn preflight(&self) -> Result<()> {
        if self.validation.validate && !self.validation.in_place && !self.trainer.store_adapter {
            return Err(TrainingError::Config(
                "validation requires trainer.store_adapter (the adapter is reloaded from disk)"
                    .to_string(),
            ));
        }
        if self.merger.merge_full && !self.trainer.store_adapter {
            return Err(TrainingError::Config(
                "merger.merge_full requires trainer.store_adapter".to_string(),
            ));
        }
        Ok(())
    }
}
