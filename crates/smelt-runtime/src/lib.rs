//! Model runtime abstraction for smelt.
//!
//! This crate defines the trait seam between the fine-tuning pipeline and the
//! tensor/model-serving runtime that actually holds weights in memory. The
//! pipeline only ever sees three capabilities: load a model, run generation,
//! free a model. Everything else (weight formats, the tokenization algorithm,
//! adapter mathematics) lives behind these traits.

pub mod device;
pub mod lifecycle;

pub use device::{Device, DevicePolicy, Precision, QuantScheme, Quantization};
pub use lifecycle::{plan_load, LoadSpec, ModelSlot};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Represents an error raised by the model runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Loading weights or a tokenizer from disk failed.
    #[error("Load Error: {0}")]
    Load(String),

    /// Token generation failed.
    #[error("Generation Error: {0}")]
    Generation(String),

    /// I/O errors surfaced by the runtime.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The role of a single turn in a chat transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One role-tagged message in a chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// How a chat template is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateMode {
    /// Render the transcript as-is (training corpus formatting).
    Training,
    /// Append the generation-prompt marker so the model answers next.
    Generation,
    /// Continue the final message in place; no generation marker.
    Continuation,
}

/// A tokenizer owned by a loaded model.
///
/// `encode`/`decode` are total functions here; tokenizers that can fail load
/// inside [`ModelRuntime::load`] instead.
pub trait Tokenizer: Send + Sync {
    /// Converts text into token ids.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Converts token ids back into text.
    fn decode(&self, ids: &[u32]) -> String;

    /// Number of tokens `text` encodes to.
    fn token_count(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    /// Renders a chat transcript through the model's chat template, or
    /// through `template` when a caller-supplied override is given.
    fn apply_chat_template(
        &self,
        chat: &[ChatTurn],
        mode: TemplateMode,
        template: Option<&str>,
    ) -> String;

    /// The end-of-sequence marker, if the model defines one.
    fn eos_token(&self) -> Option<&str>;

    /// The padding marker, if the model defines one.
    fn pad_token(&self) -> Option<&str>;
}

/// A loaded causal language model.
pub trait LanguageModel: Send + Sync {
    /// Generates a continuation for `prompt_ids`.
    ///
    /// Returns the full output sequence, prompt echo included, as model
    /// runtimes conventionally do. Callers strip the echo where needed.
    ///
    /// # Errors
    /// Returns a [`RuntimeError`] if generation fails.
    fn generate(&self, prompt_ids: &[u32], max_new_tokens: u32) -> Result<Vec<u32>, RuntimeError>;
}

/// Exclusive ownership of resident model weights plus their tokenizer.
///
/// Dropping the handle releases the runtime's references; use
/// [`ModelSlot::unload`] to also trigger resource reclamation.
pub struct ModelHandle {
    pub model: Box<dyn LanguageModel>,
    pub tokenizer: Box<dyn Tokenizer>,
    /// Where the weights were loaded from, for diagnostics.
    pub source: PathBuf,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("source", &self.source).finish_non_exhaustive()
    }
}

/// The opaque model-serving runtime.
pub trait ModelRuntime: Send + Sync {
    /// Loads a model (and optionally an adapter) according to `spec`.
    ///
    /// # Errors
    /// Returns a [`RuntimeError`] if the weights cannot be loaded.
    fn load(&self, spec: &LoadSpec) -> Result<ModelHandle, RuntimeError>;

    /// Reclaims freed resources (garbage collection, device-cache reset).
    ///
    /// Called after a handle is dropped; a no-op by default.
    fn reclaim(&self) {}
}
