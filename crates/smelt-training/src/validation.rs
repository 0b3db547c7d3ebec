//! Validation cases: the prompts and expectations the grading pipeline
//! runs against a candidate model.

use crate::dataset::read_json_records;
use crate::error::{Result, TrainingError};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

/// Which prompt field a case was built from, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Chat template with the generation-prompt marker appended.
    Chat,
    /// Chat template with continuation semantics, no marker.
    ChatCompletion,
    /// Raw string used verbatim; never trimmed from the output.
    Completion,
}

impl std::fmt::Display for PromptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::ChatCompletion => write!(f, "chatCompletion"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

/// One validation item, read-only during grading.
#[derive(Debug, Clone)]
pub struct ValidationCase {
    pub prompt: String,
    pub kind: PromptKind,
    /// Grading questions put to the grader model; any-of semantics.
    pub grading_questions: Vec<String>,
    /// Literal substrings expected in the answer; any-of semantics.
    pub expected_strings: Vec<String>,
}

/// Source record shape: `chat` / `chatCompletion` / `completion` (at most
/// one populated, checked in that order), `oneOf`, `string`.
#[derive(Debug, Deserialize)]
struct RawCase {
    #[serde(default)]
    chat: Option<String>,
    #[serde(default, rename = "chatCompletion")]
    chat_completion: Option<String>,
    #[serde(default)]
    completion: Option<String>,
    #[serde(default, rename = "oneOf")]
    one_of: Option<Vec<String>>,
    #[serde(default)]
    string: Option<Vec<String>>,
}

impl RawCase {
    fn into_case(self) -> Option<ValidationCase> {
        let populated = |field: Option<String>| field.filter(|s| !s.is_empty());

        let (prompt, kind) = if let Some(prompt) = populated(self.chat) {
            (prompt, PromptKind::Chat)
        } else if let Some(prompt) = populated(self.chat_completion) {
            (prompt, PromptKind::ChatCompletion)
        } else if let Some(prompt) = populated(self.completion) {
            (prompt, PromptKind::Completion)
        } else {
            return None;
        };

        Some(ValidationCase {
            prompt,
            kind,
            grading_questions: self.one_of.unwrap_or_default(),
            expected_strings: self.string.unwrap_or_default(),
        })
    }
}

/// Loads every validation case from the `.json`/`.jsonl` files in `dir`.
///
/// Malformed files are logged and skipped; records without a populated
/// prompt are skipped with a warning.
///
/// # Errors
/// Returns [`TrainingError::NoData`] when the directory yields no cases.
pub fn load_validation_dir(dir: &Path) -> Result<Vec<ValidationCase>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
                    .is_some_and(|ext| ext == "json" || ext == "jsonl")
        })
        .collect();
    entries.sort();

    let mut cases = Vec::new();
    for path in &entries {
        let records = match read_json_records(path) {
            Ok(records) => records,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "cannot load validation file, skipping");
                continue;
            }
        };

        for (idx, record) in records.into_iter().enumerate() {
            let raw: RawCase = match serde_json::from_value(Value::Object(record)) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        record = idx,
                        error = %e,
                        "skipping malformed validation record"
                    );
                    continue;
                }
            };
            match raw.into_case() {
                Some(case) => cases.push(case),
                None => {
                    warn!(
                        file = %path.display(),
                        record = idx,
                        "validation record has no prompt, skipping"
                    );
                }
            }
        }
    }

    if cases.is_empty() {
        return Err(TrainingError::NoData(format!(
            "no validation cases found in {}",
            dir.display()
        )));
    }
    info!(cases = cases.len(), "loaded validation cases");
    Ok(cases)
}
