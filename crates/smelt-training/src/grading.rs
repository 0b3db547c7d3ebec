//! Grading: turns generated answers into pass/fail statistics.
//!
//! Grading questions are put to a second "grader" model, whose structured
//! output is unreliable by nature. The three-tier verdict parse below is a
//! deliberate resilience policy, not a workaround: strict JSON first, then
//! literal-pattern recovery, then a logged failure. A malformed judgment is
//! never fatal; it counts as a failed evaluation.

use crate::answers::{clean_output, AnswerSet};
use crate::error::Result;
use smelt_runtime::{ChatTurn, ModelHandle, TemplateMode};
use tracing::{debug, error, info, warn};

/// System instruction for the binary-judgment prompt.
const GRADER_SYSTEM_PROMPT: &str = r#"You are a grader that evaluates the relevance of a given text to a user question.
Please provide a binary response 'true' or 'false' for the following text.
'true' means that the text provides a truthful answer to the question, while 'false' means that it does not.
Provide no preamble and a short explanation. Return the response in JSON format with the following field: "passed", "explanation""#;

/// Literal patterns accepted when the grader's JSON is malformed but the
/// verdict is still recognizable.
const PASS_PATTERNS: [&str; 4] =
    ["\"passed\": true", "\"passed\":true", "\"passed\": \"true\"", "\"passed\":\"true\""];

/// Running totals across one grading run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerdictStatistics {
    pub attempted: usize,
    pub passed: usize,
}

impl VerdictStatistics {
    /// Pass rate in percent, floored to an integer.
    #[must_use]
    pub fn score_percent(&self) -> u32 {
        if self.attempted == 0 {
            0
        } else {
            (self.passed * 100 / self.attempted) as u32
        }
    }
}

/// The result of one grading run.
#[derive(Debug, Clone, Copy)]
pub struct GradeOutcome {
    pub passed: bool,
    pub percentage: u32,
    pub stats: VerdictStatistics,
}

#[derive(Debug, Clone, Copy)]
pub struct GradingOptions {
    pub max_new_tokens: u32,
    /// Pass threshold, percent.
    pub expected_percent: u32,
}

/// How a grader judgment was extracted from the model's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerdictParse {
    /// Well-formed JSON object with a `passed` field.
    Json(bool),
    /// Invalid JSON, but the `passed` field was recognizable.
    Recovered(bool),
    /// Nothing usable; counts as a failed evaluation.
    Unparseable,
}

/// Extracts a boolean verdict from free-form grader output.
///
/// Tier 1 parses the first `{...}` span as JSON and reads `passed`
/// (stringified, case-insensitive). Tier 2 falls back to scanning for the
/// literal pass patterns whenever a quoted `passed` appears. Tier 3 gives up.
pub(crate) fn parse_grader_verdict(output: &str) -> VerdictParse {
    if let (Some(start), Some(end)) = (output.find('{'), output.find('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&output[start..=end]) {
                if let Some(passed) = value.get("passed") {
                    let text = match passed {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    return VerdictParse::Json(text.to_lowercase().contains("true"));
                }
            }
        }
    }

    let lower = output.to_lowercase();
    if lower.contains("\"passed\"") {
        VerdictParse::Recovered(PASS_PATTERNS.iter().any(|pattern| lower.contains(pattern)))
    } else {
        VerdictParse::Unparseable
    }
}

/// Asks the grader model whether `answer` truthfully addresses `question`.
///
/// # Errors
/// Only on generation failure; unparseable judgments are logged and read
/// as fail.
fn judge_answer(
    grader: &ModelHandle,
    answer: &str,
    question: &str,
    max_new_tokens: u32,
) -> Result<bool> {
    let chat = [
        ChatTurn::system(GRADER_SYSTEM_PROMPT),
        ChatTurn::user(format!("The text is: '{answer}'\nThe question is: '{question}'")),
    ];
    let tokenizer = grader.tokenizer.as_ref();
    let prompt = tokenizer.apply_chat_template(&chat, TemplateMode::Generation, None);
    let output_ids = grader.model.generate(&tokenizer.encode(&prompt), max_new_tokens)?;
    let output = clean_output(tokenizer.decode(&output_ids), Some(prompt.as_str()), tokenizer);

    Ok(match parse_grader_verdict(&output) {
        VerdictParse::Json(passed) => passed,
        VerdictParse::Recovered(passed) => {
            warn!(output = %output, "grader json malformed but parseable");
            passed
        }
        VerdictParse::Unparseable => {
            error!(output = %output, "cannot parse grader output");
            false
        }
    })
}

/// Grades every answer set and produces the run verdict.
///
/// A case contributes one evaluation slot for its grading questions (OR
/// across questions) and one for its expected substrings (OR across
/// substrings, grader never consulted). Cases with neither are not counted.
pub fn grade(
    answer_sets: &[AnswerSet],
    grader: &ModelHandle,
    options: &GradingOptions,
) -> Result<GradeOutcome> {
    info!("grading");
    let mut stats = VerdictStatistics::default();

    for set in answer_sets {
        debug!(kind = %set.case.kind, prompt = %set.case.prompt, "grading case");
        for answer in &set.answers {
            if !set.case.grading_questions.is_empty() {
                stats.attempted += 1;
                let mut case_passed = false;
                for question in &set.case.grading_questions {
                    let passed = judge_answer(grader, answer, question, options.max_new_tokens)?;
                    debug!(question = %question, passed, "grader judgment");
                    case_passed |= passed;
                }
                if case_passed {
                    stats.passed += 1;
                }
            }

            if !set.case.expected_strings.is_empty() {
                stats.attempted += 1;
                let answer_lower = answer.to_lowercase();
                let found = set
                    .case
                    .expected_strings
                    .iter()
                    .any(|expected| answer_lower.contains(&expected.to_lowercase()));
                if found {
                    stats.passed += 1;
                }
            }
        }
    }

    if stats.attempted == 0 {
        warn!("grading run had no evaluation slots");
    }
    let percentage = stats.score_percent();
    let passed = percentage >= options.expected_percent;
    info!(
        passed_evaluations = stats.passed,
        attempted_evaluations = stats.attempted,
        percentage,
        verdict = if passed { "PASSED" } else { "FAILED" },
        "grading result"
    );
    Ok(GradeOutcome { passed, percentage, stats })
}
