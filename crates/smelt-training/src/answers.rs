//! Answer generation: runs every validation case through the candidate
//! model and collects the cleaned-up answers for grading.

use crate::error::Result;
use crate::validation::{PromptKind, ValidationCase};
use smelt_runtime::{ChatTurn, ModelHandle, TemplateMode, Tokenizer};
use tracing::{debug, info};

/// One validation case with its generated answers. Consumed once by
/// grading, then discarded.
#[derive(Debug, Clone)]
pub struct AnswerSet {
    pub case: ValidationCase,
    pub answers: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    /// Generated answers per case.
    pub passes: u32,
    pub max_new_tokens: u32,
}

/// Generates `passes` answers for every case.
///
/// The prompt is built per case kind: chat prompts go through the chat
/// template with the generation marker, chat-completions with continuation
/// semantics, and completion prompts are used verbatim and never trimmed
/// from the output.
pub fn collect_answers(
    handle: &ModelHandle,
    cases: &[ValidationCase],
    options: &GenerationOptions,
) -> Result<Vec<AnswerSet>> {
    let total = cases.len() as u32 * options.passes;
    info!(questions = total, "asking questions");

    let tokenizer = handle.tokenizer.as_ref();
    let mut sets = Vec::with_capacity(cases.len());
    for case in cases {
        let (prompt, trim_prompt) = match case.kind {
            PromptKind::Chat => (
                tokenizer.apply_chat_template(
                    &[ChatTurn::user(case.prompt.clone())],
                    TemplateMode::Generation,
                    None,
                ),
                true,
            ),
            PromptKind::ChatCompletion => (
                tokenizer.apply_chat_template(
                    &[ChatTurn::user(case.prompt.clone())],
                    TemplateMode::Continuation,
                    None,
                ),
                true,
            ),
            PromptKind::Completion => (case.prompt.clone(), false),
        };

        let prompt_ids = tokenizer.encode(&prompt);
        let mut answers = Vec::with_capacity(options.passes as usize);
        for pass in 0..options.passes {
            let output_ids = handle.model.generate(&prompt_ids, options.max_new_tokens)?;
            let output = tokenizer.decode(&output_ids);
            let answer =
                clean_output(output, trim_prompt.then_some(prompt.as_str()), tokenizer);
            debug!(kind = %case.kind, pass, answer = %answer, "generated answer");
            answers.push(answer);
        }
        sets.push(AnswerSet { case: case.clone(), answers });
    }
    Ok(sets)
}

/// Strips the prompt echo (when the prompt kind trims), end-of-sequence
/// markers, and padding markers from decoded output.
pub(crate) fn clean_output(
    mut output: String,
    trimmed_prompt: Option<&str>,
    tokenizer: &dyn Tokenizer,
) -> String {
    if let Some(prompt) = trimmed_prompt {
        output = output.replace(prompt, "");
    }
    if let Some(eos) = tokenizer.eos_token() {
        output = output.replace(eos, "");
    }
    if let Some(pad) = tokenizer.pad_token() {
        output = output.replace(pad, "");
    }
    output.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scripted_handle, WordTokenizer};

    fn case(kind: PromptKind, prompt: &str) -> ValidationCase {
        ValidationCase {
            prompt: prompt.to_string(),
            kind,
            grading_questions: Vec::new(),
            expected_strings: vec!["x".to_string()],
        }
    }

    #[test]
    fn test_chat_prompt_echo_and_eos_are_stripped() {
        let tokenizer = WordTokenizer::new();
        let handle = scripted_handle(&tokenizer, &["The capital is Paris."]);
        let cases = vec![case(PromptKind::Chat, "capital of France?")];

        let sets =
            collect_answers(&handle, &cases, &GenerationOptions { passes: 1, max_new_tokens: 50 })
                .unwrap();
        assert_eq!(sets.len(), 1);
        let answer = sets[0].answers[0].trim();
        assert_eq!(answer, "The capital is Paris.");
        assert!(!answer.contains("[user]"));
        assert!(!answer.contains("</s>"));
    }

    #[test]
    fn test_completion_prompt_is_never_trimmed() {
        let tokenizer = WordTokenizer::new();
        let handle = scripted_handle(&tokenizer, &["time"]);
        let cases = vec![case(PromptKind::Completion, "Once upon a")];

        let sets =
            collect_answers(&handle, &cases, &GenerationOptions { passes: 1, max_new_tokens: 50 })
                .unwrap();
        assert_eq!(sets[0].answers[0], "Once upon a time");
    }

    #[test]
    fn test_pass_count_answers_per_case() {
        let tokenizer = WordTokenizer::new();
        let handle = scripted_handle(&tokenizer, &["one", "two", "three"]);
        let cases = vec![case(PromptKind::Chat, "count")];

        let sets =
            collect_answers(&handle, &cases, &GenerationOptions { passes: 3, max_new_tokens: 10 })
                .unwrap();
        assert_eq!(sets[0].answers.len(), 3);
    }
}
