//! Dataset normalization.
//!
//! Scans a directory of heterogeneous sources (plain text, single Q/A
//! records, multi-turn conversations) and converts everything into one
//! uniform, length-bounded stream of [`EncodedExample`]s. Malformed files
//! are logged and skipped; producing zero examples overall is fatal.

use crate::config::PipelineConfig;
use crate::error::{Result, TrainingError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smelt_runtime::{ChatRole, ChatTurn, TemplateMode, Tokenizer};
use std::path::Path;
use tracing::{debug, info, warn};

/// Tokens reserved for chat-template overhead when chunking plain text.
pub const TEMPLATE_MARGIN: usize = 20;

/// Estimated template overhead per `{user, assistant}` turn pair when
/// packing conversations.
pub const TURN_OVERHEAD_TOKENS: usize = 15;

/// Fixed shuffle seed; normalization output is reproducible across runs.
pub const SHUFFLE_SEED: u64 = 42;

/// Maps record fields to chat roles, in fixed priority order. Column order
/// in the source file never matters.
const FIELD_ROLES: [(&str, ChatRole); 5] = [
    ("history", ChatRole::Assistant),
    ("question", ChatRole::User),
    ("instruct", ChatRole::User),
    ("answer", ChatRole::Assistant),
    ("completion", ChatRole::Assistant),
];

/// One training example: token ids plus an attention mask of equal length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
}

impl EncodedExample {
    #[must_use]
    pub fn from_ids(input_ids: Vec<u32>) -> Self {
        let attention_mask = vec![1; input_ids.len()];
        Self { input_ids, attention_mask }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// How a scanned source file is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    PlainText,
    FieldRecord,
    Conversation,
}

#[derive(Debug, Clone)]
pub struct EncodingOptions {
    /// Hard ceiling on every emitted example, in tokens.
    pub max_seq_length: usize,
    /// Echo each rendered chat template at info level.
    pub show_chat_template: bool,
    pub shuffle_seed: u64,
    /// Chat template text overriding the model's own while encoding.
    pub custom_template: Option<String>,
}

impl EncodingOptions {
    #[must_use]
    pub fn new(max_seq_length: usize) -> Self {
        Self {
            max_seq_length,
            show_chat_template: false,
            shuffle_seed: SHUFFLE_SEED,
            custom_template: None,
        }
    }

    /// Builds encoding options from the pipeline configuration, reading the
    /// custom chat template file when one is configured.
    ///
    /// # Errors
    /// Returns [`TrainingError::Config`] when the template file cannot be
    /// read.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let custom_template = match &config.trainer.custom_prompt_template {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                TrainingError::Config(format!(
                    "cannot read custom prompt template {}: {e}",
                    path.display()
                ))
            })?),
            None => None,
        };
        Ok(Self {
            max_seq_length: config.trainer.max_seq_length,
            show_chat_template: config.operation.show_chat_template,
            shuffle_seed: SHUFFLE_SEED,
            custom_template,
        })
    }
}

/// Scans `dir` and encodes every recognized file into a single shuffled
/// example stream.
///
/// # Errors
/// Returns [`TrainingError::NoData`] when no file yields any example;
/// individual malformed files are logged and skipped instead.
pub fn scan(
    dir: &Path,
    tokenizer: &dyn Tokenizer,
    options: &EncodingOptions,
) -> Result<Vec<EncodedExample>> {
    info!(directory = %dir.display(), "scanning dataset directory");

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    let mut examples = Vec::new();
    for path in &entries {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        info!(file = %name, "scanning dataset file");

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let encoded = match ext.as_str() {
            "txt" => encode_text_file(path, tokenizer, options),
            "json" | "jsonl" => encode_json_file(path, tokenizer, options),
            _ => {
                debug!(file = %name, "skipping file with unrecognized extension");
                continue;
            }
        };

        match encoded {
            Ok(mut file_examples) => examples.append(&mut file_examples),
            Err(e) => warn!(file = %name, error = %e, "cannot load dataset file, skipping"),
        }
    }

    if examples.is_empty() {
        return Err(TrainingError::NoData(format!(
            "no training examples found in {}; check configuration",
            dir.display()
        )));
    }

    let mut rng = StdRng::seed_from_u64(options.shuffle_seed);
    examples.shuffle(&mut rng);
    info!(examples = examples.len(), "dataset normalization complete");
    Ok(examples)
}

fn encode_text_file(
    path: &Path,
    tokenizer: &dyn Tokenizer,
    options: &EncodingOptions,
) -> Result<Vec<EncodedExample>> {
    let content = std::fs::read_to_string(path)?;
    Ok(encode_plain_text(&content, tokenizer, options))
}

fn encode_json_file(
    path: &Path,
    tokenizer: &dyn Tokenizer,
    options: &EncodingOptions,
) -> Result<Vec<EncodedExample>> {
    let records = read_json_records(path)?;
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };

    let Some(format) = classify_record(first) else {
        return Err(TrainingError::MalformedRecord(format!(
            "json dataset {} matches no known field set",
            path.display()
        )));
    };

    let mut examples = Vec::new();
    for (idx, record) in records.iter().enumerate() {
        let encoded = match format {
            SourceFormat::PlainText => {
                let text = record.get("text").map(value_text).unwrap_or_default();
                examples.extend(encode_plain_text(&text, tokenizer, options));
                Ok(())
            }
            SourceFormat::FieldRecord => encode_field_record(record, tokenizer, options)
                .map(|example| examples.extend(example)),
            SourceFormat::Conversation => {
                encode_conversation(record, tokenizer, options, &mut examples)
            }
        };
        if let Err(e) = encoded {
            warn!(file = %path.display(), record = idx, error = %e, "skipping malformed record");
        }
    }
    Ok(examples)
}

/// Classifies a JSON record by its field set: `text` wins, then the Q/A
/// fields, then `conversation`.
fn classify_record(record: &serde_json::Map<String, Value>) -> Option<SourceFormat> {
    if record.contains_key("text") {
        Some(SourceFormat::PlainText)
    } else if FIELD_ROLES.iter().any(|(field, _)| record.contains_key(*field)) {
        Some(SourceFormat::FieldRecord)
    } else if record.contains_key("conversation") {
        Some(SourceFormat::Conversation)
    } else {
        None
    }
}

/// Reads either a top-level JSON array of objects or line-delimited objects.
pub(crate) fn read_json_records(path: &Path) -> Result<Vec<serde_json::Map<String, Value>>> {
    let text = std::fs::read_to_string(path)?;
    let trimmed = text.trim_start();

    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    values
        .into_iter()
        .map(|value| match value {
            Value::Object(map) => Ok(map),
            other => Err(TrainingError::MalformedRecord(format!(
                "expected a json object, got {other}"
            ))),
        })
        .collect()
}

/// Tokenizes `text` and slices it into consecutive non-overlapping windows
/// of `max_seq_length - TEMPLATE_MARGIN` tokens. Concatenating the chunks
/// reproduces the original token stream exactly.
pub fn encode_plain_text(
    text: &str,
    tokenizer: &dyn Tokenizer,
    options: &EncodingOptions,
) -> Vec<EncodedExample> {
    let ids = tokenizer.encode(text);
    if ids.is_empty() {
        return Vec::new();
    }
    let window = options.max_seq_length.saturating_sub(TEMPLATE_MARGIN).max(1);
    ids.chunks(window).map(|chunk| EncodedExample::from_ids(chunk.to_vec())).collect()
}

/// Assembles a chat from a single Q/A record via the fixed field/role table
/// and encodes it. Absent or empty fields are skipped.
fn encode_field_record(
    record: &serde_json::Map<String, Value>,
    tokenizer: &dyn Tokenizer,
    options: &EncodingOptions,
) -> Result<Option<EncodedExample>> {
    let mut chat = Vec::new();
    for (field, role) in FIELD_ROLES {
        if let Some(value) = record.get(field) {
            let content = value_text(value);
            if !content.is_empty() {
                chat.push(ChatTurn { role, content });
            }
        }
    }

    if chat.is_empty() {
        debug!("record has no populated fields, skipping");
        return Ok(None);
    }
    Ok(Some(format_chat(&chat, tokenizer, options)))
}

/// Greedily packs ordered `{user, assistant}` turn pairs into chats.
///
/// First-fit into the current window: a pair that would push the running
/// estimate to `max_seq_length` or beyond closes the window and seeds a
/// fresh chat. The final open chat is always flushed. The policy is
/// deliberately not optimal bin-packing.
fn encode_conversation(
    record: &serde_json::Map<String, Value>,
    tokenizer: &dyn Tokenizer,
    options: &EncodingOptions,
    out: &mut Vec<EncodedExample>,
) -> Result<()> {
    let turns = record
        .get("conversation")
        .and_then(Value::as_array)
        .ok_or_else(|| TrainingError::MalformedRecord("conversation is not an array".to_string()))?;

    let mut chat: Vec<ChatTurn> = Vec::new();
    let mut running = 0usize;
    for turn in turns {
        let pair = turn.as_object().ok_or_else(|| {
            TrainingError::MalformedRecord("conversation turn is not an object".to_string())
        })?;
        let user = pair.get("user").map(value_text).ok_or_else(|| {
            TrainingError::MalformedRecord("conversation turn has no user field".to_string())
        })?;
        let assistant = pair.get("assistant").map(value_text).ok_or_else(|| {
            TrainingError::MalformedRecord("conversation turn has no assistant field".to_string())
        })?;

        let estimate =
            tokenizer.token_count(&user) + tokenizer.token_count(&assistant) + TURN_OVERHEAD_TOKENS;
        if running + estimate >= options.max_seq_length {
            if !chat.is_empty() {
                out.push(format_chat(&chat, tokenizer, options));
                chat.clear();
            }
            running = estimate;
        } else {
            running += estimate;
        }
        chat.push(ChatTurn::user(user));
        chat.push(ChatTurn::assistant(assistant));
    }

    if !chat.is_empty() {
        out.push(format_chat(&chat, tokenizer, options));
    }
    Ok(())
}

fn format_chat(
    chat: &[ChatTurn],
    tokenizer: &dyn Tokenizer,
    options: &EncodingOptions,
) -> EncodedExample {
    let rendered = tokenizer.apply_chat_template(
        chat,
        TemplateMode::Training,
        options.custom_template.as_deref(),
    );
    if options.show_chat_template {
        info!(template = %rendered, "rendered chat template");
    }
    EncodedExample::from_ids(tokenizer.encode(&rendered))
}

/// Stringifies a record field the way the templates expect: strings pass
/// through, null reads as absent, everything else renders as JSON.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::WordTokenizer;
    use tempfile::TempDir;

    fn words(n: usize, prefix: &str) -> String {
        (0..n).map(|i| format!("{prefix}{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_plain_text_chunks_reassemble_exactly() {
        let tokenizer = WordTokenizer::new();
        // Window is max_seq_length - margin = 100; 2 * 100 + 5 tokens.
        let options = EncodingOptions::new(120);
        let text = words(205, "w");

        let chunks = encode_plain_text(&text, &tokenizer, &options);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[1].len(), 100);
        assert_eq!(chunks[2].len(), 5);

        let reassembled: Vec<u32> =
            chunks.iter().flat_map(|c| c.input_ids.iter().copied()).collect();
        assert_eq!(reassembled, tokenizer.encode(&text));
    }

    #[test]
    fn test_attention_mask_matches_ids() {
        let example = EncodedExample::from_ids(vec![3, 1, 4]);
        assert_eq!(example.attention_mask, vec![1, 1, 1]);
        assert_eq!(example.len(), 3);
    }

    #[test]
    fn test_txt_file_scan_yields_three_examples() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("corpus.txt"), words(205, "w")).unwrap();

        let tokenizer = WordTokenizer::new();
        let examples = scan(temp.path(), &tokenizer, &EncodingOptions::new(120)).unwrap();
        assert_eq!(examples.len(), 3);
        let mut lengths: Vec<_> = examples.iter().map(EncodedExample::len).collect();
        lengths.sort_unstable();
        assert_eq!(lengths, vec![5, 100, 100]);
    }

    #[test]
    fn test_json_text_records_use_plain_text_path() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("data.jsonl"),
            format!("{{\"text\": \"{}\"}}\n{{\"text\": \"tiny record\"}}\n", words(150, "t")),
        )
        .unwrap();

        let tokenizer = WordTokenizer::new();
        let examples = scan(temp.path(), &tokenizer, &EncodingOptions::new(120)).unwrap();
        // 150 tokens -> windows of 100 + 50, plus the two-token record.
        assert_eq!(examples.len(), 3);
    }

    #[test]
    fn test_field_record_role_table_order() {
        let record: serde_json::Map<String, Value> = serde_json::from_str(
            r#"{"completion": "the end", "question": "what now", "history": "so far"}"#,
        )
        .unwrap();

        let tokenizer = WordTokenizer::new();
        let options = EncodingOptions::new(512);
        let example = encode_field_record(&record, &tokenizer, &options).unwrap().unwrap();

        // Fixed priority order, regardless of column order in the source.
        let rendered = tokenizer.decode(&example.input_ids);
        assert_eq!(rendered, "[assistant] so far [user] what now [assistant] the end");
    }

    #[test]
    fn test_field_record_skips_absent_and_empty_fields() {
        let record: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{"question": "q", "answer": "", "history": null}"#).unwrap();

        let tokenizer = WordTokenizer::new();
        let example =
            encode_field_record(&record, &tokenizer, &EncodingOptions::new(512)).unwrap().unwrap();
        assert_eq!(tokenizer.decode(&example.input_ids), "[user] q");
    }

    fn conversation_record(pairs: &[(String, String)]) -> serde_json::Map<String, Value> {
        let turns: Vec<Value> = pairs
            .iter()
            .map(|(u, a)| serde_json::json!({"user": u, "assistant": a}))
            .collect();
        let mut record = serde_json::Map::new();
        record.insert("conversation".to_string(), Value::Array(turns));
        record
    }

    #[test]
    fn test_conversation_greedy_packing() {
        // Each pair estimates 5 + 5 + 15 = 25 tokens; ceiling 60.
        // p1: 25, p2: 50, p3 would hit 75 -> flush [p1, p2], seed p3, p4: 50.
        let pairs: Vec<_> =
            (0..4).map(|i| (words(5, &format!("u{i}x")), words(5, &format!("a{i}x")))).collect();
        let record = conversation_record(&pairs);

        let tokenizer = WordTokenizer::new();
        let mut out = Vec::new();
        encode_conversation(&record, &tokenizer, &EncodingOptions::new(60), &mut out).unwrap();

        assert_eq!(out.len(), 2);
        for example in &out {
            let rendered = tokenizer.decode(&example.input_ids);
            assert_eq!(rendered.matches("[user]").count(), 2);
            assert_eq!(rendered.matches("[assistant]").count(), 2);
        }
    }

    #[test]
    fn test_conversation_window_closes_at_exact_boundary() {
        // running + estimate == max_seq_length closes the window (>=, not >).
        // Pairs estimate 25; ceiling 50: every second pair triggers a flush.
        let pairs: Vec<_> =
            (0..3).map(|i| (words(5, &format!("u{i}x")), words(5, &format!("a{i}x")))).collect();
        let record = conversation_record(&pairs);

        let tokenizer = WordTokenizer::new();
        let mut out = Vec::new();
        encode_conversation(&record, &tokenizer, &EncodingOptions::new(50), &mut out).unwrap();

        // Each pair lands in its own chat.
        assert_eq!(out.len(), 3);
        for example in &out {
            assert_eq!(tokenizer.decode(&example.input_ids).matches("[user]").count(), 1);
        }
    }

    #[test]
    fn test_oversized_pair_gets_fresh_chat_not_dropped() {
        let record = conversation_record(&[(words(40, "u"), words(40, "a"))]);

        let tokenizer = WordTokenizer::new();
        let mut out = Vec::new();
        encode_conversation(&record, &tokenizer, &EncodingOptions::new(50), &mut out).unwrap();

        // One oversized pair: exactly one chat, never an empty flush.
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_empty());
    }

    #[test]
    fn test_custom_template_changes_rendered_corpus() {
        let record: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{"question": "q", "answer": "a"}"#).unwrap();

        let tokenizer = WordTokenizer::new();
        let mut options = EncodingOptions::new(512);
        options.custom_template = Some("<{role}> : {content}".to_string());
        let example = encode_field_record(&record, &tokenizer, &options).unwrap().unwrap();
        assert_eq!(tokenizer.decode(&example.input_ids), "<user> : q <assistant> : a");

        let plain =
            encode_field_record(&record, &tokenizer, &EncodingOptions::new(512)).unwrap().unwrap();
        assert_ne!(example.input_ids, plain.input_ids);
    }

    #[test]
    fn test_options_from_config_read_template_file() {
        let temp = TempDir::new().unwrap();
        let template_path = temp.path().join("template.jinja");
        std::fs::write(&template_path, "<{role}> {content}").unwrap();

        let text = format!(
            r#"
            [trainer]
            train = true
            store_adapter = true
            base_model_dir = "/models/base"
            dataset_dir = "/data/train"
            workdir = "/work"
            adapter_dir = "/out/adapter"
            max_seq_length = 256
            custom_prompt_template = "{}"
            "#,
            template_path.display()
        );
        let mut config = PipelineConfig::from_toml_str(&text).unwrap();

        let options = EncodingOptions::from_config(&config).unwrap();
        assert_eq!(options.max_seq_length, 256);
        assert_eq!(options.custom_template.as_deref(), Some("<{role}> {content}"));

        // An unreadable template file is a configuration error.
        config.trainer.custom_prompt_template = Some(temp.path().join("missing.jinja"));
        assert!(matches!(
            EncodingOptions::from_config(&config),
            Err(TrainingError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_skipped_not_fatal() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("bad.json"), "{not json at all").unwrap();
        std::fs::write(temp.path().join("odd.json"), r#"{"flavor": "unknown"}"#).unwrap();
        std::fs::write(temp.path().join("good.jsonl"), r#"{"question": "q", "answer": "a"}"#)
            .unwrap();

        let tokenizer = WordTokenizer::new();
        let examples = scan(temp.path(), &tokenizer, &EncodingOptions::new(512)).unwrap();
        assert_eq!(examples.len(), 1);
    }

    #[test]
    fn test_empty_directory_is_no_data() {
        let temp = TempDir::new().unwrap();
        let tokenizer = WordTokenizer::new();
        let result = scan(temp.path(), &tokenizer, &EncodingOptions::new(512));
        assert!(matches!(result, Err(TrainingError::NoData(_))));
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("corpus.txt"), words(500, "w")).unwrap();

        let tokenizer = WordTokenizer::new();
        let options = EncodingOptions::new(70);
        let first = scan(temp.path(), &tokenizer, &options).unwrap();
        let second = scan(temp.path(), &tokenizer, &options).unwrap();
        assert_eq!(first, second);
    }
}
