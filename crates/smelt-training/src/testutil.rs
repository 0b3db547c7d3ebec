//! Shared fakes for unit tests: a whitespace tokenizer, a scripted model,
//! and a runtime that vends pre-built handles.

use smelt_runtime::{
    ChatTurn, LanguageModel, LoadSpec, ModelHandle, ModelRuntime, RuntimeError, TemplateMode,
    Tokenizer,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Tokenizer over a dynamic whitespace-delimited vocabulary. Clones share
/// the vocabulary, so a model and its tokenizer agree on ids.
#[derive(Clone, Default)]
pub struct WordTokenizer {
    vocab: Arc<Mutex<Vec<String>>>,
}

impl WordTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&self, word: &str) -> u32 {
        let mut vocab = self.vocab.lock().unwrap();
        if let Some(idx) = vocab.iter().position(|w| w == word) {
            idx as u32
        } else {
            vocab.push(word.to_string());
            (vocab.len() - 1) as u32
        }
    }
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace().map(|w| self.intern(w)).collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        let vocab = self.vocab.lock().unwrap();
        ids.iter()
            .map(|&id| vocab.get(id as usize).cloned().unwrap_or_else(|| "<unk>".to_string()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn apply_chat_template(
        &self,
        chat: &[ChatTurn],
        mode: TemplateMode,
        template: Option<&str>,
    ) -> String {
        let turn_format = template.unwrap_or("[{role}] {content}");
        let mut rendered = chat
            .iter()
            .map(|turn| {
                turn_format
                    .replace("{role}", &turn.role.to_string())
                    .replace("{content}", &turn.content)
            })
            .collect::<Vec<_>>()
            .join(" ");
        if mode == TemplateMode::Generation {
            rendered.push_str(" [assistant]");
        }
        rendered
    }

    fn eos_token(&self) -> Option<&str> {
        Some("</s>")
    }

    fn pad_token(&self) -> Option<&str> {
        Some("<pad>")
    }
}

/// Model that answers each `generate` call with the next scripted reply,
/// echoing the prompt first the way real runtimes do.
pub struct ScriptedModel {
    tokenizer: WordTokenizer,
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    pub fn new(tokenizer: WordTokenizer, replies: &[&str]) -> Self {
        Self {
            tokenizer,
            replies: Mutex::new(replies.iter().map(|r| (*r).to_string()).collect()),
        }
    }
}

impl LanguageModel for ScriptedModel {
    fn generate(&self, prompt_ids: &[u32], _max_new_tokens: u32) -> Result<Vec<u32>, RuntimeError> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RuntimeError::Generation("no scripted reply left".to_string()))?;
        let mut out = prompt_ids.to_vec();
        out.extend(self.tokenizer.encode(&reply));
        out.extend(self.tokenizer.encode("</s>"));
        Ok(out)
    }
}

pub fn scripted_handle(tokenizer: &WordTokenizer, replies: &[&str]) -> ModelHandle {
    ModelHandle {
        model: Box::new(ScriptedModel::new(tokenizer.clone(), replies)),
        tokenizer: Box::new(tokenizer.clone()),
        source: PathBuf::from("/models/scripted"),
    }
}

/// Runtime that vends pre-built handles in order and records what it saw.
#[derive(Default)]
pub struct FakeRuntime {
    handles: Mutex<VecDeque<ModelHandle>>,
    pub loads: Mutex<Vec<LoadSpec>>,
    pub reclaims: AtomicUsize,
}

impl FakeRuntime {
    pub fn with_handles(handles: Vec<ModelHandle>) -> Self {
        Self { handles: Mutex::new(handles.into()), ..Self::default() }
    }
}

impl ModelRuntime for FakeRuntime {
    fn load(&self, spec: &LoadSpec) -> Result<ModelHandle, RuntimeError> {
        self.loads.lock().unwrap().push(spec.clone());
        self.handles
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RuntimeError::Load("no handle staged for load".to_string()))
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}
