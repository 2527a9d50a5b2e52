//! Test doubles for the model runtime.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use parking_lot::Mutex;

use super::config::DecoderConfig;
use super::decoder::CausalDecoder;
use super::error::ModelError;
use super::generation::DecoderGenerator;
use super::loader::{LoadedModel, ModelLoader};
use super::traits::{TextGenerator, TokenCodec};

const ALPHABET: &[char] = &[
    ' ', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q',
    'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0',
    '1', '2', '3', '4', '5', '6', '7', '8', '9', '.', ',', '?', '!', ':', '-', '\'', '\n',
];

/// One-character-per-token tokenizer.
///
/// Regular ids occupy `0..vocab_size - specials`; each decodes to a single character.
/// Special tokens take the top ids, are never produced by `encode`, and are dropped by
/// `decode` when `skip_special_tokens` is set.
#[derive(Debug, Clone)]
pub struct CharTokenizer {
    vocab_size: usize,
    specials: Vec<String>,
}

impl CharTokenizer {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            specials: Vec::new(),
        }
    }

    pub fn with_special_tokens(mut self, tokens: &[&str]) -> Self {
        self.specials = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    fn regular_count(&self) -> usize {
        self.vocab_size.saturating_sub(self.specials.len()).max(1)
    }
}

impl TokenCodec for CharTokenizer {
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>, ModelError> {
        let regular = self.regular_count();
        Ok(text
            .chars()
            .map(|c| {
                let position = ALPHABET.iter().position(|&a| a == c).unwrap_or(0);
                (position % regular) as u32
            })
            .collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ModelError> {
        let regular = self.regular_count();
        let mut text = String::new();
        for &id in ids {
            let id = id as usize;
            if id >= self.vocab_size {
                return Err(ModelError::TokenizationFailed {
                    reason: format!("token id {} outside vocabulary of {}", id, self.vocab_size),
                });
            }
            if id >= regular {
                if !skip_special_tokens {
                    text.push_str(&self.specials[id - regular]);
                }
                continue;
            }
            text.push(ALPHABET[id % ALPHABET.len()]);
        }
        Ok(text)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.specials
            .iter()
            .position(|s| s == token)
            .map(|i| (self.regular_count() + i) as u32)
    }
}

type JudgeRule = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Generator returning canned text and recording every prompt it receives.
pub struct ScriptedGenerator {
    completion: String,
    judge: JudgeRule,
    fail_completion: bool,
    fail_chat: bool,
    prompts: Mutex<Vec<String>>,
    completions: AtomicUsize,
}

impl ScriptedGenerator {
    /// Completes every prompt with `completion` and answers every chat with `judge_reply`.
    pub fn new(completion: impl Into<String>, judge_reply: impl Into<String>) -> Self {
        let judge_reply = judge_reply.into();
        Self {
            completion: completion.into(),
            judge: Box::new(move |_| judge_reply.clone()),
            fail_completion: false,
            fail_chat: false,
            prompts: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
        }
    }

    /// Answers chats with `rule(prompt)`.
    pub fn with_judge<F>(mut self, rule: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.judge = Box::new(rule);
        self
    }

    pub fn failing_completion(mut self) -> Self {
        self.fail_completion = true;
        self
    }

    pub fn failing_chat(mut self) -> Self {
        self.fail_chat = true;
        self
    }

    /// Chat prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn completion_calls(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

impl TextGenerator for ScriptedGenerator {
    fn complete_embeddings(
        &self,
        inputs_embeds: &Tensor,
        _max_new_tokens: usize,
    ) -> Result<String, ModelError> {
        inputs_embeds.dims3()?;
        self.completions.fetch_add(1, Ordering::SeqCst);
        if self.fail_completion {
            return Err(ModelError::GenerationFailed {
                reason: "scripted completion failure".to_string(),
            });
        }
        Ok(self.completion.clone())
    }

    fn chat(&self, prompt: &str, _max_new_tokens: usize) -> Result<String, ModelError> {
        self.prompts.lock().push(prompt.to_string());
        if self.fail_chat {
            return Err(ModelError::GenerationFailed {
                reason: "scripted chat failure".to_string(),
            });
        }
        Ok((self.judge)(prompt))
    }
}

/// Loader producing randomly initialised tiny decoders.
pub struct MockModelLoader {
    hidden_size: usize,
    vocab_size: usize,
    load_delay: Option<Duration>,
    failures_remaining: AtomicUsize,
    generator: Option<Arc<dyn TextGenerator>>,
    tokenizer: Option<Arc<dyn TokenCodec>>,
    loads: AtomicUsize,
}

impl Default for MockModelLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModelLoader {
    pub const DEFAULT_HIDDEN_SIZE: usize = 16;
    pub const DEFAULT_VOCAB_SIZE: usize = 96;

    pub fn new() -> Self {
        Self {
            hidden_size: Self::DEFAULT_HIDDEN_SIZE,
            vocab_size: Self::DEFAULT_VOCAB_SIZE,
            load_delay: None,
            failures_remaining: AtomicUsize::new(0),
            generator: None,
            tokenizer: None,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    /// Sleeps inside every load, widening the window for concurrent callers.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Fails the next `count` loads.
    pub fn failing_times(self, count: usize) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Replaces the decoder-backed generator with `generator`.
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Replaces the character tokenizer with `tokenizer`.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TokenCodec>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Number of load attempts, failed ones included.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockModelLoader {
    fn load(&self, identifier: &str, device: &Device) -> Result<LoadedModel, ModelError> {
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ModelError::ModelLoadFailed {
                reason: format!("injected failure loading '{}'", identifier),
            });
        }

        let config = DecoderConfig::tiny(self.hidden_size, self.vocab_size);
        let model = Arc::new(CausalDecoder::random(&config, DType::F32, device)?);
        let tokenizer: Arc<dyn TokenCodec> = match &self.tokenizer {
            Some(tokenizer) => tokenizer.clone(),
            None => Arc::new(CharTokenizer::new(self.vocab_size)),
        };
        let generator = match &self.generator {
            Some(generator) => generator.clone(),
            None => Arc::new(DecoderGenerator::new(model.clone(), tokenizer.clone())),
        };

        Ok(LoadedModel {
            model,
            tokenizer,
            generator,
        })
    }
}

/// Words of the on-disk fixture vocabulary. Ids 0 and 1 are `<unk>` and `</s>`; word `i`
/// has id `i + 2`.
pub const FIXTURE_WORDS: &[&str] = &[
    "The", "capital", "of", "France", "is", "Paris", ".", "London", "yes", "no", "Task",
    "description", ":", "-", "Ground", "truth", "completion", "Model", "I", "dont", "know",
];

/// Vocabulary size of [`fixture_tokenizer_json`], special tokens included.
pub fn fixture_vocab_size() -> usize {
    FIXTURE_WORDS.len() + 2
}

/// `tokenizer.json` for a whitespace-split word-level tokenizer over [`FIXTURE_WORDS`].
pub fn fixture_tokenizer_json() -> String {
    let mut vocab = serde_json::Map::new();
    vocab.insert("<unk>".to_string(), 0.into());
    vocab.insert("</s>".to_string(), 1.into());
    for (index, word) in FIXTURE_WORDS.iter().enumerate() {
        vocab.insert((*word).to_string(), (index + 2).into());
    }

    let special = |id: u32, content: &str| {
        serde_json::json!({
            "id": id,
            "content": content,
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        })
    };

    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0, "<unk>"), special(1, "</s>")],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    })
    .to_string()
}

/// Writes a complete single-file checkpoint (`config.json`, `tokenizer.json`,
/// `model.safetensors`) with random weights into `dir`.
pub fn write_fixture_checkpoint(dir: &Path, hidden_size: usize) -> Result<(), ModelError> {
    std::fs::create_dir_all(dir)?;

    let vocab_size = fixture_vocab_size();
    let config = DecoderConfig::tiny(hidden_size, vocab_size);

    let config_json = serde_json::json!({
        "hidden_size": config.hidden_size,
        "intermediate_size": config.intermediate_size,
        "num_hidden_layers": config.num_hidden_layers,
        "num_attention_heads": config.num_attention_heads,
        "num_key_value_heads": config.num_key_value_heads,
        "rms_norm_eps": config.rms_norm_eps,
        "rope_theta": config.rope_theta,
        "vocab_size": vocab_size,
        "max_position_embeddings": config.max_position_embeddings,
        "tie_word_embeddings": config.tie_word_embeddings,
        "attention_bias": false,
        "eos_token_id": 1
    });
    std::fs::write(dir.join("config.json"), config_json.to_string())?;
    std::fs::write(dir.join("tokenizer.json"), fixture_tokenizer_json())?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    CausalDecoder::load(vb, &config)?;
    varmap.save(dir.join("model.safetensors"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::traits::CausalModel;

    #[test]
    fn test_char_tokenizer_roundtrips_alphabet_text() {
        let tokenizer = CharTokenizer::new(96);
        let ids = tokenizer.encode("The capital of France is", false).unwrap();
        assert_eq!(ids.len(), 24);
        assert_eq!(tokenizer.decode(&ids, true).unwrap(), "The capital of France is");
    }

    #[test]
    fn test_char_tokenizer_special_tokens() {
        let tokenizer = CharTokenizer::new(64).with_special_tokens(&["<s>", "</s>"]);
        assert_eq!(tokenizer.token_to_id("<s>"), Some(62));
        assert_eq!(tokenizer.token_to_id("</s>"), Some(63));
        assert_eq!(tokenizer.token_to_id("<unk>"), None);

        assert_eq!(tokenizer.decode(&[1, 63], true).unwrap(), "a");
        assert_eq!(tokenizer.decode(&[1, 63], false).unwrap(), "a</s>");
        assert!(tokenizer.decode(&[64], true).is_err());
    }

    #[test]
    fn test_scripted_generator_records_prompts() {
        let generator = ScriptedGenerator::new("Paris", "yes");
        assert_eq!(generator.chat("first", 4).unwrap(), "yes");
        assert_eq!(generator.chat("second", 4).unwrap(), "yes");
        assert_eq!(generator.prompts(), vec!["first", "second"]);
    }

    #[test]
    fn test_mock_loader_failure_injection() {
        let loader = MockModelLoader::new().failing_times(1);
        assert!(loader.load("m", &Device::Cpu).is_err());
        let loaded = loader.load("m", &Device::Cpu).unwrap();
        assert_eq!(loaded.model.hidden_size(), MockModelLoader::DEFAULT_HIDDEN_SIZE);
        assert_eq!(loader.load_count(), 2);
    }
}
