//! Single-turn chat formatting.
//!
//! The template is inferred from marker tokens present in the tokenizer vocabulary.

use super::traits::TokenCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|im_start|>` / `<|im_end|>` (Qwen, many fine-tunes).
    ChatMl,
    /// `<|start_header_id|>` / `<|eot_id|>` (Llama 3).
    Llama3,
    /// `[INST] ... [/INST]` (Mistral, Llama 2).
    Instruct,
    /// No markers; the prompt followed by a newline.
    Plain,
}

impl ChatTemplate {
    pub fn detect(tokenizer: &dyn TokenCodec) -> Self {
        if tokenizer.token_to_id("<|im_start|>").is_some() {
            ChatTemplate::ChatMl
        } else if tokenizer.token_to_id("<|start_header_id|>").is_some() {
            ChatTemplate::Llama3
        } else if tokenizer.token_to_id("[INST]").is_some()
            || tokenizer.token_to_id("<s>").is_some()
        {
            ChatTemplate::Instruct
        } else {
            ChatTemplate::Plain
        }
    }

    /// Renders `content` as a user message followed by the assistant turn opener.
    pub fn render_user(&self, content: &str) -> String {
        match self {
            ChatTemplate::ChatMl => {
                format!("<|im_start|>user\n{content}<|im_end|>\n<|im_start|>assistant\n")
            }
            ChatTemplate::Llama3 => format!(
                "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\n{content}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"
            ),
            ChatTemplate::Instruct => format!("<s>[INST] {} [/INST]", content.trim()),
            ChatTemplate::Plain => format!("{content}\n"),
        }
    }

    /// End-of-turn markers that terminate generation in addition to the model's EOS ids.
    pub fn stop_tokens(&self) -> &'static [&'static str] {
        match self {
            ChatTemplate::ChatMl => &["<|im_end|>", "<|endoftext|>"],
            ChatTemplate::Llama3 => &["<|eot_id|>", "<|end_of_text|>"],
            ChatTemplate::Instruct => &["</s>"],
            ChatTemplate::Plain => &[],
        }
    }

    /// Resolves [`stop_tokens`](Self::stop_tokens) against the vocabulary.
    pub fn stop_token_ids(&self, tokenizer: &dyn TokenCodec) -> Vec<u32> {
        self.stop_tokens()
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect()
    }
}
