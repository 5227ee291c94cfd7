use thiserror::Error;

use crate::model::{GenerationOutput, GenerationParams};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("{0}")]
    Execution(String),
}

/// An opaque text generator. Implementations are allowed to keep mutable
/// state between calls and are never entered by two callers at once: the
/// slot pool hands out `&mut` access to exactly one request at a time.
pub trait ModelCapability: Send + 'static {
    fn name(&self) -> &str;

    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutput, ModelError>;
}

/// Cuts `text` at the earliest occurrence of any stop sequence.
pub fn truncate_at_stop<'a>(text: &'a str, stop: &[String]) -> &'a str {
    let cut = stop
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min();
    match cut {
        Some(idx) => &text[..idx],
        None => text,
    }
}

/// Returns the prefix of `text` holding at most `limit` whitespace-delimited
/// words, together with the number of words kept. Text that already fits is
/// returned untouched, trailing whitespace included.
pub fn take_words(text: &str, limit: usize) -> (&str, usize) {
    let mut count = 0;
    let mut in_word = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            if count == limit {
                return (text[..idx].trim_end(), count);
            }
            in_word = true;
            count += 1;
        }
    }
    (text, count)
}

/// Development backend that answers with its own prompt, honouring stop
/// sequences and the token budget. Word count stands in for token count.
#[derive(Debug, Clone)]
pub struct EchoModel {
    name: String,
}

impl EchoModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ModelCapability for EchoModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutput, ModelError> {
        let stopped = truncate_at_stop(prompt, &params.stop);
        let (text, tokens_generated) = take_words(stopped, params.max_new_tokens);
        Ok(GenerationOutput {
            text: text.to_string(),
            tokens_generated,
        })
    }
}
