use std::time::{Duration, Instant};

use serde::Serialize;

/// Sampling parameters for a single generation. Built once during admission
/// and only ever read afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub repeat_penalty: f64,
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            stop: vec!["</s>".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: GenerationParams,
    pub submitted_at: Instant,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            prompt: prompt.into(),
            params,
            submitted_at: Instant::now(),
        }
    }
}

/// What a model backend hands back for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub text: String,
    pub tokens_generated: usize,
}

/// Result of one request after it went through the slot pool.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_generated: usize,
    /// Time spent inside the model call, excluding the wait for a slot.
    pub elapsed: Duration,
    pub slot: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub backend: String,
    pub slots: usize,
}
