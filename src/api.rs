use axum::extract::FromRequest;
use serde::{Deserialize, Serialize};

use crate::{
    admission::ParamOverrides, error::ServiceError, model::GenerationParams, prompt::ChatMessage,
};

/// JSON body extractor whose rejections use the service error format.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ServiceError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    pub max_new_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub repeat_penalty: Option<f64>,
}

impl GenerateBody {
    pub fn overrides(&self) -> ParamOverrides {
        ParamOverrides {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
            stop: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub code: String,
    pub max_new_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub stop: Option<Vec<String>>,
}

impl CompleteBody {
    pub fn overrides(&self) -> ParamOverrides {
        let stop = match &self.stop {
            None => strings(&["\n\n", "def ", "class "]),
            Some(stop) if stop.is_empty() => strings(&["</s>", "\n\n"]),
            Some(stop) => stop.clone(),
        };
        ParamOverrides {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            stop: Some(stop),
            ..ParamOverrides::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub messages: Vec<ChatMessage>,
    pub max_new_tokens: Option<i64>,
    pub temperature: Option<f64>,
}

impl ChatBody {
    pub fn overrides(&self) -> ParamOverrides {
        ParamOverrides {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            ..ParamOverrides::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub prompts: Vec<String>,
    pub max_new_tokens: Option<i64>,
    pub temperature: Option<f64>,
}

impl BatchBody {
    pub fn overrides(&self) -> ParamOverrides {
        ParamOverrides {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            ..ParamOverrides::default()
        }
    }
}

pub fn generate_defaults() -> GenerationParams {
    GenerationParams::default()
}

pub fn complete_defaults() -> GenerationParams {
    GenerationParams {
        max_new_tokens: 100,
        temperature: 0.3,
        ..GenerationParams::default()
    }
}

pub fn chat_defaults() -> GenerationParams {
    GenerationParams {
        stop: strings(&["User:", "</s>"]),
        ..GenerationParams::default()
    }
}

pub fn batch_defaults() -> GenerationParams {
    GenerationParams::default()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub generated_text: String,
    pub tokens_generated: usize,
    pub time_seconds: f64,
    pub tokens_per_second: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub completion: String,
    pub full_code: String,
    pub time_seconds: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub time_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchItemResponse {
    pub index: usize,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub status: ItemStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItemResponse>,
    pub total_prompts: usize,
    pub successful: usize,
    pub failed: usize,
    pub time_seconds: f64,
}

/// Rounds to two decimals, the precision every timing field is reported at.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn tokens_per_second(tokens: usize, seconds: f64) -> f64 {
    if seconds > 0.0 {
        round2(tokens as f64 / seconds)
    } else {
        0.0
    }
}
