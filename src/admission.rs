//! Gatekeeping that runs before any request is allowed near the slot pool:
//! API-key checks, parameter validation and load shedding.

use std::time::Instant;

use subtle::ConstantTimeEq;
use tracing::warn;

use crate::{
    config::GatewayConfig,
    error::{FieldError, ServiceError},
    model::{GenerationParams, GenerationRequest},
    pool::ExecutionSlotPool,
};

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    /// No key is configured, so every caller is let through.
    Disabled,
    Denied,
}

#[derive(Clone)]
pub struct ApiKeyAuth {
    expected: Option<Vec<u8>>,
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl ApiKeyAuth {
    pub fn new(expected: Option<String>) -> Self {
        let expected = expected
            .filter(|key| !key.is_empty())
            .map(String::into_bytes);
        Self { expected }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    pub fn authenticate(&self, presented: Option<&str>) -> AuthOutcome {
        let Some(expected) = self.expected.as_deref() else {
            return AuthOutcome::Disabled;
        };
        match presented {
            Some(key) if constant_time_eq(expected, key.as_bytes()) => AuthOutcome::Authorized,
            _ => AuthOutcome::Denied,
        }
    }

    pub fn check(&self, presented: Option<&str>) -> Result<(), ServiceError> {
        match self.authenticate(presented) {
            AuthOutcome::Authorized | AuthOutcome::Disabled => Ok(()),
            AuthOutcome::Denied => {
                warn!(key_present = presented.is_some(), "rejected request with bad API key");
                Err(ServiceError::Forbidden)
            }
        }
    }
}

/// Compares two byte strings without short-circuiting on the first
/// difference. Only the length leaks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Optional sampling fields as they arrive on the wire.
#[derive(Debug, Clone, Default)]
pub struct ParamOverrides {
    pub max_new_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub repeat_penalty: Option<f64>,
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Admission {
    max_new_tokens_ceiling: usize,
    max_prompt_chars: usize,
    max_queue_depth: Option<usize>,
}

impl Admission {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            max_new_tokens_ceiling: config.max_new_tokens_ceiling,
            max_prompt_chars: config.max_prompt_chars,
            max_queue_depth: config.max_queue_depth,
        }
    }

    /// Checks one prompt and its parameters, filling gaps from `defaults`.
    /// Every offending field is reported, not just the first.
    pub fn validate(
        &self,
        prompt: &str,
        overrides: &ParamOverrides,
        defaults: &GenerationParams,
    ) -> Result<GenerationRequest, ServiceError> {
        self.validate_field("prompt", prompt, overrides, defaults)
    }

    /// Same as [`validate`](Self::validate), reporting prompt problems under
    /// `field` (e.g. `code` for completions).
    pub fn validate_field(
        &self,
        field: &str,
        prompt: &str,
        overrides: &ParamOverrides,
        defaults: &GenerationParams,
    ) -> Result<GenerationRequest, ServiceError> {
        let mut errors = Vec::new();
        self.check_prompt(field, prompt, &mut errors);
        let params = self.resolve_params(overrides, defaults, &mut errors);
        if errors.is_empty() {
            Ok(GenerationRequest {
                prompt: prompt.to_string(),
                params,
                submitted_at: Instant::now(),
            })
        } else {
            Err(ServiceError::Validation(errors))
        }
    }

    /// Validates a list of prompts sharing one parameter set. Field names
    /// carry the index of the offending prompt.
    pub fn validate_many(
        &self,
        prompts: &[String],
        overrides: &ParamOverrides,
        defaults: &GenerationParams,
    ) -> Result<Vec<GenerationRequest>, ServiceError> {
        let mut errors = Vec::new();
        if prompts.is_empty() {
            errors.push(FieldError::new("prompts", "must contain at least one prompt"));
        }
        for (idx, prompt) in prompts.iter().enumerate() {
            self.check_prompt(&format!("prompts[{idx}]"), prompt, &mut errors);
        }
        let params = self.resolve_params(overrides, defaults, &mut errors);
        if !errors.is_empty() {
            return Err(ServiceError::Validation(errors));
        }

        let submitted_at = Instant::now();
        Ok(prompts
            .iter()
            .map(|prompt| GenerationRequest {
                prompt: prompt.clone(),
                params: params.clone(),
                submitted_at,
            })
            .collect())
    }

    /// Sheds load when too many callers are already waiting for a slot.
    /// `max_queue_depth` is the number of waiters allowed, so a request is
    /// rejected once at least that many are queued: letting it in would push
    /// the depth past the bound.
    pub fn admit(&self, pool: &ExecutionSlotPool) -> Result<(), ServiceError> {
        if pool.is_closed() {
            return Err(ServiceError::ServiceOverloaded(
                "slot pool is shutting down".into(),
            ));
        }
        let Some(max) = self.max_queue_depth else {
            return Ok(());
        };
        let waiting = pool.queue_depth();
        if waiting >= max {
            warn!(waiting, max, "shedding request, slot queue is full");
            return Err(ServiceError::ServiceOverloaded(format!(
                "{waiting} requests already waiting for a model slot"
            )));
        }
        Ok(())
    }

    fn check_prompt(&self, field: &str, prompt: &str, errors: &mut Vec<FieldError>) {
        if prompt.trim().is_empty() {
            errors.push(FieldError::new(field, "must not be empty"));
        } else {
            let chars = prompt.chars().count();
            if chars > self.max_prompt_chars {
                errors.push(FieldError::new(
                    field,
                    format!(
                        "is {chars} characters long, limit is {}",
                        self.max_prompt_chars
                    ),
                ));
            }
        }
    }

    fn resolve_params(
        &self,
        overrides: &ParamOverrides,
        defaults: &GenerationParams,
        errors: &mut Vec<FieldError>,
    ) -> GenerationParams {
        let mut params = defaults.clone();

        if let Some(max_new_tokens) = overrides.max_new_tokens {
            if max_new_tokens < 1 || max_new_tokens as u64 > self.max_new_tokens_ceiling as u64 {
                errors.push(FieldError::new(
                    "max_new_tokens",
                    format!("must be between 1 and {}", self.max_new_tokens_ceiling),
                ));
            } else {
                params.max_new_tokens = max_new_tokens as usize;
            }
        } else if params.max_new_tokens > self.max_new_tokens_ceiling {
            params.max_new_tokens = self.max_new_tokens_ceiling;
        }

        if let Some(temperature) = overrides.temperature {
            if !temperature.is_finite() || temperature < 0.0 {
                errors.push(FieldError::new("temperature", "must be a finite number >= 0"));
            } else {
                params.temperature = temperature;
            }
        }

        if let Some(top_p) = overrides.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                errors.push(FieldError::new("top_p", "must be between 0 and 1"));
            } else {
                params.top_p = top_p;
            }
        }

        if let Some(top_k) = overrides.top_k {
            if top_k < 0 {
                errors.push(FieldError::new("top_k", "must be >= 0"));
            } else {
                params.top_k = top_k as usize;
            }
        }

        if let Some(repeat_penalty) = overrides.repeat_penalty {
            if !repeat_penalty.is_finite() || repeat_penalty < 0.0 {
                errors.push(FieldError::new(
                    "repeat_penalty",
                    "must be a finite number >= 0",
                ));
            } else {
                params.repeat_penalty = repeat_penalty;
            }
        }

        if let Some(stop) = &overrides.stop {
            if stop.iter().any(String::is_empty) {
                errors.push(FieldError::new("stop", "stop sequences must not be empty"));
            } else {
                params.stop = stop.clone();
            }
        }

        params
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{EchoModel, ModelCapability};

    fn admission() -> Admission {
        Admission::new(&GatewayConfig {
            max_new_tokens_ceiling: 2048,
            max_prompt_chars: 32,
            ..GatewayConfig::default()
        })
    }

    #[test]
    fn auth_disabled_without_key() {
        let auth = ApiKeyAuth::new(None);
        assert!(!auth.is_enabled());
        assert_eq!(auth.authenticate(None), AuthOutcome::Disabled);
        assert!(auth.check(Some("anything")).is_ok());

        assert!(!ApiKeyAuth::new(Some(String::new())).is_enabled());
    }

    #[test]
    fn auth_compares_keys() {
        let auth = ApiKeyAuth::new(Some("secret".into()));
        assert_eq!(auth.authenticate(Some("secret")), AuthOutcome::Authorized);
        assert_eq!(auth.authenticate(Some("wrong")), AuthOutcome::Denied);
        assert_eq!(auth.authenticate(Some("secret2")), AuthOutcome::Denied);
        assert_eq!(auth.authenticate(None), AuthOutcome::Denied);
        assert!(matches!(auth.check(Some("wrong")), Err(ServiceError::Forbidden)));
    }

    #[test]
    fn key_comparison_handles_length_and_content() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"sec"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn debug_output_hides_key() {
        let auth = ApiKeyAuth::new(Some("secret".into()));
        assert!(!format!("{auth:?}").contains("secret"));
    }

    #[test]
    fn max_new_tokens_above_ceiling_is_rejected() {
        let overrides = ParamOverrides {
            max_new_tokens: Some(5000),
            ..ParamOverrides::default()
        };
        let err = admission()
            .validate("hello", &overrides, &GenerationParams::default())
            .unwrap_err();
        match err {
            ServiceError::Validation(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field, "max_new_tokens");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reports_every_bad_field() {
        let overrides = ParamOverrides {
            max_new_tokens: Some(0),
            temperature: Some(-1.0),
            top_p: Some(1.5),
            top_k: Some(-3),
            repeat_penalty: Some(f64::NAN),
            stop: Some(vec![String::new()]),
        };
        let err = admission()
            .validate("   ", &overrides, &GenerationParams::default())
            .unwrap_err();
        let ServiceError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(
            names,
            [
                "prompt",
                "max_new_tokens",
                "temperature",
                "top_p",
                "top_k",
                "repeat_penalty",
                "stop"
            ]
        );
    }

    #[test]
    fn long_prompt_is_rejected() {
        let err = admission()
            .validate(&"x".repeat(33), &ParamOverrides::default(), &GenerationParams::default())
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let overrides = ParamOverrides {
            temperature: Some(0.0),
            ..ParamOverrides::default()
        };
        let request = admission()
            .validate("hi", &overrides, &GenerationParams::default())
            .unwrap();
        assert_eq!(request.params.max_new_tokens, 512);
        assert_eq!(request.params.temperature, 0.0);
        assert_eq!(request.params.stop, vec!["</s>".to_string()]);
    }

    #[test]
    fn batch_validation_names_the_index() {
        let prompts = vec!["fine".to_string(), "".to_string()];
        let err = admission()
            .validate_many(&prompts, &ParamOverrides::default(), &GenerationParams::default())
            .unwrap_err();
        let ServiceError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert_eq!(fields[0].field, "prompts[1]");

        let err = admission()
            .validate_many(&[], &ParamOverrides::default(), &GenerationParams::default())
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn admit_sheds_when_queue_is_full() {
        let pool = ExecutionSlotPool::new(
            vec![Box::new(EchoModel::new("echo")) as Box<dyn ModelCapability>],
            Duration::from_secs(1),
        );
        let admission = Admission::new(&GatewayConfig {
            max_queue_depth: Some(1),
            ..GatewayConfig::default()
        });
        assert!(admission.admit(&pool).is_ok());

        let held = pool.acquire(Duration::ZERO).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.queue_depth(), 1);

        // One waiter against a bound of one: the next caller would exceed it.
        let err = admission.admit(&pool).unwrap_err();
        assert_eq!(err.kind(), "service_overloaded");

        drop(held);
        assert!(waiter.await.unwrap());
        assert!(admission.admit(&pool).is_ok());
    }
}
