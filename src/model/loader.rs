use std::{path::Path, sync::Arc};

use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;

use crate::model::{
    GenerationOutput, GenerationParams,
    capability::{ModelCapability, ModelError, truncate_at_stop},
    sampling,
};

pub fn load_tokenizer(path: &Path) -> Result<Arc<Tokenizer>, ModelError> {
    Tokenizer::from_file(path)
        .map(Arc::new)
        .map_err(|e| ModelError::Tokenizer(e.to_string()))
}

/// A traced causal language model. Each instance owns its own module so that
/// several slots never share libtorch state; the tokenizer is read-only and
/// shared.
pub struct TorchScriptModel {
    name: String,
    tokenizer: Arc<Tokenizer>,
    module: tch::CModule,
    device: Device,
    eos_token_id: Option<i64>,
}

impl TorchScriptModel {
    pub fn load(
        name: &str,
        module_path: &Path,
        tokenizer: Arc<Tokenizer>,
        device: Device,
    ) -> Result<Self, ModelError> {
        if !module_path.exists() {
            return Err(ModelError::Execution(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| ModelError::Execution(e.to_string()))?;
        module.set_eval();

        let eos_token_id = ["</s>", "<|endoftext|>"]
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
            .map(i64::from);

        Ok(Self {
            name: name.to_string(),
            tokenizer,
            module,
            device,
            eos_token_id,
        })
    }

    fn forward(&self, input_ids: &[i64]) -> Result<Tensor, ModelError> {
        let input = Tensor::from_slice(input_ids)
            .reshape([1, input_ids.len() as i64])
            .to(self.device);
        let output = self
            .module
            .forward_is(&[IValue::Tensor(input)])
            .map_err(|e| ModelError::Execution(e.to_string()))?;

        // Traced models return either bare logits or (logits, past).
        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                IValue::Tensor(t) => t.shallow_clone(),
                _ => {
                    return Err(ModelError::Execution(
                        "expected tensor as first tuple element".into(),
                    ));
                }
            },
            _ => {
                return Err(ModelError::Execution(
                    "unexpected model output format".into(),
                ));
            }
        };

        // [1, seq_len, vocab] -> [vocab]
        Ok(logits.select(1, -1).squeeze())
    }

    fn decode(&self, ids: &[i64]) -> Result<String, ModelError> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))
    }
}

/// Picks the next token. The repeat penalty covers prompt and generated
/// tokens alike; temperature 0 is greedy, anything else samples from the
/// top-k / top-p candidates.
fn sample(logits: &Tensor, seen: &[i64], params: &GenerationParams) -> Result<i64, ModelError> {
    let mut row = Vec::<f32>::try_from(
        logits
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .contiguous(),
    )
    .map_err(|e| ModelError::Execution(e.to_string()))?;
    sampling::apply_repeat_penalty(&mut row, seen, params.repeat_penalty);

    let next = if params.temperature <= 0.0 {
        sampling::argmax(&row)
    } else {
        let candidates =
            sampling::candidates(&row, params.temperature, params.top_k, params.top_p);
        let u = Tensor::rand([1], (Kind::Float, Device::Cpu)).double_value(&[0]) as f32;
        sampling::pick(&candidates, u)
    };
    next.ok_or_else(|| ModelError::Execution("model produced empty logits".into()))
}

impl ModelCapability for TorchScriptModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutput, ModelError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            input_ids.push(0);
        }
        let prompt_len = input_ids.len();

        no_grad(|| {
            for _ in 0..params.max_new_tokens {
                let logits = self.forward(&input_ids)?;
                let next = sample(&logits, &input_ids, params)?;
                if Some(next) == self.eos_token_id {
                    break;
                }
                input_ids.push(next);

                if !params.stop.is_empty() {
                    let text = self.decode(&input_ids[prompt_len..])?;
                    if truncate_at_stop(&text, &params.stop).len() < text.len() {
                        break;
                    }
                }
            }
            Ok::<(), ModelError>(())
        })?;

        let generated = &input_ids[prompt_len..];
        let decoded = self.decode(generated)?;
        Ok(GenerationOutput {
            text: truncate_at_stop(&decoded, &params.stop).to_string(),
            tokens_generated: generated.len(),
        })
    }
}
