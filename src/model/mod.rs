mod capability;
#[cfg(feature = "tch-backend")]
mod loader;
pub mod sampling;
mod types;

pub use capability::{EchoModel, ModelCapability, ModelError, take_words, truncate_at_stop};
#[cfg(feature = "tch-backend")]
pub use loader::TorchScriptModel;
pub use types::{
    GenerationOutput, GenerationParams, GenerationRequest, GenerationResult, ModelMetadata,
};

use crate::config::{AppConfig, BackendKind};

/// Builds one model instance per execution slot.
pub fn build_slots(config: &AppConfig) -> anyhow::Result<Vec<Box<dyn ModelCapability>>> {
    let count = config.gateway.slots;
    match config.backend {
        BackendKind::Echo => Ok((0..count)
            .map(|_| Box::new(EchoModel::new(config.model_id.clone())) as Box<dyn ModelCapability>)
            .collect()),
        BackendKind::TorchScript => build_torchscript_slots(config, count),
    }
}

#[cfg(feature = "tch-backend")]
fn build_torchscript_slots(
    config: &AppConfig,
    count: usize,
) -> anyhow::Result<Vec<Box<dyn ModelCapability>>> {
    let tokenizer = loader::load_tokenizer(&config.tokenizer_path)?;
    let mut slots: Vec<Box<dyn ModelCapability>> = Vec::with_capacity(count);
    for idx in 0..count {
        tracing::info!(slot = idx, path = %config.module_path.display(), "loading TorchScript module");
        let model = TorchScriptModel::load(
            &config.model_id,
            &config.module_path,
            tokenizer.clone(),
            config.device,
        )?;
        slots.push(Box::new(model));
    }
    Ok(slots)
}

#[cfg(not(feature = "tch-backend"))]
fn build_torchscript_slots(
    _config: &AppConfig,
    _count: usize,
) -> anyhow::Result<Vec<Box<dyn ModelCapability>>> {
    anyhow::bail!("the torchscript backend requires building with `--features tch-backend`")
}
