use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use config::{Config, File, FileFormat};
use serde::Deserialize;
#[cfg(feature = "tch-backend")]
use tch::Device;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/model_config.yaml";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Echo,
    TorchScript,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "echo" => Ok(BackendKind::Echo),
            "torchscript" | "tch" => Ok(BackendKind::TorchScript),
            other => anyhow::bail!("unknown model backend '{other}'"),
        }
    }
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Echo => "echo",
            BackendKind::TorchScript => "torchscript",
        }
    }
}

/// How the items of one batch are fed to the slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    Sequential,
    /// Up to one in-flight item per slot.
    Concurrent,
}

impl FromStr for DispatchPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "sequential" => Ok(DispatchPolicy::Sequential),
            "concurrent" => Ok(DispatchPolicy::Concurrent),
            other => anyhow::bail!("unknown batch dispatch policy '{other}'"),
        }
    }
}

/// Limits enforced by the slot pool, admission and the batch coordinator.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub slots: usize,
    pub slot_timeout: Duration,
    /// `None` disables load shedding.
    pub max_queue_depth: Option<usize>,
    pub max_new_tokens_ceiling: usize,
    pub max_prompt_chars: usize,
    pub max_batch_size: usize,
    pub batch_dispatch: DispatchPolicy,
    pub batch_timeout: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            slots: 1,
            slot_timeout: Duration::from_secs(30),
            max_queue_depth: Some(64),
            max_new_tokens_ceiling: 2048,
            max_prompt_chars: 16_384,
            max_batch_size: 16,
            batch_dispatch: DispatchPolicy::Sequential,
            batch_timeout: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub backend: BackendKind,
    pub module_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub api_key: Option<String>,
    pub gateway: GatewayConfig,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

/// Layered settings: `config/model_config.yaml` overridden by environment
/// variables. Every key is optional.
#[derive(Debug, Default, Deserialize)]
struct Settings {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    model: ModelSection,
    #[serde(default)]
    gateway: GatewaySection,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelSection {
    name: Option<String>,
    backend: Option<String>,
    path: Option<PathBuf>,
    tokenizer: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewaySection {
    slots: Option<usize>,
    slot_timeout_ms: Option<u64>,
    max_queue_depth: Option<usize>,
    max_new_tokens_ceiling: Option<usize>,
    max_prompt_chars: Option<usize>,
    max_batch_size: Option<usize>,
    batch_dispatch: Option<String>,
    batch_timeout_secs: Option<u64>,
}

/// Environment variables and the settings keys they override.
const STRING_OVERRIDES: &[(&str, &str)] = &[
    ("MODEL_ID", "model.name"),
    ("MODEL_BACKEND", "model.backend"),
    ("MODEL_MODULE_PATH", "model.path"),
    ("TOKENIZER_PATH", "model.tokenizer"),
    ("BATCH_DISPATCH", "gateway.batch_dispatch"),
];

const NUMERIC_OVERRIDES: &[(&str, &str)] = &[
    ("MODEL_SLOTS", "gateway.slots"),
    ("SLOT_TIMEOUT_MS", "gateway.slot_timeout_ms"),
    ("MAX_QUEUE_DEPTH", "gateway.max_queue_depth"),
    ("MAX_NEW_TOKENS_CEILING", "gateway.max_new_tokens_ceiling"),
    ("MAX_PROMPT_CHARS", "gateway.max_prompt_chars"),
    ("MAX_BATCH_SIZE", "gateway.max_batch_size"),
    ("BATCH_TIMEOUT_SECS", "gateway.batch_timeout_secs"),
];

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves the configuration from a variable lookup, layered over the
    /// optional YAML file named by `CONFIG_PATH`.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = lookup("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let settings = load_settings(&lookup, &config_path)?;

        let listen_addr = match lookup("SERVER_ADDR") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid SERVER_ADDR '{raw}'"))?,
            None => match (settings.server.host, settings.server.port) {
                (None, None) => DEFAULT_LISTEN_ADDR.parse()?,
                (host, port) => {
                    let host = host.unwrap_or_else(|| "0.0.0.0".into());
                    let port = port.unwrap_or(8000);
                    format!("{host}:{port}")
                        .parse()
                        .with_context(|| format!("invalid server address {host}:{port}"))?
                }
            },
        };

        let model = settings.model;
        let model_id = model
            .name
            .unwrap_or_else(|| "codellama/CodeLlama-13B-Instruct".to_string());
        let backend = model
            .backend
            .map(|raw| raw.parse::<BackendKind>())
            .transpose()?
            .unwrap_or(BackendKind::Echo);
        let module_path = model
            .path
            .unwrap_or_else(|| PathBuf::from("models/model.ts"));
        let tokenizer_path = model
            .tokenizer
            .unwrap_or_else(|| PathBuf::from("models/tokenizer.json"));

        let api_key = lookup("LLM_API_KEY").filter(|key| !key.is_empty());

        let defaults = GatewayConfig::default();
        let section = settings.gateway;
        let slots = section.slots.unwrap_or(defaults.slots);
        if slots == 0 {
            anyhow::bail!("MODEL_SLOTS must be at least 1");
        }
        let slot_timeout = section
            .slot_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.slot_timeout);
        let max_queue_depth = match section.max_queue_depth {
            Some(0) => None,
            Some(depth) => Some(depth),
            None => defaults.max_queue_depth,
        };
        let batch_dispatch = section
            .batch_dispatch
            .map(|raw| raw.parse::<DispatchPolicy>())
            .transpose()?
            .unwrap_or(defaults.batch_dispatch);
        let batch_timeout = match section.batch_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.batch_timeout,
        };

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            model_id,
            backend,
            module_path,
            tokenizer_path,
            api_key,
            gateway: GatewayConfig {
                slots,
                slot_timeout,
                max_queue_depth,
                max_new_tokens_ceiling: section
                    .max_new_tokens_ceiling
                    .unwrap_or(defaults.max_new_tokens_ceiling),
                max_prompt_chars: section
                    .max_prompt_chars
                    .unwrap_or(defaults.max_prompt_chars),
                max_batch_size: section.max_batch_size.unwrap_or(defaults.max_batch_size),
                batch_dispatch,
                batch_timeout,
            },
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

/// Builds the layered settings. A missing file is not an error; a file that
/// exists but does not parse is.
fn load_settings<F>(lookup: &F, path: &Path) -> anyhow::Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut builder = Config::builder()
        .add_source(File::from(path).format(FileFormat::Yaml).required(false));
    for (var, key) in STRING_OVERRIDES {
        builder = builder.set_override_option(*key, lookup(var))?;
    }
    for (var, key) in NUMERIC_OVERRIDES {
        builder = builder.set_override_option(*key, number::<F, u64>(lookup, var))?;
    }
    builder
        .build()
        .and_then(|settings| settings.try_deserialize::<Settings>())
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn number<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring malformed numeric setting");
            None
        }
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            warn!(requested = raw, "CUDA not available, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write};

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env_or_file() {
        let config =
            AppConfig::from_lookup(lookup_from(&[("CONFIG_PATH", "/nonexistent/config.yaml")]))
                .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(config.backend, BackendKind::Echo);
        assert!(config.api_key.is_none());
        assert_eq!(config.gateway.slots, 1);
        assert_eq!(config.gateway.max_new_tokens_ceiling, 2048);
        assert_eq!(config.gateway.max_queue_depth, Some(64));
        assert_eq!(config.gateway.batch_dispatch, DispatchPolicy::Sequential);
    }

    #[test]
    fn env_overrides_and_disables() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("CONFIG_PATH", "/nonexistent/config.yaml"),
            ("SERVER_ADDR", "127.0.0.1:9000"),
            ("LLM_API_KEY", "secret"),
            ("MODEL_SLOTS", "3"),
            ("MAX_QUEUE_DEPTH", "0"),
            ("BATCH_DISPATCH", "Concurrent"),
            ("BATCH_TIMEOUT_SECS", "0"),
            ("MAX_BATCH_SIZE", "not-a-number"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.gateway.slots, 3);
        assert_eq!(config.gateway.max_queue_depth, None);
        assert_eq!(config.gateway.batch_dispatch, DispatchPolicy::Concurrent);
        assert_eq!(config.gateway.batch_timeout, None);
        assert_eq!(config.gateway.max_batch_size, 16);
    }

    #[test]
    fn empty_api_key_disables_auth() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("CONFIG_PATH", "/nonexistent/config.yaml"),
            ("LLM_API_KEY", ""),
        ]))
        .unwrap();
        assert!(config.api_key.is_none());
    }

    #[test]
    fn zero_slots_is_rejected() {
        let result = AppConfig::from_lookup(lookup_from(&[
            ("CONFIG_PATH", "/nonexistent/config.yaml"),
            ("MODEL_SLOTS", "0"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn yaml_file_is_layered_under_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  host: 127.0.0.1\n  port: 8123\nmodel:\n  name: tiny-model\ngateway:\n  slots: 2\n  max_batch_size: 4"
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = AppConfig::from_lookup(lookup_from(&[
            ("CONFIG_PATH", path.as_str()),
            ("MODEL_SLOTS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8123".parse().unwrap());
        assert_eq!(config.model_id, "tiny-model");
        assert_eq!(config.gateway.slots, 5);
        assert_eq!(config.gateway.max_batch_size, 4);
    }

    #[test]
    fn env_strings_override_yaml_and_bad_files_fail() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "model:\n  name: from-file\n  backend: echo\ngateway:\n  batch_dispatch: concurrent").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = AppConfig::from_lookup(lookup_from(&[
            ("CONFIG_PATH", path.as_str()),
            ("MODEL_ID", "from-env"),
        ]))
        .unwrap();
        assert_eq!(config.model_id, "from-env");
        assert_eq!(config.gateway.batch_dispatch, DispatchPolicy::Concurrent);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "gateway:\n  slots: [not, a, number]").unwrap();
        let path = broken.path().to_string_lossy().to_string();
        assert!(AppConfig::from_lookup(lookup_from(&[("CONFIG_PATH", path.as_str())])).is_err());
    }
}
