//! Configuration structures for RKServe
//!
//! This module defines all configuration types used by the gateway.
//! Configurations are loaded from YAML files and can be overridden by
//! command-line flags or environment variables.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Model configuration
    #[serde(default)]
    pub model: ModelConfig,

    /// Sampling and context tunables handed to the native engine
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Native runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            model: ModelConfig::default(),
            sampling: SamplingConfig::default(),
            runtime: RuntimeConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Absolute path of the converted model on the board
    #[serde(default)]
    pub model_path: PathBuf,

    /// Target platform the model was converted for
    #[serde(default)]
    pub target_platform: Option<TargetPlatform>,

    /// Optional LoRA adapter
    #[serde(default)]
    pub lora_model_path: Option<PathBuf>,

    /// Name the LoRA adapter is registered under
    #[serde(default = "default_lora_adapter_name")]
    pub lora_adapter_name: String,

    /// LoRA adapter scale
    #[serde(default = "default_lora_scale")]
    pub lora_scale: f32,

    /// Optional prompt cache file loaded after init
    #[serde(default)]
    pub prompt_cache_path: Option<PathBuf>,

    /// Optional chat template applied after init
    #[serde(default)]
    pub chat_template: Option<ChatTemplate>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            target_platform: None,
            lora_model_path: None,
            lora_adapter_name: default_lora_adapter_name(),
            lora_scale: default_lora_scale(),
            prompt_cache_path: None,
            chat_template: None,
        }
    }
}

/// Chat template pieces wrapped around every prompt by the native engine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatTemplate {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub prompt_prefix: String,
    #[serde(default)]
    pub prompt_postfix: String,
}

/// Supported target platforms
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetPlatform {
    Rk3588,
    Rk3576,
}

impl TargetPlatform {
    /// Identifier used in file names and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetPlatform::Rk3588 => "rk3588",
            TargetPlatform::Rk3576 => "rk3576",
        }
    }

    /// Number of cores the engine is pinned to
    pub fn enabled_cpus_num(&self) -> i8 {
        4
    }

    /// Core mask for the engine threads: the big cores 4..7 on both SoCs
    pub fn enabled_cpus_mask(&self) -> u32 {
        (1 << 4) | (1 << 5) | (1 << 6) | (1 << 7)
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetPlatform {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rk3588" => Ok(TargetPlatform::Rk3588),
            "rk3576" => Ok(TargetPlatform::Rk3576),
            other => Err(GatewayError::config(format!(
                "Please specify the correct target platform: rk3588/rk3576 (got '{}')",
                other
            ))),
        }
    }
}

/// Sampling and context configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    #[serde(default = "default_max_context_len")]
    pub max_context_len: i32,

    /// -1 means unlimited
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: i32,

    #[serde(default = "default_top_k")]
    pub top_k: i32,

    #[serde(default = "default_n_keep")]
    pub n_keep: i32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    #[serde(default)]
    pub mirostat: i32,

    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f32,

    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f32,

    #[serde(default = "default_skip_special_token")]
    pub skip_special_token: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_context_len: default_max_context_len(),
            max_new_tokens: default_max_new_tokens(),
            top_k: default_top_k(),
            n_keep: default_n_keep(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            repeat_penalty: default_repeat_penalty(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            skip_special_token: default_skip_special_token(),
        }
    }
}

/// Native runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path of the native runtime shared library
    #[serde(default = "default_library_path")]
    pub library_path: PathBuf,

    /// NPU domain the model is placed on
    #[serde(default)]
    pub base_domain_id: i32,

    /// Keep the embedding table in flash instead of memory
    #[serde(default)]
    pub embed_flash: bool,

    /// Directory holding `fix_freq_<platform>.sh`; frequency pinning is
    /// skipped when unset
    #[serde(default)]
    pub frequency_script_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            library_path: default_library_path(),
            base_domain_id: 0,
            embed_flash: false,
            frequency_script_dir: None,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Expose Prometheus metrics on /metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_lora_adapter_name() -> String {
    "test".to_string()
}

fn default_lora_scale() -> f32 {
    1.0
}

fn default_max_context_len() -> i32 {
    4096
}

fn default_max_new_tokens() -> i32 {
    -1
}

fn default_top_k() -> i32 {
    1
}

fn default_n_keep() -> i32 {
    -1
}

fn default_top_p() -> f32 {
    0.9
}

fn default_temperature() -> f32 {
    0.8
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_mirostat_tau() -> f32 {
    5.0
}

fn default_mirostat_eta() -> f32 {
    0.1
}

fn default_skip_special_token() -> bool {
    true
}

fn default_library_path() -> PathBuf {
    PathBuf::from("lib/librkllmrt.so")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    ///
    /// The file may be partial; validation happens once all overrides are
    /// applied, see [`GatewayConfig::validate`].
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        Self::from_yaml(&content).map_err(|e| {
            GatewayError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Validate configuration
    ///
    /// Every path must exist on the board before the engine is touched.
    pub fn validate(&self) -> Result<()> {
        let model = &self.model;

        if model.model_path.as_os_str().is_empty() {
            return Err(GatewayError::config("Model path is required"));
        }
        require_path(
            &model.model_path,
            "Please provide the correct rkllm model path, and ensure it is the absolute path on the board.",
        )?;

        if model.target_platform.is_none() {
            return Err(GatewayError::config(
                "Please specify the correct target platform: rk3588/rk3576.",
            ));
        }

        if let Some(lora) = &model.lora_model_path {
            require_path(
                lora,
                "Please provide the correct lora_model path, and advise it is the absolute path on the board.",
            )?;
        }

        if let Some(cache) = &model.prompt_cache_path {
            require_path(
                cache,
                "Please provide the correct prompt_cache_file path, and advise it is the absolute path on the board.",
            )?;
        }

        if self.sampling.max_context_len <= 0 {
            return Err(GatewayError::config("max_context_len must be positive"));
        }

        Ok(())
    }

    /// Socket address string the server binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn require_path(path: &Path, message: &str) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(GatewayError::Config(format!("{} ({})", message, path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn config_with_model(model: &Path) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.model.model_path = model.to_path_buf();
        config.model.target_platform = Some(TargetPlatform::Rk3588);
        config
    }

    #[test]
    fn test_config_validation() {
        let model = NamedTempFile::new().unwrap();
        let config = config_with_model(model.path());

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_missing_model() {
        let config = config_with_model(Path::new("/definitely/not/here.rkllm"));

        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_config_validation_missing_platform() {
        let model = NamedTempFile::new().unwrap();
        let mut config = config_with_model(model.path());
        config.model.target_platform = None;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_missing_lora() {
        let model = NamedTempFile::new().unwrap();
        let mut config = config_with_model(model.path());
        config.model.lora_model_path = Some(PathBuf::from("/missing/lora.rkllm"));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_missing_prompt_cache() {
        let model = NamedTempFile::new().unwrap();
        let mut config = config_with_model(model.path());
        config.model.prompt_cache_path = Some(PathBuf::from("/missing/cache.bin"));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = GatewayConfig::from_yaml("{}").unwrap();

        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.sampling.max_context_len, 4096);
        assert_eq!(config.sampling.max_new_tokens, -1);
        assert_eq!(config.sampling.top_k, 1);
        assert!(config.sampling.skip_special_token);
        assert_eq!(config.model.lora_adapter_name, "test");
        assert_eq!(config.runtime.library_path, PathBuf::from("lib/librkllmrt.so"));
        assert!(config.observability.enable_metrics);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
port: 9000
model:
  model_path: /models/qwen.rkllm
  target_platform: rk3576
sampling:
  temperature: 0.5
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.model.target_platform, Some(TargetPlatform::Rk3576));
        assert_eq!(config.sampling.temperature, 0.5);
        assert_eq!(config.sampling.top_p, 0.9);
    }

    #[test]
    fn test_unknown_platform_in_yaml_is_rejected() {
        let yaml = "model:\n  target_platform: rk9999\n";
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_target_platform_parsing() {
        assert_eq!("rk3588".parse::<TargetPlatform>().unwrap(), TargetPlatform::Rk3588);
        assert_eq!("RK3576".parse::<TargetPlatform>().unwrap(), TargetPlatform::Rk3576);
        assert!("rk1808".parse::<TargetPlatform>().is_err());
        assert_eq!(TargetPlatform::Rk3588.enabled_cpus_mask(), 0xF0);
    }
}
