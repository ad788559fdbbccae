//! Command-line interface
//!
//! Flags override the YAML file, and every flag falls back to an environment
//! variable. Empty values count as unset so deployment scripts can export
//! blank optionals.

use clap::Parser;
use rkserve_common::{GatewayConfig, Result, TargetPlatform};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "rkserve-server", version, about = "HTTP gateway for RKLLM models")]
pub struct Args {
    /// YAML configuration file
    #[arg(long, env = "RKSERVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Absolute path of the converted RKLLM model on the board
    #[arg(long = "rkllm_model_path", env = "RKLLM_MODEL_PATH")]
    pub rkllm_model_path: Option<String>,

    /// Target platform: rk3588 or rk3576
    #[arg(long = "target_platform", env = "TARGET_PLATFORM")]
    pub target_platform: Option<String>,

    /// Absolute path of the LoRA adapter on the board
    #[arg(long = "lora_model_path", env = "LORA_MODEL_PATH")]
    pub lora_model_path: Option<String>,

    /// Absolute path of the prompt cache file on the board
    #[arg(long = "prompt_cache_path", env = "PROMPT_CACHE_PATH")]
    pub prompt_cache_path: Option<String>,

    /// Native runtime shared library
    #[arg(long = "library_path", env = "RKLLM_LIBRARY_PATH")]
    pub library_path: Option<String>,

    /// Address to bind
    #[arg(long = "bind_address", env = "RKSERVE_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Port to listen on
    #[arg(long, env = "RKSERVE_PORT")]
    pub port: Option<u16>,

    /// Log level when RUST_LOG is unset
    #[arg(long = "log_level", env = "RKSERVE_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Args {
    /// Merge defaults, the optional config file, and the flags
    pub fn into_config(self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) if !path.as_os_str().is_empty() => GatewayConfig::from_file(path)?,
            _ => GatewayConfig::default(),
        };

        if let Some(path) = non_empty(self.rkllm_model_path) {
            config.model.model_path = PathBuf::from(path);
        }
        if let Some(platform) = non_empty(self.target_platform) {
            config.model.target_platform = Some(platform.parse::<TargetPlatform>()?);
        }
        if let Some(path) = non_empty(self.lora_model_path) {
            config.model.lora_model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty(self.prompt_cache_path) {
            config.model.prompt_cache_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty(self.library_path) {
            config.runtime.library_path = PathBuf::from(path);
        }
        if let Some(address) = non_empty(self.bind_address) {
            config.bind_address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = non_empty(self.log_level) {
            config.observability.log_level = level;
        }

        Ok(config)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
