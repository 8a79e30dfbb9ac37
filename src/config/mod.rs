pub mod validation;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Chat-completions endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub use_env_proxy: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.siliconflow.cn/v1".to_string()
}
fn default_model() -> String {
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-7B".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}

impl UpstreamConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Full URL of the streaming chat-completions route.
    #[must_use]
    pub fn completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let mut out = String::with_capacity(base.len() + 18);
        out.push_str(base);
        out.push_str("/chat/completions");
        out
    }
}

/// Sampling parameters sent with every analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_top_p() -> f32 {
    0.7
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_follow_interval_ms")]
    pub follow_interval_ms: u64,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_follow_interval_ms() -> u64 {
    200
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            follow_interval_ms: default_follow_interval_ms(),
        }
    }
}

impl FeaturesConfig {
    #[must_use]
    pub fn follow_interval(&self) -> Duration {
        Duration::from_millis(self.follow_interval_ms)
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
