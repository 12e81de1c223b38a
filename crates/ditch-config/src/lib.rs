use ditch_core::{BanterError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

mod env_substitution;

pub use env_substitution::substitute_env_vars;

/// Overrides `openai.api_key` when set.
pub const API_KEY_ENV: &str = "DITCH_OPENAI_API_KEY";
/// Overrides the default config file location when set.
pub const CONFIG_PATH_ENV: &str = "DITCH_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DitchConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub aws: AwsSettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    Bedrock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default = "default_model")]
    pub name: String,
    /// Ceiling on the summed token cost of a dialog plus its next reply.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Held back from `max_tokens` for the reply; also the reply size limit.
    #[serde(default = "default_reserved_tokens")]
    pub reserved_tokens: u32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSettings {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl DitchConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BanterError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config = Self::parse_yaml(yaml)?;
        config.apply_api_key_override(env::var(API_KEY_ENV).ok());
        config.validate()?;

        Ok(config)
    }

    fn parse_yaml(yaml: &str) -> Result<Self> {
        // Go through a JSON value so `${VAR}` references can be expanded
        // before the typed parse.
        let mut raw: serde_json::Value = serde_yaml::from_str(yaml)
            .map_err(|e| BanterError::ConfigError(format!("Failed to parse YAML: {}", e)))?;
        if raw.is_null() {
            raw = serde_json::Value::Object(Default::default());
        }
        substitute_env_vars(&mut raw)?;

        serde_json::from_value(raw)
            .map_err(|e| BanterError::ConfigError(format!("Invalid configuration: {}", e)))
    }

    fn apply_api_key_override(&mut self, api_key: Option<String>) {
        if let Some(api_key) = api_key.filter(|key| !key.is_empty()) {
            self.openai.api_key = api_key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.name.is_empty() {
            return Err(BanterError::ConfigError("Model name cannot be empty".into()));
        }
        if self.model.reserved_tokens >= self.model.max_tokens {
            return Err(BanterError::ConfigError(format!(
                "reserved_tokens ({}) must be smaller than max_tokens ({})",
                self.model.reserved_tokens, self.model.max_tokens
            )));
        }
        if self.model.retry_attempts == 0 {
            return Err(BanterError::ConfigError("retry_attempts must be at least 1".into()));
        }
        if self.transport.max_message_chars == 0 {
            return Err(BanterError::ConfigError(
                "max_message_chars must be greater than 0".into(),
            ));
        }
        if self.model.provider == Provider::Bedrock && self.aws.region.is_empty() {
            return Err(BanterError::ConfigError("AWS region cannot be empty".into()));
        }
        Ok(())
    }

    /// `$DITCH_CONFIG` if set, otherwise `config.yaml` in the working directory.
    pub fn default_config_path() -> PathBuf {
        env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.yaml"))
    }

    /// Budget left for dialog history once the reply reservation is taken out.
    pub fn history_budget(&self) -> i64 {
        i64::from(self.model.max_tokens) - i64::from(self.model.reserved_tokens)
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            name: default_model(),
            max_tokens: default_max_tokens(),
            reserved_tokens: default_reserved_tokens(),
            retry_attempts: default_retry_attempts(),
            system_prompt: None,
        }
    }
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: default_region(),
            profile: None,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
        }
    }
}

fn default_model() -> String { "gpt-3.5-turbo".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_reserved_tokens() -> u32 { 512 }
fn default_retry_attempts() -> u32 { 3 }
fn default_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_timeout_secs() -> u64 { 60 }
fn default_region() -> String { "us-east-1".to_string() }
fn default_max_message_chars() -> usize { 2000 }
