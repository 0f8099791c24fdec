//! Configuration management.
//!
//! Configuration is loaded from a YAML file and then overridden by environment variables:
//!
//! - `FLOCK_`-prefixed variables map onto config fields, with `__` separating nested keys. For example
//!   `FLOCK_PROVIDERS__OLLAMA__BASE_URL=http://gpu-box:11434` sets `providers.ollama.base_url`.
//! - `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `OLLAMA_URL` are honoured without a prefix, as most tooling around
//!   these providers already exports them.
//!
//! ```yaml
//! default_batch_size: 8
//! default_tuple_format: markdown
//! request_timeout: 90s
//! providers:
//!   ollama:
//!     base_url: http://localhost:11434
//! models:
//!   - name: summariser
//!     model_id: llama3.2
//!     provider: ollama
//!     default_parameters:
//!       temperature: 0.1
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::batch::BatchSize;
use crate::engine::EngineSettings;
use crate::error::{Error, Result};
use crate::model::ModelDescriptor;
use crate::prompt::TupleFormat;

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(short = 'f', long, env = "FLOCK_CONFIG", default_value = "flock.yaml")]
    pub config: String,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Job file describing the tables and function calls to run
    #[arg(short = 'j', long, env = "FLOCK_JOB")]
    pub job: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Batch size for calls that do not set one
    pub default_batch_size: usize,
    pub default_tuple_format: TupleFormat,
    /// Rows per scalar execution fragment. Each fragment runs on its own task.
    pub vector_size: usize,
    /// Shrink the batch size and retry when a provider reports an output-token overflow
    pub adaptive_batching: bool,
    /// Timeout for provider requests and media downloads
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub log_format: LogFormat,
    pub providers: ProvidersConfig,
    /// Models declared at startup
    pub models: Vec<ModelDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvidersConfig {
    pub openai: OpenAiConfig,
    pub ollama: OllamaConfig,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OllamaConfig {
    pub base_url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_URL.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_batch_size: 1,
            default_tuple_format: TupleFormat::Xml,
            vector_size: BatchSize::DEFAULT_VECTOR_SIZE.get(),
            adaptive_batching: true,
            request_timeout: Duration::from_secs(120),
            log_format: LogFormat::Text,
            providers: ProvidersConfig::default(),
            models: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> std::result::Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("FLOCK_").split("__").ignore(&["config", "job"]))
            .merge(Env::raw().only(&["OPENAI_API_KEY"]).map(|_| "providers.openai.api_key".into()))
            .merge(Env::raw().only(&["OPENAI_BASE_URL"]).map(|_| "providers.openai.base_url".into()))
            .merge(Env::raw().only(&["OLLAMA_URL"]).map(|_| "providers.ollama.base_url".into()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_batch_size == 0 {
            return Err(Error::invalid("Config validation: default_batch_size must be at least 1"));
        }
        if self.vector_size == 0 {
            return Err(Error::invalid("Config validation: vector_size must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::invalid("Config validation: request_timeout must be greater than zero"));
        }
        validate_base_url("providers.openai.base_url", &self.providers.openai.base_url)?;
        validate_base_url("providers.ollama.base_url", &self.providers.ollama.base_url)?;

        let mut names = std::collections::HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(Error::invalid(format!(
                    "Config validation: model '{}' is declared more than once",
                    model.name
                )));
            }
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings {
            default_batch_size: BatchSize::new(self.default_batch_size)?,
            default_tuple_format: self.default_tuple_format,
            vector_size: BatchSize::new(self.vector_size)?,
            adaptive_batching: self.adaptive_batching,
        })
    }
}

fn validate_base_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).map_err(|e| Error::invalid(format!("Config validation: {field} '{value}' is not a URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::invalid(format!(
            "Config validation: {field} must use http or https, got '{other}'"
        ))),
    }
}
