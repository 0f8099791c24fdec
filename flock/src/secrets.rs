//! Provider credentials.
//!
//! The engine only needs two things per provider: an endpoint and, for hosted providers, an API key. Where they
//! come from is behind the [`SecretStore`] trait; the binary answers from the loaded [`Config`](crate::Config).

use crate::config::Config;
use crate::error::Result;
use crate::model::ProviderKind;

/// Endpoint and credentials for one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderSecret {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl std::fmt::Debug for ProviderSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSecret")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

pub trait SecretStore: Send + Sync {
    fn provider_secret(&self, provider: ProviderKind) -> Result<ProviderSecret>;
}

/// Secret store backed by static values, usually taken from configuration.
#[derive(Debug, Clone)]
pub struct ConfigSecretStore {
    openai: ProviderSecret,
    ollama: ProviderSecret,
}

impl ConfigSecretStore {
    pub fn new(openai: ProviderSecret, ollama: ProviderSecret) -> Self {
        Self { openai, ollama }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            openai: ProviderSecret {
                api_key: config.providers.openai.api_key.clone(),
                base_url: config.providers.openai.base_url.clone(),
            },
            ollama: ProviderSecret {
                api_key: None,
                base_url: config.providers.ollama.base_url.clone(),
            },
        }
    }
}

impl SecretStore for ConfigSecretStore {
    fn provider_secret(&self, provider: ProviderKind) -> Result<ProviderSecret> {
        Ok(match provider {
            ProviderKind::OpenAI => self.openai.clone(),
            ProviderKind::Ollama => self.ollama.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_api_key() {
        let secret = ProviderSecret {
            api_key: Some("sk-very-secret".to_string()),
            base_url: "https://api.openai.com/v1".to_string(),
        };
        let printed = format!("{secret:?}");
        assert!(!printed.contains("sk-very-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_from_config_defaults() {
        let store = ConfigSecretStore::from_config(&Config::default());
        let ollama = store.provider_secret(ProviderKind::Ollama).unwrap();
        assert_eq!(ollama.base_url, "http://localhost:11434");
        assert!(ollama.api_key.is_none());
    }
}
