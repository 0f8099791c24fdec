//! Model declarations and the in-memory catalog behind `CREATE MODEL`.
//!
//! A [`ModelDescriptor`] binds a user-facing name to an underlying model id on one provider, along with default
//! request parameters. Descriptors are immutable once created: re-declaring a name is rejected rather than
//! overwriting, so every call site resolving a name during a query sees the same model.

pub mod parameters;

use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr, sync::Arc};

use crate::error::{Error, Result};

pub use parameters::{ModelParameters, OutputSchema, ResponseFormat};

/// The backends a model can be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(alias = "OpenAI")]
    OpenAI,
    #[serde(alias = "Ollama")]
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAI => write!(f, "OpenAI"),
            ProviderKind::Ollama => write!(f, "Ollama"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAI),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(Error::invalid(format!("Unknown provider '{other}', expected one of: openai, ollama"))),
        }
    }
}

/// A declared model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub model_id: String,
    pub provider: ProviderKind,
    #[serde(default = "empty_object")]
    pub default_parameters: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, model_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
            provider,
            default_parameters: empty_object(),
        }
    }

    pub fn with_default_parameters(mut self, parameters: Value) -> Self {
        self.default_parameters = parameters;
        self
    }
}

/// Concurrent catalog of declared models, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Arc<DashMap<String, Arc<ModelDescriptor>>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model. Fails if the name is taken, or if the default parameters are not a JSON object or carry
    /// an invalid response format.
    pub fn create_model(&self, descriptor: ModelDescriptor) -> Result<Arc<ModelDescriptor>> {
        if descriptor.name.trim().is_empty() {
            return Err(Error::invalid("Model name must not be empty"));
        }
        if descriptor.model_id.trim().is_empty() {
            return Err(Error::invalid(format!("Model '{}' has an empty model id", descriptor.name)));
        }
        // Parsing validates the recognised keys up front.
        ModelParameters::from_value(&descriptor.default_parameters)?;

        let descriptor = Arc::new(descriptor);
        match self.models.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(Error::ModelAlreadyExists {
                name: descriptor.name.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(descriptor.clone());
                tracing::debug!(model = %descriptor.name, provider = %descriptor.provider, "Model created");
                Ok(descriptor)
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModelDescriptor>> {
        self.models
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownModel { name: name.to_string() })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
