//! Provider abstraction for model backends.
//!
//! This module defines the `Provider` trait, the uniform contract the engine needs from a model backend, and the
//! [`ProviderRegistry`] that resolves a [`ProviderKind`] to a live provider.
//!
//! Every completion asks the model for a JSON envelope `{"items": [...]}` with one item per input row. The item
//! schema is either a primitive type derived from the calling function (`string` for `llm_complete`, `boolean`
//! for `llm_filter`, ...) or, for structured output, the caller's own schema. Adapters translate the envelope
//! schema into their native request format; the executor parses and checks the envelope.

pub mod mock;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::{fmt, sync::Arc, time::Duration};

use crate::error::{Error, Result};
use crate::model::{ModelParameters, OutputSchema, ProviderKind};
use crate::secrets::SecretStore;

pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Which operations a provider implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub complete: bool,
    pub structured: bool,
    pub transcribe: bool,
    pub embed: bool,
    /// Whether image inputs may be passed as URLs rather than inline base64
    pub image_urls: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        complete: true,
        structured: true,
        transcribe: true,
        embed: true,
        image_urls: true,
    };
}

/// Primitive type of a response item when no caller schema applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    String,
    Boolean,
    Integer,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::String => "string",
            ItemType::Boolean => "boolean",
            ItemType::Integer => "integer",
        }
    }

    pub fn schema(&self) -> Value {
        json!({ "type": self.as_str() })
    }
}

/// An image attached to a completion request.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    /// Reference the provider fetches itself
    Url(String),
    /// Inline bytes, base64 encoded
    Base64 { data: String, mime_type: String },
}

impl ImageInput {
    /// Form used in an OpenAI `image_url` content part.
    pub fn as_data_url(&self) -> String {
        match self {
            ImageInput::Url(url) => url.clone(),
            ImageInput::Base64 { data, mime_type } => format!("data:{mime_type};base64,{data}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_id: String,
    pub prompt: String,
    pub images: Vec<ImageInput>,
    /// Number of items the envelope must contain
    pub expected_items: usize,
    pub item_type: ItemType,
    pub parameters: ModelParameters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw model output plus token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The envelope as returned by the model, still unparsed
    pub content: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub model_id: String,
    /// URL or local path of the audio file
    pub audio: String,
    pub parameters: ModelParameters,
}

#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub model_id: String,
    /// One text per row
    pub inputs: Vec<String>,
    pub parameters: ModelParameters,
}

/// One vector per input, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f64>>,
    pub usage: TokenUsage,
}

/// Uniform contract over model backends.
///
/// Implementations declare what they support through [`Provider::capabilities`]; callers check capabilities up
/// front so a missing operation fails at bind time rather than mid-query.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Plain completion; items are of `request.item_type`.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Completion whose items must satisfy `schema`.
    async fn complete_structured(&self, request: &CompletionRequest, schema: &OutputSchema) -> Result<Completion>;

    async fn transcribe(&self, _request: &TranscriptionRequest) -> Result<String> {
        Err(Error::UnsupportedCapability {
            provider: self.kind().to_string(),
            capability: "Audio transcription".to_string(),
        })
    }

    async fn embed(&self, _request: &EmbeddingRequest) -> Result<Embeddings> {
        Err(Error::UnsupportedCapability {
            provider: self.kind().to_string(),
            capability: "Embedding generation".to_string(),
        })
    }
}

/// Check that a provider answered with one vector per input.
pub(crate) fn check_embeddings(embeddings: &Embeddings, expected: usize) -> Result<()> {
    if embeddings.vectors.len() != expected {
        return Err(Error::MalformedBatchResponse {
            expected,
            actual: embeddings.vectors.len(),
        });
    }
    Ok(())
}

/// JSON schema of the `{"items": [...]}` envelope.
///
/// With `exact_count`, the array is pinned to exactly that many items (used where the backend supports
/// `minItems`/`maxItems` in its constrained decoding).
pub fn envelope_schema(item_schema: &Value, exact_count: Option<usize>) -> Value {
    let mut items = json!({
        "type": "array",
        "items": item_schema,
    });
    if let Some(count) = exact_count {
        items["minItems"] = json!(count);
        items["maxItems"] = json!(count);
    }
    json!({
        "type": "object",
        "properties": { "items": items },
        "required": ["items"],
        "additionalProperties": false,
    })
}

/// Insert pass-through parameters into a request body without clobbering fields the adapter owns.
pub(crate) fn merge_extra(body: &mut Value, parameters: &ModelParameters, reserved: &[&str]) {
    if let Value::Object(body) = body {
        for (key, value) in &parameters.extra {
            if !reserved.contains(&key.as_str()) {
                body.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Pull a human readable message out of an error body, if it has one.
pub(crate) fn error_message(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::String(message) => Some(message.clone()),
        Value::Null => None,
        error => Some(
            error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        ),
    }
}

/// Settings shared by the HTTP adapters.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }
}

/// Resolves provider kinds to providers, building HTTP adapters on first use.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<DashMap<ProviderKind, Arc<dyn Provider>>>,
    secrets: Option<Arc<dyn SecretStore>>,
    http: HttpSettings,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.iter().map(|e| *e.key()).collect::<Vec<_>>())
            .field("http", &self.http)
            .finish()
    }
}

impl ProviderRegistry {
    /// Registry that only serves explicitly registered providers.
    pub fn empty() -> Self {
        Self {
            providers: Arc::new(DashMap::new()),
            secrets: None,
            http: HttpSettings::default(),
        }
    }

    /// Registry that builds HTTP adapters from `secrets` when a provider is first requested.
    pub fn with_secrets(secrets: Arc<dyn SecretStore>, http: HttpSettings) -> Self {
        Self {
            providers: Arc::new(DashMap::new()),
            secrets: Some(secrets),
            http,
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>> {
        if let Some(provider) = self.providers.get(&kind) {
            return Ok(provider.value().clone());
        }

        let secrets = self.secrets.as_ref().ok_or_else(|| Error::MissingSecret {
            provider: kind.to_string(),
            secret: "provider configuration".to_string(),
        })?;
        let secret = secrets.provider_secret(kind)?;

        let provider: Arc<dyn Provider> = match kind {
            ProviderKind::OpenAI => {
                let api_key = secret.api_key.ok_or_else(|| Error::MissingSecret {
                    provider: kind.to_string(),
                    secret: "api_key".to_string(),
                })?;
                Arc::new(OpenAiProvider::new(secret.base_url, api_key, &self.http)?)
            }
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(secret.base_url, &self.http)?),
        };
        tracing::debug!(provider = %kind, "Provider initialised");

        // Another caller may have raced us; keep whichever landed first.
        Ok(self.providers.entry(kind).or_insert(provider).value().clone())
    }
}
