//! Ollama `/api/generate` and `/api/embed` adapter.
//!
//! Ollama constrains decoding with a native `format` schema, so the envelope is pinned to exactly as many items
//! as the chunk has rows. Images must be inline base64; transcription is not available.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    Capabilities, Completion, CompletionRequest, EmbeddingRequest, Embeddings, HttpSettings, ImageInput, Provider,
    TokenUsage, check_embeddings, envelope_schema, error_message, merge_extra,
};
use crate::error::{Error, Result};
use crate::model::{OutputSchema, ProviderKind};

const PROVIDER: &str = "Ollama";

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f64>>,
    #[serde(default)]
    prompt_eval_count: u64,
}

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, settings: &HttpSettings) -> Result<Self> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn request_body(&self, request: &CompletionRequest, item_schema: &Value) -> Value {
        let mut body = json!({
            "model": request.model_id,
            "prompt": request.prompt,
            "stream": false,
        });
        if !request.images.is_empty() {
            let images: Vec<&str> = request
                .images
                .iter()
                .map(|image| match image {
                    ImageInput::Base64 { data, .. } => data.as_str(),
                    // Fetch failed upstream; the raw reference is passed through and Ollama decides.
                    ImageInput::Url(url) => url.as_str(),
                })
                .collect();
            body["images"] = json!(images);
        }
        merge_extra(&mut body, &request.parameters, &["model", "prompt", "stream", "images", "format"]);
        body["format"] = envelope_schema(item_schema, Some(request.expected_items));
        body
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{path}", self.base_url);
        tracing::debug!(url = %url, "Sending request");

        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            tracing::error!(url = %url, error = %e, "Ollama request failed");
            Error::provider(PROVIDER, e.to_string())
        })?;

        let status = response.status();
        let text = response.text().await?;
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| Error::provider(PROVIDER, format!("HTTP {status} - response is not JSON: {e}")))?;

        if let Some(message) = error_message(&parsed) {
            return Err(Error::provider(PROVIDER, format!("HTTP {status} - {message}")));
        }
        if !status.is_success() {
            return Err(Error::provider(PROVIDER, format!("HTTP {status} - {text}")));
        }
        Ok(parsed)
    }

    #[tracing::instrument(skip(self, body))]
    async fn generate(&self, model_id: &str, body: &Value) -> Result<Completion> {
        let parsed = self.post_json("api/generate", body).await?;
        let generated: GenerateResponse = serde_json::from_value(parsed)
            .map_err(|e| Error::provider(PROVIDER, format!("unexpected response shape: {e}")))?;
        match generated.done_reason.as_deref() {
            None | Some("stop") => {}
            Some("length") => {
                return Err(Error::ExceededMaxOutputTokens {
                    provider: PROVIDER.to_string(),
                });
            }
            Some(other) => {
                return Err(Error::provider(PROVIDER, format!("generation stopped early: {other}")));
            }
        }

        Ok(Completion {
            content: generated.response,
            usage: TokenUsage {
                input_tokens: generated.prompt_eval_count,
                output_tokens: generated.eval_count,
            },
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            complete: true,
            structured: true,
            transcribe: false,
            embed: true,
            image_urls: false,
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = self.request_body(request, &request.item_type.schema());
        self.generate(&request.model_id, &body).await
    }

    async fn complete_structured(&self, request: &CompletionRequest, schema: &OutputSchema) -> Result<Completion> {
        let body = self.request_body(request, &schema.schema);
        self.generate(&request.model_id, &body).await
    }

    #[tracing::instrument(skip(self, request), fields(model = %request.model_id, inputs = request.inputs.len()))]
    async fn embed(&self, request: &EmbeddingRequest) -> Result<Embeddings> {
        let mut body = json!({
            "model": request.model_id,
            "input": request.inputs,
        });
        merge_extra(&mut body, &request.parameters, &["model", "input"]);

        let parsed = self.post_json("api/embed", &body).await?;
        let response: EmbedResponse = serde_json::from_value(parsed)
            .map_err(|e| Error::provider(PROVIDER, format!("unexpected embedding response: {e}")))?;
        let embeddings = Embeddings {
            vectors: response.embeddings,
            usage: TokenUsage {
                input_tokens: response.prompt_eval_count,
                output_tokens: 0,
            },
        };
        check_embeddings(&embeddings, request.inputs.len())?;
        Ok(embeddings)
    }
}
