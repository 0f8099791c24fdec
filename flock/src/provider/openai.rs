//! OpenAI-compatible chat completions, embeddings and audio transcription.

use async_trait::async_trait;
use reqwest::{Client, multipart};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    Capabilities, Completion, CompletionRequest, EmbeddingRequest, Embeddings, HttpSettings, Provider, TokenUsage,
    TranscriptionRequest, check_embeddings, envelope_schema, error_message, merge_extra,
};
use crate::error::{Error, Result};
use crate::model::{OutputSchema, ProviderKind};

const PROVIDER: &str = "OpenAI";
const RESPONSE_SCHEMA_NAME: &str = "flock_response";

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Provider for the OpenAI API and compatible servers.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, settings: &HttpSettings) -> Result<Self> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn request_body(&self, request: &CompletionRequest, item_schema: &Value, strict: bool) -> Value {
        let content = if request.images.is_empty() {
            json!(request.prompt)
        } else {
            let mut parts = vec![json!({"type": "text", "text": request.prompt})];
            parts.extend(
                request
                    .images
                    .iter()
                    .map(|image| json!({"type": "image_url", "image_url": {"url": image.as_data_url()}})),
            );
            Value::Array(parts)
        };

        let mut body = json!({
            "model": request.model_id,
            "messages": [{"role": "user", "content": content}],
        });
        merge_extra(&mut body, &request.parameters, &["model", "messages", "response_format"]);
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": RESPONSE_SCHEMA_NAME,
                "strict": strict,
                "schema": envelope_schema(item_schema, None),
            }
        });
        body
    }

    /// POST a JSON body and return the parsed JSON response. Error bodies and non-success statuses become
    /// provider failures.
    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{path}", self.base_url);
        tracing::debug!(url = %url, "Sending request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(url = %url, error = %e, "OpenAI request failed");
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

    #[tracing::instrument(skip(self, body), fields(model = %model_id))]
    async fn send_chat(&self, model_id: &str, body: &Value) -> Result<Completion> {
        let parsed = self.post_json("chat/completions", body).await?;
        let completion: ChatCompletionResponse = serde_json::from_value(parsed)
            .map_err(|e| Error::provider(PROVIDER, format!("unexpected response shape: {e}")))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider(PROVIDER, "response contained no choices"))?;

        match choice.finish_reason.as_deref() {
            Some("length") => {
                return Err(Error::ExceededMaxOutputTokens {
                    provider: PROVIDER.to_string(),
                });
            }
            Some("content_filter") => {
                return Err(Error::provider(
                    PROVIDER,
                    "the content filter was triggered, the response is incomplete",
                ));
            }
            _ => {}
        }
        if let Some(refusal) = choice.message.refusal {
            return Err(Error::provider(PROVIDER, format!("the request was refused: {refusal}")));
        }

        let content = choice
            .message
            .content
            .ok_or_else(|| Error::provider(PROVIDER, "response message has no content"))?;
        let usage = completion
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        tracing::debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Chat completion finished"
        );
        Ok(Completion { content, usage })
    }

    async fn fetch_audio(&self, audio: &str) -> Result<Vec<u8>> {
        if audio.starts_with("http://") || audio.starts_with("https://") {
            let response = self
                .client
                .get(audio)
                .send()
                .await
                .map_err(|e| Error::provider(PROVIDER, format!("failed to download audio '{audio}': {e}")))?;
            if !response.status().is_success() {
                return Err(Error::provider(
                    PROVIDER,
                    format!("failed to download audio '{audio}': HTTP {}", response.status()),
                ));
            }
            Ok(response.bytes().await?.to_vec())
        } else {
            tokio::fs::read(audio)
                .await
                .map_err(|e| Error::provider(PROVIDER, format!("failed to read audio file '{audio}': {e}")))
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = self.request_body(request, &request.item_type.schema(), false);
        self.send_chat(&request.model_id, &body).await
    }

    async fn complete_structured(&self, request: &CompletionRequest, schema: &OutputSchema) -> Result<Completion> {
        let body = self.request_body(request, &schema.schema, schema.strict);
        self.send_chat(&request.model_id, &body).await
    }

    #[tracing::instrument(skip(self, request), fields(model = %request.model_id, inputs = request.inputs.len()))]
    async fn embed(&self, request: &EmbeddingRequest) -> Result<Embeddings> {
        let mut body = json!({
            "model": request.model_id,
            "input": request.inputs,
        });
        merge_extra(&mut body, &request.parameters, &["model", "input"]);

        let parsed = self.post_json("embeddings", &body).await?;
        let response: EmbeddingResponse = serde_json::from_value(parsed)
            .map_err(|e| Error::provider(PROVIDER, format!("unexpected embedding response: {e}")))?;

        let mut data = response.data;
        data.sort_by_key(|entry| entry.index);
        let embeddings = Embeddings {
            vectors: data.into_iter().map(|entry| entry.embedding).collect(),
            usage: response
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: 0,
                })
                .unwrap_or_default(),
        };
        check_embeddings(&embeddings, request.inputs.len())?;
        Ok(embeddings)
    }

    #[tracing::instrument(skip(self, request), fields(model = %request.model_id))]
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<String> {
        let bytes = self.fetch_audio(&request.audio).await?;
        let file_name = request
            .audio
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("audio")
            .to_string();

        let mut form = multipart::Form::new()
            .text("model", request.model_id.clone())
            .part("file", multipart::Part::bytes(bytes).file_name(file_name));
        for (key, value) in &request.parameters.extra {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), value);
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::provider(PROVIDER, e.to_string()))?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| error_message(&body))
                .unwrap_or(text);
            return Err(Error::provider(PROVIDER, format!("HTTP {status} - {message}")));
        }

        let transcription: TranscriptionResponse = serde_json::from_str(&text)
            .map_err(|e| Error::provider(PROVIDER, format!("unexpected transcription response: {e}")))?;
        Ok(transcription.text)
    }
}
