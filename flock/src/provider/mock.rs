//! Scriptable in-process provider for tests and dry runs.
//!
//! Responses are served from a FIFO queue. When the queue is empty, an optional responder closure computes a
//! response from the request, which is how tests drive order-sensitive reductions (e.g. "always pick the row whose
//! id is lowest") without scripting every call.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use super::{
    Capabilities, Completion, CompletionRequest, EmbeddingRequest, Embeddings, ImageInput, Provider, TokenUsage,
    TranscriptionRequest,
};
use crate::error::{Error, Result};
use crate::model::{OutputSchema, ProviderKind};

type Responder = dyn Fn(&CompletionRequest) -> Result<Completion> + Send + Sync;

/// Record of a call made to the mock provider.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub model_id: String,
    pub prompt: String,
    pub images: Vec<ImageInput>,
    pub expected_items: usize,
    /// Schema passed to `complete_structured`, `None` for plain completions
    pub schema: Option<Value>,
}

/// Mock provider.
///
/// # Example
/// ```
/// use flock::model::ProviderKind;
/// use flock::provider::MockProvider;
///
/// let mock = MockProvider::new(ProviderKind::OpenAI);
/// mock.add_items(vec!["Paris".into()]);
/// assert_eq!(mock.call_count(), 0);
/// ```
#[derive(Clone)]
pub struct MockProvider {
    kind: ProviderKind,
    capabilities: Capabilities,
    responses: Arc<Mutex<VecDeque<Result<Completion>>>>,
    transcriptions: Arc<Mutex<VecDeque<Result<String>>>>,
    responder: Option<Arc<Responder>>,
    latency: Option<Duration>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    transcription_calls: Arc<Mutex<Vec<String>>>,
    embeddings: Arc<Mutex<VecDeque<Result<Embeddings>>>>,
    embedding_calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockProvider")
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .field("queued", &self.responses.lock().len())
            .finish()
    }
}

impl MockProvider {
    /// Mock with the capability set the real provider of `kind` declares.
    pub fn new(kind: ProviderKind) -> Self {
        let capabilities = match kind {
            ProviderKind::OpenAI => Capabilities::ALL,
            ProviderKind::Ollama => Capabilities {
                complete: true,
                structured: true,
                transcribe: false,
                embed: true,
                image_urls: false,
            },
        };
        Self {
            kind,
            capabilities,
            responses: Arc::new(Mutex::new(VecDeque::new())),
            transcriptions: Arc::new(Mutex::new(VecDeque::new())),
            responder: None,
            latency: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            transcription_calls: Arc::new(Mutex::new(Vec::new())),
            embeddings: Arc::new(Mutex::new(VecDeque::new())),
            embedding_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Compute responses from requests once the queue is drained.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<Completion> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Delay every completion by `latency` before it is recorded and answered.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a raw response.
    pub fn add_response(&self, response: Result<Completion>) {
        self.responses.lock().push_back(response);
    }

    /// Queue a well-formed `{"items": [...]}` envelope.
    pub fn add_items(&self, items: Vec<Value>) {
        self.add_response(Ok(envelope(items)));
    }

    pub fn add_transcription(&self, transcription: Result<String>) {
        self.transcriptions.lock().push_back(transcription);
    }

    /// Get all calls that have been made to this mock provider.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Queue an embedding response. Without one, `embed` derives vectors from the input text.
    pub fn add_embeddings(&self, embeddings: Result<Embeddings>) {
        self.embeddings.lock().push_back(embeddings);
    }

    /// Input batches passed to `embed`.
    pub fn embedding_calls(&self) -> Vec<Vec<String>> {
        self.embedding_calls.lock().clone()
    }

    /// Audio references passed to `transcribe`.
    pub fn transcription_calls(&self) -> Vec<String> {
        self.transcription_calls.lock().clone()
    }

    async fn respond(&self, request: &CompletionRequest, schema: Option<&OutputSchema>) -> Result<Completion> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.calls.lock().push(MockCall {
            model_id: request.model_id.clone(),
            prompt: request.prompt.clone(),
            images: request.images.clone(),
            expected_items: request.expected_items,
            schema: schema.map(|s| s.schema.clone()),
        });

        if let Some(response) = self.responses.lock().pop_front() {
            return response;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => Err(Error::provider(
                self.kind.to_string(),
                format!("No mock response configured for call {}", self.call_count()),
            )),
        }
    }
}

/// Deterministic stand-in vector: character count, word count and the sum of the bytes.
pub fn text_vector(text: &str) -> Vec<f64> {
    vec![
        text.chars().count() as f64,
        text.split_whitespace().count() as f64,
        text.bytes().map(f64::from).sum(),
    ]
}

/// A completion carrying `items` in the envelope, with token counts proportional to the item count.
pub fn envelope(items: Vec<Value>) -> Completion {
    let output_tokens = items.len() as u64;
    Completion {
        content: json!({ "items": items }).to_string(),
        usage: TokenUsage {
            input_tokens: 10,
            output_tokens,
        },
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.respond(request, None).await
    }

    async fn complete_structured(&self, request: &CompletionRequest, schema: &OutputSchema) -> Result<Completion> {
        self.respond(request, Some(schema)).await
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<Embeddings> {
        if !self.capabilities.embed {
            return Err(Error::UnsupportedCapability {
                provider: self.kind.to_string(),
                capability: "Embedding generation".to_string(),
            });
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.embedding_calls.lock().push(request.inputs.clone());
        if let Some(response) = self.embeddings.lock().pop_front() {
            return response;
        }
        Ok(Embeddings {
            vectors: request.inputs.iter().map(|input| text_vector(input)).collect(),
            usage: TokenUsage {
                input_tokens: request.inputs.len() as u64,
                output_tokens: 0,
            },
        })
    }

    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<String> {
        if !self.capabilities.transcribe {
            return Err(Error::UnsupportedCapability {
                provider: self.kind.to_string(),
                capability: "Audio transcription".to_string(),
            });
        }
        self.transcription_calls.lock().push(request.audio.clone());
        self.transcriptions.lock().pop_front().unwrap_or_else(|| {
            Err(Error::provider(
                self.kind.to_string(),
                format!("No mock transcription configured for {}", request.audio),
            ))
        })
    }
}
