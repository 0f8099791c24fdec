//! One chunk, one provider call.
//!
//! [`CallExecutor::execute`] renders the chunk's prompt, calls the provider, records the call in the metrics
//! registry and returns the parsed response items. It never retries: any failure is returned to the reduction
//! strategy driving the chunk, which decides whether the batch can be re-planned.

use serde_json::Value;
use std::{sync::Arc, time::Instant};

use crate::error::{Error, Result};
use crate::functions::{BoundCall, embedding::EmbeddingCall};
use crate::metrics::{CallRecord, MetricsRegistry, MetricsScope};
use crate::model::OutputSchema;
use crate::prompt::{PromptRenderer, TaggedRow, renderer::RenderOptions};
use crate::provider::{CompletionRequest, EmbeddingRequest, ProviderRegistry, check_embeddings};

#[derive(Debug, Clone)]
pub struct CallExecutor {
    providers: ProviderRegistry,
    renderer: PromptRenderer,
    metrics: Arc<MetricsRegistry>,
}

impl CallExecutor {
    pub fn new(providers: ProviderRegistry, renderer: PromptRenderer, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            providers,
            renderer,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Execute one chunk and return exactly `call.function.expected_items(rows.len())` items.
    ///
    /// The call is recorded as soon as the provider answers, before the response is parsed, so malformed
    /// responses still count towards the call site's usage.
    #[tracing::instrument(skip_all, fields(function = %call.function, model = %call.model.name, rows = rows.len()))]
    pub async fn execute(
        &self,
        call: &BoundCall,
        scope: &MetricsScope,
        rows: &[TaggedRow<'_>],
        previous_summary: Option<&str>,
    ) -> Result<Vec<Value>> {
        let started = Instant::now();
        let provider = self.providers.get(call.model.provider)?;
        let options = RenderOptions {
            tuple_format: call.tuple_format,
            provider_fetches_urls: provider.capabilities().image_urls,
        };
        let rendered = self
            .renderer
            .render(call.function, &call.prompt, rows, options, previous_summary)
            .await?;

        let schema = call
            .function
            .uses_output_schema()
            .then(|| call.parameters.output_schema())
            .flatten();
        let expected = call.function.expected_items(rows.len());
        let request = CompletionRequest {
            model_id: call.model.model_id.clone(),
            prompt: rendered.text,
            images: rendered.images,
            expected_items: expected,
            item_type: call.function.item_type(),
            parameters: call.parameters.clone(),
        };

        let api_started = Instant::now();
        let completion = match &schema {
            Some(schema) => provider.complete_structured(&request, schema).await,
            None => provider.complete(&request).await,
        }
        .inspect_err(|e| tracing::error!(error = %e, "Provider call failed"))?;
        let api_duration = api_started.elapsed();

        let items = parse_items(&completion.content, expected, schema.as_ref(), &call.model.provider.to_string());

        self.metrics.record(
            call.call_site(),
            scope,
            &CallRecord {
                input_tokens: completion.usage.input_tokens,
                output_tokens: completion.usage.output_tokens,
                api_duration,
                execution_time: started.elapsed(),
            },
        );
        tracing::debug!(
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            api_ms = api_duration.as_millis() as u64,
            "Chunk call completed"
        );
        items
    }

    /// Embed one chunk of inputs, returning one vector per input.
    #[tracing::instrument(skip_all, fields(model = %call.model.name, inputs = inputs.len()))]
    pub async fn embed(&self, call: &EmbeddingCall, scope: &MetricsScope, inputs: Vec<String>) -> Result<Vec<Vec<f64>>> {
        let started = Instant::now();
        let provider = self.providers.get(call.model.provider)?;
        let expected = inputs.len();
        let request = EmbeddingRequest {
            model_id: call.model.model_id.clone(),
            inputs,
            parameters: call.parameters.clone(),
        };

        let embeddings = provider
            .embed(&request)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Provider call failed"))?;
        let api_duration = started.elapsed();

        self.metrics.record(
            call.call_site(),
            scope,
            &CallRecord {
                input_tokens: embeddings.usage.input_tokens,
                output_tokens: embeddings.usage.output_tokens,
                api_duration,
                execution_time: started.elapsed(),
            },
        );
        check_embeddings(&embeddings, expected)?;
        Ok(embeddings.vectors)
    }
}

/// Parse the `{"items": [...]}` envelope, check its length and validate each item against `schema`.
///
/// A bare array is accepted in place of the envelope; some models drop the wrapper object.
pub fn parse_items(content: &str, expected: usize, schema: Option<&OutputSchema>, provider: &str) -> Result<Vec<Value>> {
    let parsed: Value = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| Error::provider(provider, format!("response is not valid JSON: {e}")))?;

    let items = match parsed {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("items") {
            Some(Value::Array(items)) => items,
            _ => return Err(Error::provider(provider, "response has no \"items\" array")),
        },
        _ => return Err(Error::provider(provider, "response is neither an object nor an array")),
    };

    if items.len() != expected {
        return Err(Error::MalformedBatchResponse {
            expected,
            actual: items.len(),
        });
    }
    if let Some(schema) = schema {
        for item in &items {
            schema.validate(item)?;
        }
    }
    Ok(items)
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::functions::FunctionKind;
    use crate::metrics::StateId;
    use crate::model::{ModelDescriptor, ModelParameters, ProviderKind};
    use crate::prompt::{BoundColumn, BoundPrompt, ContextColumn, HttpMediaFetcher, TupleFormat};
    use crate::provider::{Completion, Embeddings, MockProvider, TokenUsage};
    use crate::batch::BatchSize;
    use crate::types::Row;
    use serde_json::json;
    use std::time::Duration;

    fn schema() -> OutputSchema {
        OutputSchema::new(
            "capital",
            json!({
                "type": "object",
                "properties": {"capital": {"type": "string", "pattern": "^[A-Za-z]+$"}},
                "required": ["capital"]
            }),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_envelope_and_bare_array() {
        let items = parse_items(r#"{"items": ["a", "b"]}"#, 2, None, "OpenAI").unwrap();
        assert_eq!(items, vec![json!("a"), json!("b")]);

        let items = parse_items("```json\n[true]\n```", 1, None, "OpenAI").unwrap();
        assert_eq!(items, vec![json!(true)]);
    }

    #[test]
    fn test_parse_count_mismatch() {
        let err = parse_items(r#"{"items": ["a"]}"#, 3, None, "OpenAI").unwrap_err();
        assert!(matches!(err, Error::MalformedBatchResponse { expected: 3, actual: 1 }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for content in ["not json", r#"{"answers": []}"#, "42"] {
            let err = parse_items(content, 1, None, "Ollama").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProviderFailure, "content {content}");
            assert!(err.to_string().contains("Ollama"));
        }
    }

    #[test]
    fn test_parse_validates_schema() {
        let items = parse_items(r#"{"items": [{"capital": "Ottawa"}]}"#, 1, Some(&schema()), "OpenAI").unwrap();
        assert_eq!(items[0], json!({"capital": "Ottawa"}));

        let err = parse_items(r#"{"items": [{"capital": "Ottawa!"}]}"#, 1, Some(&schema()), "OpenAI").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailure);
    }

    fn call(function: FunctionKind, parameters: ModelParameters, metrics: &MetricsRegistry) -> BoundCall {
        let model = Arc::new(ModelDescriptor::new("gpt", "gpt-4o-mini", ProviderKind::OpenAI));
        let prompt = BoundPrompt {
            template: "Capital of {country}?".to_string(),
            columns: vec![BoundColumn {
                spec: ContextColumn::text("country"),
                transcription_model: None,
            }],
        };
        BoundCall::for_test(function, model, BatchSize::ONE, TupleFormat::Xml, parameters, prompt, metrics)
    }

    fn executor(mock: &MockProvider, metrics: Arc<MetricsRegistry>) -> CallExecutor {
        let providers = ProviderRegistry::empty();
        providers.register(Arc::new(mock.clone()));
        let fetcher = Arc::new(HttpMediaFetcher::new(Duration::from_secs(1)).unwrap());
        CallExecutor::new(providers.clone(), PromptRenderer::new(providers, fetcher), metrics)
    }

    #[tokio::test]
    async fn test_execute_structured_records_metrics() {
        let metrics = Arc::new(MetricsRegistry::new());
        let mock = MockProvider::new(ProviderKind::OpenAI);
        mock.add_items(vec![json!({"capital": "Ottawa"})]);

        let parameters = ModelParameters::from_value(&json!({
            "response_format": {"type": "json_schema", "json_schema": {"name": "capital", "schema": schema().schema}}
        }))
        .unwrap();
        let call = call(FunctionKind::Complete, parameters, &metrics);
        let row: Row = json!({"country": "Canada"}).as_object().unwrap().clone();
        let scope = MetricsScope::new("1", StateId(1));

        let items = executor(&mock, metrics.clone())
            .execute(&call, &scope, &[TaggedRow { id: 0, row: &row }], None)
            .await
            .unwrap();
        assert_eq!(items, vec![json!({"capital": "Ottawa"})]);

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].schema.is_some());
        assert!(calls[0].prompt.contains("Capital of Canada?"));

        let recorded = metrics.get(call.site_key()).unwrap();
        assert_eq!(recorded.api_calls, 1);
        assert_eq!(recorded.input_tokens, 10);
        assert_eq!(recorded.output_tokens, 1);
        assert_eq!(recorded.model_name, "gpt");
    }

    #[tokio::test]
    async fn test_malformed_response_is_still_recorded() {
        let metrics = Arc::new(MetricsRegistry::new());
        let mock = MockProvider::new(ProviderKind::OpenAI);
        mock.add_response(Ok(Completion {
            content: r#"{"items": []}"#.to_string(),
            usage: TokenUsage {
                input_tokens: 7,
                output_tokens: 2,
            },
        }));

        let call = call(FunctionKind::Filter, ModelParameters::default(), &metrics);
        let row: Row = json!({"country": "Canada"}).as_object().unwrap().clone();
        let scope = MetricsScope::new("1", StateId(1));

        let err = executor(&mock, metrics.clone())
            .execute(&call, &scope, &[TaggedRow { id: 0, row: &row }], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedBatchResponse);
        assert_eq!(metrics.get(call.site_key()).unwrap().total_tokens, 9);
        // Filters never use the caller schema
        assert!(mock.get_calls()[0].schema.is_none());
    }

    #[tokio::test]
    async fn test_provider_failure_is_not_recorded() {
        let metrics = Arc::new(MetricsRegistry::new());
        let mock = MockProvider::new(ProviderKind::OpenAI);
        mock.add_response(Err(Error::provider("OpenAI", "HTTP 500")));

        let call = call(FunctionKind::Complete, ModelParameters::default(), &metrics);
        let row: Row = json!({"country": "Canada"}).as_object().unwrap().clone();
        let scope = MetricsScope::new("1", StateId(1));

        let err = executor(&mock, metrics.clone())
            .execute(&call, &scope, &[TaggedRow { id: 0, row: &row }], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderFailure);
        assert!(metrics.get(call.site_key()).is_none());
    }

    fn embedding_call(metrics: &MetricsRegistry) -> EmbeddingCall {
        let model = Arc::new(ModelDescriptor::new("embedder", "text-embedding-3-small", ProviderKind::OpenAI));
        EmbeddingCall::for_test(model, BatchSize::ONE, vec![ContextColumn::text("review")], metrics)
    }

    #[tokio::test]
    async fn test_embed_records_metrics() {
        let metrics = Arc::new(MetricsRegistry::new());
        let mock = MockProvider::new(ProviderKind::OpenAI);
        let call = embedding_call(&metrics);
        let scope = MetricsScope::new("1", StateId(1));

        let vectors = executor(&mock, metrics.clone())
            .embed(&call, &scope, vec!["good".to_string(), "bad".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(mock.embedding_calls(), vec![vec!["good".to_string(), "bad".to_string()]]);

        let recorded = metrics.get(call.site_key()).unwrap();
        assert_eq!(recorded.api_calls, 1);
        assert_eq!(recorded.input_tokens, 2);
        assert_eq!(recorded.output_tokens, 0);
        assert_eq!(metrics.snapshot()["llm_embedding_1"]["api_calls"], 1);
    }

    #[tokio::test]
    async fn test_embed_count_mismatch_is_recorded_then_rejected() {
        let metrics = Arc::new(MetricsRegistry::new());
        let mock = MockProvider::new(ProviderKind::OpenAI);
        mock.add_embeddings(Ok(Embeddings {
            vectors: vec![vec![0.5]],
            usage: TokenUsage {
                input_tokens: 4,
                output_tokens: 0,
            },
        }));
        let call = embedding_call(&metrics);
        let scope = MetricsScope::new("1", StateId(1));

        let err = executor(&mock, metrics.clone())
            .embed(&call, &scope, vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedBatchResponse);
        assert_eq!(metrics.get(call.site_key()).unwrap().input_tokens, 4);
    }
}
