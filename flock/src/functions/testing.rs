//! Fixtures shared by the reduction strategy tests.

use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};

use super::{BoundCall, FunctionKind};
use crate::batch::BatchSize;
use crate::executor::CallExecutor;
use crate::metrics::{MetricsRegistry, MetricsScope, StateId};
use crate::model::{ModelDescriptor, ModelParameters, ProviderKind};
use crate::prompt::{BoundColumn, BoundPrompt, ContextColumn, HttpMediaFetcher, PromptRenderer, TupleFormat};
use crate::provider::{Completion, CompletionRequest, MockProvider, ProviderRegistry, mock::envelope};
use crate::types::{Group, Row};

pub fn executor(mock: &MockProvider, metrics: Arc<MetricsRegistry>) -> CallExecutor {
    let providers = ProviderRegistry::empty();
    providers.register(Arc::new(mock.clone()));
    let fetcher = Arc::new(HttpMediaFetcher::new(Duration::from_secs(1)).unwrap());
    CallExecutor::new(providers.clone(), PromptRenderer::new(providers, fetcher), metrics)
}

/// A call over one text column named `item`, on an OpenAI model.
pub fn call(function: FunctionKind, batch_size: usize, metrics: &MetricsRegistry) -> BoundCall {
    call_on(ProviderKind::OpenAI, function, batch_size, metrics)
}

/// A call over one text column named `item`, on a model served by `provider`.
pub fn call_on(provider: ProviderKind, function: FunctionKind, batch_size: usize, metrics: &MetricsRegistry) -> BoundCall {
    let model = match provider {
        ProviderKind::OpenAI => Arc::new(ModelDescriptor::new("gpt", "gpt-4o-mini", provider)),
        ProviderKind::Ollama => Arc::new(ModelDescriptor::new("llama", "llama3.2", provider)),
    };
    let prompt = BoundPrompt {
        template: "Judge each {item}".to_string(),
        columns: vec![BoundColumn {
            spec: ContextColumn::text("item"),
            transcription_model: None,
        }],
    };
    BoundCall::for_test(
        function,
        model,
        BatchSize::new(batch_size).unwrap(),
        TupleFormat::Json,
        ModelParameters::default(),
        prompt,
        metrics,
    )
}

pub fn rows(values: &[&str]) -> Vec<Row> {
    values
        .iter()
        .map(|value| json!({ "item": value }).as_object().unwrap().clone())
        .collect()
}

pub fn group(key: &str, values: &[&str]) -> Group {
    Group::new(key, rows(values))
}

pub fn scope() -> MetricsScope {
    MetricsScope::new("test", StateId(1))
}

/// Row ids shown to the model, read back from the JSON tuple table.
pub fn offered_ids(prompt: &str) -> Vec<u64> {
    let start = prompt.find("{\n").unwrap();
    let table = &prompt[start..];
    let end = table.find("\n}").unwrap() + 2;
    let parsed: Value = serde_json::from_str(&table[..end]).unwrap();
    parsed["flock_row_id"]
        .as_array()
        .unwrap()
        .iter()
        .map(|id| id.as_u64().unwrap())
        .collect()
}

/// Values of the `item` column shown to the model.
pub fn offered_items(prompt: &str) -> Vec<String> {
    let start = prompt.find("{\n").unwrap();
    let table = &prompt[start..];
    let end = table.find("\n}").unwrap() + 2;
    let parsed: Value = serde_json::from_str(&table[..end]).unwrap();
    parsed["item"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item.as_str().unwrap().to_string())
        .collect()
}

/// Responder that ranks offered rows by ascending id, and picks the lowest id for single answers.
pub fn lowest_id_first(request: &CompletionRequest) -> crate::error::Result<Completion> {
    let mut ids = offered_ids(&request.prompt);
    ids.sort_unstable();
    if request.expected_items == 1 {
        Ok(envelope(vec![json!(ids[0])]))
    } else {
        Ok(envelope(ids.into_iter().map(Value::from).collect()))
    }
}
