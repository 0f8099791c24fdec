//! `llm_complete` and `llm_filter`: one answer per row.
//!
//! Input is split into fragments of `vector_size` rows, each executed on its own task with its own metrics state.
//! Within a fragment, chunks go to the provider one after another and their answers map back 1:1 in order.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;

use super::{BoundCall, join_in_order, single_item, tag};
use crate::batch::{Partitioner, partition};
use crate::engine::EngineSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::CallExecutor;
use crate::metrics::MetricsScope;
use crate::types::Row;

/// Run a scalar call over `rows`, returning one item per row in input order.
pub async fn run(executor: &CallExecutor, call: &BoundCall, rows: &[Row], settings: &EngineSettings) -> Result<Vec<Value>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    if !call.prompt.has_context() {
        let scope = MetricsScope::current(executor.metrics().state_id());
        return run_literal(executor, call, &scope, rows).await;
    }

    let call = Arc::new(call.clone());
    let mut tasks = JoinSet::new();
    for (fragment, range) in partition(rows.len(), settings.vector_size).into_iter().enumerate() {
        let executor = executor.clone();
        let call = call.clone();
        let offset = range.start;
        let rows = rows[range].to_vec();
        let adaptive = settings.adaptive_batching;
        tasks.spawn(async move {
            let scope = MetricsScope::current(executor.metrics().state_id());
            let label = format!("fragment {fragment}");
            (fragment, run_fragment(&executor, &call, &scope, &rows, offset, adaptive, &label).await)
        });
    }

    let fragments = join_in_order(tasks).await?;
    Ok(fragments.into_iter().flatten().collect())
}

/// A prompt without context columns is the same for every row: ask once and broadcast the answer.
async fn run_literal(executor: &CallExecutor, call: &BoundCall, scope: &MetricsScope, rows: &[Row]) -> Result<Vec<Value>> {
    let items = executor
        .execute(call, scope, &tag(rows, &[0]), None)
        .await
        .map_err(|e| e.in_chunk(call.function.as_str(), "literal", 0))?;
    let answer = single_item(items)?;
    Ok(vec![answer; rows.len()])
}

/// Execute one fragment chunk by chunk.
///
/// With `adaptive` set, a chunk that overflows the provider's output budget is re-issued with a smaller batch size
/// that also applies to every chunk after it.
pub async fn run_fragment(
    executor: &CallExecutor,
    call: &BoundCall,
    scope: &MetricsScope,
    rows: &[Row],
    offset: usize,
    adaptive: bool,
    label: &str,
) -> Result<Vec<Value>> {
    let provider = call.model.provider.to_string();
    let mut partitioner = Partitioner::new(rows.len(), call.batch_size);
    let mut items = Vec::with_capacity(rows.len());
    let mut chunk = 0;

    while let Some(range) = partitioner.next_chunk() {
        let ids: Vec<usize> = range.clone().collect();
        let mut tagged = tag(rows, &ids);
        for row in &mut tagged {
            row.id += offset;
        }

        match executor.execute(call, scope, &tagged, None).await {
            Ok(answers) => {
                items.extend(answers);
                partitioner.commit(&range);
                chunk += 1;
            }
            Err(e) if adaptive && e.kind() == ErrorKind::ExceededMaxOutputTokens => {
                partitioner
                    .shrink(&provider)
                    .map_err(|e| e.in_chunk(call.function.as_str(), label, chunk))?;
            }
            Err(e) => return Err(e.in_chunk(call.function.as_str(), label, chunk)),
        }
    }
    Ok(items)
}

/// `llm_complete` output: strings as-is, structured items as JSON text.
pub fn item_text(item: Value) -> String {
    match item {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// `llm_filter` output.
pub fn item_bool(item: &Value) -> Result<bool> {
    match item {
        Value::Bool(value) => Ok(*value),
        Value::String(text) if text.trim().eq_ignore_ascii_case("true") => Ok(true),
        Value::String(text) if text.trim().eq_ignore_ascii_case("false") => Ok(false),
        other => Err(Error::SchemaValidation {
            errors: vec![format!("llm_filter expected a boolean answer, got {other}")],
        }),
    }
}
