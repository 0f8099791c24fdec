//! `llm_embedding`: one vector per row.
//!
//! The text of a row's context columns, joined with single spaces, is the row's embedding input. Inputs go to the
//! provider `batch_size` at a time; like the scalar completion functions, the input is split into `vector_size`
//! fragments that each run on their own task.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;

use super::{Binder, CallConfig, join_in_order, missing, parse_object};
use crate::batch::{BatchSize, partition};
use crate::engine::EngineSettings;
use crate::error::{Error, Result};
use crate::executor::CallExecutor;
use crate::metrics::{CallSite, CallSiteKey, MetricsRegistry, MetricsScope};
use crate::model::{ModelDescriptor, ModelParameters};
use crate::prompt::{ColumnType, ContextColumn, template::cell_text};
use crate::types::Row;

pub const NAME: &str = "llm_embedding";

/// The second argument: only `context_columns` is accepted.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmbeddingInputs {
    #[serde(default)]
    context_columns: Vec<ContextColumn>,
}

/// An `llm_embedding` call with every argument resolved.
#[derive(Debug, Clone)]
pub struct EmbeddingCall {
    pub model: Arc<ModelDescriptor>,
    pub batch_size: BatchSize,
    pub parameters: ModelParameters,
    pub columns: Vec<ContextColumn>,
    site: CallSiteKey,
}

impl EmbeddingCall {
    pub fn call_site(&self) -> CallSite<'_> {
        CallSite {
            key: self.site,
            function: NAME,
            model_name: &self.model.name,
            provider: self.model.provider.as_str(),
        }
    }

    pub fn site_key(&self) -> CallSiteKey {
        self.site
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        model: Arc<ModelDescriptor>,
        batch_size: BatchSize,
        columns: Vec<ContextColumn>,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            model,
            batch_size,
            parameters: ModelParameters::default(),
            columns,
            site: metrics.call_site(),
        }
    }
}

impl Binder<'_> {
    /// Bind `llm_embedding(config, {context_columns})`.
    #[tracing::instrument(skip(self, args), fields(args = args.len()))]
    pub fn bind_embedding(&self, args: &[Value]) -> Result<EmbeddingCall> {
        match args.len() {
            0 => return Err(missing(NAME, "config")),
            1 => return Err(missing(NAME, "inputs")),
            2 => {}
            n => return Err(Error::invalid(format!("{NAME} takes 2 arguments, got {n}"))),
        }

        let CallConfig {
            model,
            batch_size,
            tuple_format,
            parameters,
        } = self.call_config(NAME, &args[0])?;
        if tuple_format.is_some() {
            return Err(Error::invalid(format!("{NAME} does not take a tuple_format")));
        }

        let inputs = parse_object::<EmbeddingInputs>(NAME, "inputs", &args[1])?;
        if inputs.context_columns.is_empty() {
            return Err(missing(NAME, "context_columns"));
        }
        if let Some(column) = inputs
            .context_columns
            .iter()
            .find(|column| column.column_type != ColumnType::Text)
        {
            return Err(Error::invalid(format!(
                "{NAME} only embeds text columns, '{}' is not one",
                column.display_name()
            )));
        }

        let provider = self.providers.get(model.provider)?;
        if !provider.capabilities().embed {
            return Err(Error::UnsupportedCapability {
                provider: model.provider.to_string(),
                capability: "Embedding generation".to_string(),
            });
        }

        tracing::debug!(model = %model.name, batch_size = %batch_size, columns = inputs.context_columns.len(), "Bound call");
        Ok(EmbeddingCall {
            model,
            batch_size,
            parameters,
            columns: inputs.context_columns,
            site: self.metrics.call_site(),
        })
    }
}

/// Embed every row, returning one vector per row in input order.
pub async fn run(
    executor: &CallExecutor,
    call: &EmbeddingCall,
    rows: &[Row],
    settings: &EngineSettings,
) -> Result<Vec<Vec<f64>>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let inputs = rows
        .iter()
        .map(|row| row_text(&call.columns, row))
        .collect::<Result<Vec<_>>>()?;

    let call = Arc::new(call.clone());
    let mut tasks = JoinSet::new();
    for (fragment, range) in partition(rows.len(), settings.vector_size).into_iter().enumerate() {
        let executor = executor.clone();
        let call = call.clone();
        let inputs = inputs[range].to_vec();
        tasks.spawn(async move {
            let scope = MetricsScope::current(executor.metrics().state_id());
            (fragment, embed_fragment(&executor, &call, &scope, inputs, fragment).await)
        });
    }

    let fragments = join_in_order(tasks).await?;
    Ok(fragments.into_iter().flatten().collect())
}

async fn embed_fragment(
    executor: &CallExecutor,
    call: &EmbeddingCall,
    scope: &MetricsScope,
    inputs: Vec<String>,
    fragment: usize,
) -> Result<Vec<Vec<f64>>> {
    let label = format!("fragment {fragment}");
    let mut vectors = Vec::with_capacity(inputs.len());
    for (chunk, range) in partition(inputs.len(), call.batch_size).into_iter().enumerate() {
        let embedded = executor
            .embed(call, scope, inputs[range].to_vec())
            .await
            .map_err(|e| e.in_chunk(NAME, &label, chunk))?;
        vectors.extend(embedded);
    }
    Ok(vectors)
}

/// The embedding input of one row.
pub fn row_text(columns: &[ContextColumn], row: &Row) -> Result<String> {
    let texts = columns
        .iter()
        .map(|column| {
            row.get(&column.data)
                .map(cell_text)
                .ok_or_else(|| Error::invalid(format!("Input row has no column '{}'", column.data)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(texts.join(" "))
}
