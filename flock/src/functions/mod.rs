//! The LLM-backed functions and their argument binding.
//!
//! Binding turns the positional SQL arguments (`config`, `prompt_spec` and an optional context struct) into a
//! [`BoundCall`]: the model is resolved, the prompt spec validated and every audio column checked against its
//! transcription model. Everything that can be rejected without talking to a provider is rejected here.
//!
//! Execution lives in one module per reduction strategy:
//!
//! - [`scalar`] - `llm_complete` and `llm_filter`, one answer per row
//! - [`reduce`] - `llm_reduce`, left-to-right summary accumulation
//! - [`select`] - `llm_first` and `llm_last`, tournament selection
//! - [`rerank`] - `llm_rerank`, chunk ranking followed by pairwise merging
//!
//! Two families sit outside [`FunctionKind`]: [`embedding`] (`llm_embedding`, which binds its own argument shape
//! and calls the provider's embedding endpoint) and [`fusion`], the score-combining functions that never reach a
//! provider.

pub mod embedding;
pub mod fusion;
pub mod reduce;
pub mod rerank;
pub mod scalar;
pub mod select;

#[cfg(test)]
pub(crate) mod testing;

use serde::Deserialize;
use serde_json::Value;
use std::{fmt, str::FromStr, sync::Arc};
use tokio::task::JoinSet;

use crate::batch::BatchSize;
use crate::engine::EngineSettings;
use crate::error::{Error, Result};
use crate::metrics::{CallSite, CallSiteKey, MetricsRegistry};
use crate::model::{ModelCatalog, ModelDescriptor, ModelParameters, parameters::json_type_name};
use crate::prompt::{BoundColumn, BoundPrompt, ColumnType, ContextColumn, PromptSpec, TaggedRow, TupleFormat};
use crate::provider::{ItemType, ProviderRegistry};
use crate::types::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Complete,
    Filter,
    Reduce,
    First,
    Last,
    Rerank,
}

impl FunctionKind {
    pub const ALL: [FunctionKind; 6] = [
        FunctionKind::Complete,
        FunctionKind::Filter,
        FunctionKind::Reduce,
        FunctionKind::First,
        FunctionKind::Last,
        FunctionKind::Rerank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::Complete => "llm_complete",
            FunctionKind::Filter => "llm_filter",
            FunctionKind::Reduce => "llm_reduce",
            FunctionKind::First => "llm_first",
            FunctionKind::Last => "llm_last",
            FunctionKind::Rerank => "llm_rerank",
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !matches!(self, FunctionKind::Complete | FunctionKind::Filter)
    }

    /// Item type asked of the provider when no caller schema applies.
    pub fn item_type(&self) -> ItemType {
        match self {
            FunctionKind::Complete | FunctionKind::Reduce => ItemType::String,
            FunctionKind::Filter => ItemType::Boolean,
            FunctionKind::First | FunctionKind::Last | FunctionKind::Rerank => ItemType::Integer,
        }
    }

    /// Whether a caller-supplied output schema shapes this function's items. Functions answering with booleans or
    /// row ids keep their own item type.
    pub fn uses_output_schema(&self) -> bool {
        matches!(self, FunctionKind::Complete | FunctionKind::Reduce)
    }

    /// Number of items the provider must return for a chunk of `rows` rows.
    pub fn expected_items(&self, rows: usize) -> usize {
        match self {
            FunctionKind::Complete | FunctionKind::Filter | FunctionKind::Rerank => rows,
            FunctionKind::Reduce | FunctionKind::First | FunctionKind::Last => 1,
        }
    }

    fn max_args(&self) -> usize {
        match self {
            FunctionKind::Filter => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunctionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FunctionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid(format!("Unknown function '{s}'")))
    }
}

/// The `config` argument as written by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCallConfig {
    model_name: Option<String>,
    batch_size: Option<i64>,
    tuple_format: Option<String>,
    /// JSON string, or an object for callers that already hold parsed JSON
    model_parameters: Option<Value>,
}

/// The `config` argument with its model resolved and parameters merged over the model's defaults.
struct CallConfig {
    model: Arc<ModelDescriptor>,
    batch_size: BatchSize,
    tuple_format: Option<String>,
    parameters: ModelParameters,
}

/// A function call with every argument resolved.
#[derive(Debug, Clone)]
pub struct BoundCall {
    pub function: FunctionKind,
    pub model: Arc<ModelDescriptor>,
    pub batch_size: BatchSize,
    pub tuple_format: TupleFormat,
    /// Call parameters merged over the model's defaults
    pub parameters: ModelParameters,
    pub prompt: BoundPrompt,
    site: CallSiteKey,
}

impl BoundCall {
    /// The metrics identity this call records under.
    pub fn call_site(&self) -> CallSite<'_> {
        CallSite {
            key: self.site,
            function: self.function.as_str(),
            model_name: &self.model.name,
            provider: self.model.provider.as_str(),
        }
    }

    pub fn site_key(&self) -> CallSiteKey {
        self.site
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        function: FunctionKind,
        model: Arc<ModelDescriptor>,
        batch_size: BatchSize,
        tuple_format: TupleFormat,
        parameters: ModelParameters,
        prompt: BoundPrompt,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            function,
            model,
            batch_size,
            tuple_format,
            parameters,
            prompt,
            site: metrics.call_site(),
        }
    }
}

/// Everything binding needs from the engine.
#[derive(Debug, Clone, Copy)]
pub struct Binder<'a> {
    pub catalog: &'a ModelCatalog,
    pub providers: &'a ProviderRegistry,
    pub metrics: &'a MetricsRegistry,
    pub settings: &'a EngineSettings,
}

impl Binder<'_> {
    #[tracing::instrument(skip(self, args), fields(args = args.len()))]
    pub fn bind(&self, function: FunctionKind, args: &[Value]) -> Result<BoundCall> {
        match args.len() {
            0 => return Err(missing(function, "config")),
            1 => return Err(missing(function, "prompt_spec")),
            n if n > function.max_args() => {
                return Err(Error::invalid(format!(
                    "{function} takes at most {} arguments, got {n}",
                    function.max_args()
                )));
            }
            _ => {}
        }

        let CallConfig {
            model,
            batch_size,
            tuple_format,
            parameters,
        } = self.call_config(function.as_str(), &args[0])?;
        let tuple_format = match tuple_format {
            Some(format) => format.parse()?,
            None => self.settings.default_tuple_format,
        };

        if args[1].get("prompt").is_none_or(Value::is_null) {
            return Err(missing(function, "prompt"));
        }
        let mut spec = parse_object::<PromptSpec>(function.as_str(), "prompt_spec", &args[1])?;
        if spec.prompt.trim().is_empty() {
            return Err(Error::EmptyPrompt {
                function: function.to_string(),
            });
        }
        if let Some(context) = args.get(2) {
            spec.context_columns.extend(context_struct(context)?);
        }

        let columns = spec
            .context_columns
            .into_iter()
            .map(|column| self.bind_column(column))
            .collect::<Result<Vec<_>>>()?;

        let call = BoundCall {
            function,
            model,
            batch_size,
            tuple_format,
            parameters,
            prompt: BoundPrompt {
                template: spec.prompt,
                columns,
            },
            site: self.metrics.call_site(),
        };
        tracing::debug!(
            model = %call.model.name,
            batch_size = %call.batch_size,
            tuple_format = %call.tuple_format,
            columns = call.prompt.columns.len(),
            "Bound call"
        );
        Ok(call)
    }

    fn call_config(&self, function: &str, value: &Value) -> Result<CallConfig> {
        let config = parse_object::<RawCallConfig>(function, "config", value)?;
        let model_name = config.model_name.ok_or_else(|| missing(function, "model_name"))?;
        let model = self.catalog.get(&model_name)?;

        let batch_size = match config.batch_size {
            Some(size) if size <= 0 => {
                return Err(Error::invalid(format!("batch_size must be a positive integer, got {size}")));
            }
            Some(size) => BatchSize::new(size as usize)?,
            None => self.settings.default_batch_size,
        };
        let overrides = match config.model_parameters {
            Some(Value::String(raw)) => ModelParameters::from_json_str(&raw)?,
            Some(value) => value,
            None => Value::Null,
        };
        let parameters = ModelParameters::merged(&model.default_parameters, &overrides)?;
        Ok(CallConfig {
            model,
            batch_size,
            tuple_format: config.tuple_format,
            parameters,
        })
    }

    fn bind_column(&self, spec: ContextColumn) -> Result<BoundColumn> {
        if spec.column_type != ColumnType::Audio {
            return Ok(BoundColumn {
                spec,
                transcription_model: None,
            });
        }

        let name = spec
            .transcription_model
            .as_deref()
            .ok_or_else(|| Error::MissingTranscriptionModel {
                column: spec.display_name().to_string(),
            })?;
        let model = self.catalog.get(name)?;
        let provider = self.providers.get(model.provider)?;
        if !provider.capabilities().transcribe {
            return Err(Error::UnsupportedCapability {
                provider: model.provider.to_string(),
                capability: "Audio transcription".to_string(),
            });
        }
        Ok(BoundColumn {
            spec,
            transcription_model: Some(model),
        })
    }
}

fn missing(function: impl fmt::Display, argument: &str) -> Error {
    Error::MissingArgument {
        function: function.to_string(),
        argument: argument.to_string(),
    }
}

fn parse_object<T: for<'de> Deserialize<'de>>(function: &str, argument: &str, value: &Value) -> Result<T> {
    if !value.is_object() {
        return Err(Error::invalid(format!(
            "{function} expects {argument} to be a struct, got {}",
            json_type_name(value)
        )));
    }
    T::deserialize(value).map_err(|e| Error::invalid(format!("Invalid {argument} for {function}: {e}")))
}

/// The only item of a single-answer response.
pub(crate) fn single_item(items: Vec<Value>) -> Result<Value> {
    let actual = items.len();
    let mut items = items.into_iter();
    match (items.next(), items.next()) {
        (Some(item), None) => Ok(item),
        _ => Err(Error::MalformedBatchResponse { expected: 1, actual }),
    }
}

/// Interpret a response item as one of the row ids shown to the model.
pub(crate) fn row_id(item: &Value, allowed: &[usize], provider: &str) -> Result<usize> {
    let id = match item {
        Value::Number(number) => number.as_u64().and_then(|id| usize::try_from(id).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    match id {
        Some(id) if allowed.contains(&id) => Ok(id),
        _ => Err(Error::provider(
            provider,
            format!("returned flock_row_id {item}, expected one of {allowed:?}"),
        )),
    }
}

/// Tag the rows at `ids` with their position in `rows`.
pub(crate) fn tag<'a>(rows: &'a [Row], ids: &[usize]) -> Vec<TaggedRow<'a>> {
    ids.iter().map(|&id| TaggedRow { id, row: &rows[id] }).collect()
}

/// Wait for tasks that each report their position, returning their outputs in position order.
///
/// The first failure aborts every task still running and is returned as-is.
pub(crate) async fn join_in_order<T: 'static>(mut tasks: JoinSet<(usize, Result<T>)>) -> Result<Vec<T>> {
    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(tasks.len()).collect();
    while let Some(joined) = tasks.join_next().await {
        let finished = joined
            .map_err(|e| Error::from(anyhow::Error::from(e)))
            .and_then(|(position, outcome)| outcome.map(|output| (position, output)));
        match finished {
            Ok((position, output)) => slots[position] = Some(output),
            Err(e) => {
                tasks.abort_all();
                tracing::debug!(aborted = tasks.len(), "Cancelling sibling tasks after failure");
                return Err(e);
            }
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

/// The optional third argument: `{name: column}` pairs read as text columns.
fn context_struct(value: &Value) -> Result<Vec<ContextColumn>> {
    let object = value.as_object().ok_or_else(|| {
        Error::invalid(format!("context columns must be a struct, got {}", json_type_name(value)))
    })?;
    object
        .iter()
        .map(|(name, column)| match column {
            Value::String(data) => Ok(ContextColumn::text(data.as_str()).named(name.as_str())),
            other => Err(Error::invalid(format!(
                "context column '{name}' must name an input column, got {}",
                json_type_name(other)
            ))),
        })
        .collect()
}
