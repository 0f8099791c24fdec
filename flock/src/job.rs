//! YAML job files for the `flock` binary.
//!
//! A job declares models, an input table and a list of function calls. Each call runs against the whole table,
//! or against the groups formed by its `group_by` column. The report holds every result set followed by the flat
//! and debug metrics views.
//!
//! ```yaml
//! models:
//!   - { name: judge, model_id: gpt-4o-mini, provider: openai }
//! table:
//!   - { region: EU, review: "Great battery life" }
//!   - { region: US, review: "Screen cracked after a week" }
//! calls:
//!   - function: llm_filter
//!     args:
//!       - { model_name: judge, batch_size: 4 }
//!       - { prompt: "Is this review positive?", context_columns: [{ data: review }] }
//!   - function: llm_reduce
//!     group_by: region
//!     args:
//!       - { model_name: judge }
//!       - { prompt: "Summarise the complaints", context_columns: [{ data: review }] }
//! ```
//!
//! `llm_embedding` takes its usual two arguments. The `fusion_*` functions take the names of the score columns
//! to combine; a missing or null score means the row was not returned by that system.

use anyhow::{Context, bail};
use figment::{
    Figment,
    providers::{Format, Yaml},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{fmt, path::Path, str::FromStr};

use crate::engine::Flock;
use crate::functions::{FunctionKind, embedding, fusion::FusionMethod};
use crate::model::ModelDescriptor;
use crate::types::{Group, Row};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub table: Vec<Row>,
    pub calls: Vec<JobCall>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobCall {
    pub function: String,
    pub args: Vec<Value>,
    /// Column whose distinct values form the aggregate groups
    #[serde(default)]
    pub group_by: Option<String>,
}

/// A function a job call may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFunction {
    Llm(FunctionKind),
    Embedding,
    Fusion(FusionMethod),
}

impl JobFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobFunction::Llm(function) => function.as_str(),
            JobFunction::Embedding => embedding::NAME,
            JobFunction::Fusion(method) => method.as_str(),
        }
    }

    fn is_aggregate(&self) -> bool {
        matches!(self, JobFunction::Llm(function) if function.is_aggregate())
    }
}

impl fmt::Display for JobFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobFunction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s.eq_ignore_ascii_case(embedding::NAME) {
            return Ok(JobFunction::Embedding);
        }
        if let Ok(method) = s.parse() {
            return Ok(JobFunction::Fusion(method));
        }
        Ok(JobFunction::Llm(s.parse()?))
    }
}

impl Job {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading job file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing job file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(Figment::from(Yaml::string(text)).extract()?)
    }
}

/// Run every call of `job` in order and collect the report.
pub async fn run(engine: &Flock, job: &Job) -> anyhow::Result<Value> {
    for model in &job.models {
        engine.catalog().create_model(model.clone())?;
    }

    let mut results = Vec::with_capacity(job.calls.len());
    for (index, call) in job.calls.iter().enumerate() {
        let function: JobFunction = call.function.parse()?;
        tracing::info!(call = index, %function, rows = job.table.len(), "Running job call");
        let output = run_call(engine, function, call, &job.table)
            .await
            .with_context(|| format!("call {index} ({function}) failed"))?;
        results.push(json!({ "function": function.as_str(), "output": output }));
    }

    Ok(json!({
        "results": results,
        "metrics": engine.flock_get_metrics(),
        "debug_metrics": engine.flock_get_debug_metrics(),
    }))
}

async fn run_call(engine: &Flock, function: JobFunction, call: &JobCall, table: &[Row]) -> anyhow::Result<Value> {
    if !function.is_aggregate() && call.group_by.is_some() {
        bail!("{function} is a scalar function and cannot take group_by");
    }
    let function = match function {
        JobFunction::Llm(function) => function,
        JobFunction::Embedding => {
            let bound = engine.bind_embedding(&call.args)?;
            return Ok(serde_json::to_value(engine.llm_embedding(&bound, table).await?)?);
        }
        JobFunction::Fusion(method) => {
            let systems = score_columns(&call.args, table)?;
            return Ok(serde_json::to_value(engine.fuse(method, &systems)?)?);
        }
    };
    let bound = engine.bind(function, &call.args)?;

    let output = match function {
        FunctionKind::Complete => serde_json::to_value(engine.llm_complete(&bound, table).await?)?,
        FunctionKind::Filter => serde_json::to_value(engine.llm_filter(&bound, table).await?)?,
        FunctionKind::Reduce => {
            let groups = group_rows(table, call.group_by.as_deref());
            serde_json::to_value(engine.llm_reduce(&bound, &groups).await?)?
        }
        FunctionKind::First => {
            let groups = group_rows(table, call.group_by.as_deref());
            serde_json::to_value(engine.llm_first(&bound, &groups).await?)?
        }
        FunctionKind::Last => {
            let groups = group_rows(table, call.group_by.as_deref());
            serde_json::to_value(engine.llm_last(&bound, &groups).await?)?
        }
        FunctionKind::Rerank => {
            let groups = group_rows(table, call.group_by.as_deref());
            serde_json::to_value(engine.llm_rerank(&bound, &groups).await?)?
        }
    };
    Ok(output)
}

/// Read the score columns named by `args`. Missing and null cells are scores the system did not produce.
fn score_columns(args: &[Value], table: &[Row]) -> anyhow::Result<Vec<Vec<Option<f64>>>> {
    args.iter()
        .map(|arg| {
            let Some(column) = arg.as_str() else {
                bail!("fusion arguments must be score column names, got {arg}");
            };
            table
                .iter()
                .enumerate()
                .map(|(index, row)| match row.get(column) {
                    None | Some(Value::Null) => Ok(None),
                    Some(Value::Number(score)) => Ok(score.as_f64()),
                    Some(other) => bail!("row {index} has a non-numeric score in column '{column}': {other}"),
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .collect()
}

/// Split `table` into groups by the value of `column`, in order of first appearance.
///
/// Without a column the whole table is one group. Rows missing the column group under `null`.
pub fn group_rows(table: &[Row], column: Option<&str>) -> Vec<Group> {
    let Some(column) = column else {
        return vec![Group::new("all", table.to_vec())];
    };

    let mut groups: Vec<(Value, Group)> = Vec::new();
    for row in table {
        let value = row.get(column).cloned().unwrap_or(Value::Null);
        match groups.iter_mut().find(|(existing, _)| *existing == value) {
            Some((_, group)) => group.rows.push(row.clone()),
            None => {
                let key = match &value {
                    Value::String(text) => format!("{column}={text}"),
                    other => format!("{column}={other}"),
                };
                groups.push((value, Group::new(key, vec![row.clone()])));
            }
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}
