//! # flock: language-model functions for SQL engines
//!
//! `flock` lets a query call a language model the way it calls any other function. Scalar functions
//! (`llm_complete`, `llm_filter`) answer once per row; aggregates (`llm_reduce`, `llm_first`, `llm_last`,
//! `llm_rerank`) answer once per group. `llm_embedding` returns one vector per row, and the `fusion_*` functions
//! combine retrieval scores without calling a model. Every call is tracked in a metrics registry that the
//! `flock_get_metrics`, `flock_get_debug_metrics` and `flock_reset_metrics` functions expose.
//!
//! ## Execution
//!
//! A call is first bound: its model is resolved from the [`model::ModelCatalog`], its options are validated and
//! it is assigned a call site in the [`metrics::MetricsRegistry`]. At execution time the rows are split into
//! chunks of at most `batch_size` rows ([`batch`]). Each chunk is rendered into one prompt ([`prompt`]), sent to
//! the model's provider ([`provider`]) and the answer is mapped back to the rows of that chunk
//! ([`executor`]). Aggregates combine chunk answers with a strategy per function ([`functions`]):
//!
//! - `llm_reduce` folds chunks left to right, passing the running summary along.
//! - `llm_first` and `llm_last` run a tournament of chunk winners.
//! - `llm_rerank` ranks each chunk and merges the ranked runs pairwise.
//!
//! Scalar input is executed in fragments of `vector_size` rows, and aggregate groups one per task. Each task
//! records its calls under its own thread and execution state, which is what the debug metrics view shows.
//!
//! ## Usage
//!
//! ```no_run
//! # async fn example() -> flock::Result<()> {
//! use flock::{Config, Flock, FunctionKind, model::ProviderKind};
//! use serde_json::json;
//!
//! let engine = Flock::from_config(&Config::default())?;
//! engine.create_model("summariser", "llama3.2", ProviderKind::Ollama)?;
//!
//! let call = engine.bind(
//!     FunctionKind::Complete,
//!     &[
//!         json!({"model_name": "summariser", "batch_size": 8}),
//!         json!({"prompt": "Summarise {review}", "context_columns": [{"data": "review"}]}),
//!     ],
//! )?;
//! let rows = vec![json!({"review": "Great battery"}).as_object().cloned().unwrap_or_default()];
//! let summaries = engine.llm_complete(&call, &rows).await?;
//! println!("{summaries:?} {}", engine.flock_get_metrics());
//! # Ok(())
//! # }
//! ```
//!
//! The `flock` binary loads a [`Config`] and runs a YAML [`job`] file against it.

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod functions;
pub mod job;
pub mod metrics;
pub mod model;
pub mod prompt;
pub mod provider;
pub mod secrets;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test;

pub use config::Config;
pub use engine::{EngineSettings, Flock};
pub use error::{Error, ErrorKind, Result};
pub use functions::{BoundCall, FunctionKind};
pub use types::{Group, GroupResult, Row, RowRef};
