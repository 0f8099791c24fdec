//! `llm_reduce`: fold a group into one answer, chunk by chunk.
//!
//! Chunks are processed left to right. The first chunk's answer becomes the running summary; every later chunk is
//! sent together with the summary so far and its answer replaces it. The summary after the last chunk is the
//! group's result.
//!
//! The lifecycle of one group's reduction is tracked with the typestate pattern:
//!
//! ```text
//! Empty --accumulate--> Accumulating --accumulate--> Accumulating
//!   |                        |
//!   +------finish------------+------finish--> Final
//! ```

use super::{BoundCall, scalar::item_text, single_item, tag};
use crate::batch::Partitioner;
use crate::error::{ErrorKind, Result};
use crate::executor::CallExecutor;
use crate::metrics::MetricsScope;
use crate::types::Group;

/// Marker trait for reduction states.
pub trait ReductionState: Send + Sync {}

/// No chunk has been folded in yet.
#[derive(Debug, Clone)]
pub struct Empty {}

impl ReductionState for Empty {}

/// At least one chunk has been folded in.
#[derive(Debug, Clone)]
pub struct Accumulating {
    pub summary: String,
    pub chunks: usize,
}

impl ReductionState for Accumulating {}

/// The group is done. `summary` is `None` when no chunk was ever folded in.
#[derive(Debug, Clone)]
pub struct Final {
    pub summary: Option<String>,
    pub chunks: usize,
}

impl ReductionState for Final {}

#[derive(Debug, Clone)]
pub struct Reduction<S: ReductionState> {
    pub state: S,
}

impl Default for Reduction<Empty> {
    fn default() -> Self {
        Self::new()
    }
}

impl Reduction<Empty> {
    pub fn new() -> Self {
        Self { state: Empty {} }
    }

    pub fn accumulate(self, summary: String) -> Reduction<Accumulating> {
        Reduction {
            state: Accumulating { summary, chunks: 1 },
        }
    }

    pub fn finish(self) -> Reduction<Final> {
        Reduction {
            state: Final {
                summary: None,
                chunks: 0,
            },
        }
    }
}

impl Reduction<Accumulating> {
    pub fn summary(&self) -> &str {
        &self.state.summary
    }

    /// Replace the running summary with the answer for the next chunk.
    pub fn accumulate(self, summary: String) -> Reduction<Accumulating> {
        Reduction {
            state: Accumulating {
                summary,
                chunks: self.state.chunks + 1,
            },
        }
    }

    pub fn finish(self) -> Reduction<Final> {
        Reduction {
            state: Final {
                summary: Some(self.state.summary),
                chunks: self.state.chunks,
            },
        }
    }
}

impl Reduction<Final> {
    pub fn into_summary(self) -> Option<String> {
        self.state.summary
    }
}

/// Reduce one group. Returns `None` for an empty group without calling the provider.
#[tracing::instrument(skip_all, fields(group = %group.key, rows = group.len(), batch_size = %call.batch_size))]
pub async fn reduce_group(
    executor: &CallExecutor,
    call: &BoundCall,
    scope: &MetricsScope,
    group: &Group,
    adaptive: bool,
) -> Result<Option<String>> {
    let function = call.function.as_str();
    let provider = call.model.provider.to_string();
    let mut partitioner = Partitioner::new(group.len(), call.batch_size);
    let mut accumulating: Option<Reduction<Accumulating>> = None;
    let mut chunk = 0;

    while let Some(range) = partitioner.next_chunk() {
        let ids: Vec<usize> = range.clone().collect();
        let tagged = tag(&group.rows, &ids);
        let previous = accumulating.as_ref().map(|reduction| reduction.summary());
        let result = executor.execute(call, scope, &tagged, previous).await;

        match result {
            Ok(items) => {
                let summary = item_text(single_item(items).map_err(|e| e.in_chunk(function, &group.key, chunk))?);
                accumulating = Some(match accumulating.take() {
                    None => Reduction::new().accumulate(summary),
                    Some(reduction) => reduction.accumulate(summary),
                });
                partitioner.commit(&range);
                chunk += 1;
            }
            Err(e) if adaptive && e.kind() == ErrorKind::ExceededMaxOutputTokens => {
                partitioner
                    .shrink(&provider)
                    .map_err(|e| e.in_chunk(function, &group.key, chunk))?;
            }
            Err(e) => return Err(e.in_chunk(function, &group.key, chunk)),
        }
    }

    let reduction = match accumulating {
        Some(reduction) => reduction.finish(),
        None => Reduction::new().finish(),
    };
    tracing::debug!(chunks = reduction.state.chunks, "Group reduced");
    Ok(reduction.into_summary())
}
