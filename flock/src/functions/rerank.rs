//! `llm_rerank`: rank chunks, then merge the ranked runs pairwise.
//!
//! Each chunk of up to `batch_size` rows is ranked by the model, producing one run per chunk. Runs are then merged
//! two at a time, bottom-up, until a single run covers the group. A merge step shows the model the heads of both
//! runs (`window` rows from each) and takes rows from the front of either run in the order the model ranked them,
//! stopping as soon as one head is used up. Rows keep their order within a run, so the result is always a
//! permutation of the group.
//!
//! The model is a comparator here and is not assumed to be transitive; different batch sizes may yield different
//! orders for the same group.

use std::collections::{HashSet, VecDeque};

use super::{BoundCall, row_id, tag};
use crate::batch::{BatchSize, Partitioner};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::CallExecutor;
use crate::metrics::MetricsScope;
use crate::types::{Group, RowRef};

struct Ranker<'a> {
    executor: &'a CallExecutor,
    call: &'a BoundCall,
    scope: &'a MetricsScope,
    group: &'a Group,
    provider: String,
    /// Shrinks after an output overflow when `adaptive` is set, and stays shrunk for the rest of the group
    batch_size: BatchSize,
    adaptive: bool,
    chunk: usize,
}

impl Ranker<'_> {
    /// Head rows shown from each run during a merge.
    fn window(&self) -> usize {
        (self.batch_size.get() / 2).max(1)
    }

    fn overflowed(&self, error: &Error) -> bool {
        self.adaptive && error.kind() == ErrorKind::ExceededMaxOutputTokens
    }

    /// Ask the model to order `ids`. A single row needs no call.
    async fn rank(&mut self, ids: &[usize]) -> Result<Vec<usize>> {
        if ids.len() < 2 {
            return Ok(ids.to_vec());
        }
        let order = self
            .executor
            .execute(self.call, self.scope, &tag(&self.group.rows, ids), None)
            .await
            .and_then(|items| permutation(&items, ids, &self.provider))
            .map_err(|e| e.in_chunk(self.call.function.as_str(), &self.group.key, self.chunk))?;
        self.chunk += 1;
        Ok(order)
    }

    /// Rank consecutive chunks of the group into sorted runs.
    async fn runs(&mut self) -> Result<Vec<Vec<usize>>> {
        let ids: Vec<usize> = (0..self.group.len()).collect();
        let mut partitioner = Partitioner::new(ids.len(), self.batch_size);
        let mut runs = Vec::with_capacity(ids.len().div_ceil(self.batch_size.get()));

        while let Some(range) = partitioner.next_chunk() {
            match self.rank(&ids[range.clone()]).await {
                Ok(run) => {
                    runs.push(run);
                    partitioner.commit(&range);
                }
                Err(e) if self.overflowed(&e) => {
                    self.batch_size = partitioner.shrink(&self.provider).map_err(|_| e)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(runs)
    }

    async fn merge(&mut self, left: Vec<usize>, right: Vec<usize>) -> Result<Vec<usize>> {
        let mut merged = Vec::with_capacity(left.len() + right.len());
        let mut left = VecDeque::from(left);
        let mut right = VecDeque::from(right);

        while !left.is_empty() && !right.is_empty() {
            let window = self.window();
            let left_head: Vec<usize> = left.iter().take(window).copied().collect();
            let right_head: Vec<usize> = right.iter().take(window).copied().collect();
            let offered: Vec<usize> = left_head.iter().chain(&right_head).copied().collect();
            let ranking = match self.rank(&offered).await {
                Ok(ranking) => ranking,
                Err(e) if self.overflowed(&e) => {
                    self.batch_size = self.batch_size.shrink().ok_or(e)?;
                    tracing::debug!(batch_size = self.batch_size.get(), "Shrinking merge window after output overflow");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (mut from_left, mut from_right) = (0, 0);
            for id in ranking {
                if from_left == left_head.len() || from_right == right_head.len() {
                    break;
                }
                // Take the next row of whichever run the ranked row came from, keeping each run's own order
                let next = if left_head.contains(&id) {
                    from_left += 1;
                    left.pop_front()
                } else {
                    from_right += 1;
                    right.pop_front()
                };
                merged.extend(next);
            }
        }
        merged.extend(left);
        merged.extend(right);
        Ok(merged)
    }
}

/// Check that `items` orders exactly the rows in `ids`.
fn permutation(items: &[serde_json::Value], ids: &[usize], provider: &str) -> Result<Vec<usize>> {
    let order = items
        .iter()
        .map(|item| row_id(item, ids, provider))
        .collect::<Result<Vec<_>>>()?;
    let distinct: HashSet<usize> = order.iter().copied().collect();
    if order.len() != ids.len() || distinct.len() != ids.len() {
        return Err(Error::provider(
            provider,
            format!("ranking {order:?} is not a permutation of the offered rows {ids:?}"),
        ));
    }
    Ok(order)
}

/// Rank every row of `group`, most relevant first.
///
/// With `adaptive` set, a call that overflows the provider's output budget is re-issued with `floor(0.9 ×
/// batch_size)` rows, and the smaller size applies to every later chunk and merge window of the group.
#[tracing::instrument(skip_all, fields(group = %group.key, rows = group.len(), batch_size = %call.batch_size))]
pub async fn rerank_group(
    executor: &CallExecutor,
    call: &BoundCall,
    scope: &MetricsScope,
    group: &Group,
    adaptive: bool,
) -> Result<Vec<RowRef>> {
    let mut ranker = Ranker {
        executor,
        call,
        scope,
        group,
        provider: call.model.provider.to_string(),
        batch_size: call.batch_size,
        adaptive,
        chunk: 0,
    };

    let mut runs = ranker.runs().await?;
    while runs.len() > 1 {
        let mut next = Vec::with_capacity(runs.len().div_ceil(2));
        let mut pending = runs.into_iter();
        while let Some(left) = pending.next() {
            match pending.next() {
                Some(right) => next.push(ranker.merge(left, right).await?),
                None => next.push(left),
            }
        }
        tracing::debug!(runs = next.len(), calls = ranker.chunk, "Merge pass complete");
        runs = next;
    }

    Ok(runs
        .into_iter()
        .flatten()
        .map(|index| RowRef {
            index,
            row: group.rows[index].clone(),
        })
        .collect())
}
