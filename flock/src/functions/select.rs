//! `llm_first` and `llm_last`: tournament selection.
//!
//! Every round splits the remaining candidates into chunks and asks the model for the most (or least) relevant row
//! of each chunk. The winners form the next round's candidates until one is left. Each call sees at most
//! `batch_size` rows, whatever the group size. A chunk always holds at least two rows, otherwise a round could not
//! shrink the field.

use super::{BoundCall, row_id, single_item, tag};
use crate::batch::BatchSize;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::CallExecutor;
use crate::metrics::MetricsScope;
use crate::types::{Group, RowRef};

/// Select one row of `group`. Returns `None` for an empty group.
///
/// With `adaptive` set, a chunk that overflows the provider's output budget is re-issued with `floor(0.9 × width)`
/// rows, and the smaller width holds for the rest of the tournament. The call fails once the width would drop
/// below two.
#[tracing::instrument(skip_all, fields(function = %call.function, group = %group.key, rows = group.len()))]
pub async fn select_row(
    executor: &CallExecutor,
    call: &BoundCall,
    scope: &MetricsScope,
    group: &Group,
    adaptive: bool,
) -> Result<Option<RowRef>> {
    let function = call.function.as_str();
    let provider = call.model.provider.to_string();
    let mut width = call.batch_size.max(BatchSize::TWO);
    let mut candidates: Vec<usize> = (0..group.len()).collect();
    let mut chunk = 0;
    let mut round = 0;

    while candidates.len() > 1 {
        let mut winners = Vec::with_capacity(candidates.len().div_ceil(width.get()));
        let mut position = 0;
        while position < candidates.len() {
            let ids = &candidates[position..(position + width.get()).min(candidates.len())];
            if let [only] = ids {
                winners.push(*only);
                position += 1;
                continue;
            }
            let answer = executor
                .execute(call, scope, &tag(&group.rows, ids), None)
                .await
                .and_then(single_item)
                .and_then(|item| row_id(&item, ids, &provider));
            match answer {
                Ok(winner) => {
                    winners.push(winner);
                    position += ids.len();
                    chunk += 1;
                }
                Err(e) if adaptive && e.kind() == ErrorKind::ExceededMaxOutputTokens => {
                    width = width
                        .shrink()
                        .filter(|smaller| *smaller >= BatchSize::TWO)
                        .ok_or_else(|| {
                            Error::ExceededMaxOutputTokens {
                                provider: provider.clone(),
                            }
                            .in_chunk(function, &group.key, chunk)
                        })?;
                    tracing::debug!(width = width.get(), "Shrinking tournament width after output overflow");
                }
                Err(e) => return Err(e.in_chunk(function, &group.key, chunk)),
            }
        }
        round += 1;
        tracing::debug!(round, remaining = winners.len(), "Tournament round complete");
        candidates = winners;
    }

    Ok(candidates.first().map(|&index| RowRef {
        index,
        row: group.rows[index].clone(),
    }))
}
