//! Score fusion: combine the relevance scores several retrieval systems gave the same rows.
//!
//! Each system contributes one score column. A missing or NaN score means the system did not return the row. The
//! `comb*` methods ignore a system whose scores are all equal, counting missing scores as 0. Reciprocal rank
//! fusion uses every system.

use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// Rank offset of reciprocal rank fusion.
pub const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusionMethod {
    /// Sum of `1 / (RRF_K + rank)` over the systems that returned the row
    Rrf,
    /// Sum of scores
    CombSum,
    /// Sum of scores times the number of systems with a nonzero score
    CombMnz,
    /// Sum of scores divided by the number of systems with a nonzero score
    CombAnz,
    /// Median of the scores present
    CombMed,
}

impl FusionMethod {
    pub const ALL: [FusionMethod; 5] = [
        FusionMethod::Rrf,
        FusionMethod::CombSum,
        FusionMethod::CombMnz,
        FusionMethod::CombAnz,
        FusionMethod::CombMed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FusionMethod::Rrf => "fusion_rrf",
            FusionMethod::CombSum => "fusion_combsum",
            FusionMethod::CombMnz => "fusion_combmnz",
            FusionMethod::CombAnz => "fusion_combanz",
            FusionMethod::CombMed => "fusion_combmed",
        }
    }
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FusionMethod::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid(format!("Unknown fusion function '{s}'")))
    }
}

/// Fuse `systems` (one score column each, all of the same length) into one score per row.
pub fn fuse(method: FusionMethod, systems: &[Vec<Option<f64>>]) -> Result<Vec<f64>> {
    let Some(rows) = systems.first().map(Vec::len) else {
        return Err(Error::invalid(format!("{method} needs at least one score column")));
    };
    if let Some(column) = systems.iter().position(|system| system.len() != rows) {
        return Err(Error::invalid(format!(
            "{method} score columns differ in length: column 0 has {rows} rows, column {column} has {}",
            systems[column].len()
        )));
    }

    let systems: Vec<Vec<Option<f64>>> = systems
        .iter()
        .map(|system| system.iter().map(|score| score.filter(|s| !s.is_nan())).collect())
        .collect();

    Ok(match method {
        FusionMethod::Rrf => reciprocal_rank(&systems, rows),
        FusionMethod::CombSum => combine(&systems, rows, |scores| scores.iter().sum()),
        FusionMethod::CombMnz => combine(&systems, rows, |scores| scores.iter().sum::<f64>() * hits(&scores) as f64),
        FusionMethod::CombAnz => combine(&systems, rows, |scores| match hits(&scores) {
            0 => 0.0,
            n => scores.iter().sum::<f64>() / n as f64,
        }),
        FusionMethod::CombMed => combine(&systems, rows, median),
    })
}

fn reciprocal_rank(systems: &[Vec<Option<f64>>], rows: usize) -> Vec<f64> {
    let ranks: Vec<Vec<Option<usize>>> = systems.iter().map(|system| competition_ranks(system)).collect();
    (0..rows)
        .map(|row| {
            ranks
                .iter()
                .filter_map(|system| system[row])
                .map(|rank| 1.0 / (RRF_K + rank as f64))
                .sum()
        })
        .collect()
}

/// Apply `score` to each row's present scores from the systems that are not constant.
fn combine(systems: &[Vec<Option<f64>>], rows: usize, score: impl Fn(Vec<f64>) -> f64) -> Vec<f64> {
    let informative: Vec<&Vec<Option<f64>>> = systems.iter().filter(|system| !is_constant(system)).collect();
    (0..rows)
        .map(|row| score(informative.iter().filter_map(|system| system[row]).collect()))
        .collect()
}

fn hits(scores: &[f64]) -> usize {
    scores.iter().filter(|score| **score != 0.0).count()
}

fn is_constant(system: &[Option<f64>]) -> bool {
    let mut scores = system.iter().map(|score| score.unwrap_or(0.0));
    match scores.next() {
        Some(first) => scores.all(|score| score == first),
        None => true,
    }
}

/// 1-based ranks by descending score; tied scores share the best rank. Missing scores have no rank.
fn competition_ranks(system: &[Option<f64>]) -> Vec<Option<usize>> {
    system
        .iter()
        .map(|score| score.map(|score| 1 + system.iter().flatten().filter(|other| **other > score).count()))
        .collect()
}

fn median(mut scores: Vec<f64>) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.sort_by(f64::total_cmp);
    let middle = scores.len() / 2;
    if scores.len() % 2 == 0 {
        (scores[middle - 1] + scores[middle]) / 2.0
    } else {
        scores[middle]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::rstest;

    fn scores(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn two_systems() -> Vec<Vec<Option<f64>>> {
        vec![scores(&[0.0, 0.4, 0.6, 0.8, 1.0]), scores(&[0.14, 0.41, 0.0, 1.0, 0.66])]
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
        }
    }

    #[rstest]
    #[case(FusionMethod::CombSum, &[0.14, 0.81, 0.6, 1.8, 1.66])]
    #[case(FusionMethod::CombMnz, &[0.14, 1.62, 0.6, 3.6, 3.32])]
    #[case(FusionMethod::CombAnz, &[0.14, 0.405, 0.6, 0.9, 0.83])]
    #[case(FusionMethod::CombMed, &[0.07, 0.405, 0.3, 0.9, 0.83])]
    fn test_comb_methods(#[case] method: FusionMethod, #[case] expected: &[f64]) {
        assert_close(&fuse(method, &two_systems()).unwrap(), expected);
    }

    #[test]
    fn test_rrf_sums_reciprocal_ranks() {
        let rrf = |ranks: [f64; 2]| ranks.iter().map(|rank| 1.0 / (RRF_K + rank)).sum::<f64>();
        let expected = [rrf([5.0, 4.0]), rrf([4.0, 3.0]), rrf([3.0, 5.0]), rrf([2.0, 1.0]), rrf([1.0, 2.0])];
        assert_close(&fuse(FusionMethod::Rrf, &two_systems()).unwrap(), &expected);
    }

    #[test]
    fn test_rrf_ties_share_a_rank_and_missing_rows_score_nothing() {
        let systems = vec![vec![Some(1.0), None], vec![Some(0.5), Some(0.5)]];
        let fused = fuse(FusionMethod::Rrf, &systems).unwrap();
        assert_close(&fused, &[2.0 / (RRF_K + 1.0), 1.0 / (RRF_K + 1.0)]);
    }

    #[test]
    fn test_constant_systems_are_ignored() {
        let systems = vec![scores(&[0.5, 0.5, 0.5]), scores(&[0.1, 0.2, 0.3])];
        assert_close(&fuse(FusionMethod::CombSum, &systems).unwrap(), &[0.1, 0.2, 0.3]);

        // Missing counts as 0 when deciding whether a system is constant
        let systems = vec![vec![Some(1.0), None], vec![Some(0.5), Some(0.5)]];
        assert_close(&fuse(FusionMethod::CombSum, &systems).unwrap(), &[1.0, 0.0]);

        let systems = vec![scores(&[0.3, 0.3])];
        for method in [FusionMethod::CombSum, FusionMethod::CombMnz, FusionMethod::CombAnz, FusionMethod::CombMed] {
            assert_close(&fuse(method, &systems).unwrap(), &[0.0, 0.0]);
        }
    }

    #[test]
    fn test_nan_is_missing() {
        let systems = vec![vec![Some(f64::NAN), Some(0.2), Some(0.9)], scores(&[0.4, 0.0, 0.6])];
        assert_close(&fuse(FusionMethod::CombAnz, &systems).unwrap(), &[0.4, 0.2, 0.75]);
    }

    #[test]
    fn test_invalid_inputs() {
        let err = fuse(FusionMethod::CombSum, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = fuse(FusionMethod::Rrf, &[scores(&[1.0, 2.0]), scores(&[1.0])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("column 1 has 1"));
    }

    #[test]
    fn test_names() {
        for method in FusionMethod::ALL {
            assert_eq!(method.as_str().parse::<FusionMethod>().unwrap(), method);
        }
        assert_eq!("FUSION_RRF".parse::<FusionMethod>().unwrap(), FusionMethod::Rrf);
        assert!("fusion_borda".parse::<FusionMethod>().is_err());
    }
}
