//! Correspondence matching between a point's discrete and continuous items.
//!
//! Input is a `[discrete, continuous]` matrix of log pair probabilities.
//! Output is a set of `(discrete, continuous)` pairs in which no continuous
//! item appears twice, and no discrete item appears twice unless duplicate
//! words are enabled.
//!
//! # Exact matching
//!
//! The Hungarian solver minimizes
//!
//! ```text
//! cost(i, d) = max_lp − lp(d, i)
//! ```
//!
//! over continuous rows and discrete columns. Forced null slots pad the
//! matrix with `n` extra rows and columns of zero cost; real costs are then
//! shifted up far enough that every null slot is used, so exactly
//! `min(D, C) − n` real pairs come back, and the pairs given up are the
//! worst ones.
//!
//! With duplicate words, discrete columns are repeated `max(1, C / D)` times
//! so one discrete item may pair with several continuous items.
//!
//! # Sampled matching
//!
//! See [`sampled`]. Used during early training iterations to avoid locking
//! in a poor correspondence.

pub mod hungarian;
pub mod sampled;

use crate::error::{Error, Result};
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;

/// Upper bound on a single pair cost, so padded sums stay finite.
const MAX_PAIR_COST: f64 = 1e12;

/// Matched `(discrete, continuous)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matches {
    /// Pairs, ordered by continuous item for exact matching and by draw
    /// order for sampled matching.
    pub pairs: Vec<(usize, usize)>,
}

impl Matches {
    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// No pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Discrete partner of continuous item `con`.
    pub fn discrete_for(&self, con: usize) -> Option<usize> {
        self.pairs.iter().find(|p| p.1 == con).map(|p| p.0)
    }
}

/// A strategy for turning pair scores into matches.
pub trait Matcher {
    /// Match items given `[discrete, continuous]` log pair probabilities.
    fn find_matches(
        &self,
        log_pair_probs: &ArrayView2<'_, f64>,
        num_nulls: usize,
        duplicate_words: bool,
        rng: &mut StdRng,
    ) -> Result<Matches>;
}

/// Exact minimum-cost matching.
#[derive(Debug, Clone, Copy, Default)]
pub struct HungarianMatcher;

/// Matching by sampling pairs in proportion to their probability.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampledMatcher;

impl Matcher for HungarianMatcher {
    fn find_matches(
        &self,
        log_pair_probs: &ArrayView2<'_, f64>,
        num_nulls: usize,
        duplicate_words: bool,
        _rng: &mut StdRng,
    ) -> Result<Matches> {
        check_scores(log_pair_probs)?;
        let (num_dis, num_con) = log_pair_probs.dim();
        if num_dis == 0 || num_con == 0 {
            return Ok(Matches::default());
        }
        let dup = duplicate_count(num_dis, num_con, duplicate_words);
        let num_cols = num_dis * dup;

        let max_lp = log_pair_probs
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        let real_cost = |d: usize, i: usize| -> f64 {
            let lp = log_pair_probs[[d, i]];
            if lp.is_finite() && max_lp.is_finite() {
                (max_lp - lp).min(MAX_PAIR_COST)
            } else {
                MAX_PAIR_COST
            }
        };

        let mut cost = Array2::zeros((num_con + num_nulls, num_cols + num_nulls));
        let mut max_cost = 0.0f64;
        for i in 0..num_con {
            for j in 0..num_cols {
                let c = real_cost(j % num_dis, i);
                cost[[i, j]] = c;
                max_cost = max_cost.max(c);
            }
        }
        if num_nulls > 0 {
            // Large enough that one more real pair always costs more than the
            // worst-case sum of the real pairs kept.
            let shift = max_cost * num_con.min(num_cols) as f64 + 1.0;
            for i in 0..num_con {
                for j in 0..num_cols {
                    cost[[i, j]] += shift;
                }
            }
        }

        let by_row = hungarian::assign(&cost.view());
        let pairs = by_row
            .into_iter()
            .enumerate()
            .take(num_con)
            .filter_map(|(i, j)| match j {
                Some(j) if j < num_cols => Some((j % num_dis, i)),
                _ => None,
            })
            .collect();
        Ok(Matches { pairs })
    }
}

impl Matcher for SampledMatcher {
    fn find_matches(
        &self,
        log_pair_probs: &ArrayView2<'_, f64>,
        num_nulls: usize,
        duplicate_words: bool,
        rng: &mut StdRng,
    ) -> Result<Matches> {
        check_scores(log_pair_probs)?;
        let (num_dis, num_con) = log_pair_probs.dim();
        if num_dis == 0 || num_con == 0 {
            return Ok(Matches::default());
        }
        let capacity = if duplicate_words { num_con } else { num_dis.min(num_con) };
        let target = capacity.saturating_sub(num_nulls);
        let pairs = sampled::sample_pairs(log_pair_probs, target, duplicate_words, rng);
        Ok(Matches { pairs })
    }
}

/// Match discrete items (rows) to continuous items (columns).
///
/// `use_sampling` selects [`SampledMatcher`] over [`HungarianMatcher`].
pub fn get_matches(
    log_pair_probs: &ArrayView2<'_, f64>,
    use_sampling: bool,
    num_nulls: usize,
    duplicate_words: bool,
    rng: &mut StdRng,
) -> Result<Matches> {
    if use_sampling {
        SampledMatcher.find_matches(log_pair_probs, num_nulls, duplicate_words, rng)
    } else {
        HungarianMatcher.find_matches(log_pair_probs, num_nulls, duplicate_words, rng)
    }
}

/// Copies of each discrete column under duplicate-word expansion.
pub fn duplicate_count(num_dis: usize, num_con: usize, duplicate_words: bool) -> usize {
    if duplicate_words && num_dis > 0 {
        (num_con / num_dis).max(1)
    } else {
        1
    }
}

fn check_scores(log_pair_probs: &ArrayView2<'_, f64>) -> Result<()> {
    if log_pair_probs.iter().any(|v| v.is_nan()) {
        return Err(Error::InvalidParameter {
            name: "log_pair_probs",
            message: "must not contain NaN",
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(9)
    }

    #[test]
    fn test_exact_match_picks_diagonal() {
        let lp = array![[0.0, -5.0, -5.0], [-5.0, 0.0, -5.0]];
        let m = get_matches(&lp.view(), false, 0, false, &mut rng()).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.discrete_for(0), Some(0));
        assert_eq!(m.discrete_for(1), Some(1));
        assert_eq!(m.discrete_for(2), None);
    }

    #[test]
    fn test_null_gives_up_worst_pair() {
        let lp = array![[0.0, -9.0], [-9.0, -3.0]];
        let m = get_matches(&lp.view(), false, 1, false, &mut rng()).unwrap();
        assert_eq!(m.pairs, vec![(0, 0)]);
    }

    #[test]
    fn test_duplicate_words_cover_all_continuous() {
        let lp = array![[0.0, 0.0, 0.0, 0.0], [-1.0, -1.0, -1.0, -1.0]];
        let m = get_matches(&lp.view(), false, 0, true, &mut rng()).unwrap();
        assert_eq!(m.len(), 4);
        assert_eq!(duplicate_count(2, 4, true), 2);
    }

    #[test]
    fn test_empty_side_yields_no_matches() {
        let lp = Array2::<f64>::zeros((0, 3));
        assert!(get_matches(&lp.view(), false, 0, false, &mut rng()).unwrap().is_empty());
    }

    #[test]
    fn test_nan_rejected() {
        let lp = array![[f64::NAN]];
        assert!(get_matches(&lp.view(), false, 0, false, &mut rng()).is_err());
    }

    proptest! {
        #[test]
        fn match_count_is_min_minus_nulls(
            d in 1usize..5,
            c in 1usize..5,
            nulls in 0usize..3,
            sampling in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let mut r = StdRng::seed_from_u64(seed);
            let lp = Array2::from_shape_fn((d, c), |_| -10.0 * r.random::<f64>());
            let m = get_matches(&lp.view(), sampling, nulls, false, &mut r).unwrap();
            prop_assert_eq!(m.len(), d.min(c).saturating_sub(nulls));

            let mut dis: Vec<usize> = m.pairs.iter().map(|p| p.0).collect();
            let mut con: Vec<usize> = m.pairs.iter().map(|p| p.1).collect();
            dis.sort_unstable();
            dis.dedup();
            con.sort_unstable();
            con.dedup();
            prop_assert_eq!(dis.len(), m.len());
            prop_assert_eq!(con.len(), m.len());
        }
    }
}
