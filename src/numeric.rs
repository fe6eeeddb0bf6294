//! Log-space numerics shared by the E, V and M steps.
//!
//! Every product of probabilities in this crate is carried as a sum of logs,
//! and every log-sum-exp subtracts the running maximum first:
//!
//! ```text
//! log Σᵢ exp(xᵢ) = m + log Σᵢ exp(xᵢ - m),   m = maxᵢ xᵢ
//! ```
//!
//! Probabilities that underflow below [`PROB_FLOOR`] are floored rather than
//! propagated as zero, and each repair is counted in [`Diagnostics`] so the
//! engine can report it once per iteration.

/// Additive floor (spread over the categories) applied to categorical rows.
pub const MIN_DIS_PROB_FOR_OFFSET: f64 = 1e-6;

/// Smallest probability or weight the engine lets through unrepaired.
pub const PROB_FLOOR: f64 = 5.0 * f64::MIN_POSITIVE;

/// Total responsibility mass below which a distribution falls back to uniform.
pub const NEGLIGIBLE_MASS: f64 = 1e6 * f64::MIN_POSITIVE;

/// Stand-in for log(0) that stays finite under addition.
pub const LOG_ZERO: f64 = f64::MIN / 4.0;

/// Reported in place of a degenerate log-likelihood.
pub const HALF_MOST_NEGATIVE: f64 = f64::MIN / 2.0;

/// Level-indicator cell that no strategy has written yet.
pub const INDICATOR_UNSET: f64 = -2.0;

/// Level-indicator cell for an item the strategy left unmatched.
pub const INDICATOR_NOT_APPLICABLE: f64 = -1.0;

/// Counters for numerical repairs made while the engine keeps running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Probabilities or weights raised to [`PROB_FLOOR`].
    pub floored_probs: usize,
    /// Categorical node rows replaced by the uniform distribution.
    pub uniform_nodes: usize,
    /// Gaussian nodes left with no responsibility mass.
    pub empty_gaussian_nodes: usize,
    /// Variance estimates that came out negative and were clamped to zero.
    pub negative_variances: usize,
    /// Per-point level distributions replaced by the uniform distribution.
    pub uniform_level_dists: usize,
    /// Points skipped because a required modality was missing.
    pub skipped_points: usize,
    /// Clusters whose prior mass vanished.
    pub empty_clusters: usize,
}

impl Diagnostics {
    /// Fold another set of counters into this one.
    pub fn merge(&mut self, other: &Diagnostics) {
        self.floored_probs += other.floored_probs;
        self.uniform_nodes += other.uniform_nodes;
        self.empty_gaussian_nodes += other.empty_gaussian_nodes;
        self.negative_variances += other.negative_variances;
        self.uniform_level_dists += other.uniform_level_dists;
        self.skipped_points += other.skipped_points;
        self.empty_clusters += other.empty_clusters;
    }

    /// True when nothing was repaired.
    pub fn is_clean(&self) -> bool {
        *self == Diagnostics::default()
    }

    /// Emit one summary line at debug level.
    pub fn log_summary(&self, iteration: usize) {
        if self.is_clean() {
            return;
        }
        log::debug!(
            "iteration {iteration}: floored {} probs, {} uniform nodes, {} empty gaussian nodes, \
             {} negative variances, {} uniform level dists, {} skipped points, {} empty clusters",
            self.floored_probs,
            self.uniform_nodes,
            self.empty_gaussian_nodes,
            self.negative_variances,
            self.uniform_level_dists,
            self.skipped_points,
            self.empty_clusters
        );
    }
}

/// Log-sum-exp for numerical stability.
pub fn logsumexp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    max_val
        + values
            .iter()
            .map(|&v| (v - max_val).exp())
            .sum::<f64>()
            .ln()
}

/// `log(exp(a) + exp(b))` without leaving log space.
pub fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if hi == f64::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Floor a probability or weight at [`PROB_FLOOR`], counting the repair.
pub fn floor_prob(p: f64, diag: &mut Diagnostics) -> f64 {
    if p < PROB_FLOOR || p.is_nan() {
        diag.floored_probs += 1;
        PROB_FLOOR
    } else {
        p
    }
}

/// Natural log of a floored probability.
pub fn floored_ln(p: f64, diag: &mut Diagnostics) -> f64 {
    floor_prob(p, diag).ln()
}

/// Scale `values` in place so they sum to one. Returns the original sum.
///
/// When the sum is negligible the slice becomes uniform instead.
pub fn normalize_in_place(values: &mut [f64]) -> f64 {
    let sum: f64 = values.iter().sum();
    if values.is_empty() {
        return sum;
    }
    if sum < NEGLIGIBLE_MASS || !sum.is_finite() {
        let u = 1.0 / values.len() as f64;
        values.iter_mut().for_each(|v| *v = u);
    } else {
        values.iter_mut().for_each(|v| *v /= sum);
    }
    sum
}

/// Turn log weights into probabilities in place. Returns their log-sum-exp.
pub fn normalize_log_in_place(values: &mut [f64]) -> f64 {
    let lse = logsumexp(values);
    if !lse.is_finite() {
        let u = 1.0 / values.len().max(1) as f64;
        values.iter_mut().for_each(|v| *v = u);
        return lse;
    }
    values.iter_mut().for_each(|v| *v = (*v - lse).exp());
    lse
}

/// Indices of the `k` largest values, largest first. Ties keep index order.
pub fn top_k_indices(values: &[f64], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    idx.truncate(k);
    idx
}

/// Index of the largest value (first on ties). `None` for an empty slice.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_logsumexp_matches_direct_sum() {
        let xs = [0.1f64, -2.0, 1.5];
        let direct = xs.iter().map(|x| x.exp()).sum::<f64>().ln();
        assert!((logsumexp(&xs) - direct).abs() < 1e-12);
    }

    #[test]
    fn test_logsumexp_survives_huge_negatives() {
        let xs = [-1e6, -1e6 - 1.0];
        let got = logsumexp(&xs);
        assert!(got.is_finite());
        assert!((got - (-1e6 + (1.0 + (-1.0f64).exp()).ln())).abs() < 1e-9);
    }

    #[test]
    fn test_log_add_agrees_with_logsumexp() {
        assert!((log_add(-3.0, 2.0) - logsumexp(&[-3.0, 2.0])).abs() < 1e-12);
        assert_eq!(log_add(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
    }

    #[test]
    fn test_floor_counts_repairs() {
        let mut diag = Diagnostics::default();
        assert_eq!(floor_prob(0.0, &mut diag), PROB_FLOOR);
        assert_eq!(floor_prob(0.5, &mut diag), 0.5);
        assert_eq!(diag.floored_probs, 1);
    }

    #[test]
    fn test_normalize_negligible_becomes_uniform() {
        let mut v = [0.0, 0.0, 0.0, 0.0];
        normalize_in_place(&mut v);
        assert!(v.iter().all(|&x| (x - 0.25).abs() < 1e-15));
    }

    #[test]
    fn test_top_k_orders_descending() {
        assert_eq!(top_k_indices(&[0.1, 0.7, 0.2, 0.7], 3), vec![1, 3, 2]);
        assert_eq!(argmax(&[0.1, 0.7, 0.2, 0.7]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    proptest! {
        #[test]
        fn logsumexp_is_bounded_by_max(xs in proptest::collection::vec(-500.0f64..500.0, 1..40)) {
            let m = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let lse = logsumexp(&xs);
            prop_assert!(lse >= m - 1e-9);
            prop_assert!(lse <= m + (xs.len() as f64).ln() + 1e-9);
        }

        #[test]
        fn normalize_log_yields_distribution(xs in proptest::collection::vec(-800.0f64..50.0, 1..30)) {
            let mut v = xs.clone();
            normalize_log_in_place(&mut v);
            let s: f64 = v.iter().sum();
            prop_assert!((s - 1.0).abs() < 1e-9);
            prop_assert!(v.iter().all(|p| *p >= 0.0));
        }
    }
}
