//! Free-parameter counting and the MDL / AIC scores built on it.
//!
//! ```text
//! mdl = ll − ½ · k · ln N
//! aic = −2 · ll + 2k · (1 + (k + 1) / (N − k − 1))
//! ```
//!
//! `ll` is the total (not per-point) log-likelihood and `N` the number of
//! points.

use super::{Model, VerticalWeights};
use crate::numeric::HALF_MOST_NEGATIVE;

/// Model size and information-criterion scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complexity {
    /// Number of free parameters.
    pub num_parameters: usize,
    /// Total log-likelihood over all points.
    pub total_log_likelihood: f64,
    /// Minimum-description-length score (larger is better).
    pub mdl: f64,
    /// Corrected Akaike information criterion (smaller is better).
    pub aic: f64,
}

impl Model {
    /// Count free parameters.
    ///
    /// Categorical entries at or below half of `dis_item_prob_threshold` are
    /// treated as pruned and not counted.
    pub fn num_parameters(&self, dis_item_prob_threshold: f64) -> usize {
        let cutoff = dis_item_prob_threshold / 2.0;
        let mut count = 0usize;
        for l in self.topology.levels() {
            let nodes = &self.levels[l];
            count += 2 * nodes.mean.len();
            count += nodes.categorical.iter().filter(|&&p| p > cutoff).count();
        }
        count += self.num_clusters().saturating_sub(1);
        let free_levels = self.topology.num_active_levels().saturating_sub(1);
        count += match &self.vertical {
            VerticalWeights::Global(v) => free_levels * v.ncols(),
            VerticalWeights::PerPoint(v) => free_levels * v.nrows(),
            VerticalWeights::PerPointPerCluster(v) => free_levels * v.dim().0 * v.dim().1,
        };
        count
    }

    /// Parameter count, total log-likelihood, MDL and AIC for a fit over
    /// `num_points` points, using the model's stored per-point log-likelihood.
    pub fn complexity(&self, num_points: usize, dis_item_prob_threshold: f64) -> Complexity {
        let k = self.num_parameters(dis_item_prob_threshold);
        let n = num_points as f64;
        let total = self.log_likelihood * n;
        let kf = k as f64;
        let degenerate = !total.is_finite() || total <= HALF_MOST_NEGATIVE || num_points == 0;
        let (mdl, aic) = if degenerate || n - kf - 1.0 <= 0.0 {
            (HALF_MOST_NEGATIVE, HALF_MOST_NEGATIVE)
        } else {
            (
                total - 0.5 * kf * n.ln(),
                -2.0 * total + 2.0 * kf * (1.0 + (kf + 1.0) / (n - kf - 1.0)),
            )
        };
        Complexity {
            num_parameters: k,
            total_log_likelihood: total,
            mdl,
            aic,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::config::VerticalWeightMode;
    use crate::model::Model;
    use crate::numeric::HALF_MOST_NEGATIVE;
    use crate::topology::Topology;

    #[test]
    fn test_parameter_count_global() {
        // Two levels (1 + 2 nodes), 3 categories, 2 features.
        let topo = Topology::from_fan_outs(&[2], 0, 2).unwrap();
        let m = Model::new(&topo, 3, 2, VerticalWeightMode::Global, 10).unwrap();
        let gaussian = 2 * 3 * 2;
        let categorical = 3 * 3;
        let priors = 1;
        let vertical = 2;
        assert_eq!(m.num_parameters(1e-4), gaussian + categorical + priors + vertical);
    }

    #[test]
    fn test_small_categorical_entries_not_counted() {
        let topo = Topology::flat(1).unwrap();
        let mut m = Model::new(&topo, 4, 0, VerticalWeightMode::Global, 1).unwrap();
        m.set_categorical(1, 0, &[1.0, 1e-9, 1e-9, 1.0]).unwrap();
        assert_eq!(m.num_parameters(1e-4), 2);
    }

    #[test]
    fn test_per_point_vertical_count_scales_with_points() {
        let topo = Topology::from_fan_outs(&[2], 0, 2).unwrap();
        let global = Model::new(&topo, 2, 0, VerticalWeightMode::Global, 5).unwrap();
        let per_pc = Model::new(&topo, 2, 0, VerticalWeightMode::PerPointPerCluster, 5).unwrap();
        assert_eq!(
            per_pc.num_parameters(0.0) - global.num_parameters(0.0),
            5 * 2 - 2
        );
    }

    #[test]
    fn test_mdl_and_aic() {
        let topo = Topology::flat(2).unwrap();
        let mut m = Model::new(&topo, 2, 0, VerticalWeightMode::Global, 100).unwrap();
        m.log_likelihood = -1.5;
        let c = m.complexity(100, 1e-4);
        let k = c.num_parameters as f64;
        assert!((c.total_log_likelihood + 150.0).abs() < 1e-12);
        assert!((c.mdl - (-150.0 - 0.5 * k * 100f64.ln())).abs() < 1e-9);
        assert!(c.aic > 300.0);
    }

    #[test]
    fn test_degenerate_scores() {
        let topo = Topology::flat(2).unwrap();
        let m = Model::new(&topo, 2, 0, VerticalWeightMode::Global, 100).unwrap();
        let c = m.complexity(100, 1e-4);
        assert_eq!(c.mdl, HALF_MOST_NEGATIVE);
        assert_eq!(c.aic, HALF_MOST_NEGATIVE);
    }
}
