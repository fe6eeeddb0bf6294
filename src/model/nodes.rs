//! Per-level node parameter blocks.

use crate::data::ContinuousItem;
use ndarray::{Array1, Array2};
use std::f64::consts::PI;

/// Parameters of every node at one level.
///
/// Inactive levels hold zero-row arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelNodes {
    /// `categorical[[node, category]]`, rows sum to one.
    pub categorical: Array2<f64>,
    /// `mean[[node, feature]]`.
    pub mean: Array2<f64>,
    /// `var[[node, feature]]`, diagonal covariance.
    pub var: Array2<f64>,
    /// `0.5 Σ_f ln(2π var) + con_log_norm`, per node.
    pub log_sqrt_det: Array1<f64>,
}

impl LevelNodes {
    /// Uniform categoricals, zero means, unit variances.
    pub fn new(num_nodes: usize, num_categories: usize, num_features: usize) -> Self {
        let uniform = if num_categories > 0 {
            1.0 / num_categories as f64
        } else {
            0.0
        };
        Self {
            categorical: Array2::from_elem((num_nodes, num_categories), uniform),
            mean: Array2::zeros((num_nodes, num_features)),
            var: Array2::ones((num_nodes, num_features)),
            log_sqrt_det: Array1::zeros(num_nodes),
        }
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.categorical.nrows()
    }

    /// Recompute `log_sqrt_det` from the variances.
    pub fn refresh_log_sqrt_det(&mut self, con_log_norm: f64) {
        for (node, slot) in self.log_sqrt_det.iter_mut().enumerate() {
            let half_log_det: f64 = self
                .var
                .row(node)
                .iter()
                .map(|&v| 0.5 * (2.0 * PI * v).ln())
                .sum();
            *slot = half_log_det + con_log_norm;
        }
    }

    /// Log density of `item` under `node`, shifted by `-con_log_norm`.
    ///
    /// Missing features drop out of both the quadratic term and the
    /// determinant. Each feature's squared normalized deviation is clamped at
    /// `max_sq_deviation`.
    pub fn log_density(&self, node: usize, item: &ContinuousItem, max_sq_deviation: f64) -> f64 {
        let mean = self.mean.row(node);
        let var = self.var.row(node);
        if !item.has_missing() {
            let mut q = 0.0;
            for ((&x, &m), &v) in item.features.iter().zip(mean.iter()).zip(var.iter()) {
                let d = x - m;
                q += (d * d / v).min(max_sq_deviation);
            }
            return -0.5 * q - self.log_sqrt_det[node];
        }
        // The cached determinant covers every feature; put back the missing ones.
        let mut q = 0.0;
        let mut missing_half_log_det = 0.0;
        for (f, &x) in item.features.iter().enumerate() {
            if item.is_present(f) {
                let d = x - mean[f];
                q += (d * d / var[f]).min(max_sq_deviation);
            } else {
                missing_half_log_det += 0.5 * (2.0 * PI * var[f]).ln();
            }
        }
        -0.5 * q - self.log_sqrt_det[node] + missing_half_log_det
    }

    /// Largest unshifted log density any node reaches at its own mean.
    pub(crate) fn peak_log_densities(&self) -> impl Iterator<Item = f64> + '_ {
        self.var
            .rows()
            .into_iter()
            .map(|row| -row.iter().map(|&v| 0.5 * (2.0 * PI * v).ln()).sum::<f64>())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_log_density_standard_normal() {
        let mut nodes = LevelNodes::new(1, 0, 2);
        nodes.refresh_log_sqrt_det(0.0);
        let item = ContinuousItem::new(vec![1.0, 0.0]);
        let expected = -0.5 - (2.0 * PI).ln();
        assert!((nodes.log_density(0, &item, 1e9) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_con_log_norm_shifts_density() {
        let mut nodes = LevelNodes::new(1, 0, 1);
        nodes.refresh_log_sqrt_det(0.0);
        let item = ContinuousItem::new(vec![0.3]);
        let base = nodes.log_density(0, &item, 1e9);
        nodes.refresh_log_sqrt_det(-4.0);
        assert!((nodes.log_density(0, &item, 1e9) - (base + 4.0)).abs() < 1e-12);
    }

    #[test]
    fn test_missing_feature_is_marginalized() {
        let mut nodes = LevelNodes::new(1, 0, 2);
        nodes.var[[0, 1]] = 9.0;
        nodes.refresh_log_sqrt_det(0.0);
        let partial = ContinuousItem::with_missing(vec![1.0, 100.0], vec![false, true]);
        let mut one_d = LevelNodes::new(1, 0, 1);
        one_d.refresh_log_sqrt_det(0.0);
        let full = ContinuousItem::new(vec![1.0]);
        let a = nodes.log_density(0, &partial, 1e9);
        let b = one_d.log_density(0, &full, 1e9);
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn test_deviation_clamp() {
        let mut nodes = LevelNodes::new(1, 0, 1);
        nodes.refresh_log_sqrt_det(0.0);
        let far = ContinuousItem::new(vec![1e6]);
        let clamped = nodes.log_density(0, &far, 100.0);
        assert!((clamped - (-50.0 - 0.5 * (2.0 * PI).ln())).abs() < 1e-9);
    }
}
