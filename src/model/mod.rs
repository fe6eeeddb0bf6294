//! The hierarchical mixture model.
//!
//! # Generative story
//!
//! A point picks a cluster `c` with prior `a[c]`. Each of its items then picks
//! a level `l` along the cluster's root-to-leaf path, with the vertical weight
//! `V(l | c)` (or a per-point variant), and is emitted by the node the cluster
//! owns at that level:
//!
//! ```text
//! P(items | c) = Πᵢ Σₗ V(l | c) · P(itemᵢ | node(c, l))
//!
//! discrete item:   P(w | n)  = categorical[n][w]
//! continuous item: P(x | n)  = Π_f N(x_f ; mean[n][f], var[n][f])
//! ```
//!
//! Nodes near the root are shared by many clusters, so they capture what the
//! clusters have in common; leaf nodes capture what is specific.
//!
//! # Vertical weights
//!
//! Three representations exist, and one is fixed when the model is built
//! (see [`VerticalWeightMode`]):
//!
//! - `Global`: `V[level][cluster]`, shared by every point
//! - `PerPoint`: `P(l | p)`, one level distribution per point
//! - `PerPointPerCluster`: `P(l | p, c)`
//!
//! # Log-density normalization
//!
//! Gaussian log densities are stored shifted by `-con_log_norm`, a constant
//! re-estimated after every M-step so that typical log densities stay near
//! zero. Posteriors are unaffected; reported log-likelihoods add it back.

mod complexity;
mod init;
mod nodes;
mod validate;

pub use complexity::Complexity;
pub use init::InitState;
pub(crate) use init::random_level_table;
pub use nodes::LevelNodes;
pub use validate::{Severity, ValidationIssue, ValidationReport};

use crate::config::VerticalWeightMode;
use crate::data::{ContinuousItem, FeatureNormalization};
use crate::error::{Error, Result};
use crate::numeric::PROB_FLOOR;
use crate::topology::Topology;
use ndarray::{s, Array1, Array2, Array3, ArrayViewMut2};

/// Level weights in one of the three representations.
///
/// Levels are indexed by their offset from the topology's first active level.
#[derive(Debug, Clone, PartialEq)]
pub enum VerticalWeights {
    /// `[level, cluster]`; each column sums to one.
    Global(Array2<f64>),
    /// `[point, level]`; each row sums to one.
    PerPoint(Array2<f64>),
    /// `[point, cluster, level]`; each innermost row sums to one.
    PerPointPerCluster(Array3<f64>),
}

impl VerticalWeights {
    /// Uniform weights in the given representation.
    pub fn uniform(
        mode: VerticalWeightMode,
        num_points: usize,
        num_clusters: usize,
        num_levels: usize,
    ) -> Self {
        let u = 1.0 / num_levels.max(1) as f64;
        match mode {
            VerticalWeightMode::Global => {
                VerticalWeights::Global(Array2::from_elem((num_levels, num_clusters), u))
            }
            VerticalWeightMode::PerPoint => {
                VerticalWeights::PerPoint(Array2::from_elem((num_points, num_levels), u))
            }
            VerticalWeightMode::PerPointPerCluster => VerticalWeights::PerPointPerCluster(
                Array3::from_elem((num_points, num_clusters, num_levels), u),
            ),
        }
    }

    /// The representation.
    pub fn mode(&self) -> VerticalWeightMode {
        match self {
            VerticalWeights::Global(_) => VerticalWeightMode::Global,
            VerticalWeights::PerPoint(_) => VerticalWeightMode::PerPoint,
            VerticalWeights::PerPointPerCluster(_) => VerticalWeightMode::PerPointPerCluster,
        }
    }

    /// Number of points covered (zero for `Global`).
    pub fn num_points(&self) -> usize {
        match self {
            VerticalWeights::Global(_) => 0,
            VerticalWeights::PerPoint(w) => w.nrows(),
            VerticalWeights::PerPointPerCluster(w) => w.dim().0,
        }
    }

    /// Weight of `level` (offset) for `point` in `cluster`.
    pub fn weight(&self, point: usize, cluster: usize, level: usize) -> f64 {
        match self {
            VerticalWeights::Global(w) => w[[level, cluster]],
            VerticalWeights::PerPoint(w) => w[[point, level]],
            VerticalWeights::PerPointPerCluster(w) => w[[point, cluster, level]],
        }
    }

    /// Write `ln` of the level weights for `point` into `out[[cluster, level]]`
    /// for every listed cluster. Weights are floored before taking the log.
    pub(crate) fn fill_log_weights(&self, point: usize, clusters: &[usize], out: &mut ArrayViewMut2<'_, f64>) {
        let num_levels = out.ncols();
        for &c in clusters {
            for l in 0..num_levels {
                out[[c, l]] = self.weight(point, c, l).max(PROB_FLOOR).ln();
            }
        }
    }
}

/// Fitted parameters plus the training-time posteriors.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub(crate) topology: Topology,
    pub(crate) num_categories: usize,
    pub(crate) num_features: usize,
    /// Cluster priors `a[c]`.
    pub(crate) priors: Array1<f64>,
    pub(crate) vertical: VerticalWeights,
    /// `P(cluster | point)` for the training points.
    pub(crate) membership: Array2<f64>,
    /// Node parameters, indexed by absolute level.
    pub(crate) levels: Vec<LevelNodes>,
    pub(crate) con_log_norm: f64,
    pub(crate) log_likelihood: f64,
    pub(crate) state: InitState,
}

impl Model {
    /// An uninitialized model shaped by `topology`, with uniform priors,
    /// uniform categoricals, unit Gaussians and uniform vertical weights.
    pub fn new(
        topology: &Topology,
        num_categories: usize,
        num_features: usize,
        mode: VerticalWeightMode,
        num_points: usize,
    ) -> Result<Self> {
        topology.validate()?;
        if num_categories == 0 && num_features == 0 {
            return Err(Error::InvalidParameter {
                name: "num_categories",
                message: "a model needs categories, features, or both",
            });
        }
        let num_clusters = topology.num_clusters();
        let levels = (0..topology.num_levels())
            .map(|l| LevelNodes::new(topology.level_count(l), num_categories, num_features))
            .collect();
        let mut model = Self {
            topology: topology.clone(),
            num_categories,
            num_features,
            priors: Array1::from_elem(num_clusters, 1.0 / num_clusters as f64),
            vertical: VerticalWeights::uniform(
                mode,
                num_points,
                num_clusters,
                topology.num_active_levels(),
            ),
            membership: Array2::from_elem((num_points, num_clusters), 1.0 / num_clusters as f64),
            levels,
            con_log_norm: 0.0,
            log_likelihood: f64::NEG_INFINITY,
            state: InitState::Uninitialized,
        };
        model.refresh_normalizers();
        Ok(model)
    }

    /// The topology the model was built on.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of clusters.
    pub fn num_clusters(&self) -> usize {
        self.topology.num_clusters()
    }

    /// Size of the discrete category space.
    pub fn num_categories(&self) -> usize {
        self.num_categories
    }

    /// Continuous feature dimension.
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Cluster priors.
    pub fn priors(&self) -> &Array1<f64> {
        &self.priors
    }

    /// Vertical weights.
    pub fn vertical(&self) -> &VerticalWeights {
        &self.vertical
    }

    /// Vertical weight representation.
    pub fn vertical_mode(&self) -> VerticalWeightMode {
        self.vertical.mode()
    }

    /// `P(cluster | point)` from the last E-step over the training points.
    pub fn membership(&self) -> &Array2<f64> {
        &self.membership
    }

    /// Node parameters at an absolute `level`.
    pub fn level(&self, level: usize) -> &LevelNodes {
        &self.levels[level]
    }

    /// Current log-density normalization constant.
    pub fn con_log_norm(&self) -> f64 {
        self.con_log_norm
    }

    /// Average per-point log-likelihood of the last E-step.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Initialization state.
    pub fn state(&self) -> InitState {
        self.state
    }

    /// Replace the cluster priors. They are renormalized.
    pub fn set_priors(&mut self, priors: &[f64]) -> Result<()> {
        if priors.len() != self.num_clusters() {
            return Err(Error::DimensionMismatch {
                expected: self.num_clusters(),
                found: priors.len(),
            });
        }
        let sum = checked_mass(priors, "priors")?;
        for (slot, &p) in self.priors.iter_mut().zip(priors) {
            *slot = p / sum;
        }
        Ok(())
    }

    /// Replace one node's categorical distribution. It is renormalized.
    pub fn set_categorical(&mut self, level: usize, node: usize, probs: &[f64]) -> Result<()> {
        self.check_node(level, node)?;
        if probs.len() != self.num_categories {
            return Err(Error::DimensionMismatch {
                expected: self.num_categories,
                found: probs.len(),
            });
        }
        let sum = checked_mass(probs, "categorical")?;
        let mut row = self.levels[level].categorical.row_mut(node);
        for (slot, &p) in row.iter_mut().zip(probs) {
            *slot = p / sum;
        }
        Ok(())
    }

    /// Replace one node's Gaussian.
    pub fn set_gaussian(&mut self, level: usize, node: usize, mean: &[f64], var: &[f64]) -> Result<()> {
        self.check_node(level, node)?;
        for v in [mean.len(), var.len()] {
            if v != self.num_features {
                return Err(Error::DimensionMismatch {
                    expected: self.num_features,
                    found: v,
                });
            }
        }
        if var.iter().any(|v| !(v.is_finite() && *v > 0.0)) || mean.iter().any(|m| !m.is_finite()) {
            return Err(Error::InvalidParameter {
                name: "gaussian",
                message: "means must be finite and variances finite and > 0",
            });
        }
        let nodes = &mut self.levels[level];
        nodes.mean.row_mut(node).assign(&Array1::from(mean.to_vec()));
        nodes.var.row_mut(node).assign(&Array1::from(var.to_vec()));
        self.refresh_normalizers();
        Ok(())
    }

    /// Replace the `Global` level weights of one cluster. They are renormalized.
    pub fn set_cluster_vertical(&mut self, cluster: usize, weights: &[f64]) -> Result<()> {
        let num_levels = self.topology.num_active_levels();
        let VerticalWeights::Global(v) = &mut self.vertical else {
            return Err(Error::InvalidParameter {
                name: "vertical",
                message: "per-cluster level weights exist only in Global mode",
            });
        };
        if cluster >= v.ncols() || weights.len() != num_levels {
            return Err(Error::DimensionMismatch {
                expected: num_levels,
                found: weights.len(),
            });
        }
        let sum = checked_mass(weights, "vertical")?;
        for (l, &w) in weights.iter().enumerate() {
            v[[l, cluster]] = w / sum;
        }
        Ok(())
    }

    /// Declare that levels `[first_level, fitted_last_level)` hold fitted
    /// parameters and deeper levels still need initializing.
    pub fn mark_partially_initialized(&mut self, fitted_last_level: usize) -> Result<()> {
        if fitted_last_level <= self.topology.first_level()
            || fitted_last_level > self.topology.last_level()
        {
            return Err(Error::InvalidParameter {
                name: "fitted_last_level",
                message: "must lie within the active level range",
            });
        }
        self.state = InitState::PartiallyInitialized { fitted_last_level };
        Ok(())
    }

    /// Declare every parameter usable.
    pub fn mark_ready(&mut self) {
        self.refresh_normalizers();
        self.state = InitState::Ready;
    }

    fn check_node(&self, level: usize, node: usize) -> Result<()> {
        if level >= self.levels.len() || node >= self.levels[level].num_nodes() {
            return Err(Error::InvalidParameter {
                name: "node",
                message: "no such (level, node)",
            });
        }
        Ok(())
    }

    /// Resize the per-point state for `num_points` training points.
    ///
    /// Existing rows are kept when the count matches; otherwise membership
    /// becomes uniform and per-point vertical weights are reset.
    pub(crate) fn ensure_points(&mut self, num_points: usize) {
        let num_clusters = self.num_clusters();
        if self.membership.nrows() != num_points {
            self.membership =
                Array2::from_elem((num_points, num_clusters), 1.0 / num_clusters as f64);
        }
        let mode = self.vertical_mode();
        if mode != VerticalWeightMode::Global && self.vertical.num_points() != num_points {
            self.vertical = VerticalWeights::uniform(
                mode,
                num_points,
                num_clusters,
                self.topology.num_active_levels(),
            );
        }
    }

    /// Re-estimate `con_log_norm` from the current variances and refresh every
    /// node's `log_sqrt_det`.
    pub(crate) fn refresh_normalizers(&mut self) {
        if self.num_features > 0 {
            let (sum, count) = self
                .topology
                .levels()
                .flat_map(|l| self.levels[l].peak_log_densities())
                .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            if count > 0 && sum.is_finite() {
                self.con_log_norm = sum / count as f64 - 0.5 * self.num_features as f64;
            }
        }
        let norm = self.con_log_norm;
        for l in self.topology.levels() {
            self.levels[l].refresh_log_sqrt_det(norm);
        }
    }

    /// `ln P(category | node)` at an absolute level.
    #[inline]
    pub(crate) fn categorical_ln(&self, level: usize, node: usize, category: usize) -> f64 {
        self.levels[level].categorical[[node, category]]
            .max(PROB_FLOOR)
            .ln()
    }

    /// Shifted Gaussian log density of `item` at an absolute level.
    #[inline]
    pub(crate) fn gaussian_ln(
        &self,
        level: usize,
        node: usize,
        item: &ContinuousItem,
        max_sq_deviation: f64,
    ) -> f64 {
        self.levels[level].log_density(node, item, max_sq_deviation)
    }

    /// Drop the last category, the one added by
    /// [`ClusterData::with_discrete_nulls`](crate::data::ClusterData::with_discrete_nulls).
    ///
    /// Rows are not renormalized: each categorical row keeps the
    /// probabilities of the real categories and now sums to one minus its
    /// null mass. Returns the removed null column per level, indexed by
    /// absolute level (empty for inactive levels).
    pub fn subtract_discrete_nulls(&mut self) -> Result<Vec<Array1<f64>>> {
        if self.num_categories == 0 || (self.num_categories == 1 && self.num_features == 0) {
            return Err(Error::InvalidParameter {
                name: "num_categories",
                message: "no null category to remove",
            });
        }
        let null = self.num_categories - 1;
        let mut removed = Vec::with_capacity(self.levels.len());
        for nodes in &mut self.levels {
            removed.push(nodes.categorical.column(null).to_owned());
            nodes.categorical = nodes.categorical.slice(s![.., ..null]).to_owned();
        }
        self.num_categories = null;
        log::debug!("removed null category {null}");
        Ok(removed)
    }

    /// Map Gaussian parameters fitted on standardized features back to the
    /// original feature space.
    pub fn un_normalize(&mut self, norm: &FeatureNormalization) -> Result<()> {
        if norm.mean.len() != self.num_features || norm.var.len() != self.num_features {
            return Err(Error::DimensionMismatch {
                expected: self.num_features,
                found: norm.mean.len(),
            });
        }
        let norm_var = norm.norm_stdev * norm.norm_stdev;
        for l in self.topology.levels() {
            let nodes = &mut self.levels[l];
            for node in 0..nodes.num_nodes() {
                for f in 0..self.num_features {
                    if norm.var[f] > 0.0 {
                        let stdev = norm.var[f].sqrt();
                        nodes.var[[node, f]] *= norm.var[f] / norm_var;
                        nodes.mean[[node, f]] =
                            nodes.mean[[node, f]] * stdev / norm.norm_stdev + norm.mean[f];
                    } else {
                        nodes.mean[[node, f]] += norm.mean[f];
                    }
                }
            }
        }
        self.refresh_normalizers();
        Ok(())
    }
}

fn checked_mass(values: &[f64], name: &'static str) -> Result<f64> {
    if values.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
        return Err(Error::InvalidParameter {
            name,
            message: "entries must be finite and non-negative",
        });
    }
    let sum: f64 = values.iter().sum();
    if sum <= 0.0 {
        return Err(Error::InvalidParameter {
            name,
            message: "entries must not all be zero",
        });
    }
    Ok(sum)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn two_level() -> Topology {
        Topology::from_fan_outs(&[2], 0, 2).unwrap()
    }

    #[test]
    fn test_new_model_is_uniform() {
        let m = Model::new(&two_level(), 3, 2, VerticalWeightMode::Global, 4).unwrap();
        assert_eq!(m.num_clusters(), 2);
        assert_eq!(m.level(1).num_nodes(), 2);
        assert!((m.level(0).categorical[[0, 2]] - 1.0 / 3.0).abs() < 1e-15);
        assert!((m.vertical().weight(0, 1, 0) - 0.5).abs() < 1e-15);
        assert_eq!(m.membership().dim(), (4, 2));
        assert_eq!(m.state(), InitState::Uninitialized);
    }

    #[test]
    fn test_setters_renormalize() {
        let mut m = Model::new(&two_level(), 2, 0, VerticalWeightMode::Global, 1).unwrap();
        m.set_priors(&[3.0, 1.0]).unwrap();
        assert!((m.priors()[0] - 0.75).abs() < 1e-15);
        m.set_categorical(1, 0, &[2.0, 2.0]).unwrap();
        assert!((m.level(1).categorical[[0, 0]] - 0.5).abs() < 1e-15);
        m.set_cluster_vertical(1, &[1.0, 3.0]).unwrap();
        assert!((m.vertical().weight(0, 1, 1) - 0.75).abs() < 1e-15);
        assert!(m.set_priors(&[0.0, 0.0]).is_err());
        assert!(m.set_categorical(1, 5, &[1.0, 1.0]).is_err());
    }

    #[test]
    fn test_per_point_mode_rejects_cluster_vertical() {
        let mut m = Model::new(&two_level(), 2, 0, VerticalWeightMode::PerPoint, 3).unwrap();
        assert!(m.set_cluster_vertical(0, &[0.5, 0.5]).is_err());
        assert_eq!(m.vertical().num_points(), 3);
    }

    #[test]
    fn test_un_normalize_inverts_standardization() {
        let topo = Topology::flat(1).unwrap();
        let mut m = Model::new(&topo, 0, 1, VerticalWeightMode::Global, 1).unwrap();
        m.set_gaussian(1, 0, &[1.0], &[0.25]).unwrap();
        let norm = FeatureNormalization {
            mean: vec![10.0],
            var: vec![4.0],
            norm_stdev: 1.0,
        };
        m.un_normalize(&norm).unwrap();
        assert!((m.level(1).mean[[0, 0]] - 12.0).abs() < 1e-12);
        assert!((m.level(1).var[[0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_subtract_discrete_nulls_keeps_real_categories() {
        let mut m = Model::new(&two_level(), 3, 0, VerticalWeightMode::Global, 1).unwrap();
        m.set_categorical(1, 0, &[0.5, 0.3, 0.2]).unwrap();
        m.set_categorical(1, 1, &[0.1, 0.1, 0.8]).unwrap();
        let removed = m.subtract_discrete_nulls().unwrap();
        assert_eq!(m.num_categories(), 2);
        assert_eq!(m.level(1).categorical.dim(), (2, 2));
        assert_eq!(m.level(1).categorical.row(0).to_vec(), vec![0.5, 0.3]);
        assert!((removed[1][1] - 0.8).abs() < 1e-15);
        assert!((removed[0][0] - 1.0 / 3.0).abs() < 1e-15);
        // Unnormalized on purpose: what is missing is the null mass.
        for node in 0..2 {
            let row_sum: f64 = m.level(1).categorical.row(node).sum();
            assert!((row_sum + removed[1][node] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_subtract_discrete_nulls_needs_a_category() {
        let mut m = Model::new(&two_level(), 1, 0, VerticalWeightMode::Global, 1).unwrap();
        assert!(m.subtract_discrete_nulls().is_err());
        let mut m = Model::new(&two_level(), 0, 2, VerticalWeightMode::Global, 1).unwrap();
        assert!(m.subtract_discrete_nulls().is_err());
    }

    #[test]
    fn test_partial_state_bounds() {
        let topo = Topology::from_fan_outs(&[2, 2], 0, 3).unwrap();
        let mut m = Model::new(&topo, 2, 0, VerticalWeightMode::Global, 1).unwrap();
        assert!(m.mark_partially_initialized(0).is_err());
        m.mark_partially_initialized(2).unwrap();
        assert_eq!(m.state(), InitState::PartiallyInitialized { fitted_last_level: 2 });
    }
}
