//! Model initialization.
//!
//! Training starts from one of three states:
//!
//! ```text
//! Uninitialized ──random indicators + M-step──────────────────────┐
//!                                                                 ▼
//! PartiallyInitialized ──E-step on fitted levels + M-step──────▶ Ready
//! ```
//!
//! Both paths end in the same M-step entry point: given `P(cluster | point)`
//! and a `[level, cluster]` table of level weights, every item is credited to
//! every node on its cluster's path in proportion to those weights.

use super::{Model, VerticalWeights};
use crate::config::{EmConfig, VerticalWeightMode};
use crate::data::ClusterData;
use crate::em::mstep::{accumulate_prior_indicators, apply_m_step};
use crate::error::{Error, Result};
use ndarray::{Array2, Array3};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

/// Offset added to random membership draws before normalizing.
const HORIZONTAL_OFFSET: f64 = 0.1;

/// Offset added to random level-weight draws before normalizing.
const VERTICAL_OFFSET: f64 = 0.1;

/// Jitter applied to initial Gaussian means, in units of the node's stdev.
const INITIAL_MEAN_JITTER: f64 = 0.25;

/// Mixed into the seed for the vertical-weight stream.
const VERTICAL_STREAM: u64 = 0x9e37_79b9_7f4a_7c15;

/// How much of the model holds usable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Nothing fitted yet.
    Uninitialized,
    /// Levels `[first_level, fitted_last_level)` are fitted; deeper ones are not.
    PartiallyInitialized {
        /// One past the deepest fitted level.
        fitted_last_level: usize,
    },
    /// Every parameter is usable.
    Ready,
}

impl Model {
    /// Initialize from random membership and level weights, then one M-step.
    ///
    /// Deterministic for a given `config.seed`.
    pub fn initialize_random(&mut self, data: &ClusterData, config: &EmConfig) -> Result<()> {
        self.check_data_shape(data)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut v_rng = StdRng::seed_from_u64(config.seed ^ VERTICAL_STREAM);

        let membership = random_membership(data, self.num_clusters(), &mut rng)?;
        let level_table = random_level_table(
            self.topology.num_active_levels(),
            self.num_clusters(),
            &mut v_rng,
        );
        self.initialize_from_membership(data, config, membership, level_table, &mut rng)
    }

    /// Run the initializing M-step from a given membership and level table.
    pub(crate) fn initialize_from_membership(
        &mut self,
        data: &ClusterData,
        config: &EmConfig,
        membership: Array2<f64>,
        level_table: Array2<f64>,
        rng: &mut StdRng,
    ) -> Result<()> {
        self.ensure_points(data.num_points());
        let stats = accumulate_prior_indicators(self, data, config, &membership, &level_table)?;
        let diag = apply_m_step(self, &stats, config, 0, &data.feature_means());
        diag.log_summary(0);

        if self.num_features > 0 {
            let unit = Normal::new(0.0, 1.0).map_err(|e| Error::Other(e.to_string()))?;
            for l in self.topology.levels() {
                let nodes = &mut self.levels[l];
                for (m, v) in nodes.mean.iter_mut().zip(nodes.var.iter()) {
                    *m += unit.sample(rng) * v.sqrt() * INITIAL_MEAN_JITTER;
                }
            }
        }

        self.vertical = match self.vertical_mode() {
            VerticalWeightMode::Global => VerticalWeights::Global(level_table),
            VerticalWeightMode::PerPoint => VerticalWeights::uniform(
                VerticalWeightMode::PerPoint,
                data.num_points(),
                self.num_clusters(),
                self.topology.num_active_levels(),
            ),
            VerticalWeightMode::PerPointPerCluster => {
                let (num_levels, num_clusters) = level_table.dim();
                VerticalWeights::PerPointPerCluster(Array3::from_shape_fn(
                    (data.num_points(), num_clusters, num_levels),
                    |(_, c, l)| level_table[[l, c]],
                ))
            }
        };
        self.membership = membership;
        self.refresh_normalizers();
        self.state = InitState::Ready;
        log::debug!(
            "initialized {} clusters over {} points",
            self.num_clusters(),
            data.num_points()
        );
        Ok(())
    }

    pub(crate) fn check_data_shape(&self, data: &ClusterData) -> Result<()> {
        if data.num_categories() != self.num_categories {
            return Err(Error::DimensionMismatch {
                expected: self.num_categories,
                found: data.num_categories(),
            });
        }
        if data.num_features() != self.num_features {
            return Err(Error::DimensionMismatch {
                expected: self.num_features,
                found: data.num_features(),
            });
        }
        for (p, point) in data.points().iter().enumerate() {
            if let Some(g) = point.group {
                if g >= self.num_clusters() {
                    return Err(Error::ModalityMismatch {
                        point: p,
                        message: format!(
                            "group {g} is not a cluster (model has {})",
                            self.num_clusters()
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Random `P(cluster | point)` rows. Pinned points put all mass on their group.
fn random_membership(data: &ClusterData, num_clusters: usize, rng: &mut StdRng) -> Result<Array2<f64>> {
    if num_clusters == 0 {
        return Err(Error::EmptyInput);
    }
    let mut membership = Array2::zeros((data.num_points(), num_clusters));
    for (p, point) in data.points().iter().enumerate() {
        let mut row = membership.row_mut(p);
        if let Some(g) = point.group {
            row[g] = 1.0;
            continue;
        }
        let mut sum = 0.0;
        for slot in row.iter_mut() {
            *slot = rng.random::<f64>() + HORIZONTAL_OFFSET;
            sum += *slot;
        }
        row.mapv_inplace(|v| v / sum);
    }
    Ok(membership)
}

/// Random `[level, cluster]` weights, each column normalized over levels.
pub(crate) fn random_level_table(num_levels: usize, num_clusters: usize, rng: &mut StdRng) -> Array2<f64> {
    let mut table = Array2::zeros((num_levels, num_clusters));
    for c in 0..num_clusters {
        let mut sum = 0.0;
        for l in 0..num_levels {
            let v = rng.random::<f64>() + VERTICAL_OFFSET;
            table[[l, c]] = v;
            sum += v;
        }
        for l in 0..num_levels {
            table[[l, c]] /= sum;
        }
    }
    table
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::data::Point;
    use crate::topology::Topology;

    fn data() -> ClusterData {
        ClusterData::builder(3, 2)
            .add_point(Point::new().with_discrete(0, 1.0).with_continuous(vec![0.0, 0.0]))
            .add_point(Point::new().with_discrete(1, 2.0).with_continuous(vec![5.0, 5.0]))
            .add_point(Point::new().with_discrete(2, 1.0).with_continuous(vec![9.0, 1.0]).with_group(1))
            .build()
            .unwrap()
    }

    #[test]
    fn test_random_init_is_ready_and_valid() {
        let topo = Topology::from_fan_outs(&[2], 0, 2).unwrap();
        let mut m = Model::new(&topo, 3, 2, VerticalWeightMode::Global, 3).unwrap();
        let cfg = EmConfig::new().with_seed(7);
        m.initialize_random(&data(), &cfg).unwrap();
        assert_eq!(m.state(), InitState::Ready);
        let report = m.validate_with_var_floor(cfg.var_offset);
        assert!(report.is_healthy(), "{report}");
        assert_eq!(m.membership()[[2, 1]], 1.0);
    }

    #[test]
    fn test_random_init_is_deterministic() {
        let topo = Topology::from_fan_outs(&[2], 0, 2).unwrap();
        let cfg = EmConfig::new().with_seed(11);
        let mut a = Model::new(&topo, 3, 2, VerticalWeightMode::PerPointPerCluster, 3).unwrap();
        let mut b = a.clone();
        a.initialize_random(&data(), &cfg).unwrap();
        b.initialize_random(&data(), &cfg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_level_table_columns_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(3);
        let t = random_level_table(4, 5, &mut rng);
        for col in t.columns() {
            assert!((col.sum() - 1.0).abs() < 1e-12);
            assert!(col.iter().all(|&v| v > 0.0));
        }
    }

    #[test]
    fn test_group_out_of_range_rejected() {
        let topo = Topology::flat(1).unwrap();
        let mut m = Model::new(&topo, 3, 2, VerticalWeightMode::Global, 3).unwrap();
        assert!(m.initialize_random(&data(), &EmConfig::new()).is_err());
    }
}
