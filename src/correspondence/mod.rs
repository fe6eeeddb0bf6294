//! Correspondence strategies: how a point's discrete and continuous items
//! relate when it is scored against a cluster.
//!
//! Every strategy exposes the same contract. Given a point, the clusters to
//! score, and `ln` level weights per cluster, it
//!
//! 1. writes the data term of `ln P(items | cluster)` for each listed cluster
//!    into `cluster_ll` (the engine adds `ln a[c]`), and
//! 2. writes every (cluster, level, item) level indicator, either a
//!    responsibility in `[0, 1]` or [`INDICATOR_NOT_APPLICABLE`].
//!
//! The V-step and M-step consume only those outputs, so they never branch on
//! the correspondence model.
//!
//! | model | strategy                | pairing                              |
//! |-------|-------------------------|--------------------------------------|
//! | 0     | [`Independent`]         | none                                 |
//! | 1     | [`Dependent`]           | discrete items use continuous levels |
//! | 2     | [`Matched`]             | bipartite matching                   |
//! | 3     | [`LevelPrior`]          | level prior from all pairs           |
//! | 5     | [`Block`]               | matching onto tied level blocks      |
//!
//! Boost factors are exponents on item probabilities, applied before the
//! sum over levels.
//!
//! [`INDICATOR_NOT_APPLICABLE`]: crate::numeric::INDICATOR_NOT_APPLICABLE

mod block;
mod dependent;
mod independent;
mod level_prior;
mod matched;

pub use block::Block;
pub use dependent::Dependent;
pub use independent::Independent;
pub use level_prior::LevelPrior;
pub use matched::Matched;

use crate::config::{CorrespondenceModel, EmConfig};
use crate::data::Point;
use crate::error::Result;
use crate::model::Model;
use crate::numeric::normalize_log_in_place;
use crate::scratch::{ContinuousProbCache, LevelIndicators, PointScratch};
use ndarray::ArrayView1;
use rand::rngs::StdRng;

/// Read-only inputs for scoring one point.
#[derive(Debug, Clone, Copy)]
pub struct PointContext<'a> {
    /// Model being evaluated.
    pub model: &'a Model,
    /// Numeric tunables.
    pub config: &'a EmConfig,
    /// The point.
    pub point: &'a Point,
    /// Clusters to score.
    pub clusters: &'a [usize],
    /// `ln a[c]` for every cluster.
    pub log_priors: &'a [f64],
    /// Multiplier on discrete item counts (item-count normalization).
    pub dis_factor: f64,
    /// Multiplier on continuous item counts.
    pub con_factor: f64,
    /// Sample matchings instead of solving them exactly.
    pub sample: bool,
}

impl PointContext<'_> {
    /// Boosted `ln P(category | node(c, level))`.
    #[inline]
    pub fn dis_log(&self, cluster: usize, level: usize, category: usize) -> f64 {
        let node = self.model.topology().node(cluster, level);
        self.config.dis_prob_boost_factor * self.model.categorical_ln(level, node, category)
    }

    /// Boosted, shifted Gaussian log density of continuous item `i`.
    #[inline]
    pub fn con_log(&self, cache: &ContinuousProbCache, cluster: usize, level: usize, i: usize) -> f64 {
        let node = self.model.topology().node(cluster, level);
        self.config.con_prob_boost_factor * cache.log_density(self.model, self.point, i, level, node)
    }

    /// First active level.
    #[inline]
    pub fn first_level(&self) -> usize {
        self.model.topology().first_level()
    }

    /// Number of active levels.
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.model.topology().num_active_levels()
    }

    /// Total `con_log_norm` multiplier when every continuous item is scored
    /// once with its weight.
    pub fn weighted_con_norm(&self) -> f64 {
        self.config.con_prob_boost_factor
            * self.con_factor
            * self.point.continuous.iter().map(|c| c.weight).sum::<f64>()
    }
}

/// A correspondence model.
pub trait CorrespondenceStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether a point must carry both modalities to be scored.
    fn needs_both_modalities(&self) -> bool;

    /// Whether the strategy computes matchings.
    fn uses_matching(&self) -> bool {
        false
    }

    /// Score `ctx.point` against `ctx.clusters`.
    ///
    /// Reads `scratch.log_v` and `scratch.cache`; writes `scratch.cluster_ll`
    /// and `scratch.indicators`. Returns the multiplier with which
    /// `con_log_norm` must be added back to get the unshifted log-likelihood.
    fn score_point(
        &self,
        ctx: &PointContext<'_>,
        scratch: &mut PointScratch,
        rng: &mut StdRng,
    ) -> Result<f64>;
}

/// The strategy for a correspondence model.
pub fn strategy_for(model: CorrespondenceModel) -> Box<dyn CorrespondenceStrategy> {
    match model {
        CorrespondenceModel::Independent => Box::new(Independent),
        CorrespondenceModel::Dependent => Box::new(Dependent),
        CorrespondenceModel::Matched { share_matches } => Box::new(Matched { share_matches }),
        CorrespondenceModel::LevelPrior => Box::new(LevelPrior),
        CorrespondenceModel::Block => Box::new(Block),
    }
}

/// Score every discrete item of the point under `cluster` with `ln` level
/// weights `log_w`, writing its level responsibilities. Returns
/// `Σ_d multiplicity · factor · ln Σ_l w_l P(w_d | l)^β`.
pub(crate) fn score_discrete_items(
    ctx: &PointContext<'_>,
    indicators: &mut LevelIndicators,
    cluster: usize,
    log_w: ArrayView1<'_, f64>,
    buf: &mut [f64],
) -> f64 {
    let first = ctx.first_level();
    let mut total = 0.0;
    for (d, item) in ctx.point.discrete.iter().enumerate() {
        for (lo, slot) in buf.iter_mut().enumerate() {
            *slot = log_w[lo] + ctx.dis_log(cluster, first + lo, item.category);
        }
        let lse = normalize_log_in_place(buf);
        for (lo, &r) in buf.iter().enumerate() {
            indicators.set_dis(cluster, lo, d, r);
        }
        total += item.multiplicity * ctx.dis_factor * lse;
    }
    total
}

/// Continuous counterpart of [`score_discrete_items`].
pub(crate) fn score_continuous_items(
    ctx: &PointContext<'_>,
    cache: &ContinuousProbCache,
    indicators: &mut LevelIndicators,
    cluster: usize,
    log_w: ArrayView1<'_, f64>,
    buf: &mut [f64],
) -> f64 {
    let first = ctx.first_level();
    let mut total = 0.0;
    for (i, item) in ctx.point.continuous.iter().enumerate() {
        for (lo, slot) in buf.iter_mut().enumerate() {
            *slot = log_w[lo] + ctx.con_log(cache, cluster, first + lo, i);
        }
        let lse = normalize_log_in_place(buf);
        for (lo, &r) in buf.iter().enumerate() {
            indicators.set_con(cluster, lo, i, r);
        }
        total += item.weight * ctx.con_factor * lse;
    }
    total
}

/// `ln` of the joint level term for a (discrete, continuous) pair at one level.
#[inline]
pub(crate) fn pair_level_log(
    ctx: &PointContext<'_>,
    cache: &ContinuousProbCache,
    log_w: f64,
    cluster: usize,
    level: usize,
    d: usize,
    i: usize,
) -> f64 {
    log_w + ctx.dis_log(cluster, level, ctx.point.discrete[d].category) + ctx.con_log(cache, cluster, level, i)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::VerticalWeightMode;
    use crate::numeric::INDICATOR_NOT_APPLICABLE;
    use crate::topology::Topology;
    use rand::SeedableRng;

    /// Two-level, two-cluster model with distinct leaf nodes.
    pub fn model() -> Model {
        let topo = Topology::from_fan_outs(&[2], 0, 2).unwrap();
        let mut m = Model::new(&topo, 2, 1, VerticalWeightMode::Global, 1).unwrap();
        m.set_categorical(0, 0, &[0.5, 0.5]).unwrap();
        m.set_categorical(1, 0, &[0.9, 0.1]).unwrap();
        m.set_categorical(1, 1, &[0.1, 0.9]).unwrap();
        m.set_gaussian(0, 0, &[0.0], &[4.0]).unwrap();
        m.set_gaussian(1, 0, &[-2.0], &[1.0]).unwrap();
        m.set_gaussian(1, 1, &[2.0], &[1.0]).unwrap();
        m.mark_ready();
        m
    }

    pub fn point() -> Point {
        Point::new()
            .with_discrete(0, 1.0)
            .with_discrete(1, 1.0)
            .with_continuous(vec![-2.0])
            .with_continuous(vec![2.1])
            .with_continuous(vec![0.0])
    }

    /// Run `strategy` on `point` against both clusters and check that every
    /// indicator is written and every applicable level row sums to one.
    pub fn run(
        strategy: &dyn CorrespondenceStrategy,
        model: &Model,
        config: &EmConfig,
        point: &Point,
    ) -> (Vec<f64>, f64, PointScratch) {
        let clusters = [0usize, 1];
        let mut scratch = PointScratch::new(model, point.num_discrete(), point.num_continuous(), true, 1e6);
        let log_priors: Vec<f64> = model.priors().iter().map(|a| a.ln()).collect();
        model
            .vertical()
            .fill_log_weights(0, &clusters, &mut scratch.log_v.view_mut());
        scratch.cache.fill(model, point).unwrap();
        scratch
            .indicators
            .reset(&clusters, point.num_discrete(), point.num_continuous())
            .unwrap();
        let ctx = PointContext {
            model,
            config,
            point,
            clusters: &clusters,
            log_priors: &log_priors,
            dis_factor: 1.0,
            con_factor: 1.0,
            sample: false,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let norm = strategy.score_point(&ctx, &mut scratch, &mut rng).unwrap();
        scratch.indicators.verify(&clusters).unwrap();
        let levels = model.topology().num_active_levels();
        for &c in &clusters {
            for d in 0..point.num_discrete() {
                let col: Vec<f64> = (0..levels).map(|l| scratch.indicators.dis(c, l, d)).collect();
                if col[0] != INDICATOR_NOT_APPLICABLE {
                    assert!((col.iter().sum::<f64>() - 1.0).abs() < 1e-9, "{col:?}");
                }
            }
            for i in 0..point.num_continuous() {
                let col: Vec<f64> = (0..levels).map(|l| scratch.indicators.con(c, l, i)).collect();
                if col[0] != INDICATOR_NOT_APPLICABLE {
                    assert!((col.iter().sum::<f64>() - 1.0).abs() < 1e-9, "{col:?}");
                }
            }
        }
        let ll = clusters.iter().map(|&c| scratch.cluster_ll[c]).collect();
        (ll, norm, scratch)
    }
}
