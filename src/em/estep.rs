//! E-step and V-step: one scoring pass over the points.
//!
//! For each point:
//!
//! ```text
//! clusters    = [group]            if the point is pinned
//!             | top-K              once cluster limiting is on
//!             | 0..K               otherwise
//! ll[c]       = strategy data term                (see correspondence)
//! q(c | p)    = softmax_c(ll[c] + ln a[c])
//! fit(p)      = logsumexp_c(ll[c] + ln a[c]) + con_log_norm · norm_weight
//! ```
//!
//! The V-step turns each cluster's level indicators into level mass
//! `m[c][l]` and, depending on the vertical mode, either accumulates it for
//! the `Global` M-step or produces the point's new level distribution
//! directly. The M-step statistics are accumulated in the same pass.
//!
//! With the `parallel` feature points are scored by rayon workers, each with
//! its own scratch, and the per-worker statistics are merged afterwards.
//!
//! Level posteriors are kept dense (`n × L`) or, with [`LevelCollection::Sparse`],
//! trimmed to the heaviest entries inside each worker so that only `n × top`
//! pairs are ever stored.

use super::mstep::SuffStats;
use crate::config::{EmConfig, VerticalWeightMode};
use crate::correspondence::{CorrespondenceStrategy, PointContext};
use crate::data::{ClusterData, Point};
use crate::error::{Error, Result};
use crate::inference::LevelPosteriors;
use crate::model::{Model, VerticalWeights};
use crate::numeric::{
    normalize_in_place, normalize_log_in_place, top_k_indices, Diagnostics, NEGLIGIBLE_MASS,
};
use crate::scratch::{ClusterLimiter, PointScratch};
use ndarray::{s, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Item-count normalization factors `(discrete, continuous)` for `point`.
///
/// With `norm_items` every point counts as if it had as many items as the
/// largest point in `data`; otherwise both factors are one.
pub(crate) fn item_factors(data: &ClusterData, point: &Point, config: &EmConfig) -> (f64, f64) {
    if !config.norm_items {
        return (1.0, 1.0);
    }
    let dis_mass = point.discrete_mass();
    let dis = if dis_mass > 0.0 {
        data.max_num_dis_items_with_multiplicity() / dis_mass
    } else {
        1.0
    };
    let con = if point.num_continuous() > 0 {
        data.max_num_con_items() as f64 / point.num_continuous() as f64
    } else {
        1.0
    };
    (dis, con)
}

/// Seed for the RNG of one point in one iteration.
pub(crate) fn point_seed(seed: u64, iteration: usize, point: usize) -> u64 {
    // splitmix64 finalizer over a simple combination
    let mut z = seed
        .wrapping_add((iteration as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add((point as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Which per-point level posteriors a pass records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LevelCollection {
    None,
    /// Every level.
    Dense,
    /// The `n` heaviest levels, with their weights in the full distribution.
    Sparse(usize),
}

impl LevelCollection {
    fn is_some(self) -> bool {
        self != LevelCollection::None
    }
}

/// Inputs shared by every point of one pass.
pub(crate) struct Pass<'a> {
    pub model: &'a Model,
    pub data: &'a ClusterData,
    pub config: &'a EmConfig,
    pub strategy: &'a dyn CorrespondenceStrategy,
    pub limiter: Option<&'a ClusterLimiter>,
    pub iteration: usize,
    /// Sample matchings in this pass.
    pub sample: bool,
    /// Accumulate M-step statistics.
    pub accumulate: bool,
    /// Produce new per-point level distributions.
    pub update_vertical: bool,
    /// Record each point's level posterior `Σ_c q(c|p) P(l | p, c)`.
    pub levels: LevelCollection,
}

/// Everything a pass produces.
#[derive(Debug, Clone)]
pub(crate) struct PassOutput {
    /// `q(c | p)`, `[point, cluster]`.
    pub membership: Array2<f64>,
    /// Per-point log-likelihood; `None` for skipped or degenerate points.
    pub fits: Vec<Option<f64>>,
    /// M-step statistics (zero unless accumulating).
    pub stats: SuffStats,
    /// New per-point level distributions, when requested.
    pub vertical: Option<VerticalWeights>,
    /// Level posteriors over level offsets, when requested.
    pub levels: Option<LevelPosteriors>,
    pub diagnostics: Diagnostics,
}

impl PassOutput {
    /// Mean fit over points with a fit, in point order.
    pub fn average_fit(&self) -> Option<f64> {
        let (sum, n) = self
            .fits
            .iter()
            .flatten()
            .fold((0.0, 0usize), |(s, n), &f| (s + f, n + 1));
        (n > 0).then(|| sum / n as f64)
    }
}

/// Outcome for one point.
#[derive(Debug, Clone)]
struct PointResult {
    point: usize,
    membership: Vec<f64>,
    fit: Option<f64>,
    /// `L` values for `PerPoint`, `K · L` for `PerPointPerCluster`.
    vertical: Option<Vec<f64>>,
    levels: Option<PointLevels>,
}

#[derive(Debug, Clone)]
enum PointLevels {
    Dense(Vec<f64>),
    Sparse(Vec<(usize, f64)>),
}

/// The `n` heaviest `(level, weight)` pairs of a normalized row, heaviest
/// first. Weights are not renormalized over the kept entries.
pub(crate) fn heaviest_levels(row: &[f64], n: usize) -> Vec<(usize, f64)> {
    top_k_indices(row, n).into_iter().map(|l| (l, row[l])).collect()
}

/// Per-worker state.
struct Worker {
    scratch: PointScratch,
    /// `ln a[c]`.
    log_priors: Vec<f64>,
    stats: SuffStats,
    results: Vec<PointResult>,
    diagnostics: Diagnostics,
}

impl Worker {
    fn new(pass: &Pass<'_>) -> Self {
        Self {
            scratch: PointScratch::new(
                pass.model,
                pass.data.max_num_dis_items(),
                pass.data.max_num_con_items(),
                pass.config.cache_continuous,
                pass.config.max_sq_deviation,
            ),
            log_priors: pass
                .model
                .priors()
                .iter()
                .map(|a| a.max(f64::MIN_POSITIVE).ln())
                .collect(),
            stats: SuffStats::zeros(pass.model),
            results: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    fn merge(mut self, other: Worker) -> Self {
        self.stats.merge(&other.stats);
        self.results.extend(other.results);
        self.diagnostics.merge(&other.diagnostics);
        self
    }

    fn process(&mut self, pass: &Pass<'_>, p: usize) -> Result<()> {
        let model = pass.model;
        let point = pass.data.point(p);
        let k = model.num_clusters();
        let num_levels = model.topology().num_active_levels();

        let mut clusters = std::mem::take(&mut self.scratch.clusters);
        clusters.clear();
        match (point.group, pass.limiter.and_then(|l| l.clusters_for(p))) {
            (Some(g), _) => clusters.push(g),
            (None, Some(top)) => clusters.extend_from_slice(top),
            (None, None) => clusters.extend(0..k),
        }

        let missing_modality = pass.strategy.needs_both_modalities()
            && (point.num_discrete() == 0 || point.num_continuous() == 0);
        if missing_modality {
            log::warn!(
                "point {p} lacks a modality required by the {} correspondence model; skipped",
                pass.strategy.name()
            );
            self.diagnostics.skipped_points += 1;
            let membership = match point.group {
                Some(g) => one_hot(k, g),
                None => model.priors().to_vec(),
            };
            self.results.push(PointResult {
                point: p,
                membership,
                fit: None,
                vertical: None,
                levels: None,
            });
            self.scratch.clusters = clusters;
            return Ok(());
        }

        model
            .vertical()
            .fill_log_weights(p, &clusters, &mut self.scratch.log_v.view_mut());
        self.scratch.cache.fill(model, point)?;
        self.scratch
            .indicators
            .reset(&clusters, point.num_discrete(), point.num_continuous())?;

        let (dis_factor, con_factor) = item_factors(pass.data, point, pass.config);
        let ctx = PointContext {
            model,
            config: pass.config,
            point,
            clusters: &clusters,
            log_priors: &self.log_priors,
            dis_factor,
            con_factor,
            sample: pass.sample,
        };
        let mut rng = StdRng::seed_from_u64(point_seed(pass.config.seed, pass.iteration, p));
        let norm_weight = pass.strategy.score_point(&ctx, &mut self.scratch, &mut rng)?;
        self.diagnostics
            .merge(&std::mem::take(&mut self.scratch.diagnostics));
        self.scratch.indicators.verify(&clusters)?;

        let mut post: Vec<f64> = clusters
            .iter()
            .map(|&c| self.scratch.cluster_ll[c] + self.log_priors[c])
            .collect();
        let lse = normalize_log_in_place(&mut post);
        let fit = if lse.is_finite() {
            Some(lse + model.con_log_norm() * norm_weight)
        } else {
            self.diagnostics.skipped_points += 1;
            None
        };
        let mut membership = vec![0.0; k];
        for (&c, &q) in clusters.iter().zip(&post) {
            membership[c] = q;
        }

        // V-step and M-step accumulation.
        let mode = model.vertical_mode();
        let mut vertical = match (pass.update_vertical, mode) {
            (true, VerticalWeightMode::PerPoint) => Some(vec![0.0; num_levels]),
            (true, VerticalWeightMode::PerPointPerCluster) => Some(previous_rows(model, p)),
            _ => None,
        };
        let topo = model.topology();
        let first = topo.first_level();
        let mut mass = vec![0.0; num_levels];
        let mut levels = pass.levels.is_some().then(|| vec![0.0; num_levels]);
        if pass.accumulate {
            self.stats.total_weight += point.weight;
        }
        for (&c, &q) in clusters.iter().zip(&post) {
            self.scratch
                .indicators
                .level_mass(c, point, dis_factor, con_factor, &mut mass);

            if pass.accumulate {
                let wq = point.weight * q;
                if wq > 0.0 {
                    self.stats.prior[c] += wq;
                    if mode == VerticalWeightMode::Global {
                        for (lo, &m) in mass.iter().enumerate() {
                            self.stats.vertical[[lo, c]] += wq * m;
                        }
                    }
                    for lo in 0..num_levels {
                        let level = first + lo;
                        let node = topo.node(c, level);
                        for (d, item) in point.discrete.iter().enumerate() {
                            let r = self.scratch.indicators.dis(c, lo, d);
                            if r > 0.0 {
                                self.stats
                                    .add_discrete(level, node, item.category, wq * r * item.multiplicity * dis_factor);
                            }
                        }
                        for (i, item) in point.continuous.iter().enumerate() {
                            let r = self.scratch.indicators.con(c, lo, i);
                            if r > 0.0 {
                                self.stats
                                    .add_continuous(level, node, item, wq * r * item.weight * con_factor);
                            }
                        }
                    }
                }
            }

            if vertical.is_none() && levels.is_none() {
                continue;
            }
            if mass.iter().sum::<f64>() < NEGLIGIBLE_MASS {
                self.diagnostics.uniform_level_dists += 1;
            }
            normalize_in_place(&mut mass);
            if let Some(out) = levels.as_mut() {
                for (slot, &m) in out.iter_mut().zip(&mass) {
                    *slot += q * m;
                }
            }
            if let Some(rows) = vertical.as_mut() {
                match mode {
                    VerticalWeightMode::PerPoint => {
                        for (slot, &m) in rows.iter_mut().zip(&mass) {
                            *slot += q * m;
                        }
                    }
                    _ => rows[c * num_levels..(c + 1) * num_levels].copy_from_slice(&mass),
                }
            }
        }
        if let (Some(rows), VerticalWeightMode::PerPoint) = (vertical.as_mut(), mode) {
            normalize_in_place(rows);
        }
        let levels = levels.map(|mut row| {
            normalize_in_place(&mut row);
            match pass.levels {
                LevelCollection::Sparse(n) => PointLevels::Sparse(heaviest_levels(&row, n)),
                _ => PointLevels::Dense(row),
            }
        });

        self.results.push(PointResult {
            point: p,
            membership,
            fit,
            vertical,
            levels,
        });
        self.scratch.clusters = clusters;
        Ok(())
    }
}

fn one_hot(k: usize, c: usize) -> Vec<f64> {
    let mut row = vec![0.0; k];
    row[c] = 1.0;
    row
}

/// Current `[cluster, level]` rows of a per-(point, cluster) model, flattened.
fn previous_rows(model: &Model, p: usize) -> Vec<f64> {
    match model.vertical() {
        VerticalWeights::PerPointPerCluster(w) => w.slice(s![p, .., ..]).iter().copied().collect(),
        _ => Vec::new(),
    }
}

/// Score every point of `pass.data` against `pass.model`.
pub(crate) fn run_pass(pass: &Pass<'_>) -> Result<PassOutput> {
    let n = pass.data.num_points();

    #[cfg(feature = "parallel")]
    let worker = (0..n)
        .into_par_iter()
        .try_fold(
            || Worker::new(pass),
            |mut w, p| -> Result<Worker> {
                w.process(pass, p)?;
                Ok(w)
            },
        )
        .try_reduce_with(|a, b| Ok(a.merge(b)))
        .transpose()?
        .unwrap_or_else(|| Worker::new(pass));

    #[cfg(not(feature = "parallel"))]
    let worker = {
        let mut w = Worker::new(pass);
        for p in 0..n {
            w.process(pass, p)?;
        }
        w
    };

    assemble(pass, worker)
}

fn assemble(pass: &Pass<'_>, worker: Worker) -> Result<PassOutput> {
    let model = pass.model;
    let n = pass.data.num_points();
    let k = model.num_clusters();
    let num_levels = model.topology().num_active_levels();
    let mut membership = Array2::zeros((n, k));
    let mut fits = vec![None; n];
    // Skipped points keep the uniform level distribution.
    let uniform = vec![1.0 / num_levels.max(1) as f64; num_levels];
    let mut levels = match pass.levels {
        LevelCollection::None => None,
        LevelCollection::Dense => Some(LevelPosteriors::Dense(Array2::from_elem(
            (n, num_levels),
            1.0 / num_levels.max(1) as f64,
        ))),
        LevelCollection::Sparse(top) => Some(LevelPosteriors::Sparse(vec![
            heaviest_levels(&uniform, top);
            n
        ])),
    };
    let mut vertical = pass.update_vertical.then(|| match model.vertical() {
        VerticalWeights::Global(_) => None,
        other if other.num_points() == n => Some(other.clone()),
        other => Some(VerticalWeights::uniform(other.mode(), n, k, num_levels)),
    });
    for r in worker.results {
        membership.row_mut(r.point).assign(&ndarray::ArrayView1::from(&r.membership[..]));
        fits[r.point] = r.fit;
        match (levels.as_mut(), r.levels) {
            (Some(LevelPosteriors::Dense(out)), Some(PointLevels::Dense(row))) => {
                out.row_mut(r.point).assign(&ndarray::ArrayView1::from(&row[..]));
            }
            (Some(LevelPosteriors::Sparse(out)), Some(PointLevels::Sparse(row))) => {
                out[r.point] = row;
            }
            _ => {}
        }
        if let (Some(Some(v)), Some(rows)) = (vertical.as_mut(), r.vertical) {
            match v {
                VerticalWeights::PerPoint(w) => {
                    w.row_mut(r.point).assign(&ndarray::ArrayView1::from(&rows[..]));
                }
                VerticalWeights::PerPointPerCluster(w) => {
                    let block = Array2::from_shape_vec((k, num_levels), rows).map_err(|e| {
                        Error::Internal(format!("per-cluster level rows: {e}"))
                    })?;
                    w.slice_mut(s![r.point, .., ..]).assign(&block);
                }
                VerticalWeights::Global(_) => {}
            }
        }
    }
    Ok(PassOutput {
        membership,
        fits,
        stats: worker.stats,
        vertical: vertical.flatten(),
        levels,
        diagnostics: worker.diagnostics,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::CorrespondenceModel;
    use crate::correspondence::strategy_for;
    use crate::topology::Topology;

    fn two_point_data() -> ClusterData {
        ClusterData::builder(2, 1)
            .add_point(Point::new().with_discrete(0, 3.0).with_continuous(vec![-1.0]))
            .add_point(Point::new().with_discrete(1, 1.0).with_continuous(vec![1.0]).with_group(1))
            .build()
            .unwrap()
    }

    fn model(mode: VerticalWeightMode) -> Model {
        let topo = Topology::from_fan_outs(&[2], 0, 2).unwrap();
        let mut m = Model::new(&topo, 2, 1, mode, 2).unwrap();
        m.set_categorical(1, 0, &[0.8, 0.2]).unwrap();
        m.set_categorical(1, 1, &[0.2, 0.8]).unwrap();
        m.mark_ready();
        m
    }

    fn pass<'a>(
        model: &'a Model,
        data: &'a ClusterData,
        config: &'a EmConfig,
        strategy: &'a dyn CorrespondenceStrategy,
    ) -> Pass<'a> {
        Pass {
            model,
            data,
            config,
            strategy,
            limiter: None,
            iteration: 0,
            sample: false,
            accumulate: true,
            update_vertical: true,
            levels: LevelCollection::Dense,
        }
    }

    #[test]
    fn test_item_factors_scale_to_largest_point() {
        let data = two_point_data();
        let on = EmConfig::default().with_norm_items(true);
        assert_eq!(item_factors(&data, data.point(0), &on), (1.0, 1.0));
        assert_eq!(item_factors(&data, data.point(1), &on), (3.0, 1.0));
        assert_eq!(item_factors(&data, data.point(1), &EmConfig::default()), (1.0, 1.0));
    }

    #[test]
    fn test_point_seed_varies() {
        assert_ne!(point_seed(1, 0, 0), point_seed(1, 0, 1));
        assert_ne!(point_seed(1, 0, 0), point_seed(1, 1, 0));
        assert_eq!(point_seed(7, 3, 4), point_seed(7, 3, 4));
    }

    #[test]
    fn test_pass_rows_are_stochastic_and_groups_pin() {
        let data = two_point_data();
        let config = EmConfig::default();
        let strategy = strategy_for(CorrespondenceModel::Independent);
        for mode in [
            VerticalWeightMode::Global,
            VerticalWeightMode::PerPoint,
            VerticalWeightMode::PerPointPerCluster,
        ] {
            let m = model(mode);
            let out = run_pass(&pass(&m, &data, &config, strategy.as_ref())).unwrap();
            for row in out.membership.rows() {
                assert!((row.sum() - 1.0).abs() < 1e-9);
            }
            assert_eq!(out.membership[[1, 1]], 1.0);
            assert!(out.membership[[0, 0]] > out.membership[[0, 1]]);
            assert!(out.fits.iter().all(Option::is_some));
            assert!((out.stats.prior.sum() - 2.0).abs() < 1e-9);
            let Some(LevelPosteriors::Dense(levels)) = &out.levels else {
                panic!("expected dense levels");
            };
            for row in levels.rows() {
                assert!((row.sum() - 1.0).abs() < 1e-9);
            }
            match (mode, &out.vertical) {
                (VerticalWeightMode::Global, None) => {}
                (VerticalWeightMode::PerPoint, Some(VerticalWeights::PerPoint(w))) => {
                    for row in w.rows() {
                        assert!((row.sum() - 1.0).abs() < 1e-9);
                    }
                }
                (VerticalWeightMode::PerPointPerCluster, Some(VerticalWeights::PerPointPerCluster(w))) => {
                    for p in 0..2 {
                        for c in 0..2 {
                            assert!((w.slice(s![p, c, ..]).sum() - 1.0).abs() < 1e-9);
                        }
                    }
                }
                other => panic!("unexpected vertical output {other:?}"),
            }
        }
    }

    #[test]
    fn test_missing_modality_is_skipped() {
        let data = ClusterData::builder(2, 1)
            .add_point(Point::new().with_discrete(0, 1.0))
            .add_point(Point::new().with_discrete(1, 1.0).with_continuous(vec![0.5]))
            .build()
            .unwrap();
        let m = model(VerticalWeightMode::Global);
        let config = EmConfig::default();
        let strategy = strategy_for(CorrespondenceModel::Dependent);
        let out = run_pass(&pass(&m, &data, &config, strategy.as_ref())).unwrap();
        assert_eq!(out.fits[0], None);
        assert!(out.fits[1].is_some());
        assert_eq!(out.diagnostics.skipped_points, 1);
        assert!((out.stats.total_weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fit_is_unshifted_log_likelihood() {
        // One cluster, one level, one feature: fit must equal ln N(x; mean, var).
        let topo = Topology::flat(1).unwrap();
        let mut m = Model::new(&topo, 0, 1, VerticalWeightMode::Global, 1).unwrap();
        m.set_gaussian(1, 0, &[1.0], &[2.0]).unwrap();
        m.mark_ready();
        let data = ClusterData::builder(0, 1)
            .add_point(Point::new().with_continuous(vec![0.0]))
            .build()
            .unwrap();
        let config = EmConfig::default();
        let strategy = strategy_for(CorrespondenceModel::Independent);
        let out = run_pass(&pass(&m, &data, &config, strategy.as_ref())).unwrap();
        let expected = -0.5 * (2.0 * std::f64::consts::PI * 2.0).ln() - 0.25;
        assert!((out.fits[0].unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_sparse_levels_keep_heaviest_weights_of_full_row() {
        // Three active levels so that trimming to two actually drops one.
        let topo = Topology::from_fan_outs(&[2, 2], 0, 3).unwrap();
        let mut m = Model::new(&topo, 3, 0, VerticalWeightMode::PerPoint, 3).unwrap();
        m.set_categorical(1, 0, &[0.8, 0.1, 0.1]).unwrap();
        m.set_categorical(2, 0, &[0.1, 0.1, 0.8]).unwrap();
        m.set_categorical(2, 3, &[0.1, 0.8, 0.1]).unwrap();
        m.mark_ready();
        let data = ClusterData::builder(3, 0)
            .add_point(Point::new().with_discrete(0, 2.0).with_discrete(2, 1.0))
            .add_point(Point::new().with_discrete(1, 1.0))
            .add_point(Point::new().with_discrete(2, 1.0).with_discrete(1, 1.0))
            .build()
            .unwrap();
        let config = EmConfig::default();
        let strategy = strategy_for(CorrespondenceModel::Independent);

        let mut dense_pass = pass(&m, &data, &config, strategy.as_ref());
        dense_pass.accumulate = false;
        let dense = run_pass(&dense_pass).unwrap();
        let Some(LevelPosteriors::Dense(full)) = &dense.levels else {
            panic!("expected dense levels");
        };

        let sparse_pass = Pass {
            levels: LevelCollection::Sparse(2),
            ..dense_pass
        };
        let sparse = run_pass(&sparse_pass).unwrap();
        let Some(LevelPosteriors::Sparse(rows)) = &sparse.levels else {
            panic!("expected sparse levels");
        };
        assert_eq!(rows.len(), 3);
        for (p, row) in rows.iter().enumerate() {
            assert_eq!(row.len(), 2);
            assert!(row[0].1 >= row[1].1);
            let full_row = full.row(p).to_vec();
            assert_eq!(*row, heaviest_levels(&full_row, 2));
            // Kept weights are read off the full distribution, so they sum
            // to at most one.
            let kept: f64 = row.iter().map(|&(_, w)| w).sum();
            assert!(kept <= 1.0 + 1e-12);
            let dropped = (0..3).find(|l| row.iter().all(|&(k, _)| k != *l)).unwrap();
            assert!((kept + full_row[dropped] - 1.0).abs() < 1e-9);
        }
        assert_eq!(sparse.membership, dense.membership);
    }

    #[test]
    fn test_sparse_rows_for_skipped_points_are_uniform() {
        let data = ClusterData::builder(2, 1)
            .add_point(Point::new().with_discrete(0, 1.0))
            .add_point(Point::new().with_discrete(1, 1.0).with_continuous(vec![0.5]))
            .build()
            .unwrap();
        let m = model(VerticalWeightMode::Global);
        let config = EmConfig::default();
        let strategy = strategy_for(CorrespondenceModel::Dependent);
        let sparse_pass = Pass {
            levels: LevelCollection::Sparse(5),
            ..pass(&m, &data, &config, strategy.as_ref())
        };
        let out = run_pass(&sparse_pass).unwrap();
        let Some(LevelPosteriors::Sparse(rows)) = &out.levels else {
            panic!("expected sparse levels");
        };
        // Asking for more entries than levels keeps every level.
        assert_eq!(rows[0], vec![(0, 0.5), (1, 0.5)]);
        assert_eq!(rows[1].len(), 2);
        assert!((rows[1].iter().map(|&(_, w)| w).sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
