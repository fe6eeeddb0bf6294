//! M-step: sufficient statistics and parameter re-estimation.
//!
//! ```text
//! a[c]            = Σₚ wₚ q(c|p) / Σₚ wₚ
//! cat[l][n][w]    = max(δ, count_w / λ), λ chosen so the row sums to 1
//! mean[l][n][f]   = Σ r x_f / Σ r
//! var[l][n][f]    = max(Σ r x_f² / Σ r − mean², floor(iteration))
//! V[l][c]         ∝ Σₚ wₚ q(c|p) Σ_items r(l | item, c, p)
//! ```
//!
//! Both floors are lower bounds on the maximization rather than offsets
//! added afterwards, so every update maximizes the expected complete-data
//! log-likelihood over the floored parameter set and the training
//! log-likelihood cannot decrease. `δ` is `MIN_DIS_PROB_FOR_OFFSET /
//! (num_categories · (1 + MIN_DIS_PROB_FOR_OFFSET))`, the value an unseen
//! category gets.
//!
//! With MAP priors the cluster priors get `alpha` pseudo-counts, categorical
//! rows get `beta_minus_one` pseudo-counts, and Gaussians are pulled toward
//! the data mean with strength `kappa`, prior sum of squares `delta`, and
//! `r_minus_n_g` extra degrees of freedom.

use super::estep::item_factors;
use crate::config::EmConfig;
use crate::data::{ClusterData, ContinuousItem};
use crate::error::{Error, Result};
use crate::model::{Model, VerticalWeights};
use crate::numeric::{floor_prob, Diagnostics, MIN_DIS_PROB_FOR_OFFSET, NEGLIGIBLE_MASS, PROB_FLOOR};
use ndarray::{Array1, Array2};

/// Accumulated responsibilities for one M-step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SuffStats {
    /// Σ wₚ q(c|p), per cluster.
    pub prior: Array1<f64>,
    /// Σ wₚ over contributing points.
    pub total_weight: f64,
    /// Weighted category counts, per absolute level: `[node, category]`.
    pub categorical: Vec<Array2<f64>>,
    /// Per-feature responsibility mass, per absolute level: `[node, feature]`.
    pub gauss_mass: Vec<Array2<f64>>,
    /// Σ r x, per absolute level.
    pub gauss_s1: Vec<Array2<f64>>,
    /// Σ r x², per absolute level.
    pub gauss_s2: Vec<Array2<f64>>,
    /// `Global` vertical accumulator, `[level offset, cluster]`.
    pub vertical: Array2<f64>,
}

impl SuffStats {
    /// Zeroed statistics shaped like `model`.
    pub fn zeros(model: &Model) -> Self {
        let topo = model.topology();
        let per_level = |width: usize| -> Vec<Array2<f64>> {
            (0..topo.num_levels())
                .map(|l| Array2::zeros((topo.level_count(l), width)))
                .collect()
        };
        Self {
            prior: Array1::zeros(model.num_clusters()),
            total_weight: 0.0,
            categorical: per_level(model.num_categories()),
            gauss_mass: per_level(model.num_features()),
            gauss_s1: per_level(model.num_features()),
            gauss_s2: per_level(model.num_features()),
            vertical: Array2::zeros((topo.num_active_levels(), model.num_clusters())),
        }
    }

    /// Add another partial sum into this one.
    pub fn merge(&mut self, other: &SuffStats) {
        self.prior += &other.prior;
        self.total_weight += other.total_weight;
        for (a, b) in self.categorical.iter_mut().zip(&other.categorical) {
            *a += b;
        }
        for (a, b) in self.gauss_mass.iter_mut().zip(&other.gauss_mass) {
            *a += b;
        }
        for (a, b) in self.gauss_s1.iter_mut().zip(&other.gauss_s1) {
            *a += b;
        }
        for (a, b) in self.gauss_s2.iter_mut().zip(&other.gauss_s2) {
            *a += b;
        }
        self.vertical += &other.vertical;
    }

    #[inline]
    pub fn add_discrete(&mut self, level: usize, node: usize, category: usize, weight: f64) {
        self.categorical[level][[node, category]] += weight;
    }

    #[inline]
    pub fn add_continuous(&mut self, level: usize, node: usize, item: &ContinuousItem, weight: f64) {
        for (f, &x) in item.features.iter().enumerate() {
            if item.is_present(f) {
                self.gauss_mass[level][[node, f]] += weight;
                self.gauss_s1[level][[node, f]] += weight * x;
                self.gauss_s2[level][[node, f]] += weight * x * x;
            }
        }
    }
}

/// Statistics from a fixed membership and a `[level, cluster]` table of level
/// weights, with every item credited to every level of its cluster's path.
pub(crate) fn accumulate_prior_indicators(
    model: &Model,
    data: &ClusterData,
    config: &EmConfig,
    membership: &Array2<f64>,
    level_table: &Array2<f64>,
) -> Result<SuffStats> {
    let topo = model.topology();
    if membership.dim() != (data.num_points(), model.num_clusters()) {
        return Err(Error::ShapeMismatch {
            expected: format!("{}x{} membership", data.num_points(), model.num_clusters()),
            actual: format!("{}x{}", membership.nrows(), membership.ncols()),
        });
    }
    if level_table.dim() != (topo.num_active_levels(), model.num_clusters()) {
        return Err(Error::ShapeMismatch {
            expected: format!("{}x{} level table", topo.num_active_levels(), model.num_clusters()),
            actual: format!("{}x{}", level_table.nrows(), level_table.ncols()),
        });
    }
    let mut stats = SuffStats::zeros(model);
    for (p, point) in data.points().iter().enumerate() {
        let (dis_factor, con_factor) = item_factors(data, point, config);
        stats.total_weight += point.weight;
        for c in 0..model.num_clusters() {
            let q = point.weight * membership[[p, c]];
            if q <= 0.0 {
                continue;
            }
            stats.prior[c] += q;
            for level in topo.levels() {
                let lo = level - topo.first_level();
                let r = q * level_table[[lo, c]];
                let node = topo.node(c, level);
                for item in &point.discrete {
                    stats.add_discrete(level, node, item.category, r * item.multiplicity * dis_factor);
                }
                for item in &point.continuous {
                    stats.add_continuous(level, node, item, r * item.weight * con_factor);
                }
                stats.vertical[[lo, c]] += r;
            }
        }
    }
    Ok(stats)
}

/// Re-estimate every parameter of `model` from `stats`.
///
/// Degenerate cases are repaired in place and counted in the returned
/// diagnostics. `log_sqrt_det` and `con_log_norm` are refreshed at the end.
pub(crate) fn apply_m_step(
    model: &mut Model,
    stats: &SuffStats,
    config: &EmConfig,
    iteration: usize,
    data_mean: &[f64],
) -> Diagnostics {
    let mut diag = Diagnostics::default();
    update_priors(model, stats, config, &mut diag);
    update_categoricals(model, stats, config, &mut diag);
    update_gaussians(model, stats, config, iteration, data_mean, &mut diag);
    update_global_vertical(model, stats, &mut diag);
    model.refresh_normalizers();
    diag
}

fn update_priors(model: &mut Model, stats: &SuffStats, config: &EmConfig, diag: &mut Diagnostics) {
    let k = model.num_clusters() as f64;
    let total = stats.total_weight;
    let alpha = config.map.map_or(0.0, |m| m.alpha);
    if total + k * alpha < NEGLIGIBLE_MASS {
        diag.empty_clusters += model.num_clusters();
        return;
    }
    let mut sum = 0.0;
    for (slot, &n_c) in model.priors.iter_mut().zip(stats.prior.iter()) {
        if n_c < NEGLIGIBLE_MASS {
            diag.empty_clusters += 1;
        }
        *slot = floor_prob((n_c + alpha) / (total + k * alpha), diag);
        sum += *slot;
    }
    model.priors.mapv_inplace(|a| a / sum);
}

fn update_categoricals(model: &mut Model, stats: &SuffStats, config: &EmConfig, diag: &mut Diagnostics) {
    let ncat = model.num_categories;
    if ncat == 0 {
        return;
    }
    let beta = config.map.map_or(0.0, |m| m.beta_minus_one);
    let lower = MIN_DIS_PROB_FOR_OFFSET / (ncat as f64 * (1.0 + MIN_DIS_PROB_FOR_OFFSET));
    let mut clamped = vec![false; ncat];
    for level in model.topology.levels() {
        let counts = &stats.categorical[level];
        let nodes = &mut model.levels[level];
        for node in 0..nodes.num_nodes() {
            let row = counts.row(node);
            let total = row.sum() + beta * ncat as f64;
            let mut out = nodes.categorical.row_mut(node);
            if total < NEGLIGIBLE_MASS {
                out.fill(1.0 / ncat as f64);
                diag.uniform_nodes += 1;
                continue;
            }
            let scale = floored_scale(row.iter().map(|&c| c + beta), lower, &mut clamped);
            for ((slot, &count), &low) in out.iter_mut().zip(row.iter()).zip(clamped.iter()) {
                *slot = if low { lower } else { (count + beta) / scale };
            }
        }
    }
}

/// Normalizer `λ` of `θ_w = max(lower, c_w / λ)` with `Σ θ_w = 1`.
///
/// Marks in `clamped` the categories held at `lower`. The clamped set only
/// grows, so this takes at most one pass per category.
fn floored_scale(counts: impl Iterator<Item = f64> + Clone, lower: f64, clamped: &mut [bool]) -> f64 {
    clamped.fill(false);
    loop {
        let (mut free_mass, mut held) = (0.0, 0usize);
        for (c, &low) in counts.clone().zip(clamped.iter()) {
            if low {
                held += 1;
            } else {
                free_mass += c;
            }
        }
        let scale = free_mass / (1.0 - lower * held as f64);
        let mut grew = false;
        for (c, low) in counts.clone().zip(clamped.iter_mut()) {
            if !*low && c < lower * scale {
                *low = true;
                grew = true;
            }
        }
        if !grew {
            return scale;
        }
    }
}

fn update_gaussians(
    model: &mut Model,
    stats: &SuffStats,
    config: &EmConfig,
    iteration: usize,
    data_mean: &[f64],
    diag: &mut Diagnostics,
) {
    let nfeat = model.num_features;
    if nfeat == 0 {
        return;
    }
    let floor = config.var_floor(iteration);
    for level in model.topology.levels() {
        let nodes = &mut model.levels[level];
        for node in 0..nodes.num_nodes() {
            let mut empty = false;
            for f in 0..nfeat {
                let n = stats.gauss_mass[level][[node, f]];
                if n < NEGLIGIBLE_MASS {
                    nodes.var[[node, f]] = floor;
                    empty = true;
                    continue;
                }
                let s1 = stats.gauss_s1[level][[node, f]];
                let s2 = stats.gauss_s2[level][[node, f]];
                let mean_ml = s1 / n;
                let mut ss = s2 - s1 * mean_ml;
                if ss < 0.0 {
                    diag.negative_variances += 1;
                    ss = 0.0;
                }
                let (mean, var) = match &config.map {
                    Some(map) => {
                        let mu0 = data_mean.get(f).copied().unwrap_or(0.0);
                        let mean = (s1 + map.kappa * mu0) / (n + map.kappa);
                        let shrink = map.kappa * n / (n + map.kappa);
                        let d = mean_ml - mu0;
                        let var = (ss + shrink * d * d + map.delta) / (n + map.r_minus_n_g);
                        (mean, var)
                    }
                    None => (mean_ml, ss / n),
                };
                nodes.mean[[node, f]] = mean;
                nodes.var[[node, f]] = var.max(floor);
            }
            if empty {
                diag.empty_gaussian_nodes += 1;
            }
        }
    }
}

fn update_global_vertical(model: &mut Model, stats: &SuffStats, diag: &mut Diagnostics) {
    let VerticalWeights::Global(v) = &mut model.vertical else {
        return;
    };
    for c in 0..v.ncols() {
        let col = stats.vertical.column(c);
        let total = col.sum();
        if total < NEGLIGIBLE_MASS {
            diag.uniform_level_dists += 1;
            continue;
        }
        let mut sum = 0.0;
        for (l, &m) in col.iter().enumerate() {
            let w = (m / total).max(PROB_FLOOR);
            v[[l, c]] = w;
            sum += w;
        }
        for l in 0..v.nrows() {
            v[[l, c]] /= sum;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{MapPriors, VerticalWeightMode};
    use crate::data::Point;
    use crate::topology::Topology;

    fn flat_model(k: usize, ncat: usize, nfeat: usize) -> Model {
        let topo = Topology::flat(k).unwrap();
        Model::new(&topo, ncat, nfeat, VerticalWeightMode::Global, 0).unwrap()
    }

    #[test]
    fn test_zero_mass_node_is_repaired() {
        let mut model = flat_model(2, 3, 2);
        let mut stats = SuffStats::zeros(&model);
        stats.total_weight = 1.0;
        stats.prior[0] = 1.0;
        stats.add_discrete(1, 0, 1, 1.0);
        stats.add_continuous(1, 0, &ContinuousItem::new(vec![1.0, 2.0]), 1.0);
        let cfg = EmConfig::new().with_var_offset(0.05);
        let diag = apply_m_step(&mut model, &stats, &cfg, 3, &[0.0, 0.0]);

        let row = model.level(1).categorical.row(1).to_owned();
        assert!(row.iter().all(|&p| (p - 1.0 / 3.0).abs() < 1e-12));
        for f in 0..2 {
            assert_eq!(model.level(1).var[[1, f]], 0.05);
            assert!(model.level(1).mean[[1, f]].is_finite());
        }
        assert_eq!(diag.uniform_nodes, 1);
        assert_eq!(diag.empty_gaussian_nodes, 1);
        assert!(model.priors()[1] > 0.0);
        assert!((model.priors().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_item_fit_is_exact() {
        let mut model = flat_model(1, 0, 3);
        let mut stats = SuffStats::zeros(&model);
        stats.total_weight = 1.0;
        stats.prior[0] = 1.0;
        let x = vec![0.5, -2.0, 7.25];
        stats.add_continuous(1, 0, &ContinuousItem::new(x.clone()), 1.0);
        let cfg = EmConfig::new().with_var_offset(0.01);
        apply_m_step(&mut model, &stats, &cfg, 0, &[0.0; 3]);
        for f in 0..3 {
            assert_eq!(model.level(1).mean[[0, f]], x[f]);
            assert!((model.level(1).var[[0, f]] - 0.01).abs() < 1e-12);
        }
    }

    #[test]
    fn test_categorical_offset_keeps_unseen_positive() {
        let mut model = flat_model(1, 4, 0);
        let mut stats = SuffStats::zeros(&model);
        stats.total_weight = 1.0;
        stats.prior[0] = 1.0;
        stats.add_discrete(1, 0, 2, 5.0);
        apply_m_step(&mut model, &stats, &EmConfig::new(), 0, &[]);
        let row = model.level(1).categorical.row(0).to_owned();
        assert!((row.sum() - 1.0).abs() < 1e-12);
        assert!(row[0] > 0.0 && row[0] < 1e-6);
        assert!(row[2] > 0.999);
    }

    #[test]
    fn test_small_counts_are_held_at_floor() {
        let mut model = flat_model(1, 4, 0);
        let mut stats = SuffStats::zeros(&model);
        stats.total_weight = 1.0;
        stats.prior[0] = 1.0;
        stats.add_discrete(1, 0, 0, 1e-9);
        stats.add_discrete(1, 0, 1, 1.0);
        stats.add_discrete(1, 0, 2, 3.0);
        apply_m_step(&mut model, &stats, &EmConfig::new(), 0, &[]);
        let row = model.level(1).categorical.row(0).to_owned();
        let lower = MIN_DIS_PROB_FOR_OFFSET / (4.0 * (1.0 + MIN_DIS_PROB_FOR_OFFSET));
        assert_eq!(row[0], lower);
        assert_eq!(row[3], lower);
        assert!((row[2] / row[1] - 3.0).abs() < 1e-12);
        assert!((row.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_variance_above_floor_is_unchanged() {
        let mut model = flat_model(1, 0, 1);
        let mut stats = SuffStats::zeros(&model);
        stats.total_weight = 2.0;
        stats.prior[0] = 2.0;
        stats.add_continuous(1, 0, &ContinuousItem::new(vec![0.0]), 1.0);
        stats.add_continuous(1, 0, &ContinuousItem::new(vec![2.0]), 1.0);
        apply_m_step(&mut model, &stats, &EmConfig::new().with_var_offset(0.01), 0, &[0.0]);
        assert!((model.level(1).var[[0, 0]] - 1.0).abs() < 1e-12);
        assert_eq!(model.level(1).mean[[0, 0]], 1.0);
    }

    #[test]
    fn test_missing_features_excluded() {
        let mut model = flat_model(1, 0, 2);
        let mut stats = SuffStats::zeros(&model);
        stats.total_weight = 2.0;
        stats.prior[0] = 2.0;
        stats.add_continuous(1, 0, &ContinuousItem::new(vec![1.0, 1.0]), 1.0);
        stats.add_continuous(
            1,
            0,
            &ContinuousItem::with_missing(vec![3.0, 1e9], vec![false, true]),
            1.0,
        );
        apply_m_step(&mut model, &stats, &EmConfig::new(), 0, &[0.0, 0.0]);
        assert!((model.level(1).mean[[0, 0]] - 2.0).abs() < 1e-12);
        assert!((model.level(1).mean[[0, 1]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_map_priors_smooth() {
        let mut model = flat_model(2, 2, 1);
        let mut stats = SuffStats::zeros(&model);
        stats.total_weight = 1.0;
        stats.prior[0] = 1.0;
        stats.add_discrete(1, 0, 0, 1.0);
        stats.add_continuous(1, 0, &ContinuousItem::new(vec![4.0]), 1.0);
        let map = MapPriors {
            alpha: 1.0,
            beta_minus_one: 1.0,
            kappa: 1.0,
            delta: 0.0,
            r_minus_n_g: 0.0,
        };
        let cfg = EmConfig::new().with_map(map);
        apply_m_step(&mut model, &stats, &cfg, 0, &[0.0]);
        assert!((model.priors()[0] - 2.0 / 3.0).abs() < 1e-12);
        // (1 + 1) / (1 + 2) before the tiny offset.
        assert!((model.level(1).categorical[[0, 0]] - 2.0 / 3.0).abs() < 1e-5);
        assert!((model.level(1).mean[[0, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_prior_indicator_accumulation() {
        let topo = Topology::from_fan_outs(&[2], 0, 2).unwrap();
        let model = Model::new(&topo, 2, 0, VerticalWeightMode::Global, 2).unwrap();
        let data = ClusterData::builder(2, 0)
            .add_point(Point::new().with_discrete(0, 2.0))
            .add_point(Point::new().with_discrete(1, 1.0))
            .build()
            .unwrap();
        let membership = ndarray::array![[1.0, 0.0], [0.0, 1.0]];
        let table = ndarray::array![[0.25, 0.5], [0.75, 0.5]];
        let stats =
            accumulate_prior_indicators(&model, &data, &EmConfig::new(), &membership, &table).unwrap();
        // Root node is shared by both clusters.
        assert!((stats.categorical[0][[0, 0]] - 0.5).abs() < 1e-12);
        assert!((stats.categorical[0][[0, 1]] - 0.5).abs() < 1e-12);
        assert!((stats.categorical[1][[0, 0]] - 1.5).abs() < 1e-12);
        assert!((stats.categorical[1][[1, 1]] - 0.5).abs() < 1e-12);
        assert_eq!(stats.prior.to_vec(), vec![1.0, 1.0]);
    }
}
