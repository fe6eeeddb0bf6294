//! Run-scoped scratch resources.
//!
//! Every training or inference call owns its scratch; nothing is shared
//! between calls. Under the `parallel` feature each worker owns one
//! [`PointScratch`].
//!
//! - [`ContinuousProbCache`]: per (continuous item, level, node) Gaussian log
//!   densities for the point being scored, computed once and reused by every
//!   cluster that shares the node.
//! - [`LevelIndicators`]: per (cluster, level, item) responsibilities, reset
//!   to [`INDICATOR_UNSET`] before each point.
//! - [`ClusterLimiter`]: the top-K cluster index per point once cluster
//!   limiting has turned on.

use crate::data::Point;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::numeric::{top_k_indices, Diagnostics, INDICATOR_NOT_APPLICABLE, INDICATOR_UNSET};
use ndarray::{Array2, Array3};

/// Gaussian log densities for one point's continuous items.
#[derive(Debug, Clone)]
pub struct ContinuousProbCache {
    enabled: bool,
    /// `[item, level offset, node]`.
    values: Array3<f64>,
    max_sq_deviation: f64,
}

impl ContinuousProbCache {
    /// Cache sized for `max_items` items of `model`.
    pub fn new(model: &Model, max_items: usize, enabled: bool, max_sq_deviation: f64) -> Self {
        let topo = model.topology();
        let max_nodes = topo.levels().map(|l| topo.level_count(l)).max().unwrap_or(0);
        let shape = if enabled && model.num_features() > 0 {
            (max_items, topo.num_active_levels(), max_nodes)
        } else {
            (0, 0, 0)
        };
        Self {
            enabled: enabled && model.num_features() > 0,
            values: Array3::zeros(shape),
            max_sq_deviation,
        }
    }

    /// Whether densities are precomputed.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Compute every (item, level, node) density for `point`.
    pub fn fill(&mut self, model: &Model, point: &Point) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if point.num_continuous() > self.values.dim().0 {
            return Err(Error::Internal(format!(
                "continuous cache holds {} items, point has {}",
                self.values.dim().0,
                point.num_continuous()
            )));
        }
        let topo = model.topology();
        for (i, item) in point.continuous.iter().enumerate() {
            for level in topo.levels() {
                let lo = level - topo.first_level();
                for node in 0..topo.level_count(level) {
                    self.values[[i, lo, node]] =
                        model.gaussian_ln(level, node, item, self.max_sq_deviation);
                }
            }
        }
        Ok(())
    }

    /// Shifted log density of item `i` of `point` under (`level`, `node`).
    #[inline]
    pub fn log_density(&self, model: &Model, point: &Point, i: usize, level: usize, node: usize) -> f64 {
        if self.enabled {
            let lo = level - model.topology().first_level();
            self.values[[i, lo, node]]
        } else {
            model.gaussian_ln(level, node, &point.continuous[i], self.max_sq_deviation)
        }
    }
}

/// Per (cluster, level, item) responsibilities for the point being scored.
#[derive(Debug, Clone)]
pub struct LevelIndicators {
    /// `[cluster, level offset, discrete item]`.
    dis: Array3<f64>,
    /// `[cluster, level offset, continuous item]`.
    con: Array3<f64>,
    num_dis: usize,
    num_con: usize,
}

impl LevelIndicators {
    /// Indicators for `num_clusters` clusters, `num_levels` active levels and
    /// up to the given item counts.
    pub fn new(num_clusters: usize, num_levels: usize, max_dis: usize, max_con: usize) -> Self {
        Self {
            dis: Array3::from_elem((num_clusters, num_levels, max_dis), INDICATOR_UNSET),
            con: Array3::from_elem((num_clusters, num_levels, max_con), INDICATOR_UNSET),
            num_dis: 0,
            num_con: 0,
        }
    }

    /// Mark every cell the point will use, for the listed clusters, as unset.
    pub fn reset(&mut self, clusters: &[usize], num_dis: usize, num_con: usize) -> Result<()> {
        if num_dis > self.dis.dim().2 || num_con > self.con.dim().2 {
            return Err(Error::Internal(format!(
                "indicator scratch sized for {}/{} items, point has {num_dis}/{num_con}",
                self.dis.dim().2,
                self.con.dim().2
            )));
        }
        self.num_dis = num_dis;
        self.num_con = num_con;
        for &c in clusters {
            self.dis
                .slice_mut(ndarray::s![c, .., ..num_dis])
                .fill(INDICATOR_UNSET);
            self.con
                .slice_mut(ndarray::s![c, .., ..num_con])
                .fill(INDICATOR_UNSET);
        }
        Ok(())
    }

    /// Discrete indicator.
    #[inline]
    pub fn dis(&self, cluster: usize, level: usize, item: usize) -> f64 {
        self.dis[[cluster, level, item]]
    }

    /// Continuous indicator.
    #[inline]
    pub fn con(&self, cluster: usize, level: usize, item: usize) -> f64 {
        self.con[[cluster, level, item]]
    }

    /// Set a discrete indicator.
    #[inline]
    pub fn set_dis(&mut self, cluster: usize, level: usize, item: usize, value: f64) {
        self.dis[[cluster, level, item]] = value;
    }

    /// Set a continuous indicator.
    #[inline]
    pub fn set_con(&mut self, cluster: usize, level: usize, item: usize, value: f64) {
        self.con[[cluster, level, item]] = value;
    }

    /// Mark a discrete item as unmatched at every level of `cluster`.
    pub fn mark_dis_not_applicable(&mut self, cluster: usize, item: usize) {
        self.dis
            .slice_mut(ndarray::s![cluster, .., item])
            .fill(INDICATOR_NOT_APPLICABLE);
    }

    /// Mark a continuous item as unmatched at every level of `cluster`.
    pub fn mark_con_not_applicable(&mut self, cluster: usize, item: usize) {
        self.con
            .slice_mut(ndarray::s![cluster, .., item])
            .fill(INDICATOR_NOT_APPLICABLE);
    }

    /// Fail if any cell the point uses is still unset.
    pub fn verify(&self, clusters: &[usize]) -> Result<()> {
        for &c in clusters {
            let dis = self.dis.slice(ndarray::s![c, .., ..self.num_dis]);
            let con = self.con.slice(ndarray::s![c, .., ..self.num_con]);
            if dis.iter().chain(con.iter()).any(|&v| v == INDICATOR_UNSET) {
                return Err(Error::Internal(format!(
                    "level indicator for cluster {c} was never written"
                )));
            }
        }
        Ok(())
    }

    /// Responsibility mass per level for `cluster`, with items weighted by
    /// multiplicity (discrete) or weight (continuous) and the item factors.
    pub fn level_mass(
        &self,
        cluster: usize,
        point: &Point,
        dis_factor: f64,
        con_factor: f64,
        out: &mut [f64],
    ) {
        for (l, slot) in out.iter_mut().enumerate() {
            let mut mass = 0.0;
            for (d, item) in point.discrete.iter().enumerate() {
                let r = self.dis[[cluster, l, d]];
                if r >= 0.0 {
                    mass += r * item.multiplicity * dis_factor;
                }
            }
            for (i, item) in point.continuous.iter().enumerate() {
                let r = self.con[[cluster, l, i]];
                if r >= 0.0 {
                    mass += r * item.weight * con_factor;
                }
            }
            *slot = mass;
        }
    }
}

/// Top-K cluster index per point, once limiting is on.
#[derive(Debug, Clone, Default)]
pub struct ClusterLimiter {
    k: Option<usize>,
    active: bool,
    top: Vec<Vec<usize>>,
}

impl ClusterLimiter {
    /// Limiter for `k` clusters per point; `None` never limits.
    pub fn new(k: Option<usize>) -> Self {
        Self {
            k,
            active: false,
            top: Vec::new(),
        }
    }

    /// Whether limiting is on.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Clusters to score for `point`, if limiting is on.
    pub fn clusters_for(&self, point: usize) -> Option<&[usize]> {
        if self.active {
            self.top.get(point).map(Vec::as_slice)
        } else {
            None
        }
    }

    /// Average membership mass outside each point's top K clusters.
    pub fn truncation_error(&self, membership: &Array2<f64>) -> Option<f64> {
        let k = self.k?;
        if membership.nrows() == 0 {
            return None;
        }
        let total: f64 = membership
            .rows()
            .into_iter()
            .map(|row| {
                let row = row.to_vec();
                let kept: f64 = top_k_indices(&row, k).iter().map(|&c| row[c]).sum();
                (1.0 - kept).max(0.0)
            })
            .sum();
        Some(total / membership.nrows() as f64)
    }

    /// Turn limiting on when the average truncation error drops below
    /// `threshold`. Once on it stays on. Returns whether it switched now.
    pub fn maybe_activate(&mut self, membership: &Array2<f64>, threshold: f64) -> bool {
        if self.active {
            return false;
        }
        let (Some(k), Some(err)) = (self.k, self.truncation_error(membership)) else {
            return false;
        };
        if err >= threshold || k >= membership.ncols() {
            return false;
        }
        self.top = membership
            .rows()
            .into_iter()
            .map(|row| {
                let mut top = top_k_indices(&row.to_vec(), k);
                top.sort_unstable();
                top
            })
            .collect();
        self.active = true;
        log::info!("cluster limiting on: {k} clusters per point (average truncation {err:.3e})");
        true
    }
}

/// Everything one worker needs to score points.
#[derive(Debug, Clone)]
pub struct PointScratch {
    /// Gaussian density cache.
    pub cache: ContinuousProbCache,
    /// Level indicators.
    pub indicators: LevelIndicators,
    /// `ln` level weights, `[cluster, level offset]`.
    pub log_v: Array2<f64>,
    /// Per-cluster log-likelihood of the current point.
    pub cluster_ll: Vec<f64>,
    /// Per-level buffer.
    pub levels: Vec<f64>,
    /// Second per-level buffer.
    pub aux: Vec<f64>,
    /// Cluster list buffer.
    pub clusters: Vec<usize>,
    /// Repairs made while scoring; drained by the pass after each point.
    pub diagnostics: Diagnostics,
}

impl PointScratch {
    /// Scratch for scoring points with at most the given item counts.
    pub fn new(model: &Model, max_dis: usize, max_con: usize, cache_continuous: bool, max_sq_deviation: f64) -> Self {
        let k = model.num_clusters();
        let num_levels = model.topology().num_active_levels();
        Self {
            cache: ContinuousProbCache::new(model, max_con, cache_continuous, max_sq_deviation),
            indicators: LevelIndicators::new(k, num_levels, max_dis, max_con),
            log_v: Array2::zeros((k, num_levels)),
            cluster_ll: vec![0.0; k],
            levels: vec![0.0; num_levels],
            aux: vec![0.0; num_levels],
            clusters: Vec::with_capacity(k),
            diagnostics: Diagnostics::default(),
        }
    }
}
