//! Inference-only scoring against a frozen model.
//!
//! Runs the E-step and V-step without any M-step. With `Global` level
//! weights one pass suffices. With per-point level weights the pass is
//! repeated, each round feeding the previous round's level distributions back
//! in, until the mean log-likelihood settles or `max_inference_iterations`
//! rounds have run:
//!
//! ```text
//! v_0(p)   = uniform
//! round t:   q_t, v_{t+1} = E/V-step(model, v_t)
//! stop when  |ll_t − ll_{t−1}| / |ll_{t−1}| < iteration_tolerance
//! ```
//!
//! Matchings are always exact here, so repeated calls on the same model and
//! data give the same answer.
//!
//! Sparse level posteriors are trimmed per point while scoring: each row keeps
//! the `n` heaviest levels with the weights they have in the full normalized
//! distribution, so a trimmed row sums to at most one.

use crate::config::{CorrespondenceModel, EmConfig, VerticalWeightMode};
use crate::correspondence::{strategy_for, CorrespondenceStrategy};
use crate::data::ClusterData;
use crate::em::estep::{run_pass, LevelCollection, Pass, PassOutput};
use crate::error::{Error, Result};
use crate::model::{InitState, Model, VerticalWeights};
use ndarray::Array2;

/// What to compute besides cluster membership.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceOptions {
    /// Correspondence model to score with.
    pub model_correspondence: CorrespondenceModel,
    /// Also return per-point level posteriors.
    pub return_levels: bool,
    /// Keep only the `n` heaviest levels per point.
    pub sparse_levels: Option<usize>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            model_correspondence: CorrespondenceModel::Independent,
            return_levels: false,
            sparse_levels: None,
        }
    }
}

impl InferenceOptions {
    /// Defaults: independent correspondence, no level posteriors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the correspondence model.
    pub fn with_model_correspondence(mut self, model: CorrespondenceModel) -> Self {
        self.model_correspondence = model;
        self
    }

    /// Return dense level posteriors.
    pub fn with_levels(mut self) -> Self {
        self.return_levels = true;
        self
    }

    /// Return only the `n` heaviest levels per point.
    pub fn with_sparse_levels(mut self, n: usize) -> Self {
        self.return_levels = true;
        self.sparse_levels = Some(n);
        self
    }
}

/// Per-point level posteriors. Levels are offsets from the first active level.
#[derive(Debug, Clone, PartialEq)]
pub enum LevelPosteriors {
    /// `[point, level]`, rows sum to one.
    Dense(Array2<f64>),
    /// `(level, weight)` pairs per point, heaviest first. Weights are those
    /// of the full distribution and are not renormalized.
    Sparse(Vec<Vec<(usize, f64)>>),
}

impl LevelPosteriors {
    /// Weight of `level` for `point`; zero when a sparse row dropped it.
    pub fn weight(&self, point: usize, level: usize) -> f64 {
        match self {
            LevelPosteriors::Dense(w) => w[[point, level]],
            LevelPosteriors::Sparse(rows) => rows[point]
                .iter()
                .find(|(l, _)| *l == level)
                .map_or(0.0, |&(_, w)| w),
        }
    }
}

/// Result of [`get_cluster_membership`].
#[derive(Debug, Clone, PartialEq)]
pub struct Membership {
    /// `P(cluster | point)`, `[point, cluster]`.
    pub membership: Array2<f64>,
    /// Level posteriors, when requested.
    pub levels: Option<LevelPosteriors>,
    /// Mean per-point log-likelihood over points with a fit.
    pub log_likelihood: f64,
    /// Per-point log-likelihood; `None` for skipped points.
    pub fit: Vec<Option<f64>>,
}

/// Score `data` against a frozen `model`.
///
/// The model is not modified. Fails if the model is not fully initialized or
/// its shape does not match the data.
pub fn get_cluster_membership(
    model: &Model,
    data: &ClusterData,
    config: &EmConfig,
    options: &InferenceOptions,
) -> Result<Membership> {
    config.validate()?;
    data.validate()?;
    if data.num_points() == 0 {
        return Err(Error::EmptyInput);
    }
    if model.state() != InitState::Ready {
        return Err(Error::InvalidParameter {
            name: "model",
            message: "must be fully initialized before scoring",
        });
    }
    model.check_data_shape(data)?;
    let strategy = strategy_for(options.model_correspondence);

    let levels = match (options.return_levels, options.sparse_levels) {
        (false, _) => LevelCollection::None,
        (true, Some(n)) => LevelCollection::Sparse(n),
        (true, None) => LevelCollection::Dense,
    };
    let out = score(model, data, config, strategy.as_ref(), levels)?;
    let log_likelihood = out.average_fit().unwrap_or(f64::NEG_INFINITY);
    log::debug!(
        "scored {} points: mean log-likelihood {log_likelihood:.6}",
        data.num_points()
    );
    Ok(Membership {
        membership: out.membership,
        levels: out.levels,
        log_likelihood,
        fit: out.fits,
    })
}

/// Mean held-out log-likelihood under `model`, for convergence decisions.
pub(crate) fn held_out_log_likelihood(
    model: &Model,
    data: &ClusterData,
    config: &EmConfig,
    correspondence: CorrespondenceModel,
) -> Result<f64> {
    let strategy = strategy_for(correspondence);
    let out = score(model, data, config, strategy.as_ref(), LevelCollection::None)?;
    Ok(out.average_fit().unwrap_or(f64::NEG_INFINITY))
}

fn score(
    model: &Model,
    data: &ClusterData,
    config: &EmConfig,
    strategy: &dyn CorrespondenceStrategy,
    levels: LevelCollection,
) -> Result<PassOutput> {
    let mode = model.vertical_mode();
    let per_point = mode != VerticalWeightMode::Global;
    let mut frozen = model.clone();
    if per_point {
        frozen.vertical = VerticalWeights::uniform(
            mode,
            data.num_points(),
            model.num_clusters(),
            model.topology().num_active_levels(),
        );
    }

    let rounds = if per_point {
        config.max_inference_iterations.max(1)
    } else {
        1
    };
    let mut previous: Option<f64> = None;
    let mut round = 0;
    loop {
        let mut out = run_pass(&Pass {
            model: &frozen,
            data,
            config,
            strategy,
            limiter: None,
            iteration: round,
            sample: false,
            accumulate: false,
            update_vertical: per_point,
            levels,
        })?;
        round += 1;
        let ll = out.average_fit();
        let settled = match (previous, ll) {
            (Some(prev), Some(cur)) if prev.is_finite() && prev != 0.0 => {
                ((cur - prev) / prev.abs()).abs() < config.iteration_tolerance
            }
            (Some(prev), Some(cur)) => prev == cur,
            _ => false,
        };
        if settled || round >= rounds {
            log::trace!("inference finished after {round} rounds");
            return Ok(out);
        }
        if let Some(v) = out.vertical.take() {
            frozen.vertical = v;
        }
        previous = ll;
    }
}
