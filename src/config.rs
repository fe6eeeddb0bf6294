//! Run configuration: numeric tunables and training options.
//!
//! Both structs are plain values, built once with `with_*` methods and then
//! passed by reference into every E, V and M routine. Nothing is read from
//! global state during a run.

use crate::error::{Error, Result};

/// Iteration cap for the inference-only loop.
pub const MAX_INFERENCE_ITERATIONS: usize = 20;

/// When training stops, and which model is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceCriterion {
    /// Stop as soon as held-out log-likelihood turns from rising to falling,
    /// keeping the model at the peak. Also stops when either the training or
    /// the held-out score levels off within the iteration tolerance.
    FirstHeldOutMax,
    /// Run to convergence; keep the model with the best held-out score.
    MaxHeldOutLl,
    /// Run to convergence; keep the model with the best training plus
    /// held-out score.
    MaxCombinedLl,
    /// Run to convergence; keep the model with the best training score.
    MaxDataLl,
    /// Exactly three iterations.
    ThreeIterations,
    /// Exactly one iteration.
    SingleIteration,
}

impl ConvergenceCriterion {
    /// Short name used in messages.
    pub fn name(self) -> &'static str {
        match self {
            ConvergenceCriterion::FirstHeldOutMax => "first-held-out-max",
            ConvergenceCriterion::MaxHeldOutLl => "max-held-out-ll",
            ConvergenceCriterion::MaxCombinedLl => "max-combined-ll",
            ConvergenceCriterion::MaxDataLl => "max-data-ll",
            ConvergenceCriterion::ThreeIterations => "three-iterations",
            ConvergenceCriterion::SingleIteration => "single-iteration",
        }
    }

    /// Whether held-out data must be supplied.
    pub fn needs_held_out(self) -> bool {
        matches!(
            self,
            ConvergenceCriterion::FirstHeldOutMax
                | ConvergenceCriterion::MaxHeldOutLl
                | ConvergenceCriterion::MaxCombinedLl
        )
    }

    /// Fixed iteration count, if the criterion prescribes one.
    pub fn fixed_iterations(self) -> Option<usize> {
        match self {
            ConvergenceCriterion::ThreeIterations => Some(3),
            ConvergenceCriterion::SingleIteration => Some(1),
            _ => None,
        }
    }
}

/// How discrete and continuous items of a point relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrespondenceModel {
    /// Model 0: items are emitted independently.
    Independent,
    /// Model 1: discrete items take their level weights from the continuous
    /// items' level posteriors.
    Dependent,
    /// Model 2: explicit bipartite matching between discrete and continuous
    /// items. With `share_matches` one matching is computed per point and
    /// reused by every cluster; otherwise each cluster matches on its own.
    Matched {
        /// Reuse one matching across clusters.
        share_matches: bool,
    },
    /// Model 3: a per-point level prior, marginalized over all
    /// discrete×continuous pairs, reweights independent item scores.
    LevelPrior,
    /// Model 5: hard assignment of matched pairs to blocks of tied levels.
    Block,
}

impl CorrespondenceModel {
    /// Map a numeric correspondence code onto a model.
    pub fn from_code(code: u8, share_matches: bool) -> Result<Self> {
        match code {
            0 => Ok(CorrespondenceModel::Independent),
            1 => Ok(CorrespondenceModel::Dependent),
            2 => Ok(CorrespondenceModel::Matched { share_matches }),
            3 => Ok(CorrespondenceModel::LevelPrior),
            5 => Ok(CorrespondenceModel::Block),
            _ => Err(Error::InvalidParameter {
                name: "model_correspondence",
                message: "must be one of 0, 1, 2, 3, 5",
            }),
        }
    }

    /// Numeric code.
    pub fn code(self) -> u8 {
        match self {
            CorrespondenceModel::Independent => 0,
            CorrespondenceModel::Dependent => 1,
            CorrespondenceModel::Matched { .. } => 2,
            CorrespondenceModel::LevelPrior => 3,
            CorrespondenceModel::Block => 5,
        }
    }

    /// Whether every point must carry both modalities.
    pub fn needs_both_modalities(self) -> bool {
        !matches!(self, CorrespondenceModel::Independent)
    }
}

/// Representation of the vertical (level) weights, fixed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalWeightMode {
    /// One level distribution per cluster, shared by all points.
    Global,
    /// One level distribution per point, shared by its clusters.
    PerPoint,
    /// One level distribution per (point, cluster).
    PerPointPerCluster,
}

/// Pseudo-count priors for MAP smoothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapPriors {
    /// Dirichlet pseudo-count added to every cluster prior.
    pub alpha: f64,
    /// Dirichlet pseudo-count (beta − 1) added to every category count.
    pub beta_minus_one: f64,
    /// Prior strength pulling Gaussian means toward the data mean.
    pub kappa: f64,
    /// Prior sum of squares added to Gaussian variances.
    pub delta: f64,
    /// Extra prior degrees of freedom in the variance denominator.
    pub r_minus_n_g: f64,
}

impl Default for MapPriors {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta_minus_one: 0.01,
            kappa: 0.01,
            delta: 0.01,
            r_minus_n_g: 1.0,
        }
    }
}

/// Numeric tunables for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct EmConfig {
    /// Seed for initialization and match sampling.
    pub seed: u64,
    /// Exponent applied to discrete item probabilities.
    pub dis_prob_boost_factor: f64,
    /// Exponent applied to continuous item densities.
    pub con_prob_boost_factor: f64,
    /// Rescale each point's item counts to the largest point's counts.
    pub norm_items: bool,
    /// Variance floor added after every M-step.
    pub var_offset: f64,
    /// Secondary variance floor, decayed geometrically per iteration.
    pub var_offset_2: f64,
    /// Per-iteration decay factor of `var_offset_2`.
    pub var_offset_2_decay: f64,
    /// Maximum number of EM iterations.
    pub max_iterations: usize,
    /// Minimum number of EM iterations before convergence may be declared.
    pub min_iterations: usize,
    /// Relative log-likelihood change that counts as converged.
    pub iteration_tolerance: f64,
    /// MAP smoothing; `None` for maximum likelihood.
    pub map: Option<MapPriors>,
    /// Number of consecutive levels tied into one block (model 5).
    pub discrete_tie_count: usize,
    /// Clamp on each feature's squared normalized deviation.
    pub max_sq_deviation: f64,
    /// Average truncated mass below which cluster limiting turns on.
    pub max_ave_limited_cluster_error: f64,
    /// Iterations before per-point vertical weights start being re-estimated.
    pub vertical_warmup_iterations: usize,
    /// Model 1: aggregate continuous-item level posteriors by max, not sum.
    pub dependent_max: bool,
    /// Model 2: forced null slots when item counts differ.
    pub match_nulls: usize,
    /// Let one discrete item match several continuous items.
    pub duplicate_words_for_matching: bool,
    /// Model 5: strength of the adjacency prior on leftover continuous items.
    pub adjacency_weight: f64,
    /// Categorical entries below half this value are not counted as parameters.
    pub dis_item_prob_threshold: f64,
    /// Cache per-(item, level, node) Gaussian log densities for each point.
    pub cache_continuous: bool,
    /// Iteration cap of the inference-only loop.
    pub max_inference_iterations: usize,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            dis_prob_boost_factor: 1.0,
            con_prob_boost_factor: 1.0,
            norm_items: false,
            var_offset: 1e-3,
            var_offset_2: 0.0,
            var_offset_2_decay: 0.5,
            max_iterations: 100,
            min_iterations: 3,
            iteration_tolerance: 1e-5,
            map: None,
            discrete_tie_count: 1,
            max_sq_deviation: 1e6,
            max_ave_limited_cluster_error: 0.01,
            vertical_warmup_iterations: 0,
            dependent_max: false,
            match_nulls: 0,
            duplicate_words_for_matching: false,
            adjacency_weight: 1.0,
            dis_item_prob_threshold: 1e-4,
            cache_continuous: true,
            max_inference_iterations: MAX_INFERENCE_ITERATIONS,
        }
    }
}

impl EmConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the discrete and continuous probability boost factors.
    pub fn with_boost_factors(mut self, dis: f64, con: f64) -> Self {
        self.dis_prob_boost_factor = dis;
        self.con_prob_boost_factor = con;
        self
    }

    /// Toggle item-count normalization.
    pub fn with_norm_items(mut self, norm_items: bool) -> Self {
        self.norm_items = norm_items;
        self
    }

    /// Set the variance floor.
    pub fn with_var_offset(mut self, var_offset: f64) -> Self {
        self.var_offset = var_offset;
        self
    }

    /// Set the decaying secondary variance floor.
    pub fn with_var_offset_2(mut self, var_offset_2: f64, decay: f64) -> Self {
        self.var_offset_2 = var_offset_2;
        self.var_offset_2_decay = decay;
        self
    }

    /// Set maximum iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set minimum iterations.
    pub fn with_min_iterations(mut self, min_iterations: usize) -> Self {
        self.min_iterations = min_iterations;
        self
    }

    /// Set convergence tolerance.
    pub fn with_iteration_tolerance(mut self, tol: f64) -> Self {
        self.iteration_tolerance = tol;
        self
    }

    /// Enable MAP smoothing.
    pub fn with_map(mut self, priors: MapPriors) -> Self {
        self.map = Some(priors);
        self
    }

    /// Set the level block size for model 5.
    pub fn with_discrete_tie_count(mut self, count: usize) -> Self {
        self.discrete_tie_count = count;
        self
    }

    /// Set the Gaussian deviation clamp.
    pub fn with_max_sq_deviation(mut self, clamp: f64) -> Self {
        self.max_sq_deviation = clamp;
        self
    }

    /// Set the cluster-limiting trigger.
    pub fn with_max_ave_limited_cluster_error(mut self, err: f64) -> Self {
        self.max_ave_limited_cluster_error = err;
        self
    }

    /// Set the per-point vertical weight warm-up.
    pub fn with_vertical_warmup_iterations(mut self, n: usize) -> Self {
        self.vertical_warmup_iterations = n;
        self
    }

    /// Aggregate model-1 dependent weights by max instead of sum.
    pub fn with_dependent_max(mut self, on: bool) -> Self {
        self.dependent_max = on;
        self
    }

    /// Set forced null slots for matching.
    pub fn with_match_nulls(mut self, n: usize) -> Self {
        self.match_nulls = n;
        self
    }

    /// Toggle duplicate discrete items during matching.
    pub fn with_duplicate_words_for_matching(mut self, on: bool) -> Self {
        self.duplicate_words_for_matching = on;
        self
    }

    /// Set the adjacency prior weight for model 5.
    pub fn with_adjacency_weight(mut self, w: f64) -> Self {
        self.adjacency_weight = w;
        self
    }

    /// Toggle the continuous-probability cache.
    pub fn with_cache_continuous(mut self, on: bool) -> Self {
        self.cache_continuous = on;
        self
    }

    /// Set the inference-only iteration cap.
    pub fn with_max_inference_iterations(mut self, n: usize) -> Self {
        self.max_inference_iterations = n;
        self
    }

    /// Variance floor in effect after the M-step of `iteration`.
    pub fn var_floor(&self, iteration: usize) -> f64 {
        let decay = self.var_offset_2_decay.powi(iteration.min(i32::MAX as usize) as i32);
        self.var_offset + self.var_offset_2 * decay
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        let positive = |x: f64| x.is_finite() && x > 0.0;
        if !positive(self.dis_prob_boost_factor) || !positive(self.con_prob_boost_factor) {
            return Err(Error::InvalidParameter {
                name: "prob_boost_factor",
                message: "must be finite and > 0",
            });
        }
        if !(self.var_offset.is_finite() && self.var_offset > 0.0) {
            return Err(Error::InvalidParameter {
                name: "var_offset",
                message: "must be finite and > 0",
            });
        }
        if !(self.var_offset_2.is_finite() && self.var_offset_2 >= 0.0)
            || !(0.0..=1.0).contains(&self.var_offset_2_decay)
        {
            return Err(Error::InvalidParameter {
                name: "var_offset_2",
                message: "must be >= 0 with decay in [0, 1]",
            });
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidParameter {
                name: "max_iterations",
                message: "must be > 0",
            });
        }
        if !(self.iteration_tolerance.is_finite() && self.iteration_tolerance >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "iteration_tolerance",
                message: "must be finite and >= 0",
            });
        }
        if self.discrete_tie_count == 0 {
            return Err(Error::InvalidParameter {
                name: "discrete_tie_count",
                message: "must be > 0",
            });
        }
        if !(self.max_sq_deviation > 0.0) {
            return Err(Error::InvalidParameter {
                name: "max_sq_deviation",
                message: "must be > 0",
            });
        }
        if !(self.adjacency_weight.is_finite() && self.adjacency_weight >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "adjacency_weight",
                message: "must be finite and >= 0",
            });
        }
        if let Some(map) = &self.map {
            let fields = [map.alpha, map.beta_minus_one, map.kappa, map.delta, map.r_minus_n_g];
            if fields.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(Error::InvalidParameter {
                    name: "map",
                    message: "MAP hyperparameters must be finite and >= 0",
                });
            }
        }
        if self.max_inference_iterations == 0 {
            return Err(Error::InvalidParameter {
                name: "max_inference_iterations",
                message: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Options that shape one training call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOptions {
    /// Stopping rule and model-selection rule.
    pub convergence_criterion: ConvergenceCriterion,
    /// The supplied model carries usable parameters for every level.
    pub initial_model_is_valid: bool,
    /// The supplied model carries usable parameters for a prefix of levels.
    pub initial_model_is_subset: bool,
    /// Keep only this many clusters per point once membership concentrates.
    pub num_limited_clusters: Option<usize>,
    /// Share one level distribution per cluster across points.
    pub uniform_vertical_dist: bool,
    /// Per-point level distributions also depend on the cluster.
    pub cluster_dependent_vertical_dist: bool,
    /// Correspondence model.
    pub model_correspondence: CorrespondenceModel,
    /// Sample matchings instead of solving the assignment problem.
    pub sample_matches: bool,
    /// Last iteration (0-based) that samples; later iterations match exactly.
    pub last_sample: Option<usize>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            convergence_criterion: ConvergenceCriterion::MaxDataLl,
            initial_model_is_valid: false,
            initial_model_is_subset: false,
            num_limited_clusters: None,
            uniform_vertical_dist: true,
            cluster_dependent_vertical_dist: false,
            model_correspondence: CorrespondenceModel::Independent,
            sample_matches: false,
            last_sample: None,
        }
    }
}

impl TrainingOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the convergence criterion.
    pub fn with_convergence_criterion(mut self, c: ConvergenceCriterion) -> Self {
        self.convergence_criterion = c;
        self
    }

    /// Mark the supplied model as fully initialized.
    pub fn with_initial_model_is_valid(mut self, on: bool) -> Self {
        self.initial_model_is_valid = on;
        self
    }

    /// Mark the supplied model as fitted on a prefix of levels.
    pub fn with_initial_model_is_subset(mut self, on: bool) -> Self {
        self.initial_model_is_subset = on;
        self
    }

    /// Set cluster limiting.
    pub fn with_num_limited_clusters(mut self, k: usize) -> Self {
        self.num_limited_clusters = Some(k);
        self
    }

    /// Choose the vertical weight representation.
    pub fn with_vertical_dist(mut self, uniform: bool, cluster_dependent: bool) -> Self {
        self.uniform_vertical_dist = uniform;
        self.cluster_dependent_vertical_dist = cluster_dependent;
        self
    }

    /// Set the correspondence model.
    pub fn with_model_correspondence(mut self, model: CorrespondenceModel) -> Self {
        self.model_correspondence = model;
        self
    }

    /// Sample matches up to and including iteration `last_sample`.
    pub fn with_sample_matches(mut self, on: bool, last_sample: Option<usize>) -> Self {
        self.sample_matches = on;
        self.last_sample = last_sample;
        self
    }

    /// Vertical weight representation implied by the flags.
    pub fn vertical_mode(&self) -> VerticalWeightMode {
        if self.uniform_vertical_dist {
            VerticalWeightMode::Global
        } else if self.cluster_dependent_vertical_dist {
            VerticalWeightMode::PerPointPerCluster
        } else {
            VerticalWeightMode::PerPoint
        }
    }

    /// Whether matches are sampled at `iteration`.
    pub fn samples_at(&self, iteration: usize) -> bool {
        self.sample_matches && self.last_sample.map_or(true, |last| iteration <= last)
    }

    /// Check option combinations.
    pub fn validate(&self) -> Result<()> {
        if self.initial_model_is_valid && self.initial_model_is_subset {
            return Err(Error::InvalidParameter {
                name: "initial_model_is_subset",
                message: "cannot be combined with initial_model_is_valid",
            });
        }
        if self.num_limited_clusters == Some(0) {
            return Err(Error::InvalidParameter {
                name: "num_limited_clusters",
                message: "must be > 0 when set",
            });
        }
        Ok(())
    }
}
