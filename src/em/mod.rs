//! The EM engine.
//!
//! # Iteration
//!
//! ```text
//! for t in 0..max_iterations:
//!     halt requested?                         → stop (Halted)
//!     E/V-step over all points                → q(c|p), fits, statistics
//!     ll(t)       = mean fit over scored points
//!     held_out(t) = inference-only score of the held-out set
//!     snapshot if score(t) beats the best so far
//!     stopping rule                           → stop
//!     cluster limiting may switch on
//!     M-step                                  → new parameters
//! ```
//!
//! Snapshots are taken after the E-step, so a returned model's membership,
//! log-likelihood and parameters always belong together. Fixed-iteration
//! criteria return the model after its final M-step instead, re-scored once.
//!
//! # Initialization
//!
//! ```text
//! initial_model_is_valid  → use as is
//! initial_model_is_subset → score with the fitted levels, then M-step
//! otherwise               → random indicators, then M-step
//! ```
//!
//! # Level-weight modes
//!
//! Per-point level distributions stay uniform until `vertical_warmup_iterations`
//! have passed and, when cluster limiting is configured, limiting has turned
//! on. Once on they stay on.

pub(crate) mod convergence;
pub(crate) mod estep;
pub mod halt;
pub(crate) mod mstep;

pub use convergence::StopReason;
pub use halt::HaltSignal;

use crate::config::{EmConfig, TrainingOptions, VerticalWeightMode};
use crate::correspondence::{strategy_for, CorrespondenceStrategy};
use crate::data::ClusterData;
use crate::error::{Error, Result};
use crate::inference::held_out_log_likelihood;
use crate::model::{Complexity, InitState, Model, VerticalWeights};
use crate::numeric::Diagnostics;
use crate::scratch::ClusterLimiter;
use crate::topology::Topology;
use convergence::{ConvergenceTracker, Observation};
use estep::{run_pass, LevelCollection, Pass, PassOutput};
use mstep::apply_m_step;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Mixed into the seed for subset initialization.
const SUBSET_STREAM: u64 = 0x5851_f42d_4c95_7f2d;

/// Numbers reported after each iteration's E-step.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    /// 0-based iteration.
    pub iteration: usize,
    /// Mean per-point training log-likelihood.
    pub log_likelihood: f64,
    /// Relative change from the previous iteration.
    pub relative_delta: Option<f64>,
    /// Mean per-point held-out log-likelihood, if held-out data was given.
    pub held_out_log_likelihood: Option<f64>,
    /// Free parameters of the model that produced this iteration.
    pub num_parameters: usize,
    /// Repairs made in this iteration's E-step and M-step.
    pub diagnostics: Diagnostics,
    /// Whether cluster limiting was on.
    pub limiting_active: bool,
}

/// What [`EmEngine::train`] returns.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// The selected model.
    pub model: Model,
    /// Why training stopped.
    pub status: StopReason,
    /// Iterations whose E-step completed.
    pub iterations: usize,
    /// Training log-likelihood per iteration.
    pub log_likelihood_trace: Vec<f64>,
    /// Held-out log-likelihood per iteration (empty without held-out data).
    pub held_out_trace: Vec<f64>,
    /// Per-point fit under the returned model.
    pub fit: Vec<Option<f64>>,
    /// Iteration the returned model was snapshotted at, if any.
    pub best_iteration: Option<usize>,
    /// Criterion score of that iteration.
    pub best_score: Option<f64>,
    /// Parameter count, MDL and AIC of the returned model.
    pub complexity: Complexity,
}

type Observer<'a> = Box<dyn FnMut(&IterationReport, &Model) + 'a>;

/// Runs EM training with a fixed configuration.
///
/// ```no_run
/// use tiermix::{ClusterData, EmConfig, EmEngine, Point, Topology, TrainingOptions};
///
/// let data = ClusterData::builder(3, 0)
///     .add_point(Point::new().with_discrete(0, 1.0))
///     .add_point(Point::new().with_discrete(2, 1.0))
///     .build()?;
/// let topology = Topology::flat(2)?;
/// let outcome = EmEngine::new(EmConfig::default(), TrainingOptions::default())
///     .train(&topology, &data, None, None)?;
/// println!("{} after {} iterations", outcome.status, outcome.iterations);
/// # Ok::<(), tiermix::Error>(())
/// ```
pub struct EmEngine<'a> {
    config: EmConfig,
    options: TrainingOptions,
    halt: Option<HaltSignal>,
    observer: Option<(usize, Observer<'a>)>,
}

impl std::fmt::Debug for EmEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmEngine")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("halt", &self.halt)
            .field("observer_every", &self.observer.as_ref().map(|o| o.0))
            .finish()
    }
}

impl<'a> EmEngine<'a> {
    /// Engine for `config` and `options`. Both are validated by [`EmEngine::train`].
    pub fn new(config: EmConfig, options: TrainingOptions) -> Self {
        Self {
            config,
            options,
            halt: None,
            observer: None,
        }
    }

    /// Stop at the start of the next iteration once `signal` is raised.
    pub fn with_halt(mut self, signal: HaltSignal) -> Self {
        self.halt = Some(signal);
        self
    }

    /// Call `observer` every `every` iterations with the iteration's report
    /// and the model that produced it.
    pub fn with_observer(mut self, every: usize, observer: impl FnMut(&IterationReport, &Model) + 'a) -> Self {
        self.observer = Some((every.max(1), Box::new(observer)));
        self
    }

    /// Numeric configuration.
    pub fn config(&self) -> &EmConfig {
        &self.config
    }

    /// Training options.
    pub fn options(&self) -> &TrainingOptions {
        &self.options
    }

    /// Fit a model on `train`.
    ///
    /// `model` supplies initial parameters when `initial_model_is_valid` or
    /// `initial_model_is_subset` is set; otherwise it may be `None` and a
    /// model is built from `topology` and initialized at random.
    pub fn train(
        &mut self,
        topology: &Topology,
        train: &ClusterData,
        held_out: Option<&ClusterData>,
        model: Option<Model>,
    ) -> Result<TrainingOutcome> {
        self.config.validate()?;
        self.options.validate()?;
        topology.validate()?;
        train.validate()?;
        if train.num_points() == 0 {
            return Err(Error::EmptyInput);
        }
        let criterion = self.options.convergence_criterion;
        if criterion.needs_held_out() && held_out.is_none() {
            return Err(Error::MissingHeldOut {
                criterion: criterion.name(),
            });
        }
        if let Some(h) = held_out {
            h.validate()?;
            if h.num_categories() != train.num_categories() || h.num_features() != train.num_features() {
                return Err(Error::ShapeMismatch {
                    expected: format!("{} categories, {} features", train.num_categories(), train.num_features()),
                    actual: format!("{} categories, {} features", h.num_categories(), h.num_features()),
                });
            }
        }
        let strategy = strategy_for(self.options.model_correspondence);
        check_modalities(strategy.as_ref(), train)?;

        let mode = self.options.vertical_mode();
        let mut model = match model {
            Some(m) => {
                if !m.topology().same_shape(topology) {
                    return Err(Error::InvalidTopology(
                        "supplied model was built on a different topology".into(),
                    ));
                }
                if m.vertical_mode() != mode {
                    return Err(Error::InvalidParameter {
                        name: "model",
                        message: "vertical weight mode differs from the training options",
                    });
                }
                m
            }
            None => Model::new(topology, train.num_categories(), train.num_features(), mode, train.num_points())?,
        };
        model.check_data_shape(train)?;
        model.ensure_points(train.num_points());
        self.initialize(&mut model, train, strategy.as_ref())?;

        log::info!(
            "training {} clusters on {} points: {} correspondence, {} criterion",
            model.num_clusters(),
            train.num_points(),
            strategy.name(),
            criterion.name()
        );
        self.run(model, train, held_out, strategy.as_ref())
    }

    fn initialize(&self, model: &mut Model, train: &ClusterData, strategy: &dyn CorrespondenceStrategy) -> Result<()> {
        if self.options.initial_model_is_valid {
            model.mark_ready();
            log::debug!("using supplied model as is");
            return Ok(());
        }
        if !self.options.initial_model_is_subset {
            return model.initialize_random(train, &self.config);
        }
        let InitState::PartiallyInitialized { fitted_last_level } = model.state() else {
            return Err(Error::InvalidParameter {
                name: "initial_model_is_subset",
                message: "supplied model is not partially initialized",
            });
        };

        let sub = model.topology().sub_topology(fitted_last_level)?;
        let mut partial = model.clone();
        partial.vertical = VerticalWeights::uniform(
            model.vertical_mode(),
            train.num_points(),
            model.num_clusters(),
            sub.num_active_levels(),
        );
        partial.topology = sub;
        partial.refresh_normalizers();
        let out = run_pass(&Pass {
            model: &partial,
            data: train,
            config: &self.config,
            strategy,
            limiter: None,
            iteration: 0,
            sample: false,
            accumulate: false,
            update_vertical: false,
            levels: LevelCollection::None,
        })?;
        log::debug!(
            "scored {} points with levels {}..{fitted_last_level}",
            train.num_points(),
            model.topology().first_level()
        );

        let mut rng = StdRng::seed_from_u64(self.config.seed ^ SUBSET_STREAM);
        let table = crate::model::random_level_table(
            model.topology().num_active_levels(),
            model.num_clusters(),
            &mut rng,
        );
        model.initialize_from_membership(train, &self.config, out.membership, table, &mut rng)
    }

    fn run(
        &mut self,
        mut model: Model,
        train: &ClusterData,
        held_out: Option<&ClusterData>,
        strategy: &dyn CorrespondenceStrategy,
    ) -> Result<TrainingOutcome> {
        let config = &self.config;
        let options = &self.options;
        let criterion = options.convergence_criterion;
        let per_point_mode = model.vertical_mode() != VerticalWeightMode::Global;
        let data_mean = train.feature_means();

        let mut tracker = ConvergenceTracker::new(criterion, config.iteration_tolerance, config.min_iterations);
        let mut limiter = ClusterLimiter::new(options.num_limited_clusters);
        let mut per_point_active = false;
        let mut best: Option<(Model, Vec<Option<f64>>)> = None;
        let mut ll_trace = Vec::new();
        let mut held_out_trace = Vec::new();
        let mut last_fits = Vec::new();
        let mut status = StopReason::MaxIterations;
        let mut iterations = 0;

        for iteration in 0..config.max_iterations {
            if self.halt.as_ref().is_some_and(HaltSignal::is_requested) {
                log::info!("halt requested before iteration {iteration}");
                status = StopReason::Halted;
                break;
            }
            if per_point_mode
                && !per_point_active
                && iteration >= config.vertical_warmup_iterations
                && (options.num_limited_clusters.is_none() || limiter.is_active())
            {
                per_point_active = true;
                log::info!("per-point level distributions on from iteration {iteration}");
            }
            let sample = options.samples_at(iteration) && strategy.uses_matching();
            let sampled_before = iteration > 0 && options.samples_at(iteration - 1);
            if strategy.uses_matching() && sampled_before && !sample {
                log::info!("switching from sampled to exact matching at iteration {iteration}");
            }

            let out = run_pass(&Pass {
                model: &model,
                data: train,
                config,
                strategy,
                limiter: Some(&limiter),
                iteration,
                sample,
                accumulate: true,
                update_vertical: per_point_active,
                levels: LevelCollection::None,
            })?;
            let ll = out.average_fit().unwrap_or(f64::NEG_INFINITY);
            let PassOutput {
                membership,
                fits,
                stats,
                vertical,
                diagnostics: mut diag,
                ..
            } = out;
            model.membership = membership;
            model.log_likelihood = ll;

            let held = match held_out {
                Some(h) => Some(held_out_log_likelihood(&model, h, config, options.model_correspondence)?),
                None => None,
            };
            let num_parameters = model.num_parameters(config.dis_item_prob_threshold);
            let verdict = tracker.observe(Observation {
                iteration,
                log_likelihood: ll,
                held_out: held,
                num_parameters,
            });
            ll_trace.push(ll);
            if let Some(h) = held {
                held_out_trace.push(h);
            }
            iterations = iteration + 1;

            match (held, verdict.relative_delta) {
                (Some(h), Some(d)) => log::info!("iteration {iteration}: ll {ll:.6} (delta {d:.3e}), held-out {h:.6}"),
                (Some(h), None) => log::info!("iteration {iteration}: ll {ll:.6}, held-out {h:.6}"),
                (None, Some(d)) => log::info!("iteration {iteration}: ll {ll:.6} (delta {d:.3e})"),
                (None, None) => log::info!("iteration {iteration}: ll {ll:.6}"),
            }
            if verdict.is_best && criterion.fixed_iterations().is_none() {
                best = Some((model.clone(), fits.clone()));
            }

            let stop = verdict.stop;
            if stop.is_none() || stop == Some(StopReason::FixedIterations) {
                if limiter.maybe_activate(&model.membership, config.max_ave_limited_cluster_error) {
                    log::debug!("cluster limiting active after iteration {iteration}");
                }
                diag.merge(&apply_m_step(&mut model, &stats, config, iteration + 1, &data_mean));
                if let Some(v) = vertical {
                    model.vertical = v;
                }
            }
            diag.log_summary(iteration);

            if let Some((every, observer)) = self.observer.as_mut() {
                if (iteration + 1) % *every == 0 {
                    let report = IterationReport {
                        iteration,
                        log_likelihood: ll,
                        relative_delta: verdict.relative_delta,
                        held_out_log_likelihood: held,
                        num_parameters,
                        diagnostics: diag,
                        limiting_active: limiter.is_active(),
                    };
                    observer(&report, &model);
                }
            }

            last_fits = fits;
            if let Some(reason) = stop {
                status = reason;
                break;
            }
        }

        let (best_iteration, best_score) = tracker.best().map_or((None, None), |(i, s)| (Some(i), Some(s)));
        let (model, fit, best_iteration, best_score) = match (status, best) {
            (StopReason::FixedIterations, _) => {
                let out = run_pass(&Pass {
                    model: &model,
                    data: train,
                    config,
                    strategy,
                    limiter: Some(&limiter),
                    iteration: iterations,
                    sample: false,
                    accumulate: false,
                    update_vertical: false,
                    levels: LevelCollection::None,
                })?;
                model.log_likelihood = out.average_fit().unwrap_or(f64::NEG_INFINITY);
                model.membership = out.membership;
                (model, out.fits, None, None)
            }
            (_, Some((snapshot, fits))) => (snapshot, fits, best_iteration, best_score),
            (_, None) => {
                if last_fits.is_empty() {
                    last_fits = vec![None; train.num_points()];
                }
                (model, last_fits, None, None)
            }
        };

        log::info!("training stopped after {iterations} iterations: {status}");
        let complexity = model.complexity(train.num_points(), self.config.dis_item_prob_threshold);
        Ok(TrainingOutcome {
            model,
            status,
            iterations,
            log_likelihood_trace: ll_trace,
            held_out_trace,
            fit,
            best_iteration,
            best_score,
            complexity,
        })
    }
}

/// Fail when the data has no item of a modality the strategy needs.
fn check_modalities(strategy: &dyn CorrespondenceStrategy, data: &ClusterData) -> Result<()> {
    if !strategy.needs_both_modalities() {
        return Ok(());
    }
    let missing = match (data.has_discrete(), data.has_continuous()) {
        (true, true) => return Ok(()),
        (false, _) => "discrete",
        (_, false) => "continuous",
    };
    Err(Error::ModalityMismatch {
        point: 0,
        message: format!(
            "the {} correspondence model needs both modalities, but no point has {missing} items",
            strategy.name()
        ),
    })
}
