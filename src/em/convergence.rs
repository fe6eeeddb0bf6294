//! Stopping rules and best-model bookkeeping.
//!
//! ```text
//! delta(t) = (ll(t) − ll(t−1)) / |ll(t−1)|
//!
//! converged  ⇔  0 ≤ delta(t) < tolerance
//!               ∧ t + 1 ≥ min_iterations
//!               ∧ num_parameters(t) = num_parameters(t−1)
//! ```
//!
//! `FirstHeldOutMax` stops early on the first held-out decrease, and also
//! accepts the same tolerance test applied to the held-out score.
//!
//! The criterion also decides what "best" means for snapshots: held-out
//! log-likelihood, training plus held-out, or training alone.

use crate::config::ConvergenceCriterion;

/// Why training stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Relative log-likelihood change fell below the tolerance.
    Converged,
    /// `max_iterations` reached.
    MaxIterations,
    /// A fixed-iteration criterion completed its iterations.
    FixedIterations,
    /// Held-out log-likelihood turned down (`FirstHeldOutMax`).
    HeldOutPeak,
    /// A halt was requested.
    Halted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Converged => "converged",
            StopReason::MaxIterations => "maximum iterations reached",
            StopReason::FixedIterations => "fixed iterations completed",
            StopReason::HeldOutPeak => "held-out log-likelihood peaked",
            StopReason::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// One iteration's numbers as seen by the tracker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Observation {
    pub iteration: usize,
    pub log_likelihood: f64,
    pub held_out: Option<f64>,
    pub num_parameters: usize,
}

/// What the tracker concluded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Verdict {
    pub relative_delta: Option<f64>,
    /// This iteration is the best so far.
    pub is_best: bool,
    pub stop: Option<StopReason>,
}

#[derive(Debug, Clone)]
pub(crate) struct ConvergenceTracker {
    criterion: ConvergenceCriterion,
    tolerance: f64,
    min_iterations: usize,
    previous: Option<Observation>,
    best: Option<(usize, f64)>,
}

impl ConvergenceTracker {
    pub fn new(criterion: ConvergenceCriterion, tolerance: f64, min_iterations: usize) -> Self {
        Self {
            criterion,
            tolerance,
            min_iterations,
            previous: None,
            best: None,
        }
    }

    /// Snapshot score for an iteration.
    pub fn score(&self, log_likelihood: f64, held_out: Option<f64>) -> f64 {
        match self.criterion {
            ConvergenceCriterion::MaxHeldOutLl | ConvergenceCriterion::FirstHeldOutMax => {
                held_out.unwrap_or(f64::NEG_INFINITY)
            }
            ConvergenceCriterion::MaxCombinedLl => log_likelihood + held_out.unwrap_or(f64::NEG_INFINITY),
            _ => log_likelihood,
        }
    }

    /// Best `(iteration, score)` so far.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.best
    }

    pub fn observe(&mut self, obs: Observation) -> Verdict {
        let score = self.score(obs.log_likelihood, obs.held_out);
        let is_best = !score.is_nan() && self.best.map_or(true, |(_, best)| score > best);
        if is_best {
            self.best = Some((obs.iteration, score));
        }

        let relative_delta = self
            .previous
            .and_then(|prev| relative_change(prev.log_likelihood, obs.log_likelihood));
        let held_out_delta = match (self.previous.and_then(|p| p.held_out), obs.held_out) {
            (Some(prev), Some(cur)) => relative_change(prev, cur),
            _ => None,
        };
        if let Some(delta) = relative_delta {
            if delta < -self.tolerance {
                log::warn!(
                    "iteration {}: log-likelihood decreased by {:.3e} (relative)",
                    obs.iteration,
                    -delta
                );
            }
        }

        let stop = if let Some(n) = self.criterion.fixed_iterations() {
            (obs.iteration + 1 >= n).then_some(StopReason::FixedIterations)
        } else if self.criterion == ConvergenceCriterion::FirstHeldOutMax
            && matches!(
                (self.previous.and_then(|p| p.held_out), obs.held_out),
                (Some(prev), Some(cur)) if cur < prev
            )
        {
            Some(StopReason::HeldOutPeak)
        } else {
            let same_params = self
                .previous
                .is_some_and(|p| p.num_parameters == obs.num_parameters);
            let settled = |delta: Option<f64>| delta.is_some_and(|d| (0.0..self.tolerance).contains(&d));
            let plateau = settled(relative_delta)
                || (self.criterion == ConvergenceCriterion::FirstHeldOutMax && settled(held_out_delta));
            let converged = plateau && obs.iteration + 1 >= self.min_iterations && same_params;
            converged.then_some(StopReason::Converged)
        };

        self.previous = Some(obs);
        Verdict {
            relative_delta,
            is_best,
            stop,
        }
    }
}

/// `(cur - prev) / |prev|`, when both are finite and `prev` is non-zero.
fn relative_change(prev: f64, cur: f64) -> Option<f64> {
    let denom = prev.abs();
    (prev.is_finite() && cur.is_finite() && denom > 0.0).then(|| (cur - prev) / denom)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn obs(iteration: usize, ll: f64, held_out: Option<f64>, k: usize) -> Observation {
        Observation {
            iteration,
            log_likelihood: ll,
            held_out,
            num_parameters: k,
        }
    }

    #[test]
    fn test_converges_on_small_positive_delta() {
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::MaxDataLl, 1e-3, 2);
        assert_eq!(t.observe(obs(0, -10.0, None, 4)).stop, None);
        let v = t.observe(obs(1, -9.99999, None, 4));
        assert_eq!(v.stop, Some(StopReason::Converged));
        assert!(v.relative_delta.unwrap() > 0.0);
    }

    #[test]
    fn test_parameter_change_blocks_convergence() {
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::MaxDataLl, 1e-3, 1);
        t.observe(obs(0, -10.0, None, 4));
        assert_eq!(t.observe(obs(1, -10.0, None, 5)).stop, None);
        assert_eq!(t.observe(obs(2, -10.0, None, 5)).stop, Some(StopReason::Converged));
    }

    #[test]
    fn test_decrease_does_not_converge() {
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::MaxDataLl, 1e-3, 1);
        t.observe(obs(0, -10.0, None, 4));
        assert_eq!(t.observe(obs(1, -10.000001, None, 4)).stop, None);
    }

    #[test]
    fn test_min_iterations_respected() {
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::MaxDataLl, 1e-3, 5);
        t.observe(obs(0, -10.0, None, 4));
        assert_eq!(t.observe(obs(1, -10.0, None, 4)).stop, None);
    }

    #[test]
    fn test_first_held_out_max_stops_on_training_plateau() {
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::FirstHeldOutMax, 1e-6, 2);
        t.observe(obs(0, -10.0, Some(-12.0), 4));
        t.observe(obs(1, -9.0, Some(-11.0), 4));
        let v = t.observe(obs(2, -8.999_999_99, Some(-10.5), 4));
        assert_eq!(v.stop, Some(StopReason::Converged));
        assert!(v.is_best);
    }

    #[test]
    fn test_first_held_out_max_stops_on_held_out_plateau() {
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::FirstHeldOutMax, 1e-6, 1);
        t.observe(obs(0, -10.0, Some(-12.0), 4));
        let v = t.observe(obs(1, -9.0, Some(-11.999_999_99), 4));
        assert_eq!(v.stop, Some(StopReason::Converged));

        // Other criteria only look at the training score.
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::MaxHeldOutLl, 1e-6, 1);
        t.observe(obs(0, -10.0, Some(-12.0), 4));
        assert_eq!(t.observe(obs(1, -9.0, Some(-11.999_999_99), 4)).stop, None);
    }

    #[test]
    fn test_first_held_out_max_stops_on_turn() {
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::FirstHeldOutMax, 1e-9, 1);
        t.observe(obs(0, -10.0, Some(-12.0), 4));
        let v = t.observe(obs(1, -9.0, Some(-11.0), 4));
        assert!(v.is_best);
        let v = t.observe(obs(2, -8.0, Some(-11.5), 4));
        assert_eq!(v.stop, Some(StopReason::HeldOutPeak));
        assert!(!v.is_best);
        assert_eq!(t.best(), Some((1, -11.0)));
    }

    #[test]
    fn test_combined_score_adds_terms() {
        let t = ConvergenceTracker::new(ConvergenceCriterion::MaxCombinedLl, 1e-3, 1);
        assert_eq!(t.score(-2.0, Some(-3.0)), -5.0);
    }

    #[test]
    fn test_fixed_iterations() {
        let mut t = ConvergenceTracker::new(ConvergenceCriterion::ThreeIterations, 1e-3, 1);
        assert_eq!(t.observe(obs(0, -1.0, None, 1)).stop, None);
        assert_eq!(t.observe(obs(1, -1.0, None, 1)).stop, None);
        assert_eq!(t.observe(obs(2, -1.0, None, 1)).stop, Some(StopReason::FixedIterations));
    }
}
