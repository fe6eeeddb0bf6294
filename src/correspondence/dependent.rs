//! Model 1: discrete items inherit their level weights from the continuous
//! items of the same point.
//!
//! Continuous items are scored as in model 0. Their level posteriors are
//! then pooled into dependent weights
//!
//! ```text
//! u[l] ∝ Σ_i r_i[l]          (or max_i r_i[l] with dependent_max)
//! ```
//!
//! and discrete items are scored against `u` in place of `V[c, ·]`.

use super::{score_continuous_items, score_discrete_items, CorrespondenceStrategy, PointContext};
use crate::error::Result;
use crate::numeric::{floored_ln, normalize_in_place};
use crate::scratch::PointScratch;
use ndarray::ArrayView1;
use rand::rngs::StdRng;

/// Discrete items use the continuous items' level posteriors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dependent;

impl CorrespondenceStrategy for Dependent {
    fn name(&self) -> &'static str {
        "dependent"
    }

    fn needs_both_modalities(&self) -> bool {
        true
    }

    fn score_point(&self, ctx: &PointContext<'_>, scratch: &mut PointScratch, _rng: &mut StdRng) -> Result<f64> {
        let PointScratch {
            cache,
            indicators,
            log_v,
            cluster_ll,
            levels,
            aux,
            diagnostics,
            ..
        } = scratch;
        let num_con = ctx.point.num_continuous();
        for &c in ctx.clusters {
            let con = score_continuous_items(ctx, cache, indicators, c, log_v.row(c), levels);

            for (lo, slot) in aux.iter_mut().enumerate() {
                let column = (0..num_con).map(|i| indicators.con(c, lo, i));
                *slot = if ctx.config.dependent_max {
                    column.fold(0.0, f64::max)
                } else {
                    column.sum()
                };
            }
            normalize_in_place(aux);
            aux.iter_mut().for_each(|u| *u = floored_ln(*u, diagnostics));

            let dis = score_discrete_items(ctx, indicators, c, ArrayView1::from(&aux[..]), levels);
            cluster_ll[c] = dis + con;
        }
        Ok(ctx.weighted_con_norm())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::{test_support, Independent};
    use super::*;
    use crate::config::EmConfig;

    #[test]
    fn test_discrete_follows_continuous_levels() {
        let model = test_support::model();
        let config = EmConfig::default();
        // continuous item sits on cluster 0's leaf, so discrete level weights
        // lean towards the leaf
        let point = crate::data::Point::new()
            .with_discrete(0, 1.0)
            .with_continuous(vec![-2.0]);
        let (dep, _, s_dep) = test_support::run(&Dependent, &model, &config, &point);
        let (ind, _, s_ind) = test_support::run(&Independent, &model, &config, &point);
        assert!(s_dep.indicators.dis(0, 1, 0) > s_ind.indicators.dis(0, 1, 0));
        assert!(dep[0] > ind[0]);
    }

    #[test]
    fn test_max_pooling_is_row_stochastic() {
        let model = test_support::model();
        let config = EmConfig::default().with_dependent_max(true);
        let point = test_support::point();
        let (ll, _, _) = test_support::run(&Dependent, &model, &config, &point);
        assert!(ll.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_vanishing_level_weight_is_counted() {
        let model = test_support::model();
        let config = EmConfig::default();
        let (_, _, near) = test_support::run(&Dependent, &model, &config, &test_support::point());
        assert_eq!(near.diagnostics.floored_probs, 0);

        // Far from both leaves: the leaf weight underflows to zero and is floored.
        let point = crate::data::Point::new()
            .with_discrete(0, 1.0)
            .with_continuous(vec![-600.0]);
        let (ll, _, far) = test_support::run(&Dependent, &model, &config, &point);
        assert!(far.diagnostics.floored_probs > 0);
        assert!(ll.iter().all(|v| v.is_finite()));
    }
}
