//! Model 3: a per-point level prior built from every discrete×continuous
//! pair, then used to score items as in model 0.
//!
//! ```text
//! π[l] ∝ V[c,l] · Σ_d Σ_i m_d P(w_d | l)^β_d · u_i N(x_i | l)^β_c
//!      = V[c,l] · (Σ_d m_d P(w_d | l)^β_d) · (Σ_i u_i N(x_i | l)^β_c)
//! ```
//!
//! `m_d` is the discrete multiplicity times the item-count factor and `u_i`
//! the continuous item weight times its factor, so a word seen three times
//! pulls the prior as hard as three separate copies. The double sum
//! factorizes, so the prior costs `O(L (D + C))`.

use super::{score_continuous_items, score_discrete_items, CorrespondenceStrategy, PointContext};
use crate::error::Result;
use crate::numeric::{floored_ln, logsumexp, normalize_log_in_place};
use crate::scratch::PointScratch;
use ndarray::ArrayView1;
use rand::rngs::StdRng;

/// Level prior marginalized over all pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelPrior;

impl CorrespondenceStrategy for LevelPrior {
    fn name(&self) -> &'static str {
        "level-prior"
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
        let first = ctx.first_level();
        let point = ctx.point;
        let mut dis_terms = vec![0.0; point.num_discrete()];
        let mut con_terms = vec![0.0; point.num_continuous()];
        // Zero-weight items contribute ln 0 and drop out of the sums.
        let dis_mass: Vec<f64> = point
            .discrete
            .iter()
            .map(|item| (item.multiplicity * ctx.dis_factor).ln())
            .collect();
        let con_mass: Vec<f64> = point
            .continuous
            .iter()
            .map(|item| (item.weight * ctx.con_factor).ln())
            .collect();

        for &c in ctx.clusters {
            for (lo, slot) in aux.iter_mut().enumerate() {
                let level = first + lo;
                for (d, item) in point.discrete.iter().enumerate() {
                    dis_terms[d] = dis_mass[d] + ctx.dis_log(c, level, item.category);
                }
                for (i, term) in con_terms.iter_mut().enumerate() {
                    *term = con_mass[i] + ctx.con_log(cache, c, level, i);
                }
                *slot = log_v[[c, lo]] + logsumexp(&dis_terms) + logsumexp(&con_terms);
            }
            normalize_log_in_place(aux);
            aux.iter_mut().for_each(|p| *p = floored_ln(*p, diagnostics));

            let log_pi = ArrayView1::from(&aux[..]);
            let dis = score_discrete_items(ctx, indicators, c, log_pi, levels);
            let con = score_continuous_items(ctx, cache, indicators, c, log_pi, levels);
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
    use crate::data::Point;

    #[test]
    fn test_agreeing_pair_favours_leaf() {
        let model = test_support::model();
        let config = EmConfig::default();
        let point = Point::new().with_discrete(0, 1.0).with_continuous(vec![-2.0]);
        let (_, _, s_prior) = test_support::run(&LevelPrior, &model, &config, &point);
        let (_, _, s_ind) = test_support::run(&Independent, &model, &config, &point);
        assert!(s_prior.indicators.con(0, 1, 0) > s_ind.indicators.con(0, 1, 0));
        assert!(s_prior.indicators.dis(0, 1, 0) > s_ind.indicators.dis(0, 1, 0));
    }

    #[test]
    fn test_scores_are_finite_for_many_items() {
        let model = test_support::model();
        let (ll, norm, _) = test_support::run(&LevelPrior, &model, &EmConfig::default(), &test_support::point());
        assert!(ll.iter().all(|v| v.is_finite()));
        assert!((norm - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_word_weighs_on_level_prior() {
        // Word 1 belongs to cluster 1's leaf; repeating it should pull
        // cluster 0's prior towards the shared root.
        let model = test_support::model();
        let config = EmConfig::default();
        let once = Point::new()
            .with_discrete(0, 1.0)
            .with_discrete(1, 1.0)
            .with_continuous(vec![-2.0]);
        let repeated = Point::new()
            .with_discrete(0, 1.0)
            .with_discrete(1, 9.0)
            .with_continuous(vec![-2.0]);
        let (_, _, s_once) = test_support::run(&LevelPrior, &model, &config, &once);
        let (_, _, s_rep) = test_support::run(&LevelPrior, &model, &config, &repeated);
        assert!(s_rep.indicators.con(0, 1, 0) < s_once.indicators.con(0, 1, 0));
    }

    #[test]
    fn test_zero_weight_item_leaves_prior_unchanged() {
        let model = test_support::model();
        let config = EmConfig::default();
        let base = Point::new().with_discrete(0, 1.0).with_continuous(vec![-2.0]);
        let padded = base
            .clone()
            .with_continuous_item(crate::data::ContinuousItem {
                features: vec![40.0],
                missing: Vec::new(),
                weight: 0.0,
            });
        let (_, _, s_base) = test_support::run(&LevelPrior, &model, &config, &base);
        let (_, _, s_pad) = test_support::run(&LevelPrior, &model, &config, &padded);
        for lo in 0..2 {
            assert!((s_base.indicators.con(0, lo, 0) - s_pad.indicators.con(0, lo, 0)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_vanishing_prior_is_counted() {
        let model = test_support::model();
        let point = Point::new().with_discrete(0, 1.0).with_continuous(vec![-600.0]);
        let (_, _, scratch) = test_support::run(&LevelPrior, &model, &EmConfig::default(), &point);
        assert!(scratch.diagnostics.floored_probs > 0);
    }
}
