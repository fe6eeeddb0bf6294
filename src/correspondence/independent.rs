//! Model 0: discrete and continuous items are emitted independently.
//!
//! ```text
//! ln P(x | c) = Σ_d m_d ln Σ_l V[c,l] P(w_d | l)^β_d
//!             + Σ_i w_i ln Σ_l V[c,l] N(x_i | l)^β_c
//! ```

use super::{score_continuous_items, score_discrete_items, CorrespondenceStrategy, PointContext};
use crate::error::Result;
use crate::scratch::PointScratch;
use rand::rngs::StdRng;

/// Independent items.
#[derive(Debug, Clone, Copy, Default)]
pub struct Independent;

impl CorrespondenceStrategy for Independent {
    fn name(&self) -> &'static str {
        "independent"
    }

    fn needs_both_modalities(&self) -> bool {
        false
    }

    fn score_point(&self, ctx: &PointContext<'_>, scratch: &mut PointScratch, _rng: &mut StdRng) -> Result<f64> {
        let PointScratch {
            cache,
            indicators,
            log_v,
            cluster_ll,
            levels,
            ..
        } = scratch;
        for &c in ctx.clusters {
            let log_w = log_v.row(c);
            let dis = score_discrete_items(ctx, indicators, c, log_w, levels);
            let con = score_continuous_items(ctx, cache, indicators, c, log_w, levels);
            cluster_ll[c] = dis + con;
        }
        Ok(ctx.weighted_con_norm())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::test_support;
    use super::*;
    use crate::config::EmConfig;
    use crate::numeric::logsumexp;

    #[test]
    fn test_single_discrete_item_matches_closed_form() {
        let model = test_support::model();
        let config = EmConfig::default();
        let point = crate::data::Point::new().with_discrete(0, 2.0);
        let (ll, norm, scratch) = test_support::run(&Independent, &model, &config, &point);
        // uniform V over two levels: 2 * ln(0.5*0.5 + 0.5*0.9)
        let expected = 2.0 * (0.5f64 * 0.5 + 0.5 * 0.9).ln();
        assert!((ll[0] - expected).abs() < 1e-9);
        assert_eq!(norm, 0.0);
        let r0 = scratch.indicators.dis(0, 0, 0);
        assert!((r0 - 0.25 / 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_boost_scales_item_probabilities() {
        let model = test_support::model();
        let config = EmConfig::default().with_boost_factors(3.0, 1.0);
        let point = crate::data::Point::new().with_discrete(1, 1.0);
        let (ll, _, _) = test_support::run(&Independent, &model, &config, &point);
        let expected = logsumexp(&[0.5f64.ln() + 3.0 * 0.5f64.ln(), 0.5f64.ln() + 3.0 * 0.9f64.ln()]);
        assert!((ll[1] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_con_norm_weight_sums_item_weights() {
        let model = test_support::model();
        let config = EmConfig::default().with_boost_factors(1.0, 2.0);
        let point = test_support::point();
        let (_, norm, _) = test_support::run(&Independent, &model, &config, &point);
        assert!((norm - 6.0).abs() < 1e-12);
    }
}
