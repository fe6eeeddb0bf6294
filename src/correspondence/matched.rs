//! Model 2: explicit matching between discrete and continuous items.
//!
//! Each (discrete, continuous) pair is scored per cluster as
//!
//! ```text
//! s_c(d, i) = ln Σ_l V[c,l] P(w_d | l)^β_d N(x_i | l)^β_c
//! ```
//!
//! A matching is found on those scores (exact, or sampled while
//! `sample_matches` is on) and the cluster score is the mean over matched
//! pairs. Unmatched items get no level responsibility. With
//! `share_matches` one matching is computed on `ln Σ_c a_c exp(s_c)` and
//! reused by every cluster.
//!
//! When discrete and continuous counts differ, `match_nulls` pairs are
//! deliberately left unmatched.

use super::{pair_level_log, CorrespondenceStrategy, PointContext};
use crate::error::Result;
use crate::matching::{get_matches, Matches};
use crate::numeric::{log_add, logsumexp, normalize_log_in_place};
use crate::scratch::PointScratch;
use ndarray::{s, Array2, Array3, ArrayView2};
use rand::rngs::StdRng;

/// Matched correspondence.
#[derive(Debug, Clone, Copy, Default)]
pub struct Matched {
    /// One matching per point, shared across clusters.
    pub share_matches: bool,
}

impl CorrespondenceStrategy for Matched {
    fn name(&self) -> &'static str {
        if self.share_matches {
            "matched-shared"
        } else {
            "matched"
        }
    }

    fn needs_both_modalities(&self) -> bool {
        true
    }

    fn uses_matching(&self) -> bool {
        true
    }

    fn score_point(&self, ctx: &PointContext<'_>, scratch: &mut PointScratch, rng: &mut StdRng) -> Result<f64> {
        let num_dis = ctx.point.num_discrete();
        let num_con = ctx.point.num_continuous();
        let nulls = if num_dis != num_con { ctx.config.match_nulls } else { 0 };
        let dup = ctx.config.duplicate_words_for_matching;

        let mut pair = Array3::zeros((ctx.clusters.len(), num_dis, num_con));
        for (ci, &c) in ctx.clusters.iter().enumerate() {
            pair_scores(ctx, scratch, c, pair.slice_mut(s![ci, .., ..]));
        }

        let mut any_matched = false;
        if self.share_matches {
            let joint = Array2::from_shape_fn((num_dis, num_con), |(d, i)| {
                ctx.clusters
                    .iter()
                    .enumerate()
                    .fold(f64::NEG_INFINITY, |acc, (ci, &c)| {
                        log_add(acc, ctx.log_priors[c] + pair[[ci, d, i]])
                    })
            });
            let matches = get_matches(&joint.view(), ctx.sample, nulls, dup, rng)?;
            for (ci, &c) in ctx.clusters.iter().enumerate() {
                apply_matches(ctx, scratch, c, pair.slice(s![ci, .., ..]), &matches);
            }
            any_matched = !matches.is_empty();
        } else {
            for (ci, &c) in ctx.clusters.iter().enumerate() {
                let scores = pair.slice(s![ci, .., ..]);
                let matches = get_matches(&scores, ctx.sample, nulls, dup, rng)?;
                apply_matches(ctx, scratch, c, scores, &matches);
                any_matched |= !matches.is_empty();
            }
        }
        Ok(if any_matched {
            ctx.config.con_prob_boost_factor
        } else {
            0.0
        })
    }
}

fn pair_scores(
    ctx: &PointContext<'_>,
    scratch: &mut PointScratch,
    cluster: usize,
    mut out: ndarray::ArrayViewMut2<'_, f64>,
) {
    let first = ctx.first_level();
    let PointScratch {
        cache, log_v, levels, ..
    } = scratch;
    for ((d, i), slot) in out.indexed_iter_mut() {
        for (lo, v) in levels.iter_mut().enumerate() {
            *v = pair_level_log(ctx, cache, log_v[[cluster, lo]], cluster, first + lo, d, i);
        }
        *slot = logsumexp(levels);
    }
}

/// Write indicators and the cluster score for one matching.
fn apply_matches(
    ctx: &PointContext<'_>,
    scratch: &mut PointScratch,
    cluster: usize,
    scores: ArrayView2<'_, f64>,
    matches: &Matches,
) {
    let first = ctx.first_level();
    let PointScratch {
        cache,
        indicators,
        log_v,
        cluster_ll,
        levels,
        ..
    } = scratch;
    let num_dis = ctx.point.num_discrete();
    for d in 0..num_dis {
        indicators.mark_dis_not_applicable(cluster, d);
    }
    for i in 0..ctx.point.num_continuous() {
        indicators.mark_con_not_applicable(cluster, i);
    }

    let mut uses = vec![0usize; num_dis];
    let mut total = 0.0;
    for &(d, i) in &matches.pairs {
        for (lo, v) in levels.iter_mut().enumerate() {
            *v = pair_level_log(ctx, cache, log_v[[cluster, lo]], cluster, first + lo, d, i);
        }
        normalize_log_in_place(levels);
        for (lo, &r) in levels.iter().enumerate() {
            indicators.set_con(cluster, lo, i, r);
            let prev = if uses[d] == 0 { 0.0 } else { indicators.dis(cluster, lo, d) };
            indicators.set_dis(cluster, lo, d, prev + r);
        }
        uses[d] += 1;
        total += scores[[d, i]];
    }
    // A duplicated discrete item carries the average of its matches.
    for (d, &n) in uses.iter().enumerate() {
        if n < 2 {
            continue;
        }
        for lo in 0..levels.len() {
            let r = indicators.dis(cluster, lo, d);
            indicators.set_dis(cluster, lo, d, r / n as f64);
        }
    }
    cluster_ll[cluster] = if matches.is_empty() {
        0.0
    } else {
        total / matches.len() as f64
    };
}
