//! Model 5: matched pairs are assigned hard to blocks of tied levels.
//!
//! Levels are grouped into blocks of `discrete_tie_count`. A pair's score is
//! its best block:
//!
//! ```text
//! s_c(d, i) = max_b ln Σ_{l ∈ b} V[c,l] P(w_d | l)^β_d N(x_i | l)^β_c
//! ```
//!
//! After matching, every leftover continuous item picks the block that
//! maximizes its own score plus an adjacency bonus towards the blocks of
//! already matched neighbours; leftover discrete items pick their best block
//! alone. Responsibilities are zero outside the chosen block. The cluster
//! score is the weighted sum over all pairs and leftovers:
//!
//! ```text
//! ll_c = Σ_(d,i) u_i s_c(d, i) + Σ_i' u_i' s_c(i') + Σ_d' m_d' s_c(d')
//! ```
//!
//! with `u` the continuous weight times its item factor and `m` the discrete
//! multiplicity times its factor. A pair is weighted by its continuous item,
//! which keeps the `con_log_norm` correction equal to model 0's.

use super::{pair_level_log, CorrespondenceStrategy, PointContext};
use crate::error::Result;
use crate::matching::get_matches;
use crate::numeric::{argmax, normalize_log_in_place};
use crate::scratch::{ContinuousProbCache, LevelIndicators, PointScratch};
use ndarray::Array2;
use rand::rngs::StdRng;
use std::ops::Range;

/// Block-assigned correspondence.
#[derive(Debug, Clone, Copy, Default)]
pub struct Block;

impl CorrespondenceStrategy for Block {
    fn name(&self) -> &'static str {
        "block"
    }

    fn needs_both_modalities(&self) -> bool {
        true
    }

    fn uses_matching(&self) -> bool {
        true
    }

    fn score_point(&self, ctx: &PointContext<'_>, scratch: &mut PointScratch, rng: &mut StdRng) -> Result<f64> {
        let PointScratch {
            cache,
            indicators,
            log_v,
            cluster_ll,
            levels,
            ..
        } = scratch;
        let cache: &ContinuousProbCache = cache;
        let topo = ctx.model.topology();
        let first = ctx.first_level();
        let tie = ctx.config.discrete_tie_count;
        let blocks: Vec<Range<usize>> = (0..topo.num_blocks(tie))
            .map(|b| topo.block_levels(b, tie))
            .collect();
        let point = ctx.point;
        let (num_dis, num_con) = (point.num_discrete(), point.num_continuous());
        let nulls = if num_dis != num_con { ctx.config.match_nulls } else { 0 };

        let mut pair = Array2::zeros((num_dis, num_con));
        let mut pair_block = Array2::zeros((num_dis, num_con));
        let mut block_scores = vec![0.0; blocks.len()];

        for &c in ctx.clusters {
            let lv = log_v.row(c);
            for d in 0..num_dis {
                for i in 0..num_con {
                    for (b, range) in blocks.iter().enumerate() {
                        block_scores[b] = block_posterior(levels, range.clone(), |l| {
                            pair_level_log(ctx, cache, lv[l - first], c, l, d, i)
                        });
                    }
                    let best = argmax(&block_scores).unwrap_or(0);
                    pair[[d, i]] = block_scores[best];
                    pair_block[[d, i]] = best;
                }
            }
            let matches = get_matches(&pair.view(), ctx.sample, nulls, ctx.config.duplicate_words_for_matching, rng)?;

            indicators_zero(indicators, c, num_dis, num_con, lv.len());
            let mut con_block: Vec<Option<usize>> = vec![None; num_con];
            let mut dis_uses = vec![0usize; num_dis];
            let mut total = 0.0;

            for &(d, i) in &matches.pairs {
                let b = pair_block[[d, i]];
                let range = blocks[b].clone();
                total += con_weight(ctx, i) * pair[[d, i]];
                block_posterior(levels, range.clone(), |l| {
                    pair_level_log(ctx, cache, lv[l - first], c, l, d, i)
                });
                for (k, l) in range.enumerate() {
                    let lo = l - first;
                    indicators.set_con(c, lo, i, levels[k]);
                    let prev = indicators.dis(c, lo, d);
                    indicators.set_dis(c, lo, d, prev + levels[k]);
                }
                con_block[i] = Some(b);
                dis_uses[d] += 1;
            }
            for (d, &n) in dis_uses.iter().enumerate() {
                if n < 2 {
                    continue;
                }
                for lo in 0..lv.len() {
                    let r = indicators.dis(c, lo, d);
                    indicators.set_dis(c, lo, d, r / n as f64);
                }
            }

            // Leftover continuous items, biased towards neighbours' blocks.
            let matched_blocks = con_block.clone();
            for i in (0..num_con).filter(|&i| matched_blocks[i].is_none()) {
                let mut best: Option<(usize, f64, f64)> = None;
                for (b, range) in blocks.iter().enumerate() {
                    let own = block_posterior(levels, range.clone(), |l| {
                        lv[l - first] + ctx.con_log(cache, c, l, i)
                    });
                    let bonus = adjacency_bonus(ctx, i, b, &matched_blocks);
                    if best.map_or(true, |(_, _, s)| own + bonus > s) {
                        best = Some((b, own, own + bonus));
                    }
                }
                if let Some((b, own, _)) = best {
                    total += con_weight(ctx, i) * own;
                    let range = blocks[b].clone();
                    block_posterior(levels, range.clone(), |l| lv[l - first] + ctx.con_log(cache, c, l, i));
                    for (k, l) in range.enumerate() {
                        indicators.set_con(c, l - first, i, levels[k]);
                    }
                    con_block[i] = Some(b);
                }
            }

            // Leftover discrete items pick their best block.
            for d in (0..num_dis).filter(|&d| dis_uses[d] == 0) {
                let category = point.discrete[d].category;
                for (b, range) in blocks.iter().enumerate() {
                    block_scores[b] = block_posterior(levels, range.clone(), |l| {
                        lv[l - first] + ctx.dis_log(c, l, category)
                    });
                }
                let b = argmax(&block_scores).unwrap_or(0);
                total += point.discrete[d].multiplicity * ctx.dis_factor * block_scores[b];
                let range = blocks[b].clone();
                block_posterior(levels, range.clone(), |l| lv[l - first] + ctx.dis_log(c, l, category));
                for (k, l) in range.enumerate() {
                    indicators.set_dis(c, l - first, d, levels[k]);
                }
            }

            cluster_ll[c] = total;
        }
        Ok(ctx.weighted_con_norm())
    }
}

#[inline]
fn con_weight(ctx: &PointContext<'_>, i: usize) -> f64 {
    ctx.point.continuous[i].weight * ctx.con_factor
}

/// `ln Σ_{l ∈ block} exp(term(l))`. Leaves the within-block posteriors in
/// `buf[..block.len()]`.
fn block_posterior(buf: &mut [f64], block: Range<usize>, term: impl Fn(usize) -> f64) -> f64 {
    let n = block.len();
    for (slot, level) in buf[..n].iter_mut().zip(block) {
        *slot = term(level);
    }
    normalize_log_in_place(&mut buf[..n])
}

fn indicators_zero(indicators: &mut LevelIndicators, cluster: usize, num_dis: usize, num_con: usize, num_levels: usize) {
    for lo in 0..num_levels {
        for d in 0..num_dis {
            indicators.set_dis(cluster, lo, d, 0.0);
        }
        for i in 0..num_con {
            indicators.set_con(cluster, lo, i, 0.0);
        }
    }
}

/// `adjacency_weight · Σ_j adj[i][j]` over matched items `j` in block `b`.
fn adjacency_bonus(ctx: &PointContext<'_>, i: usize, block: usize, con_block: &[Option<usize>]) -> f64 {
    let Some(adj) = &ctx.point.adjacency else {
        return 0.0;
    };
    let sum: f64 = con_block
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == Some(block))
        .map(|(j, _)| adj[[i, j]])
        .sum();
    ctx.config.adjacency_weight * sum
}
