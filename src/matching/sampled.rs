//! Matching by sequential sampling without replacement.
//!
//! Each draw picks an open (discrete, continuous) pair with probability
//! proportional to `exp(log_pair_prob)`, then closes its row and column.
//! With duplicate words a discrete item may be drawn again once every
//! discrete item has been used.

use ndarray::ArrayView2;
use rand::Rng;

/// Draw up to `target` pairs. Returns `(discrete, continuous)` pairs in draw order.
pub fn sample_pairs<R: Rng + ?Sized>(
    log_pair_probs: &ArrayView2<'_, f64>,
    target: usize,
    duplicate_words: bool,
    rng: &mut R,
) -> Vec<(usize, usize)> {
    let (num_dis, num_con) = log_pair_probs.dim();
    let max_lp = log_pair_probs
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    let weight = |d: usize, i: usize| -> f64 {
        let lp = log_pair_probs[[d, i]];
        if lp.is_finite() && max_lp.is_finite() {
            (lp - max_lp).exp()
        } else {
            0.0
        }
    };

    let mut open_dis = vec![true; num_dis];
    let mut open_con = vec![true; num_con];
    let mut pairs = Vec::with_capacity(target);
    while pairs.len() < target {
        if duplicate_words && !open_dis.iter().any(|&o| o) {
            open_dis.iter_mut().for_each(|o| *o = true);
        }
        let mut total = 0.0;
        let mut num_open = 0usize;
        for d in (0..num_dis).filter(|&d| open_dis[d]) {
            for i in (0..num_con).filter(|&i| open_con[i]) {
                total += weight(d, i);
                num_open += 1;
            }
        }
        if num_open == 0 {
            break;
        }
        let uniform = !(total > 0.0 && total.is_finite());
        let mut u = if uniform {
            rng.random::<f64>() * num_open as f64
        } else {
            rng.random::<f64>() * total
        };

        let mut chosen = None;
        let mut last_open = None;
        'draw: for d in (0..num_dis).filter(|&d| open_dis[d]) {
            for i in (0..num_con).filter(|&i| open_con[i]) {
                last_open = Some((d, i));
                let w = if uniform { 1.0 } else { weight(d, i) };
                if u < w {
                    chosen = Some((d, i));
                    break 'draw;
                }
                u -= w;
            }
        }
        // Rounding can walk past the end; fall back to the last open pair.
        let Some((d, i)) = chosen.or(last_open) else {
            break;
        };
        pairs.push((d, i));
        open_dis[d] = false;
        open_con[i] = false;
    }
    pairs
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_dominant_pair_is_drawn_first() {
        let lp = array![[0.0, -200.0], [-200.0, -200.0]];
        let mut rng = StdRng::seed_from_u64(1);
        let pairs = sample_pairs(&lp.view(), 2, false, &mut rng);
        assert_eq!(pairs[0], (0, 0));
        assert_eq!(pairs[1], (1, 1));
    }

    #[test]
    fn test_duplicates_reopen_discrete_items() {
        let lp = array![[0.0, 0.0, 0.0]];
        let mut rng = StdRng::seed_from_u64(5);
        let pairs = sample_pairs(&lp.view(), 3, true, &mut rng);
        assert_eq!(pairs.len(), 3);
        let mut cons: Vec<usize> = pairs.iter().map(|p| p.1).collect();
        cons.sort_unstable();
        assert_eq!(cons, vec![0, 1, 2]);
    }

    #[test]
    fn test_all_zero_probabilities_fall_back_to_uniform() {
        let lp = array![[f64::NEG_INFINITY, f64::NEG_INFINITY]];
        let mut rng = StdRng::seed_from_u64(2);
        let pairs = sample_pairs(&lp.view(), 1, false, &mut rng);
        assert_eq!(pairs.len(), 1);
    }
}
