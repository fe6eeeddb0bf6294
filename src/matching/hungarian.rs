//! Minimum-cost assignment (Kuhn–Munkres with potentials), O(n²m).

use ndarray::{Array2, ArrayView2};

/// Assign each row of `cost` to a distinct column, minimizing total cost.
///
/// Returns, per row, the assigned column. When there are more rows than
/// columns some rows stay unassigned.
pub fn assign(cost: &ArrayView2<'_, f64>) -> Vec<Option<usize>> {
    let (rows, cols) = cost.dim();
    if rows == 0 || cols == 0 {
        return vec![None; rows];
    }
    if rows <= cols {
        return assign_wide(cost);
    }
    // Solve the transpose, then invert the column-to-row answer.
    let transposed: Array2<f64> = cost.t().to_owned();
    let by_col = assign_wide(&transposed.view());
    let mut by_row = vec![None; rows];
    for (col, row) in by_col.into_iter().enumerate() {
        if let Some(row) = row {
            by_row[row] = Some(col);
        }
    }
    by_row
}

/// `rows <= cols`: every row gets a column.
fn assign_wide(cost: &ArrayView2<'_, f64>) -> Vec<Option<usize>> {
    let (n, m) = cost.dim();
    // 1-indexed; index 0 is the virtual start column.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        owner[0] = i;
        let mut j0 = 0usize;
        let mut min_v = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if cur < min_v[j] {
                    min_v[j] = cur;
                    way[j] = j0;
                }
                if min_v[j] < delta {
                    delta = min_v[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_v[j] -= delta;
                }
            }
            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut by_row = vec![None; n];
    for j in 1..=m {
        if owner[j] != 0 {
            by_row[owner[j] - 1] = Some(j - 1);
        }
    }
    by_row
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    fn total(cost: &Array2<f64>, a: &[Option<usize>]) -> f64 {
        a.iter()
            .enumerate()
            .filter_map(|(r, c)| c.map(|c| cost[[r, c]]))
            .sum()
    }

    fn brute_force(cost: &Array2<f64>) -> f64 {
        // rows <= cols, small sizes only
        fn go(cost: &Array2<f64>, row: usize, used: &mut Vec<bool>) -> f64 {
            if row == cost.nrows() {
                return 0.0;
            }
            let mut best = f64::INFINITY;
            for c in 0..cost.ncols() {
                if !used[c] {
                    used[c] = true;
                    best = best.min(cost[[row, c]] + go(cost, row + 1, used));
                    used[c] = false;
                }
            }
            best
        }
        go(cost, 0, &mut vec![false; cost.ncols()])
    }

    #[test]
    fn test_classic_instance() {
        let cost = array![[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let a = assign(&cost.view());
        assert_eq!(total(&cost, &a), 5.0);
    }

    #[test]
    fn test_tall_matrix_leaves_rows_free() {
        let cost = array![[1.0], [0.0], [2.0]];
        let a = assign(&cost.view());
        assert_eq!(a, vec![None, Some(0), None]);
    }

    proptest! {
        #[test]
        fn matches_brute_force(vals in proptest::collection::vec(0.0f64..10.0, 12)) {
            let cost = Array2::from_shape_vec((3, 4), vals).unwrap();
            let a = assign(&cost.view());
            prop_assert!(a.iter().all(Option::is_some));
            prop_assert!((total(&cost, &a) - brute_force(&cost)).abs() < 1e-9);
        }
    }
}
