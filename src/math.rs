use ndarray::Array2;
use num_traits::Float;

/// Replace non-finite values with a fallback.
#[inline]
pub fn finite_or<T: Float>(x: T, fallback: T) -> T {
    if x.is_finite() {
        x
    } else {
        fallback
    }
}

#[inline]
pub fn euclidean(a_row: f64, a_col: f64, b_row: f64, b_col: f64) -> f64 {
    (a_row - b_row).hypot(a_col - b_col)
}

/// Standardize each column to zero mean / unit variance in place, using
/// statistics over the given rows only. Non-finite results (constant
/// columns) become 0.
pub fn standardize_columns(x: &mut Array2<f64>) {
    let n = x.nrows() as f64;
    if n == 0.0 {
        return;
    }

    for mut col in x.columns_mut() {
        let mean = col.sum() / n;
        let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();
        for v in col.iter_mut() {
            *v = finite_or((*v - mean) / std, 0.0);
        }
    }
}

pub fn logsumexp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn standardizes_to_zero_mean_unit_variance() {
        let mut x = array![[1.0, 10.0], [2.0, 10.0], [3.0, 10.0]];
        standardize_columns(&mut x);

        let mean0: f64 = x.column(0).sum() / 3.0;
        assert!(mean0.abs() < 1e-12);
        let var0: f64 = x.column(0).iter().map(|v| v * v).sum::<f64>() / 3.0;
        assert!((var0 - 1.0).abs() < 1e-12);

        // constant column collapses to zeros, not NaN
        assert!(x.column(1).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn logsumexp_matches_naive_sum() {
        let xs = [-1.0, 0.5, 2.0];
        let naive: f64 = xs.iter().map(|x| x.exp()).sum::<f64>().ln();
        assert!((logsumexp(&xs) - naive).abs() < 1e-12);
    }

    #[test]
    fn logsumexp_is_stable_for_large_inputs() {
        let xs = [1000.0, 1000.0];
        assert!((logsumexp(&xs) - (1000.0 + 2.0f64.ln())).abs() < 1e-9);
    }
}
