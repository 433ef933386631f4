//! Small dense vector/matrix helpers shared by the statistics, risk and
//! optimization modules. Matrices are row-major `Vec<Vec<f64>>`; anything
//! that needs a factorization goes through `nalgebra`.

use nalgebra::DMatrix;

/// Dot product.
pub fn vec_dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Matrix-vector multiplication.
pub fn mat_vec_multiply(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    mat.iter().map(|row| vec_dot(row, v)).collect()
}

/// Portfolio variance: w' * Sigma * w.
pub fn portfolio_variance(w: &[f64], sigma: &[Vec<f64>]) -> f64 {
    let sigma_w = mat_vec_multiply(sigma, w);
    vec_dot(w, &sigma_w)
}

/// Portfolio standard deviation, clamped at zero for tiny negative round-off.
pub fn portfolio_std(w: &[f64], sigma: &[Vec<f64>]) -> f64 {
    portfolio_variance(w, sigma).max(0.0).sqrt()
}

/// Sharpe ratio with division-by-zero guard.
pub fn compute_sharpe(ret: f64, rf: f64, risk: f64) -> f64 {
    if risk <= f64::EPSILON {
        0.0
    } else {
        (ret - rf) / risk
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.max(0.0).sqrt()
}

/// Compute the percentile value from a **sorted** slice using linear interpolation.
/// `p` is in [0, 100].
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Sort a copy ascending; NaNs compare equal so they never panic the sort.
pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted
}

/// Equal weights summing to `budget`.
pub fn equal_weights(n: usize, budget: f64) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![budget / n as f64; n]
}

/// Herfindahl-Hirschman index of weights.
pub fn hhi(w: &[f64]) -> f64 {
    w.iter().map(|x| x * x).sum()
}

/// Largest absolute elementwise difference.
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

pub fn to_dmatrix(rows: &[Vec<f64>]) -> DMatrix<f64> {
    let n = rows.len();
    let m = rows.first().map_or(0, Vec::len);
    DMatrix::from_fn(n, m, |i, j| rows[i][j])
}

pub fn from_dmatrix(mat: &DMatrix<f64>) -> Vec<Vec<f64>> {
    (0..mat.nrows())
        .map(|i| (0..mat.ncols()).map(|j| mat[(i, j)]).collect())
        .collect()
}

/// SplitMix64 finalizer; turns (seed, stream index) into well-separated seeds.
pub fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Seed for an independent random stream `stream` derived from a request seed.
pub fn stream_seed(seed: u64, stream: u64) -> u64 {
    splitmix64(seed ^ splitmix64(stream.wrapping_add(1)))
}
