//! Poisson fit statistics.
//!
//! The Cash statistic for counts `n` with predicted counts `mu` is
//! `2 * (mu - n * ln(mu))`, dropping the `n`-only terms that do not depend
//! on the model. Differences of this statistic between two model points are
//! exact twice-log-likelihood-ratio values, which is all the fit engine and
//! the estimators need.

/// Predicted counts below this value are clipped before taking logs.
pub const MU_MIN: f64 = 1e-25;

/// Cash statistic contribution of a single bin.
#[inline]
pub fn cash(n: f64, mu: f64) -> f64 {
    let mu = mu.max(MU_MIN);
    2.0 * (mu - n * mu.ln())
}

/// Sum of the Cash statistic over paired counts/prediction slices.
pub fn cash_sum(counts: &[f64], npred: &[f64]) -> f64 {
    counts.iter().zip(npred.iter()).map(|(&n, &mu)| cash(n, mu)).sum()
}

/// Detection test statistic for counts `n` against a known background `mu`:
/// twice the log-likelihood ratio between the best-fit signal+background
/// hypothesis (`lambda = n`) and the background-only hypothesis.
#[inline]
pub fn cash_ts(n: f64, mu: f64) -> f64 {
    if mu <= 0.0 {
        return f64::NAN;
    }
    if n <= 0.0 {
        // Likelihood ratio with zero observed counts.
        return 2.0 * mu;
    }
    2.0 * (mu - n + n * (n / mu).ln())
}

/// Signed significance (sqrt of [`cash_ts`], carrying the sign of the excess).
///
/// This is the closed-form, known-background analogue of the Li & Ma
/// significance; no optimization is involved.
#[inline]
pub fn cash_significance(n: f64, mu: f64) -> f64 {
    let ts = cash_ts(n, mu);
    if ts.is_nan() {
        return f64::NAN;
    }
    let sign = if n >= mu { 1.0 } else { -1.0 };
    sign * ts.max(0.0).sqrt()
}
