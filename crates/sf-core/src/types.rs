//! Common result types for Skyfit

use serde::{Deserialize, Serialize};

/// Result of a likelihood fit.
///
/// Parameter values and covariance are trustworthy only when `converged`
/// is true; a non-converged result carries best-effort values for
/// inspection, flagged unreliable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Free-parameter names, in optimizer order.
    pub parameter_names: Vec<String>,

    /// Best-fit parameter values.
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal).
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if Hessian inversion failed.
    pub covariance: Option<Vec<f64>>,

    /// Minimized fit statistic (Cash) at the best-fit point.
    pub stat: f64,

    /// Convergence status.
    pub converged: bool,

    /// Optimizer iterations.
    pub n_iter: u64,

    /// Objective evaluations.
    pub n_fev: usize,

    /// Gradient evaluations.
    pub n_gev: usize,

    /// Optimizer termination message.
    pub message: String,

    /// Identifiability warnings (empty when the model is well identified).
    pub warnings: Vec<String>,
}

impl FitResult {
    /// Look up a best-fit value by parameter name.
    pub fn value(&self, name: &str) -> Option<f64> {
        let idx = self.parameter_names.iter().position(|n| n == name)?;
        Some(self.parameters[idx])
    }

    /// Look up an uncertainty by parameter name.
    pub fn uncertainty(&self, name: &str) -> Option<f64> {
        let idx = self.parameter_names.iter().position(|n| n == name)?;
        Some(self.uncertainties[idx])
    }

    /// Correlation matrix element (i, j). `None` if covariance is unavailable
    /// or either uncertainty is non-positive.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(cov[i * n + j] / (sigma_i * sigma_j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy() -> FitResult {
        FitResult {
            parameter_names: vec!["a".into(), "b".into()],
            parameters: vec![1.0, 2.0],
            uncertainties: vec![0.1, 0.2],
            covariance: Some(vec![0.01, 0.002, 0.002, 0.04]),
            stat: 123.4,
            converged: true,
            n_iter: 12,
            n_fev: 40,
            n_gev: 13,
            message: "converged".into(),
            warnings: vec![],
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let r = dummy();
        assert_eq!(r.value("b"), Some(2.0));
        assert_eq!(r.uncertainty("a"), Some(0.1));
        assert_eq!(r.value("c"), None);
    }

    #[test]
    fn test_correlation() {
        let r = dummy();
        let c = r.correlation(0, 1).unwrap();
        assert!((c - 0.002 / (0.1 * 0.2)).abs() < 1e-12);
        assert_eq!(r.correlation(0, 2), None);
    }
}
