//! Energy axes.
//!
//! An axis is an ordered, strictly increasing sequence of bin edges in TeV.
//! Reconstructed-energy axes address counts/background cubes; true-energy
//! axes address exposure cubes and response kernels.

use sf_core::{Error, Result};
use std::ops::Range;

/// Relative tolerance used when matching edges between axes.
const EDGE_RTOL: f64 = 1e-6;

/// An energy axis with ordered bin edges (TeV).
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyAxis {
    edges: Vec<f64>,
}

impl EnergyAxis {
    /// Build an axis from explicit edges. Edges must be positive, strictly
    /// increasing, and at least two.
    pub fn from_edges(edges: Vec<f64>) -> Result<Self> {
        if edges.len() < 2 {
            return Err(Error::Validation(format!(
                "energy axis needs at least 2 edges, got {}",
                edges.len()
            )));
        }
        if edges[0] <= 0.0 || !edges[0].is_finite() {
            return Err(Error::Validation(format!(
                "energy axis edges must be positive and finite, first edge = {}",
                edges[0]
            )));
        }
        for w in edges.windows(2) {
            if !(w[1] > w[0]) || !w[1].is_finite() {
                return Err(Error::Validation(format!(
                    "energy axis edges must be strictly increasing, got {} then {}",
                    w[0], w[1]
                )));
            }
        }
        Ok(Self { edges })
    }

    /// Build a logarithmically spaced axis between `e_min` and `e_max`.
    pub fn from_bounds(e_min: f64, e_max: f64, n_bins: usize) -> Result<Self> {
        if n_bins == 0 {
            return Err(Error::Validation("energy axis needs at least 1 bin".to_string()));
        }
        if !(e_min > 0.0 && e_max > e_min) {
            return Err(Error::Validation(format!(
                "invalid energy bounds: ({e_min}, {e_max})"
            )));
        }
        let log_min = e_min.ln();
        let step = (e_max.ln() - log_min) / n_bins as f64;
        let edges: Vec<f64> = (0..=n_bins).map(|i| (log_min + i as f64 * step).exp()).collect();
        Self::from_edges(edges)
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Bin edges.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Lower/upper edge of bin `k`.
    pub fn bin_edges(&self, k: usize) -> (f64, f64) {
        (self.edges[k], self.edges[k + 1])
    }

    /// Geometric (log) center of bin `k`.
    pub fn center(&self, k: usize) -> f64 {
        (self.edges[k] * self.edges[k + 1]).sqrt()
    }

    /// All bin centers.
    pub fn centers(&self) -> Vec<f64> {
        (0..self.n_bins()).map(|k| self.center(k)).collect()
    }

    /// Width of bin `k`.
    pub fn width(&self, k: usize) -> f64 {
        self.edges[k + 1] - self.edges[k]
    }

    /// First and last edge.
    pub fn bounds(&self) -> (f64, f64) {
        (self.edges[0], self.edges[self.edges.len() - 1])
    }

    /// Index of the bin containing `energy`, or `None` when outside the axis.
    /// The upper edge of the last bin is inclusive.
    pub fn bin_index(&self, energy: f64) -> Option<usize> {
        let (lo, hi) = self.bounds();
        if !(energy >= lo && energy <= hi) {
            return None;
        }
        if energy == hi {
            return Some(self.n_bins() - 1);
        }
        // Edges are sorted; partition_point gives the first edge > energy.
        let idx = self.edges.partition_point(|&e| e <= energy);
        Some(idx - 1)
    }

    /// Whether this axis covers the full range of `other`.
    pub fn spans(&self, other: &EnergyAxis) -> bool {
        let (lo, hi) = self.bounds();
        let (olo, ohi) = other.bounds();
        lo <= olo * (1.0 + EDGE_RTOL) && hi >= ohi * (1.0 - EDGE_RTOL)
    }

    /// Contiguous bin range whose edges coincide with `(e_min, e_max)`.
    ///
    /// Estimation bins must align with the axis binning; misaligned edges
    /// are a configuration error, not silently snapped.
    pub fn group_range(&self, e_min: f64, e_max: f64) -> Result<Range<usize>> {
        let find = |target: f64| -> Option<usize> {
            self.edges
                .iter()
                .position(|&e| (e - target).abs() <= EDGE_RTOL * target.abs().max(f64::MIN_POSITIVE))
        };
        let lo = find(e_min).ok_or_else(|| {
            Error::Validation(format!("energy {e_min} TeV does not match any axis edge"))
        })?;
        let hi = find(e_max).ok_or_else(|| {
            Error::Validation(format!("energy {e_max} TeV does not match any axis edge"))
        })?;
        if hi <= lo {
            return Err(Error::Validation(format!(
                "empty energy group: ({e_min}, {e_max}) TeV"
            )));
        }
        Ok(lo..hi)
    }

    /// Sub-axis over the given bin range.
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.end > self.n_bins() || range.is_empty() {
            return Err(Error::Validation(format!(
                "invalid axis slice {:?} for {} bins",
                range,
                self.n_bins()
            )));
        }
        Self::from_edges(self.edges[range.start..=range.end].to_vec())
    }

    /// Approximate equality of two axes, edge by edge.
    pub fn approx_eq(&self, other: &EnergyAxis) -> bool {
        self.edges.len() == other.edges.len()
            && self
                .edges
                .iter()
                .zip(other.edges.iter())
                .all(|(&a, &b)| (a - b).abs() <= EDGE_RTOL * a.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_bounds_log_spacing() {
        let axis = EnergyAxis::from_bounds(0.1, 10.0, 2).unwrap();
        assert_eq!(axis.n_bins(), 2);
        assert_relative_eq!(axis.edges()[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(axis.center(0), (0.1_f64).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_from_edges_rejects_unordered() {
        assert!(EnergyAxis::from_edges(vec![1.0, 0.5, 2.0]).is_err());
        assert!(EnergyAxis::from_edges(vec![1.0]).is_err());
        assert!(EnergyAxis::from_edges(vec![-1.0, 1.0]).is_err());
    }

    #[test]
    fn test_bin_index() {
        let axis = EnergyAxis::from_edges(vec![1.0, 2.0, 4.0, 8.0]).unwrap();
        assert_eq!(axis.bin_index(1.5), Some(0));
        assert_eq!(axis.bin_index(2.0), Some(1));
        assert_eq!(axis.bin_index(8.0), Some(2));
        assert_eq!(axis.bin_index(0.5), None);
        assert_eq!(axis.bin_index(9.0), None);
    }

    #[test]
    fn test_group_range_alignment() {
        let axis = EnergyAxis::from_edges(vec![1.0, 2.0, 4.0, 8.0]).unwrap();
        assert_eq!(axis.group_range(2.0, 8.0).unwrap(), 1..3);
        assert!(axis.group_range(1.5, 8.0).is_err());
    }

    #[test]
    fn test_spans_and_slice() {
        let wide = EnergyAxis::from_bounds(0.1, 100.0, 10).unwrap();
        let narrow = EnergyAxis::from_bounds(0.3, 20.0, 5).unwrap();
        assert!(wide.spans(&narrow));
        assert!(!narrow.spans(&wide));

        let sub = wide.slice(2..5).unwrap();
        assert_eq!(sub.n_bins(), 3);
        assert_relative_eq!(sub.edges()[0], wide.edges()[2], epsilon = 1e-12);
    }
}
