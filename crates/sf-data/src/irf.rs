//! In-memory instrument response functions.
//!
//! Responses are defined on a true-energy grid and an offset grid relative
//! to the pointing direction (background rates on reconstructed energy).
//! Parsing them from instrument files is an external collaborator's job;
//! this module provides the table types, interpolation, and the projection
//! onto local dataset grids (`PsfKernel`, `EdispKernel`).

use ndarray::{Array2, Array3, s};
use sf_core::{Error, Result};
use sf_maps::convolve;
use sf_maps::EnergyAxis;
use statrs::function::erf::erf;

/// m² → cm².
pub const M2_TO_CM2: f64 = 1e4;

/// Linear interpolation index/weight on a sorted grid, clamped at the ends.
/// A single-node grid pins the lookup to that node.
fn interp_weight(grid: &[f64], x: f64) -> (usize, f64) {
    if grid.len() < 2 || x <= grid[0] {
        return (0, 0.0);
    }
    if x >= grid[grid.len() - 1] {
        return (grid.len() - 2, 1.0);
    }
    let hi = grid.partition_point(|&g| g <= x);
    let lo = hi - 1;
    let w = (x - grid[lo]) / (grid[hi] - grid[lo]);
    (lo, w)
}

/// Log-energy interpolation of a per-bin table evaluated at axis centers.
fn interp_log_energy(centers: &[f64], values: &[f64], energy: f64) -> f64 {
    if values.len() < 2 {
        return values[0];
    }
    let logs: Vec<f64> = centers.iter().map(|e| e.ln()).collect();
    let (lo, w) = interp_weight(&logs, energy.ln());
    values[lo] * (1.0 - w) + values[lo + 1] * w
}

fn validate_offsets(offset_deg: &[f64]) -> Result<()> {
    if offset_deg.len() < 2 {
        return Err(Error::Validation("offset grid needs at least 2 nodes".to_string()));
    }
    if offset_deg[0] < 0.0 {
        return Err(Error::Validation("offsets must be non-negative".to_string()));
    }
    for w in offset_deg.windows(2) {
        if !(w[1] > w[0]) {
            return Err(Error::Validation("offset grid must be strictly increasing".to_string()));
        }
    }
    Ok(())
}

/// Effective area table over (true energy, offset), in m².
#[derive(Debug, Clone)]
pub struct EffectiveArea {
    offset_deg: Vec<f64>,
    energy: EnergyAxis,
    /// Shape (n_energy, n_offset).
    values: Array2<f64>,
}

impl EffectiveArea {
    /// Build from a table. `values` has shape `(energy.n_bins(), offsets)`.
    pub fn new(offset_deg: Vec<f64>, energy: EnergyAxis, values: Array2<f64>) -> Result<Self> {
        validate_offsets(&offset_deg)?;
        if values.dim() != (energy.n_bins(), offset_deg.len()) {
            return Err(Error::Validation(format!(
                "effective area table shape {:?} does not match ({}, {})",
                values.dim(),
                energy.n_bins(),
                offset_deg.len()
            )));
        }
        Ok(Self { offset_deg, energy, values })
    }

    /// Flat response: `value_m2` everywhere inside `offset_max_deg`.
    pub fn constant(offset_max_deg: f64, energy: EnergyAxis, value_m2: f64) -> Result<Self> {
        let values = Array2::from_elem((energy.n_bins(), 2), value_m2);
        Self::new(vec![0.0, offset_max_deg], energy, values)
    }

    /// Maximum tabulated offset (deg); the response is zero beyond it.
    pub fn offset_max(&self) -> f64 {
        self.offset_deg[self.offset_deg.len() - 1]
    }

    /// Effective area (m²) at the given offset and true energy, bilinear in
    /// (offset, log energy), zero outside the offset range.
    pub fn value(&self, offset_deg: f64, energy_tev: f64) -> f64 {
        if offset_deg > self.offset_max() || offset_deg < 0.0 {
            return 0.0;
        }
        let (io, wo) = interp_weight(&self.offset_deg, offset_deg);
        let centers = self.energy.centers();
        let col_lo: Vec<f64> = self.values.column(io).to_vec();
        let col_hi: Vec<f64> = self.values.column(io + 1).to_vec();
        let v_lo = interp_log_energy(&centers, &col_lo, energy_tev);
        let v_hi = interp_log_energy(&centers, &col_hi, energy_tev);
        v_lo * (1.0 - wo) + v_hi * wo
    }

    /// On-axis effective-area curve at the centers of `energy_true`.
    pub fn on_axis_curve(&self, energy_true: &EnergyAxis) -> Vec<f64> {
        energy_true.centers().iter().map(|&e| self.value(0.0, e)).collect()
    }
}

/// Background rate table over (reconstructed energy, offset),
/// in s⁻¹ sr⁻¹ TeV⁻¹.
#[derive(Debug, Clone)]
pub struct BackgroundRateModel {
    offset_deg: Vec<f64>,
    energy: EnergyAxis,
    /// Shape (n_energy, n_offset).
    values: Array2<f64>,
}

impl BackgroundRateModel {
    /// Build from a table. `values` has shape `(energy.n_bins(), offsets)`.
    pub fn new(offset_deg: Vec<f64>, energy: EnergyAxis, values: Array2<f64>) -> Result<Self> {
        validate_offsets(&offset_deg)?;
        if values.dim() != (energy.n_bins(), offset_deg.len()) {
            return Err(Error::Validation(format!(
                "background table shape {:?} does not match ({}, {})",
                values.dim(),
                energy.n_bins(),
                offset_deg.len()
            )));
        }
        Ok(Self { offset_deg, energy, values })
    }

    /// Flat rate everywhere inside `offset_max_deg`.
    pub fn constant(offset_max_deg: f64, energy: EnergyAxis, rate: f64) -> Result<Self> {
        let values = Array2::from_elem((energy.n_bins(), 2), rate);
        Self::new(vec![0.0, offset_max_deg], energy, values)
    }

    /// Offset-flat rate with one value per energy bin.
    pub fn from_spectrum(offset_max_deg: f64, energy: EnergyAxis, rates: &[f64]) -> Result<Self> {
        if rates.len() != energy.n_bins() {
            return Err(Error::Validation(format!(
                "spectrum length {} does not match {} energy bins",
                rates.len(),
                energy.n_bins()
            )));
        }
        let mut values = Array2::zeros((energy.n_bins(), 2));
        for (k, &r) in rates.iter().enumerate() {
            values[(k, 0)] = r;
            values[(k, 1)] = r;
        }
        Self::new(vec![0.0, offset_max_deg], energy, values)
    }

    /// Maximum tabulated offset (deg).
    pub fn offset_max(&self) -> f64 {
        self.offset_deg[self.offset_deg.len() - 1]
    }

    /// Rate at the given offset and reconstructed energy; zero outside the
    /// offset range.
    pub fn value(&self, offset_deg: f64, energy_tev: f64) -> f64 {
        if offset_deg > self.offset_max() || offset_deg < 0.0 {
            return 0.0;
        }
        let (io, wo) = interp_weight(&self.offset_deg, offset_deg);
        let centers = self.energy.centers();
        let col_lo: Vec<f64> = self.values.column(io).to_vec();
        let col_hi: Vec<f64> = self.values.column(io + 1).to_vec();
        let v_lo = interp_log_energy(&centers, &col_lo, energy_tev);
        let v_hi = interp_log_energy(&centers, &col_hi, energy_tev);
        v_lo * (1.0 - wo) + v_hi * wo
    }
}

/// Gaussian energy-resolution model over true energy.
#[derive(Debug, Clone)]
pub struct EnergyDispersion {
    energy: EnergyAxis,
    /// Relative resolution sigma(E)/E per true-energy bin.
    sigma_rel: Vec<f64>,
}

impl EnergyDispersion {
    /// Build from per-bin relative resolutions.
    pub fn new(energy: EnergyAxis, sigma_rel: Vec<f64>) -> Result<Self> {
        if sigma_rel.len() != energy.n_bins() {
            return Err(Error::Validation(format!(
                "resolution length {} does not match {} energy bins",
                sigma_rel.len(),
                energy.n_bins()
            )));
        }
        if sigma_rel.iter().any(|&s| s < 0.0 || !s.is_finite()) {
            return Err(Error::Validation("resolutions must be finite and >= 0".to_string()));
        }
        Ok(Self { energy, sigma_rel })
    }

    /// Energy-independent relative resolution.
    pub fn constant(energy: EnergyAxis, sigma_rel: f64) -> Result<Self> {
        let n = energy.n_bins();
        Self::new(energy, vec![sigma_rel; n])
    }

    /// Migration matrix from `energy_true` bins into `energy_reco` bins.
    ///
    /// Rows need not sum to one: events migrating outside the reconstructed
    /// range are lost, which is physical.
    pub fn kernel(&self, energy_true: &EnergyAxis, energy_reco: &EnergyAxis) -> Result<EdispKernel> {
        let n_true = energy_true.n_bins();
        let n_reco = energy_reco.n_bins();
        let mut pdf = Array2::<f64>::zeros((n_true, n_reco));

        let own_centers = self.energy.centers();
        for (t, &e_t) in energy_true.centers().iter().enumerate() {
            let sigma_rel = interp_log_energy(&own_centers, &self.sigma_rel, e_t);
            let sigma = sigma_rel * e_t;
            if sigma < 1e-12 * e_t {
                // Delta response: everything lands in the containing bin.
                if let Some(r) = energy_reco.bin_index(e_t) {
                    pdf[(t, r)] = 1.0;
                }
                continue;
            }
            let denom = sigma * std::f64::consts::SQRT_2;
            for r in 0..n_reco {
                let (lo, hi) = energy_reco.bin_edges(r);
                pdf[(t, r)] = 0.5 * (erf((hi - e_t) / denom) - erf((lo - e_t) / denom));
            }
        }

        EdispKernel::new(energy_true.clone(), energy_reco.clone(), pdf)
    }
}

/// Migration matrix mapping true-energy planes to reconstructed-energy
/// planes. Shape `(n_true, n_reco)`.
#[derive(Debug, Clone)]
pub struct EdispKernel {
    energy_true: EnergyAxis,
    energy_reco: EnergyAxis,
    pdf: Array2<f64>,
}

impl EdispKernel {
    /// Build from an explicit matrix.
    pub fn new(energy_true: EnergyAxis, energy_reco: EnergyAxis, pdf: Array2<f64>) -> Result<Self> {
        if pdf.dim() != (energy_true.n_bins(), energy_reco.n_bins()) {
            return Err(Error::Validation(format!(
                "edisp matrix shape {:?} does not match ({}, {})",
                pdf.dim(),
                energy_true.n_bins(),
                energy_reco.n_bins()
            )));
        }
        Ok(Self { energy_true, energy_reco, pdf })
    }

    /// True-energy axis.
    pub fn energy_true(&self) -> &EnergyAxis {
        &self.energy_true
    }

    /// Reconstructed-energy axis.
    pub fn energy_reco(&self) -> &EnergyAxis {
        &self.energy_reco
    }

    /// Migration matrix.
    pub fn pdf(&self) -> &Array2<f64> {
        &self.pdf
    }

    /// Fold a true-energy cube into reconstructed energy:
    /// `out[r] = Σ_t pdf[t, r] * cube[t]`.
    pub fn apply(&self, cube_true: &Array3<f64>) -> Result<Array3<f64>> {
        let (nt, ny, nx) = cube_true.dim();
        if nt != self.energy_true.n_bins() {
            return Err(Error::Validation(format!(
                "cube has {} true-energy planes, kernel expects {}",
                nt,
                self.energy_true.n_bins()
            )));
        }
        let n_reco = self.energy_reco.n_bins();
        let mut out = Array3::<f64>::zeros((n_reco, ny, nx));
        for t in 0..nt {
            let plane = cube_true.slice(s![t, .., ..]);
            for r in 0..n_reco {
                let w = self.pdf[(t, r)];
                if w == 0.0 {
                    continue;
                }
                out.slice_mut(s![r, .., ..]).scaled_add(w, &plane);
            }
        }
        Ok(out)
    }

    /// Kernel restricted to a contiguous reconstructed-energy bin range.
    pub fn slice_reco(&self, range: std::ops::Range<usize>) -> Result<EdispKernel> {
        let axis = self.energy_reco.slice(range.clone())?;
        let pdf = self.pdf.slice(s![.., range]).to_owned();
        EdispKernel::new(self.energy_true.clone(), axis, pdf)
    }

    /// Exposure-weighted average with another kernel (same axes).
    pub fn weighted_mean(&self, other: &EdispKernel, w_self: f64, w_other: f64) -> Result<EdispKernel> {
        if !self.energy_true.approx_eq(&other.energy_true)
            || !self.energy_reco.approx_eq(&other.energy_reco)
        {
            return Err(Error::Validation("cannot average edisp kernels on different axes".to_string()));
        }
        let w_sum = w_self + w_other;
        if w_sum <= 0.0 {
            return Ok(self.clone());
        }
        let pdf = (&self.pdf * w_self + &other.pdf * w_other) / w_sum;
        EdispKernel::new(self.energy_true.clone(), self.energy_reco.clone(), pdf)
    }
}

/// Gaussian point-spread-function model over true energy.
#[derive(Debug, Clone)]
pub struct PsfModel {
    energy: EnergyAxis,
    /// 68%-containment-like Gaussian width (deg) per true-energy bin.
    sigma_deg: Vec<f64>,
}

impl PsfModel {
    /// Build from per-bin widths.
    pub fn new(energy: EnergyAxis, sigma_deg: Vec<f64>) -> Result<Self> {
        if sigma_deg.len() != energy.n_bins() {
            return Err(Error::Validation(format!(
                "psf width length {} does not match {} energy bins",
                sigma_deg.len(),
                energy.n_bins()
            )));
        }
        if sigma_deg.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(Error::Validation("psf widths must be finite and > 0".to_string()));
        }
        Ok(Self { energy, sigma_deg })
    }

    /// Energy-independent width.
    pub fn constant(energy: EnergyAxis, sigma_deg: f64) -> Result<Self> {
        let n = energy.n_bins();
        Self::new(energy, vec![sigma_deg; n])
    }

    /// Kernel cube on a local pixel grid: one normalized Gaussian plane per
    /// bin of `energy_true`, all planes sharing a fixed size set by
    /// `max_radius_deg`.
    pub fn kernel(
        &self,
        binsz_deg: f64,
        energy_true: &EnergyAxis,
        max_radius_deg: f64,
    ) -> Result<PsfKernel> {
        if !(binsz_deg > 0.0 && max_radius_deg > 0.0) {
            return Err(Error::Validation(format!(
                "invalid psf kernel grid: binsz={binsz_deg}, max_radius={max_radius_deg}"
            )));
        }
        let half = (max_radius_deg / binsz_deg).ceil() as isize;
        let size = (2 * half + 1) as usize;
        let n_true = energy_true.n_bins();
        let mut data = Array3::<f64>::zeros((n_true, size, size));

        let own_centers = self.energy.centers();
        for (t, &e_t) in energy_true.centers().iter().enumerate() {
            let sigma = interp_log_energy(&own_centers, &self.sigma_deg, e_t);
            let sigma_pix = (sigma / binsz_deg).max(1e-3);
            let inv_two_sigma2 = 1.0 / (2.0 * sigma_pix * sigma_pix);
            let mut sum = 0.0;
            for iy in -half..=half {
                for ix in -half..=half {
                    let r2 = (ix * ix + iy * iy) as f64;
                    let v = (-r2 * inv_two_sigma2).exp();
                    data[(t, (iy + half) as usize, (ix + half) as usize)] = v;
                    sum += v;
                }
            }
            data.slice_mut(s![t, .., ..]).mapv_inplace(|v| v / sum);
        }

        PsfKernel::new(energy_true.clone(), data)
    }
}

/// PSF kernel cube: one normalized convolution kernel per true-energy bin.
#[derive(Debug, Clone)]
pub struct PsfKernel {
    energy_true: EnergyAxis,
    /// Shape (n_true, k, k), odd k.
    data: Array3<f64>,
}

impl PsfKernel {
    /// Build from an explicit cube.
    pub fn new(energy_true: EnergyAxis, data: Array3<f64>) -> Result<Self> {
        let (nt, ky, kx) = data.dim();
        if nt != energy_true.n_bins() {
            return Err(Error::Validation(format!(
                "psf kernel has {} planes, axis has {} bins",
                nt,
                energy_true.n_bins()
            )));
        }
        if ky % 2 == 0 || kx % 2 == 0 || ky != kx {
            return Err(Error::Validation(format!(
                "psf kernel planes must be square with odd size, got ({ky}, {kx})"
            )));
        }
        Ok(Self { energy_true, data })
    }

    /// True-energy axis.
    pub fn energy_true(&self) -> &EnergyAxis {
        &self.energy_true
    }

    /// Kernel cube.
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// Convolve each true-energy plane of `cube` with its kernel plane.
    pub fn apply(&self, cube_true: &Array3<f64>) -> Result<Array3<f64>> {
        convolve::convolve_cube_per_plane(cube_true, &self.data)
    }

    /// Exposure-weighted average with another kernel (same axis and size).
    pub fn weighted_mean(&self, other: &PsfKernel, w_self: f64, w_other: f64) -> Result<PsfKernel> {
        if !self.energy_true.approx_eq(&other.energy_true) || self.data.dim() != other.data.dim() {
            return Err(Error::Validation(
                "cannot average psf kernels with different axes or sizes".to_string(),
            ));
        }
        let w_sum = w_self + w_other;
        if w_sum <= 0.0 {
            return Ok(self.clone());
        }
        let data = (&self.data * w_self + &other.data * w_other) / w_sum;
        PsfKernel::new(self.energy_true.clone(), data)
    }
}
