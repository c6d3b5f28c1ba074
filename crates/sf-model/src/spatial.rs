//! Spatial morphologies.
//!
//! A spatial model maps a geometry to a dimensionless per-pixel template:
//! the fraction of the source flux falling into each pixel. Templates are
//! normalized to unit sum over the map footprint, so multiplying by an
//! integral flux and the exposure yields predicted counts directly.

use crate::params::Parameter;
use ndarray::Array2;
use sf_core::{Error, Result};
use sf_maps::{MapGeom, SkyCoord};

/// A parametric source morphology.
#[derive(Debug, Clone)]
pub enum SpatialModel {
    /// Point source: all flux in the pixel containing the position.
    Point {
        /// Source longitude (deg).
        lon: Parameter,
        /// Source latitude (deg).
        lat: Parameter,
    },
    /// Radially symmetric Gaussian surface brightness.
    Gaussian {
        /// Source longitude (deg).
        lon: Parameter,
        /// Source latitude (deg).
        lat: Parameter,
        /// Gaussian width (deg).
        sigma: Parameter,
    },
    /// Uniform disk.
    Disk {
        /// Source longitude (deg).
        lon: Parameter,
        /// Source latitude (deg).
        lat: Parameter,
        /// Disk radius (deg).
        r0: Parameter,
    },
}

impl SpatialModel {
    /// Point source at the given position.
    pub fn point(lon_deg: f64, lat_deg: f64) -> Self {
        Self::Point {
            lon: Parameter::new("lon", lon_deg),
            lat: Parameter::new("lat", lat_deg).with_bounds(-90.0, 90.0),
        }
    }

    /// Gaussian source.
    pub fn gaussian(lon_deg: f64, lat_deg: f64, sigma_deg: f64) -> Self {
        Self::Gaussian {
            lon: Parameter::new("lon", lon_deg),
            lat: Parameter::new("lat", lat_deg).with_bounds(-90.0, 90.0),
            sigma: Parameter::new("sigma", sigma_deg).with_bounds(1e-4, 10.0),
        }
    }

    /// Uniform disk source.
    pub fn disk(lon_deg: f64, lat_deg: f64, r0_deg: f64) -> Self {
        Self::Disk {
            lon: Parameter::new("lon", lon_deg),
            lat: Parameter::new("lat", lat_deg).with_bounds(-90.0, 90.0),
            r0: Parameter::new("r0", r0_deg).with_bounds(1e-4, 10.0),
        }
    }

    /// Source position.
    pub fn position(&self) -> SkyCoord {
        match self {
            Self::Point { lon, lat }
            | Self::Gaussian { lon, lat, .. }
            | Self::Disk { lon, lat, .. } => SkyCoord::new(lon.value(), lat.value()),
        }
    }

    /// Per-pixel flux fraction on `geom`, unit sum over the footprint.
    ///
    /// Fails with a coverage error when none of the flux lands on the map.
    pub fn evaluate(&self, geom: &MapGeom) -> Result<Array2<f64>> {
        let position = self.position();
        let (ny, nx) = geom.npix();

        let template = match self {
            Self::Point { .. } => {
                let mut t = Array2::<f64>::zeros((ny, nx));
                match geom.pix_index(&position) {
                    Some(idx) => t[idx] = 1.0,
                    None => {
                        return Err(Error::Coverage(format!(
                            "point source at ({:.3}, {:.3}) deg is outside the map",
                            position.lon_deg, position.lat_deg
                        )))
                    }
                }
                t
            }
            Self::Gaussian { sigma, .. } => {
                let s = sigma.value();
                let sep = geom.separation_map(&position);
                sep.mapv(|r| (-0.5 * (r / s).powi(2)).exp())
            }
            Self::Disk { r0, .. } => {
                let r = r0.value();
                let sep = geom.separation_map(&position);
                sep.mapv(|d| if d <= r { 1.0 } else { 0.0 })
            }
        };

        let sum = template.sum();
        if !(sum > 0.0) {
            return Err(Error::Coverage(format!(
                "source at ({:.3}, {:.3}) deg contributes no flux to the map",
                position.lon_deg, position.lat_deg
            )));
        }
        Ok(template / sum)
    }

    /// All parameters.
    pub fn parameters(&self) -> Vec<&Parameter> {
        match self {
            Self::Point { lon, lat } => vec![lon, lat],
            Self::Gaussian { lon, lat, sigma } => vec![lon, lat, sigma],
            Self::Disk { lon, lat, r0 } => vec![lon, lat, r0],
        }
    }

    /// All parameters, mutable.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        match self {
            Self::Point { lon, lat } => vec![lon, lat],
            Self::Gaussian { lon, lat, sigma } => vec![lon, lat, sigma],
            Self::Disk { lon, lat, r0 } => vec![lon, lat, r0],
        }
    }

    /// Freeze the position (and shape) parameters.
    pub fn freeze_all(&mut self) {
        for p in self.parameters_mut() {
            p.freeze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sf_maps::EnergyAxis;

    fn geom() -> MapGeom {
        let axis = EnergyAxis::from_bounds(1.0, 10.0, 1).unwrap();
        MapGeom::new(SkyCoord::new(0.0, 0.0), 0.05, (41, 41), axis).unwrap()
    }

    #[test]
    fn test_point_source_single_pixel() {
        let g = geom();
        let model = SpatialModel::point(0.0, 0.0);
        let t = model.evaluate(&g).unwrap();
        assert_relative_eq!(t.sum(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(t[(20, 20)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_unit_sum_and_peak() {
        let g = geom();
        let model = SpatialModel::gaussian(0.0, 0.0, 0.2);
        let t = model.evaluate(&g).unwrap();
        assert_relative_eq!(t.sum(), 1.0, epsilon = 1e-12);
        let peak = t.iter().cloned().fold(f64::MIN, f64::max);
        assert_relative_eq!(t[(20, 20)], peak, epsilon = 1e-15);
    }

    #[test]
    fn test_disk_support() {
        let g = geom();
        let model = SpatialModel::disk(0.0, 0.0, 0.3);
        let t = model.evaluate(&g).unwrap();
        assert_relative_eq!(t.sum(), 1.0, epsilon = 1e-12);
        // Pixels well outside the radius carry nothing.
        assert_eq!(t[(0, 0)], 0.0);
    }

    #[test]
    fn test_source_off_map_is_coverage_error() {
        let g = geom();
        let model = SpatialModel::point(30.0, 0.0);
        match model.evaluate(&g) {
            Err(Error::Coverage(_)) => {}
            other => panic!("expected coverage error, got {other:?}"),
        }
    }
}
