//! Sky coordinates and map geometry.
//!
//! `MapGeom` is the immutable addressing scheme for every array-valued
//! quantity in an analysis: a rectangular pixel grid around a center
//! coordinate crossed with a reconstructed-energy axis. The projection is a
//! flat tangent plane with cos(lat) longitude scaling; full WCS handling is
//! the job of an external collaborator, while cutout/stacking algebra only
//! requires that all geometries in an analysis share one pixel lattice.

use crate::axis::EnergyAxis;
use ndarray::Array2;
use sf_core::{Error, Result};
use std::ops::Range;

/// Tolerance (in pixels) for lattice alignment between geometries.
const ALIGN_TOL: f64 = 1e-3;

/// A sky direction in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyCoord {
    /// Longitude-like angle (deg).
    pub lon_deg: f64,
    /// Latitude-like angle (deg).
    pub lat_deg: f64,
}

impl SkyCoord {
    /// Create a coordinate from degrees.
    pub fn new(lon_deg: f64, lat_deg: f64) -> Self {
        Self { lon_deg, lat_deg }
    }

    /// Great-circle separation to `other` in degrees (haversine).
    pub fn separation(&self, other: &SkyCoord) -> f64 {
        let lat1 = self.lat_deg.to_radians();
        let lat2 = other.lat_deg.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.lon_deg - self.lon_deg).to_radians();
        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        (2.0 * a.sqrt().min(1.0).asin()).to_degrees()
    }
}

/// Pixel ranges of a cutout within its parent geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoutSlices {
    /// Column (x) range in the parent grid.
    pub x: Range<usize>,
    /// Row (y) range in the parent grid.
    pub y: Range<usize>,
}

/// Spatial grid crossed with a reconstructed-energy axis.
///
/// Cutouts keep the parent's projection center, so every geometry derived
/// from one reference grid projects through the same tangent point and the
/// pixel lattices coincide exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct MapGeom {
    center: SkyCoord,
    proj_center: SkyCoord,
    /// Fractional pixel coordinates `(x, y)` of the projection center.
    crpix: (f64, f64),
    binsz_deg: f64,
    npix: (usize, usize),
    axis: EnergyAxis,
}

impl MapGeom {
    /// Build a geometry around `center` with `binsz_deg` pixels and
    /// `(ny, nx)` pixel counts. The projection tangent point is `center`.
    pub fn new(center: SkyCoord, binsz_deg: f64, npix: (usize, usize), axis: EnergyAxis) -> Result<Self> {
        if !(binsz_deg > 0.0 && binsz_deg.is_finite()) {
            return Err(Error::Validation(format!("invalid pixel size: {binsz_deg} deg")));
        }
        if npix.0 == 0 || npix.1 == 0 {
            return Err(Error::Validation(format!("empty pixel grid: {npix:?}")));
        }
        if center.lat_deg.abs() >= 89.0 {
            return Err(Error::Validation(
                "tangent-plane geometry is not defined at the poles".to_string(),
            ));
        }
        let crpix = ((npix.1 as f64 - 1.0) / 2.0, (npix.0 as f64 - 1.0) / 2.0);
        Ok(Self { center, proj_center: center, crpix, binsz_deg, npix, axis })
    }

    /// Center coordinate.
    pub fn center(&self) -> SkyCoord {
        self.center
    }

    /// Pixel size in degrees.
    pub fn binsz_deg(&self) -> f64 {
        self.binsz_deg
    }

    /// Pixel counts `(ny, nx)`.
    pub fn npix(&self) -> (usize, usize) {
        self.npix
    }

    /// Reconstructed-energy axis.
    pub fn axis(&self) -> &EnergyAxis {
        &self.axis
    }

    /// Cube shape `(n_energy, ny, nx)` for this geometry.
    pub fn cube_shape(&self) -> (usize, usize, usize) {
        (self.axis.n_bins(), self.npix.0, self.npix.1)
    }

    /// Geometry with the same grid but a different energy axis.
    pub fn with_axis(&self, axis: EnergyAxis) -> Self {
        Self { axis, ..self.clone() }
    }

    /// Solid angle per pixel in steradian (flat approximation).
    pub fn solid_angle(&self) -> f64 {
        self.binsz_deg.to_radians().powi(2)
    }

    /// Half of the grid diagonal extent in degrees.
    pub fn half_width_deg(&self) -> f64 {
        let (ny, nx) = self.npix;
        0.5 * self.binsz_deg * ((nx * nx + ny * ny) as f64).sqrt()
    }

    fn cos_lat(&self) -> f64 {
        self.proj_center.lat_deg.to_radians().cos()
    }

    /// Fractional pixel coordinates `(x, y)` of a sky direction.
    pub fn coord_to_pix(&self, coord: &SkyCoord) -> (f64, f64) {
        let mut dlon = coord.lon_deg - self.proj_center.lon_deg;
        if dlon > 180.0 {
            dlon -= 360.0;
        } else if dlon < -180.0 {
            dlon += 360.0;
        }
        let x = dlon * self.cos_lat() / self.binsz_deg + self.crpix.0;
        let y = (coord.lat_deg - self.proj_center.lat_deg) / self.binsz_deg + self.crpix.1;
        (x, y)
    }

    /// Sky direction at fractional pixel coordinates `(x, y)`.
    pub fn pix_to_coord(&self, x: f64, y: f64) -> SkyCoord {
        let lon =
            self.proj_center.lon_deg + (x - self.crpix.0) * self.binsz_deg / self.cos_lat();
        let lat = self.proj_center.lat_deg + (y - self.crpix.1) * self.binsz_deg;
        SkyCoord::new(lon, lat)
    }

    /// Integer pixel indices `(iy, ix)` of a coordinate, `None` when outside.
    pub fn pix_index(&self, coord: &SkyCoord) -> Option<(usize, usize)> {
        let (x, y) = self.coord_to_pix(coord);
        let ix = x.round();
        let iy = y.round();
        let (ny, nx) = self.npix;
        if ix < 0.0 || iy < 0.0 || ix >= nx as f64 || iy >= ny as f64 {
            return None;
        }
        Some((iy as usize, ix as usize))
    }

    /// Whether a coordinate falls inside the grid footprint.
    pub fn contains(&self, coord: &SkyCoord) -> bool {
        self.pix_index(coord).is_some()
    }

    /// Per-pixel angular separation (deg) from `coord`.
    pub fn separation_map(&self, coord: &SkyCoord) -> Array2<f64> {
        let (ny, nx) = self.npix;
        Array2::from_shape_fn((ny, nx), |(iy, ix)| {
            self.pix_to_coord(ix as f64, iy as f64).separation(coord)
        })
    }

    /// Pixel-aligned cutout of width `width_deg` around `center`.
    ///
    /// The cutout shares the parent pixel lattice exactly; the returned
    /// slices locate it within the parent grid. Fails with a coverage error
    /// when the requested footprint misses the parent entirely.
    pub fn cutout(&self, center: &SkyCoord, width_deg: f64) -> Result<(MapGeom, CutoutSlices)> {
        if !(width_deg > 0.0) {
            return Err(Error::Validation(format!("invalid cutout width: {width_deg} deg")));
        }
        let (xf, yf) = self.coord_to_pix(center);
        let xc = xf.round() as isize;
        let yc = yf.round() as isize;
        let half = (width_deg / 2.0 / self.binsz_deg).ceil() as isize;

        let (ny, nx) = self.npix;
        let x0 = (xc - half).max(0);
        let x1 = (xc + half + 1).min(nx as isize);
        let y0 = (yc - half).max(0);
        let y1 = (yc + half + 1).min(ny as isize);
        if x0 >= x1 || y0 >= y1 {
            return Err(Error::Coverage(format!(
                "cutout around ({:.3}, {:.3}) deg does not intersect the grid",
                center.lon_deg, center.lat_deg
            )));
        }

        let slices = CutoutSlices { x: x0 as usize..x1 as usize, y: y0 as usize..y1 as usize };
        let cnx = (x1 - x0) as usize;
        let cny = (y1 - y0) as usize;
        let c_center =
            self.pix_to_coord((x0 + x1 - 1) as f64 / 2.0, (y0 + y1 - 1) as f64 / 2.0);
        // Same tangent point as the parent; only the pixel origin shifts.
        let geom = MapGeom {
            center: c_center,
            proj_center: self.proj_center,
            crpix: (self.crpix.0 - x0 as f64, self.crpix.1 - y0 as f64),
            binsz_deg: self.binsz_deg,
            npix: (cny, cnx),
            axis: self.axis.clone(),
        };
        Ok((geom, slices))
    }

    /// Overlap of `other` with this geometry, as paired pixel ranges.
    ///
    /// Both geometries must share pixel size and lattice alignment (the
    /// cutout contract); energy axes are compared by the caller. Returns
    /// `None` when the footprints are disjoint.
    pub fn overlap(&self, other: &MapGeom) -> Result<Option<(CutoutSlices, CutoutSlices)>> {
        let rel = (self.binsz_deg - other.binsz_deg).abs() / self.binsz_deg;
        if rel > 1e-9 {
            return Err(Error::Validation(format!(
                "pixel size mismatch: {} vs {} deg",
                self.binsz_deg, other.binsz_deg
            )));
        }

        // Locate other's pixel (0, 0) on this lattice.
        let origin = other.pix_to_coord(0.0, 0.0);
        let (x0f, y0f) = self.coord_to_pix(&origin);
        let x0 = x0f.round();
        let y0 = y0f.round();
        if (x0f - x0).abs() > ALIGN_TOL || (y0f - y0).abs() > ALIGN_TOL {
            return Err(Error::Validation(format!(
                "pixel lattices are misaligned by ({:.4}, {:.4}) pixels",
                x0f - x0,
                y0f - y0
            )));
        }
        let x0 = x0 as isize;
        let y0 = y0 as isize;

        let (ony, onx) = other.npix;
        let (ny, nx) = self.npix;
        let sx0 = x0.max(0);
        let sy0 = y0.max(0);
        let sx1 = (x0 + onx as isize).min(nx as isize);
        let sy1 = (y0 + ony as isize).min(ny as isize);
        if sx0 >= sx1 || sy0 >= sy1 {
            return Ok(None);
        }

        let this = CutoutSlices {
            x: sx0 as usize..sx1 as usize,
            y: sy0 as usize..sy1 as usize,
        };
        let that = CutoutSlices {
            x: (sx0 - x0) as usize..(sx1 - x0) as usize,
            y: (sy0 - y0) as usize..(sy1 - y0) as usize,
        };
        Ok(Some((this, that)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_axis() -> EnergyAxis {
        EnergyAxis::from_bounds(1.0, 10.0, 3).unwrap()
    }

    fn test_geom() -> MapGeom {
        MapGeom::new(SkyCoord::new(83.63, 22.01), 0.02, (101, 101), test_axis()).unwrap()
    }

    #[test]
    fn test_pix_round_trip() {
        let geom = test_geom();
        let coord = SkyCoord::new(83.7, 22.1);
        let (x, y) = geom.coord_to_pix(&coord);
        let back = geom.pix_to_coord(x, y);
        assert_relative_eq!(back.lon_deg, coord.lon_deg, epsilon = 1e-9);
        assert_relative_eq!(back.lat_deg, coord.lat_deg, epsilon = 1e-9);
    }

    #[test]
    fn test_center_maps_to_grid_center() {
        let geom = test_geom();
        let (x, y) = geom.coord_to_pix(&geom.center());
        assert_relative_eq!(x, 50.0, epsilon = 1e-9);
        assert_relative_eq!(y, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_separation_small_angle() {
        let a = SkyCoord::new(0.0, 0.0);
        let b = SkyCoord::new(0.1, 0.0);
        assert_relative_eq!(a.separation(&b), 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_cutout_alignment() {
        let geom = test_geom();
        let target = SkyCoord::new(83.8, 22.1);
        let (cut, slices) = geom.cutout(&target, 0.5).unwrap();

        // Cutout pixel (0, 0) must coincide with the parent pixel at the slice origin.
        let origin = cut.pix_to_coord(0.0, 0.0);
        let parent = geom.pix_to_coord(slices.x.start as f64, slices.y.start as f64);
        assert_relative_eq!(origin.lon_deg, parent.lon_deg, epsilon = 1e-9);
        assert_relative_eq!(origin.lat_deg, parent.lat_deg, epsilon = 1e-9);
        assert_eq!(cut.npix().1, slices.x.len());
        assert_eq!(cut.npix().0, slices.y.len());
    }

    #[test]
    fn test_cutout_outside_is_coverage_error() {
        let geom = test_geom();
        let far = SkyCoord::new(120.0, -30.0);
        match geom.cutout(&far, 0.5) {
            Err(sf_core::Error::Coverage(_)) => {}
            other => panic!("expected coverage error, got {other:?}"),
        }
    }

    #[test]
    fn test_overlap_of_cutout_matches_slices() {
        let geom = test_geom();
        let (cut, slices) = geom.cutout(&SkyCoord::new(83.7, 21.95), 0.4).unwrap();
        let (this, that) = geom.overlap(&cut).unwrap().unwrap();
        assert_eq!(this, slices);
        assert_eq!(that.x, 0..cut.npix().1);
        assert_eq!(that.y, 0..cut.npix().0);
    }

    #[test]
    fn test_overlap_disjoint() {
        let axis = test_axis();
        let a = MapGeom::new(SkyCoord::new(0.0, 0.0), 0.1, (11, 11), axis.clone()).unwrap();
        // Same lattice (center sits on a pixel of `a`, same spacing), but the
        // footprint starts 40 pixels past the edge of `a`.
        let far_center = a.pix_to_coord(55.0, 5.0);
        let b = MapGeom::new(far_center, 0.1, (11, 11), axis).unwrap();
        assert!(a.overlap(&b).unwrap().is_none());
    }
}
