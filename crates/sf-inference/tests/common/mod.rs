//! Shared synthetic-observation scaffolding for the scenario tests.
//!
//! Responses are flat and deliberately oversized (effective areas of
//! 1e5-1e6 m², bright residual background) so the scenarios reach good
//! statistics on small grids within the default test budget.

// Each scenario binary uses a different subset of the helpers.
#![allow(dead_code)]

use sf_data::irf::{BackgroundRateModel, EffectiveArea, EnergyDispersion, PsfModel};
use sf_data::obs::{GoodTimeInterval, Observation};
use sf_maps::{EnergyAxis, MapGeom, SkyCoord};

/// True-energy axis the synthetic responses are tabulated on.
pub fn irf_axis() -> EnergyAxis {
    EnergyAxis::from_bounds(0.1, 200.0, 20).expect("valid axis")
}

/// A 1800 s pointing with flat responses and no events.
pub fn observation(
    id: u32,
    pointing: SkyCoord,
    aeff_m2: f64,
    bkg_rate: f64,
) -> Observation {
    Observation::new(
        id,
        pointing,
        vec![GoodTimeInterval::new(0.0, 1800.0).expect("valid gti")],
        vec![],
        EffectiveArea::constant(2.5, irf_axis(), aeff_m2).expect("valid aeff"),
        EnergyDispersion::constant(irf_axis(), 0.08).expect("valid edisp"),
        PsfModel::constant(irf_axis(), 0.06).expect("valid psf"),
        BackgroundRateModel::constant(2.5, irf_axis(), bkg_rate).expect("valid bkg"),
    )
    .expect("valid observation")
}

/// Reference geometry centered on the synthetic target.
pub fn reference_geom(npix: usize, n_energy: usize) -> MapGeom {
    let axis = EnergyAxis::from_bounds(0.5, 50.0, n_energy).expect("valid axis");
    MapGeom::new(SkyCoord::new(83.63, 22.01), 0.02, (npix, npix), axis).expect("valid geom")
}

/// True-energy axis used at reduction time.
pub fn reduction_energy_true(n_bins: usize) -> EnergyAxis {
    EnergyAxis::from_bounds(0.3, 100.0, n_bins).expect("valid axis")
}
