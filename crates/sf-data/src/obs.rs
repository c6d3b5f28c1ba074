//! Observation records.
//!
//! An observation is one pointing of the instrument: calibrated events,
//! good-time intervals, and the responses valid for that pointing. Records
//! arrive fully in memory; reading instrument files is out of scope.

use sf_core::{Error, Result};
use sf_maps::SkyCoord;

use crate::irf::{BackgroundRateModel, EffectiveArea, EnergyDispersion, PsfModel};

/// A calibrated event: reconstructed direction and energy.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Reconstructed direction.
    pub coord: SkyCoord,
    /// Reconstructed energy (TeV).
    pub energy_tev: f64,
}

impl Event {
    /// Create an event.
    pub fn new(coord: SkyCoord, energy_tev: f64) -> Self {
        Self { coord, energy_tev }
    }
}

/// A contiguous interval of valid data taking, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct GoodTimeInterval {
    /// Interval start (s).
    pub start_s: f64,
    /// Interval stop (s).
    pub stop_s: f64,
}

impl GoodTimeInterval {
    /// Create an interval. The stop must follow the start.
    pub fn new(start_s: f64, stop_s: f64) -> Result<Self> {
        if !(stop_s > start_s) || !start_s.is_finite() || !stop_s.is_finite() {
            return Err(Error::Validation(format!(
                "invalid good-time interval: ({start_s}, {stop_s}) s"
            )));
        }
        Ok(Self { start_s, stop_s })
    }

    /// Interval duration (s).
    pub fn duration_s(&self) -> f64 {
        self.stop_s - self.start_s
    }
}

/// One instrument pointing with its events and responses.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Observation identifier, unique within an analysis.
    pub id: u32,
    /// Pointing direction.
    pub pointing: SkyCoord,
    /// Good-time intervals.
    pub gtis: Vec<GoodTimeInterval>,
    /// Calibrated events.
    pub events: Vec<Event>,
    /// Effective area table.
    pub aeff: EffectiveArea,
    /// Energy-resolution model.
    pub edisp: EnergyDispersion,
    /// Point-spread-function model.
    pub psf: PsfModel,
    /// Residual-background rate model.
    pub bkg: BackgroundRateModel,
}

impl Observation {
    /// Assemble an observation record. At least one good-time interval is
    /// required.
    pub fn new(
        id: u32,
        pointing: SkyCoord,
        gtis: Vec<GoodTimeInterval>,
        events: Vec<Event>,
        aeff: EffectiveArea,
        edisp: EnergyDispersion,
        psf: PsfModel,
        bkg: BackgroundRateModel,
    ) -> Result<Self> {
        if gtis.is_empty() {
            return Err(Error::Validation(format!(
                "observation {id} has no good-time intervals"
            )));
        }
        Ok(Self { id, pointing, gtis, events, aeff, edisp, psf, bkg })
    }

    /// Total livetime (s), summed over good-time intervals.
    pub fn livetime_s(&self) -> f64 {
        self.gtis.iter().map(|g| g.duration_s()).sum()
    }

    /// Field-of-view radius (deg): the smaller of the response table
    /// extents, beyond which both signal and background responses vanish.
    pub fn fov_radius_deg(&self) -> f64 {
        self.aeff.offset_max().min(self.bkg.offset_max())
    }

    /// Offset of a sky direction from the pointing (deg).
    pub fn offset_deg(&self, coord: &SkyCoord) -> f64 {
        self.pointing.separation(coord)
    }
}
