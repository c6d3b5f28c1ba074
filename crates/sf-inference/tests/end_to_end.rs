//! Full-chain scenarios: reduce, stack, normalize the background,
//! detect and fit a source.

mod common;

use common::{observation, reduction_energy_true, reference_geom};
use ndarray::Array2;
use sf_data::{
    BackgroundMethod, Datasets, FovBackgroundMaker, MapDataset, MapDatasetMaker,
};
use sf_inference::{ExcessMapEstimator, Fit};
use sf_maps::SkyCoord;
use sf_model::{FovBackgroundModel, Model, SkyModel, SpatialModel, SpectralModel};

const TARGET: SkyCoord = SkyCoord { lon_deg: 83.63, lat_deg: 22.01 };

fn reduce_and_stack(
    npix: usize,
    n_energy: usize,
    n_energy_true: usize,
    pointings: &[SkyCoord],
    aeff_m2: f64,
    bkg_rate: f64,
) -> MapDataset {
    let geom = reference_geom(npix, n_energy);
    let energy_true = reduction_energy_true(n_energy_true);
    let maker = MapDatasetMaker::all().with_psf_radius(0.25);

    let mut stacked = MapDataset::empty("stacked", geom.clone(), energy_true.clone())
        .expect("valid reference");
    for (i, pointing) in pointings.iter().enumerate() {
        let obs = observation(i as u32 + 1, *pointing, aeff_m2, bkg_rate);
        let ds = maker.run(&geom, &energy_true, &obs).expect("reduction succeeds");
        stacked.stack(&ds).expect("compatible stack");
    }
    stacked
}

/// Exclusion disk around the target, `true` marking excluded pixels.
fn exclusion_disk(dataset: &MapDataset, radius_deg: f64) -> Array2<bool> {
    dataset
        .geom
        .separation_map(&TARGET)
        .mapv(|sep| sep < radius_deg)
}

#[test]
fn test_significance_is_standard_normal_without_a_source() {
    let mut ds = reduce_and_stack(
        60,
        4,
        8,
        &[SkyCoord::new(83.63, 22.01)],
        1e5,
        1500.0,
    );
    ds.fake(21).unwrap();

    let maps = ExcessMapEstimator::new(0.06).unwrap().run(&ds).unwrap();

    // Interior pixels only, away from convolution edge effects.
    let mut values = Vec::new();
    for iy in 10..50 {
        for ix in 10..50 {
            let s = maps.significance[(iy, ix)];
            if s.is_finite() {
                values.push(s);
            }
        }
    }
    assert!(values.len() > 1000);

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();

    // Correlated tophat smoothing inflates neither moment much; the
    // bounds are loose because neighbouring pixels share counts.
    assert!(mean.abs() < 0.4, "significance mean {mean:.3}");
    assert!((0.75..1.3).contains(&std), "significance std {std:.3}");
}

fn gaussian_source_scenario(
    npix: usize,
    n_energy: usize,
    n_energy_true: usize,
    pointings: &[SkyCoord],
    seed: u64,
) {
    let truth_amplitude = 2e-11;
    let truth_index = 2.3;
    let truth_sigma = 0.15;
    let truth_bkg_norm = 1.1;

    let mut stacked = reduce_and_stack(npix, n_energy, n_energy_true, pointings, 1e6, 100.0);

    // Inject the truth and draw one realization.
    let mut source = SkyModel::new(
        "crab",
        SpatialModel::gaussian(TARGET.lon_deg, TARGET.lat_deg, truth_sigma),
        SpectralModel::power_law(truth_amplitude, truth_index, 1.0),
    );
    source.spatial.freeze_all();
    let mut bkg = FovBackgroundModel::new(&stacked.name, 1.0);
    bkg.norm.set_value(truth_bkg_norm).unwrap();
    stacked.models.attach(Model::Sky(source)).unwrap();
    stacked.models.attach(Model::FovBackground(bkg)).unwrap();
    stacked.fake(seed).unwrap();

    // Forget the truth: reset the start point before analysis.
    {
        let spectral = &mut stacked.models.sky_model_mut("crab").unwrap().spectral;
        spectral.parameter_mut("amplitude").unwrap().set_value(5e-12).unwrap();
        spectral.parameter_mut("index").unwrap().set_value(2.0).unwrap();
        stacked.models.background_mut().unwrap().norm.set_value(1.0).unwrap();
    }

    // Normalize the residual background outside the source region.
    let exclusion = exclusion_disk(&stacked, 3.0 * truth_sigma);
    let bkg_fit = FovBackgroundMaker::new(BackgroundMethod::Norm)
        .with_exclusion(exclusion)
        .run(&mut stacked)
        .unwrap()
        .expect("constrained background fit");
    assert!(
        (bkg_fit.norm - truth_bkg_norm).abs() / truth_bkg_norm < 0.05,
        "background norm {:.4} vs truth {truth_bkg_norm}",
        bkg_fit.norm
    );

    // The injected source stands out before the spectral fit. The
    // estimator sees the attached models as null hypothesis, so detach
    // the source for the detection pass.
    {
        let mut null = stacked.clone();
        null.models.detach("crab");
        let maps = ExcessMapEstimator::new(0.1).unwrap().run(&null).unwrap();
        let (cy, cx) = (npix / 2, npix / 2);
        assert!(
            maps.significance[(cy, cx)] > 5.0,
            "source significance {:.2}",
            maps.significance[(cy, cx)]
        );
        assert!(maps.excess[(cy, cx)] > 0.0);
    }

    // Spectral fit with the background norm floating alongside.
    let mut datasets = Datasets::new();
    datasets.push(stacked).unwrap();
    let result = Fit::new().fit(&mut datasets).unwrap();
    assert!(result.converged, "{}", result.message);

    let amp = result.value("stacked.crab.amplitude").unwrap();
    let index = result.value("stacked.crab.index").unwrap();
    assert!(
        (amp - truth_amplitude).abs() / truth_amplitude < 0.10,
        "amplitude {amp:.3e} vs truth {truth_amplitude:.3e}"
    );
    assert!(
        (index - truth_index).abs() < 0.2,
        "index {index:.3} vs truth {truth_index}"
    );

    let norm = result.value("stacked.stacked-bkg.norm").unwrap();
    assert!((norm - truth_bkg_norm).abs() / truth_bkg_norm < 0.05);
}

#[test]
fn test_gaussian_source_reduced_scale() {
    gaussian_source_scenario(
        100,
        5,
        10,
        &[SkyCoord::new(83.43, 22.01), SkyCoord::new(83.83, 22.01)],
        42,
    );
}

#[test]
#[ignore = "full-scale scenario, minutes of runtime"]
fn test_gaussian_source_full_scale() {
    gaussian_source_scenario(
        200,
        20,
        24,
        &[
            SkyCoord::new(83.43, 22.01),
            SkyCoord::new(83.83, 22.01),
            SkyCoord::new(83.63, 21.81),
            SkyCoord::new(83.63, 22.21),
            SkyCoord::new(83.63, 22.01),
        ],
        4242,
    );
}
