//! Reduction and stacking scenarios across several observations.

mod common;

use approx::assert_relative_eq;
use common::{observation, reduction_energy_true, reference_geom};
use sf_data::{MapDataset, MapDatasetMaker};
use sf_maps::SkyCoord;

fn reduce_three() -> Vec<MapDataset> {
    let geom = reference_geom(60, 4);
    let energy_true = reduction_energy_true(8);
    let maker = MapDatasetMaker::all().with_psf_radius(0.25);
    let observations = vec![
        observation(1, SkyCoord::new(83.63, 22.31), 1e5, 100.0),
        observation(2, SkyCoord::new(83.63, 21.71), 2e5, 100.0),
        observation(3, SkyCoord::new(83.95, 22.01), 1e5, 50.0),
    ];
    maker.run_batch(&geom, &energy_true, &observations).expect("reduction succeeds")
}

fn fold(base_name: &str, parts: &[&MapDataset]) -> MapDataset {
    let mut stack = MapDataset::empty(
        base_name,
        reference_geom(60, 4),
        reduction_energy_true(8),
    )
    .expect("valid stack");
    for part in parts {
        stack.stack(part).expect("stacking succeeds");
    }
    stack
}

fn max_abs_diff(a: &ndarray::Array3<f64>, b: &ndarray::Array3<f64>) -> f64 {
    (a - b).iter().map(|d| d.abs()).fold(0.0, f64::max)
}

#[test]
fn test_stacking_is_associative() {
    let reduced = reduce_three();
    let [a, b, c] = [&reduced[0], &reduced[1], &reduced[2]];

    // ((a + b) + c) against (a + (b + c)).
    let left = fold("left", &[a, b, c]);

    let mut bc = b.clone();
    bc.stack(c).expect("partial stack");
    let right = fold("right", &[a, &bc]);

    assert_eq!(left.counts, right.counts);
    assert!(max_abs_diff(&left.background, &right.background) < 1e-9);
    assert!(max_abs_diff(&left.exposure, &right.exposure) < 1e-3);
    assert_eq!(left.mask_safe, right.mask_safe);

    let (psf_l, psf_r) = (left.psf.expect("kernel"), right.psf.expect("kernel"));
    assert!(max_abs_diff(psf_l.data(), psf_r.data()) < 1e-12);
}

#[test]
fn test_stacking_commutes() {
    let reduced = reduce_three();
    let ab = fold("ab", &[&reduced[0], &reduced[1]]);
    let ba = fold("ba", &[&reduced[1], &reduced[0]]);

    assert_eq!(ab.counts, ba.counts);
    assert!(max_abs_diff(&ab.background, &ba.background) < 1e-9);
    assert!(max_abs_diff(&ab.exposure, &ba.exposure) < 1e-3);
}

#[test]
fn test_stacking_zero_dataset_is_identity() {
    let reduced = reduce_three();
    let base = fold("base", &[&reduced[0], &reduced[1]]);

    let zero = MapDataset::empty("zero", reference_geom(60, 4), reduction_energy_true(8))
        .expect("valid empty");
    let mut stacked = base.clone();
    stacked.stack(&zero).expect("stacking succeeds");

    assert_eq!(base.counts, stacked.counts);
    assert_eq!(base.background, stacked.background);
    assert_eq!(base.exposure, stacked.exposure);
    assert_eq!(base.mask_safe, stacked.mask_safe);
}

#[test]
fn test_reduce_on_displaced_cutout_then_stack() {
    // Reduce onto a cutout displaced in latitude from the reference center,
    // then fold the result back into the full grid. The cutout must sit on
    // the reference pixel lattice for the stack to line up.
    let geom = reference_geom(120, 4);
    let energy_true = reduction_energy_true(8);
    let target = SkyCoord::new(83.63, 22.31);
    let (cut_geom, slices) = geom.cutout(&target, 1.0).expect("cutout inside the grid");

    let maker = MapDatasetMaker::all().with_psf_radius(0.25);
    let obs = observation(1, target, 1e5, 100.0);
    let reduced = maker.run(&cut_geom, &energy_true, &obs).expect("reduction succeeds");

    let mut stack =
        MapDataset::empty("stacked", geom.clone(), energy_true).expect("valid stack");
    stack.stack(&reduced).expect("stacking succeeds");

    // Exposure lands in the parent pixels named by the cutout slices and
    // nowhere else.
    let (iy, ix) = (slices.y.start + slices.y.len() / 2, slices.x.start + slices.x.len() / 2);
    assert_relative_eq!(stack.exposure[(0, iy, ix)], 1e5 * 1e4 * 1800.0, max_relative = 1e-9);
    assert_eq!(stack.exposure[(0, 0, 0)], 0.0);
    let total_cut: f64 = reduced.exposure.sum();
    let total_stack: f64 = stack.exposure.sum();
    assert_relative_eq!(total_stack, total_cut, max_relative = 1e-9);
}

#[test]
fn test_stacked_exposure_accumulates_livetime() {
    let reduced = reduce_three();
    let stack = fold("stack", &[&reduced[0], &reduced[1]]);

    // Both observations cover the map center: 1e5 and 2e5 m² for 1800 s
    // each, in cm² s.
    let expected = (1e5 + 2e5) * 1e4 * 1800.0;
    assert_relative_eq!(stack.exposure[(0, 30, 30)], expected, max_relative = 1e-9);
}
