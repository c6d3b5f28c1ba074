//! Image convolution.
//!
//! Direct-summation "same"-mode 2-D convolution with zero padding, used for
//! PSF application and for correlating counts/background maps. Kernels are
//! small relative to the images, so direct summation beats FFT setup cost
//! for the sizes this crate handles.

use ndarray::{Array2, Array3, ArrayView2};
use sf_core::{Error, Result};

/// Convolve a single image plane with a kernel, "same" output size,
/// zero padding outside the image.
pub fn convolve_plane(image: ArrayView2<'_, f64>, kernel: ArrayView2<'_, f64>) -> Array2<f64> {
    let (ny, nx) = image.dim();
    let (ky, kx) = kernel.dim();
    let cy = (ky / 2) as isize;
    let cx = (kx / 2) as isize;

    let mut out = Array2::<f64>::zeros((ny, nx));
    for iy in 0..ny as isize {
        for ix in 0..nx as isize {
            let mut acc = 0.0;
            for jy in 0..ky as isize {
                let sy = iy + cy - jy;
                if sy < 0 || sy >= ny as isize {
                    continue;
                }
                for jx in 0..kx as isize {
                    let sx = ix + cx - jx;
                    if sx < 0 || sx >= nx as isize {
                        continue;
                    }
                    acc += image[(sy as usize, sx as usize)] * kernel[(jy as usize, jx as usize)];
                }
            }
            out[(iy as usize, ix as usize)] = acc;
        }
    }
    out
}

/// Convolve every plane of a cube with the same kernel.
pub fn convolve_cube(cube: &Array3<f64>, kernel: ArrayView2<'_, f64>) -> Array3<f64> {
    let mut out = cube.clone();
    for (mut plane, src) in out.outer_iter_mut().zip(cube.outer_iter()) {
        plane.assign(&convolve_plane(src, kernel));
    }
    out
}

/// Convolve plane `i` of a cube with plane `i` of a kernel cube.
pub fn convolve_cube_per_plane(cube: &Array3<f64>, kernels: &Array3<f64>) -> Result<Array3<f64>> {
    if cube.dim().0 != kernels.dim().0 {
        return Err(Error::Validation(format!(
            "kernel cube has {} planes, image cube has {}",
            kernels.dim().0,
            cube.dim().0
        )));
    }
    let mut out = cube.clone();
    for ((mut plane, src), kernel) in
        out.outer_iter_mut().zip(cube.outer_iter()).zip(kernels.outer_iter())
    {
        plane.assign(&convolve_plane(src, kernel));
    }
    Ok(out)
}

/// Gaussian kernel with the given width in pixels, truncated at 4 sigma,
/// normalized to unit sum.
pub fn gaussian_kernel(sigma_pix: f64) -> Result<Array2<f64>> {
    if !(sigma_pix > 0.0 && sigma_pix.is_finite()) {
        return Err(Error::Validation(format!("invalid kernel sigma: {sigma_pix} pixels")));
    }
    let half = (4.0 * sigma_pix).ceil() as isize;
    let size = (2 * half + 1) as usize;
    let mut kernel = Array2::<f64>::zeros((size, size));
    let inv_two_sigma2 = 1.0 / (2.0 * sigma_pix * sigma_pix);
    for iy in -half..=half {
        for ix in -half..=half {
            let r2 = (ix * ix + iy * iy) as f64;
            kernel[((iy + half) as usize, (ix + half) as usize)] = (-r2 * inv_two_sigma2).exp();
        }
    }
    let sum = kernel.sum();
    kernel.mapv_inplace(|v| v / sum);
    Ok(kernel)
}

/// Flat disk kernel of the given radius in pixels, entries 1.0 inside the
/// radius. Deliberately not normalized: correlating with it sums counts
/// within the radius.
pub fn tophat_kernel(radius_pix: f64) -> Result<Array2<f64>> {
    if !(radius_pix > 0.0 && radius_pix.is_finite()) {
        return Err(Error::Validation(format!("invalid kernel radius: {radius_pix} pixels")));
    }
    let half = radius_pix.ceil() as isize;
    let size = (2 * half + 1) as usize;
    let mut kernel = Array2::<f64>::zeros((size, size));
    let r2 = radius_pix * radius_pix;
    for iy in -half..=half {
        for ix in -half..=half {
            if (ix * ix + iy * iy) as f64 <= r2 {
                kernel[((iy + half) as usize, (ix + half) as usize)] = 1.0;
            }
        }
    }
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_delta_image_reproduces_kernel() {
        let mut image = Array2::<f64>::zeros((9, 9));
        image[(4, 4)] = 1.0;
        let kernel = gaussian_kernel(1.0).unwrap();
        let out = convolve_plane(image.view(), kernel.view());
        // Kernel is 9x9 for sigma=1, so it fits exactly.
        assert_relative_eq!(out[(4, 4)], kernel[(4, 4)], epsilon = 1e-12);
        assert_relative_eq!(out[(4, 6)], kernel[(4, 6)], epsilon = 1e-12);
        assert_relative_eq!(out.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_flux_conservation_interior() {
        // A unit point well inside the image keeps total flux after smoothing.
        let mut image = Array2::<f64>::zeros((31, 31));
        image[(15, 15)] = 2.5;
        let kernel = gaussian_kernel(1.5).unwrap();
        let out = convolve_plane(image.view(), kernel.view());
        assert_relative_eq!(out.sum(), 2.5, epsilon = 1e-9);
    }

    #[test]
    fn test_tophat_counts_within_radius() {
        let kernel = tophat_kernel(1.0).unwrap();
        // Radius 1: center + 4 orthogonal neighbours.
        assert_relative_eq!(kernel.sum(), 5.0, epsilon = 1e-12);

        let image = Array2::<f64>::ones((7, 7));
        let out = convolve_plane(image.view(), kernel.view());
        assert_relative_eq!(out[(3, 3)], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_per_plane_shape_mismatch() {
        let cube = Array3::<f64>::zeros((3, 5, 5));
        let kernels = Array3::<f64>::zeros((2, 3, 3));
        assert!(convolve_cube_per_plane(&cube, &kernels).is_err());
    }
}
