//! # Spatial Smoothing
//!
//! NaN-aware 2-D Gaussian convolution for the aggregation passes. The
//! treatment of non-finite pixels follows the convention the evidence and
//! histogram maps rely on: a NaN input pixel contributes nothing, and the
//! kernel is renormalized over the finite footprint, so holes are
//! interpolated from their neighborhood rather than spreading NaN.
//! Callers that must not invent data where there was none re-mask the
//! output afterwards.

use ndarray::{Array2, ArrayView2};

/// A truncated, normalized 2-D Gaussian kernel.
#[derive(Debug, Clone)]
pub struct GaussianKernel2d {
    weights: Array2<f64>,
    half: usize,
}

impl GaussianKernel2d {
    /// Build a kernel with standard deviation `std_pix` map pixels,
    /// truncated at 4σ and forced to an odd size.
    ///
    /// # Panics
    ///
    /// Panics if `std_pix` is not a positive finite number; the smoothing
    /// bandwidth is a caller parameter validated at configuration time.
    pub fn new(std_pix: f64) -> Self {
        assert!(
            std_pix.is_finite() && std_pix > 0.0,
            "kernel width must be positive and finite"
        );
        let half = (4.0 * std_pix).ceil() as usize;
        let size = 2 * half + 1;
        let mut weights = Array2::zeros((size, size));
        let mut total = 0.0;
        for i in 0..size {
            for j in 0..size {
                let dx = i as f64 - half as f64;
                let dy = j as f64 - half as f64;
                let w = (-(dx * dx + dy * dy) / (2.0 * std_pix * std_pix)).exp();
                weights[[i, j]] = w;
                total += w;
            }
        }
        weights /= total;
        Self { weights, half }
    }

    /// Kernel side length.
    pub fn size(&self) -> usize {
        2 * self.half + 1
    }

    /// Convolve one 2-D map, ignoring non-finite input pixels and
    /// renormalizing the kernel over the finite footprint.
    ///
    /// An output pixel whose entire footprint is non-finite stays NaN.
    pub fn convolve(&self, data: ArrayView2<f64>) -> Array2<f64> {
        let (nx, ny) = data.dim();
        let half = self.half as isize;
        let mut out = Array2::from_elem((nx, ny), f64::NAN);
        for x in 0..nx as isize {
            for y in 0..ny as isize {
                let mut acc = 0.0;
                let mut wsum = 0.0;
                for kx in -half..=half {
                    let sx = x + kx;
                    if sx < 0 || sx >= nx as isize {
                        continue;
                    }
                    for ky in -half..=half {
                        let sy = y + ky;
                        if sy < 0 || sy >= ny as isize {
                            continue;
                        }
                        let v = data[[sx as usize, sy as usize]];
                        if !v.is_finite() {
                            continue;
                        }
                        let w = self.weights[[(kx + half) as usize, (ky + half) as usize]];
                        acc += w * v;
                        wsum += w;
                    }
                }
                if wsum > 0.0 {
                    out[[x as usize, y as usize]] = acc / wsum;
                }
            }
        }
        out
    }
}
