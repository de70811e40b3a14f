//! # Core Data Model
//!
//! Value types shared by the fitting engine, the chunked store, and the
//! aggregation pipeline:
//!
//! - [`PixelKey`]: integer spatial grid coordinates of one pixel.
//! - [`ModelFit`]: the immutable result of fitting one model order at one
//!   pixel, as returned by the sampler and persisted into a chunk file.
//! - [`PixelRecord`]: one pixel's full chain of attempted fits plus the
//!   selected model order.
//! - [`SelectionState`]: the per-pixel outcome of the stopping rule as a
//!   tagged variant rather than a bare integer.
//!
//! ## Flat array layouts
//!
//! `map_params`, `marginals`, and `posteriors` are stored flat and
//! parameter-major, matching the on-disk record format:
//!
//! - `map_params[i_par * ncomp + j_comp]`
//! - `marginals[(i_quan * n_params + i_par) * ncomp + j_comp]`
//! - posterior row `s`, column `i_par * ncomp + j_comp`

use serde::{Deserialize, Serialize};

/// Fixed cumulative-probability levels for the marginal quantiles.
///
/// Nine points; index 0 is the sample minimum and index 8 the sample
/// maximum, with ±1σ, ±2σ, ±3σ and the median in between. Aggregation
/// passes rely on the endpoint convention when deriving histogram bins.
pub const MARG_QUANTILES: [f64; 9] = [
    0.0, 0.00135, 0.02275, 0.158655, 0.5, 0.841345, 0.97725, 0.99865, 1.0,
];

/// Sentinel for a pixel that was never fit (NaN-contaminated spectrum or
/// worker never reached it). Never a valid model order.
pub const NBEST_UNRESOLVED: i32 = -1;

/// Integer grid coordinates of one spatial cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelKey {
    /// Longitude-like (first spatial) index
    pub i_lon: usize,
    /// Latitude-like (second spatial) index
    pub i_lat: usize,
}

impl PixelKey {
    /// Create a key from grid indices.
    pub fn new(i_lon: usize, i_lat: usize) -> Self {
        Self { i_lon, i_lat }
    }

    /// Group path of this pixel inside the store, `pix/<lon>/<lat>`.
    pub fn group_path(&self) -> String {
        format!("pix/{}/{}", self.i_lon, self.i_lat)
    }
}

impl std::fmt::Display for PixelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.i_lon, self.i_lat)
    }
}

/// Evidence and information criteria of the null (`ncomp = 0`) model.
///
/// Carried on the order-1 fit only, since the null model is evaluated once
/// per pixel as the baseline of the evidence chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NullStats {
    /// Log-evidence of the pure-noise model
    pub ln_evidence: f64,
    /// Akaike information criterion
    pub aic: f64,
    /// Small-sample corrected AIC
    pub aicc: f64,
    /// Bayesian information criterion
    pub bic: f64,
}

/// Result of fitting one model order at one pixel.
///
/// Produced once by the sampler, immutable thereafter. Owned by the pixel
/// group it is written into; the table file never holds one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFit {
    /// Number of spectral components in this model
    pub ncomp: usize,
    /// Number of free parameters per component
    pub n_params: usize,
    /// Log-evidence estimate from the sampler
    pub ln_evidence: f64,
    /// Uncertainty of the log-evidence estimate
    pub ln_evidence_err: f64,
    /// Akaike information criterion
    pub aic: f64,
    /// Small-sample corrected AIC
    pub aicc: f64,
    /// Bayesian information criterion
    pub bic: f64,
    /// Null-model statistics; present on the order-1 fit only
    pub null_stats: Option<NullStats>,
    /// Cumulative-probability levels of `marginals`
    pub marg_quantiles: Vec<f64>,
    /// Maximum a posteriori parameter vector, flat `(p, m)`
    pub map_params: Vec<f64>,
    /// Marginal quantile values, flat `(M, p, m)`
    pub marginals: Vec<f64>,
    /// Number of posterior sample rows
    pub n_samples: usize,
    /// Posterior sample table, row-major `(samples, p * m)`
    pub posteriors: Vec<f64>,
}

impl ModelFit {
    /// Total number of free parameters, `n_params * ncomp`.
    pub fn ndim(&self) -> usize {
        self.n_params * self.ncomp
    }

    /// Flat column index of parameter `i_par` of component `j_comp`.
    pub fn column(&self, i_par: usize, j_comp: usize) -> usize {
        i_par * self.ncomp + j_comp
    }

    /// MAP value of parameter `i_par` of component `j_comp`.
    pub fn map_param(&self, i_par: usize, j_comp: usize) -> f64 {
        self.map_params[self.column(i_par, j_comp)]
    }

    /// Marginal quantile value at level index `i_quan` for parameter
    /// `i_par` of component `j_comp`.
    pub fn marginal(&self, i_quan: usize, i_par: usize, j_comp: usize) -> f64 {
        self.marginals[(i_quan * self.n_params + i_par) * self.ncomp + j_comp]
    }

    /// Posterior sample values of one flat column.
    pub fn posterior_column(&self, column: usize) -> impl Iterator<Item = f64> + '_ {
        let ncols = self.ndim();
        (0..self.n_samples).map(move |s| self.posteriors[s * ncols + column])
    }
}

/// Outcome of the per-pixel stopping rule.
///
/// Modeled as a tagged variant so the smoothed re-selection clamp in the
/// aggregation pipeline can reason about "was never fit" separately from
/// "fit and rejected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionState {
    /// Pixel rejected before fitting (non-finite spectrum samples)
    Unresolved,
    /// Fit attempted, but not even one component beat the null model
    NoSignal,
    /// `k` components accepted by the evidence chain
    Accepted(usize),
}

impl SelectionState {
    /// The `nbest` integer persisted at the pixel-group level.
    pub fn nbest(&self) -> i32 {
        match self {
            SelectionState::Unresolved => NBEST_UNRESOLVED,
            SelectionState::NoSignal => 0,
            SelectionState::Accepted(k) => *k as i32,
        }
    }

    /// Reconstruct the state from a persisted `nbest` value.
    pub fn from_nbest(nbest: i32) -> Self {
        match nbest {
            n if n < 0 => SelectionState::Unresolved,
            0 => SelectionState::NoSignal,
            n => SelectionState::Accepted(n as usize),
        }
    }
}

/// One pixel's persisted group: attrs plus the chain of attempted fits.
///
/// Fits are ordered by `ncomp` from 1 upward and include the final rejected
/// order when one was attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelRecord {
    /// Spatial key of this pixel
    pub key: PixelKey,
    /// Selected model order (`-1` never occurs here; unresolved pixels
    /// write no record at all)
    pub nbest: i32,
    /// Every attempted fit, keyed by `ncomp` = index + 1
    pub fits: Vec<ModelFit>,
}

impl PixelRecord {
    /// The fit of a given model order, if it was attempted.
    pub fn fit(&self, ncomp: usize) -> Option<&ModelFit> {
        self.fits.iter().find(|f| f.ncomp == ncomp)
    }
}
