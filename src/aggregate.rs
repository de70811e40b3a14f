//! # Aggregation Pipeline
//!
//! Turns a linked store of per-pixel records into dense map products.
//! Six passes, each committing named datasets back into the store:
//!
//! 1. [`aggregate_attributes`]: selected model order and per-order
//!    evidence / information-criteria maps.
//! 2. [`convolve_evidence`]: spatially smoothed evidence, then a walk-up
//!    re-selection that promotes pixels whose smoothed neighborhood
//!    supports one more component.
//! 3. [`aggregate_products`]: MAP parameter and marginal-quantile maps of
//!    the smoothed selection.
//! 4. [`aggregate_pdfs`]: marginal posterior histograms per parameter.
//! 5. [`convolve_post_pdfs`]: spatially smoothed histograms, re-masked so
//!    smoothing never invents a posterior where no fit exists.
//! 6. [`quantize_conv_marginals`]: quantiles interpolated from the
//!    smoothed histograms, plus model-derived intensity maps via
//!    [`deblend_intensity`].
//!
//! Dense maps are stored `(…, lat, lon)` with the spatial axes last, the
//! orientation image viewers expect. Unfit pixels are NaN in float maps
//! and `-1` in the order maps.
//!
//! Every pass is a pure function of the store contents, so re-running a
//! pass replaces its datasets with identical values.

use log::{info, warn};
use ndarray::{Array1, Array2, Array3, Array4, Array5, Axis, Ix2, Ix3, Ix5, Zip};

use crate::convolve::GaussianKernel2d;
use crate::model::{PixelKey, NBEST_UNRESOLVED, MARG_QUANTILES};
use crate::sampler::ComponentModel;
use crate::store::{ChunkedStore, Dataset, OverwritePolicy, StoreError};

/// Dataset names committed by the aggregation passes.
pub mod products {
    /// Selected model order per pixel, `(b, l)`, `-1` unresolved
    pub const NBEST: &str = "nbest";
    /// Log-evidence per model order, `(m, b, l)`, index 0 the null model
    pub const EVIDENCE: &str = "evidence";
    /// Log-evidence uncertainty, `(m, b, l)`
    pub const EVIDENCE_ERR: &str = "evidence_err";
    /// Akaike information criterion, `(m, b, l)`
    pub const AIC: &str = "AIC";
    /// Small-sample corrected AIC, `(m, b, l)`
    pub const AICC: &str = "AICc";
    /// Bayesian information criterion, `(m, b, l)`
    pub const BIC: &str = "BIC";
    /// Smoothed log-evidence, `(m, b, l)`
    pub const CONV_EVIDENCE: &str = "conv_evidence";
    /// Re-selected model order after smoothing, `(b, l)`
    pub const CONV_NBEST: &str = "conv_nbest";
    /// MAP parameters of the selected model, `(m, p, b, l)`
    pub const NBEST_MAP: &str = "nbest_MAP";
    /// Marginal quantiles of the selected model, `(m, p, M, b, l)`
    pub const NBEST_MARGINALS: &str = "nbest_marginals";
    /// Cumulative-probability levels of the marginal datasets, `(M,)`
    pub const MARG_QUANTILES: &str = "marg_quantiles";
    /// Histogram bin midpoints per parameter, `(p, h)`
    pub const PDF_BINS: &str = "pdf_bins";
    /// Marginal posterior histograms, `(m, p, h, b, l)`
    pub const POST_PDFS: &str = "post_pdfs";
    /// Smoothed posterior histograms, `(m, p, h, b, l)`
    pub const CONV_POST_PDFS: &str = "conv_post_pdfs";
    /// Quantiles of the smoothed histograms, `(m, p, M, b, l)`
    pub const CONV_MARGINALS: &str = "conv_marginals";
    /// Peak brightness per transition and component, `(t, m, b, l)`
    pub const PEAK_INTENSITY: &str = "peak_intensity";
    /// Integrated brightness per transition and component, `(t, m, b, l)`
    pub const INTEGRATED_INTENSITY: &str = "integrated_intensity";
    /// Deblended single-component spectra, `(t, m, S, b, l)`
    pub const HF_DEBLENDED: &str = "hf_deblended";
}

/// Number of histogram bin edges when no explicit bins are given.
pub const DEFAULT_N_EDGES: usize = 200;

/// Errors raised by the aggregation passes.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// Store access failure, including broken links
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A required run attribute was never persisted
    #[error("store is missing run attribute {0:?}")]
    MissingAttr(&'static str),

    /// A stored dataset has an unexpected number of axes
    #[error("dataset {0:?} has an unexpected shape")]
    BadShape(&'static str),

    /// The store has no linked pixel groups to aggregate
    #[error("store has no linked pixel groups")]
    NoPixels,

    /// The smoothed selection points at a model order the pixel never fit
    #[error("pixel {key} selected ncomp={ncomp} but holds no such fit")]
    MissingFit {
        /// Offending pixel
        key: PixelKey,
        /// Selected model order
        ncomp: usize,
    },

    /// Stored parameter count disagrees with the component model
    #[error("stored maps have {stored} parameters, model has {model}")]
    ParamCountMismatch {
        /// Parameter count in the stored maps
        stored: usize,
        /// Parameter count of the component model
        model: usize,
    },
}

/// Spatial grid and model-order cap from the persisted run attributes.
fn grid_dims(store: &ChunkedStore) -> Result<(usize, usize, usize), AggregateError> {
    let attrs = store.attrs();
    let n_lon = attrs.naxis1.ok_or(AggregateError::MissingAttr("naxis1"))?;
    let n_lat = attrs.naxis2.ok_or(AggregateError::MissingAttr("naxis2"))?;
    let ncomp_max = attrs
        .n_max_components
        .ok_or(AggregateError::MissingAttr("n_max_components"))?;
    Ok((n_lon, n_lat, ncomp_max))
}

/// Pass 1: per-pixel selection and evidence maps.
///
/// Commits `nbest` plus `evidence`, `evidence_err`, `AIC`, `AICc`, `BIC`
/// over the model-order axis, with index 0 holding the null model. Orders
/// a pixel never attempted stay NaN.
pub fn aggregate_attributes(store: &mut ChunkedStore) -> Result<(), AggregateError> {
    let (n_lon, n_lat, ncomp_max) = grid_dims(store)?;
    let n_model = ncomp_max + 1;

    let mut nbest = Array2::<i32>::from_elem((n_lat, n_lon), NBEST_UNRESOLVED);
    let mut evidence = Array3::<f64>::from_elem((n_model, n_lat, n_lon), f64::NAN);
    let mut evidence_err = evidence.clone();
    let mut aic = evidence.clone();
    let mut aicc = evidence.clone();
    let mut bic = evidence.clone();

    for record in store.iter_pixel_groups() {
        let record = record?;
        let (l, b) = (record.key.i_lon, record.key.i_lat);
        nbest[[b, l]] = record.nbest;
        if let Some(null) = record.fits.first().and_then(|f| f.null_stats) {
            evidence[[0, b, l]] = null.ln_evidence;
            // The null model has no sampling uncertainty.
            evidence_err[[0, b, l]] = 0.0;
            aic[[0, b, l]] = null.aic;
            aicc[[0, b, l]] = null.aicc;
            bic[[0, b, l]] = null.bic;
        }
        for fit in &record.fits {
            let m = fit.ncomp;
            if m < n_model {
                evidence[[m, b, l]] = fit.ln_evidence;
                evidence_err[[m, b, l]] = fit.ln_evidence_err;
                aic[[m, b, l]] = fit.aic;
                aicc[[m, b, l]] = fit.aicc;
                bic[[m, b, l]] = fit.bic;
            }
        }
    }

    let policy = OverwritePolicy::Clobber;
    let nbest = nbest.into_dyn();
    store.create_dataset(products::NBEST, Dataset::from_i32(&nbest), policy)?;
    for (name, array) in [
        (products::EVIDENCE, evidence),
        (products::EVIDENCE_ERR, evidence_err),
        (products::AIC, aic),
        (products::AICC, aicc),
        (products::BIC, bic),
    ] {
        let array = array.into_dyn();
        store.create_dataset(name, Dataset::from_f64(&array), policy)?;
    }
    info!("aggregated attribute maps over {n_lat}x{n_lon} grid");
    Ok(())
}

/// Pass 2: smoothed evidence and walk-up re-selection.
///
/// Smooths each evidence plane with a Gaussian kernel of `std_pix` map
/// pixels, then walks each pixel's selection upward one order at a time
/// while the smoothed evidence gain beats the run's threshold. Unresolved
/// pixels stay `-1`, and no pixel is promoted past one order beyond its
/// own accepted fit, which is the deepest order its record holds.
pub fn convolve_evidence(store: &mut ChunkedStore, std_pix: f64) -> Result<(), AggregateError> {
    let lnz_threshold = store
        .attrs()
        .lnz_threshold
        .ok_or(AggregateError::MissingAttr("lnZ_threshold"))?;
    let nbest = store
        .dataset_i32(products::NBEST)?
        .into_dimensionality::<Ix2>()
        .map_err(|_| AggregateError::BadShape(products::NBEST))?;
    let evidence = store
        .dataset_f64(products::EVIDENCE)?
        .into_dimensionality::<Ix3>()
        .map_err(|_| AggregateError::BadShape(products::EVIDENCE))?;

    let kernel = GaussianKernel2d::new(std_pix);
    let n_model = evidence.dim().0;
    let mut conv_evidence = Array3::<f64>::zeros(evidence.raw_dim());
    for m in 0..n_model {
        conv_evidence
            .index_axis_mut(Axis(0), m)
            .assign(&kernel.convolve(evidence.index_axis(Axis(0), m)));
    }

    let mut conv_nbest = Array2::<i32>::zeros(nbest.raw_dim());
    for i in 0..n_model - 1 {
        let lo = conv_evidence.index_axis(Axis(0), i);
        let hi = conv_evidence.index_axis(Axis(0), i + 1);
        Zip::from(&mut conv_nbest)
            .and(&lo)
            .and(&hi)
            .for_each(|c, &lo, &hi| {
                // NaN differences never promote.
                if *c == i as i32 && hi - lo > lnz_threshold {
                    *c += 1;
                }
            });
    }
    Zip::from(&mut conv_nbest).and(&nbest).for_each(|c, &n| {
        if n == NBEST_UNRESOLVED {
            *c = NBEST_UNRESOLVED;
        } else if *c > n + 1 {
            *c = n + 1;
        }
    });

    let policy = OverwritePolicy::Clobber;
    let conv_evidence = conv_evidence.into_dyn();
    store.create_dataset(products::CONV_EVIDENCE, Dataset::from_f64(&conv_evidence), policy)?;
    let conv_nbest = conv_nbest.into_dyn();
    store.create_dataset(products::CONV_NBEST, Dataset::from_i32(&conv_nbest), policy)?;
    info!("re-selected model orders from smoothed evidence, std {std_pix} pix");
    Ok(())
}

/// Pass 3: MAP parameter and marginal-quantile maps.
///
/// For every pixel the smoothed selection `conv_nbest` picks the fit whose
/// parameters populate the maps; components beyond the selected order stay
/// NaN. Also commits the quantile levels themselves so readers need not
/// hard-code them.
pub fn aggregate_products(store: &mut ChunkedStore) -> Result<(), AggregateError> {
    let (n_lon, n_lat, ncomp_max) = grid_dims(store)?;
    let conv_nbest = store
        .dataset_i32(products::CONV_NBEST)?
        .into_dimensionality::<Ix2>()
        .map_err(|_| AggregateError::BadShape(products::CONV_NBEST))?;
    let n_marg = MARG_QUANTILES.len();

    let mut maps: Option<(Array4<f64>, Array5<f64>)> = None;
    for record in store.iter_pixel_groups() {
        let record = record?;
        let n_params = match record.fits.first() {
            Some(fit) => fit.n_params,
            None => continue,
        };
        let (nbest_map, marginals) = maps.get_or_insert_with(|| {
            (
                Array4::from_elem((ncomp_max, n_params, n_lat, n_lon), f64::NAN),
                Array5::from_elem((ncomp_max, n_params, n_marg, n_lat, n_lon), f64::NAN),
            )
        });
        let (l, b) = (record.key.i_lon, record.key.i_lat);
        let n = conv_nbest[[b, l]];
        if n < 1 {
            continue;
        }
        let n = n as usize;
        let fit = record.fit(n).ok_or(AggregateError::MissingFit {
            key: record.key,
            ncomp: n,
        })?;
        for p in 0..n_params {
            for j in 0..n.min(ncomp_max) {
                nbest_map[[j, p, b, l]] = fit.map_param(p, j);
                for q in 0..n_marg {
                    marginals[[j, p, q, b, l]] = fit.marginal(q, p, j);
                }
            }
        }
    }

    let (nbest_map, marginals) = maps.ok_or(AggregateError::NoPixels)?;
    let policy = OverwritePolicy::Clobber;
    let nbest_map = nbest_map.into_dyn();
    store.create_dataset(products::NBEST_MAP, Dataset::from_f64(&nbest_map), policy)?;
    let marginals = marginals.into_dyn();
    store.create_dataset(products::NBEST_MARGINALS, Dataset::from_f64(&marginals), policy)?;
    let levels = Array1::from_vec(MARG_QUANTILES.to_vec()).into_dyn();
    store.create_dataset(products::MARG_QUANTILES, Dataset::from_f64(&levels), policy)?;
    info!("aggregated MAP and marginal maps");
    Ok(())
}

/// Histogram bin edges derived from the global marginal extrema.
///
/// Per parameter, the range spans the minimum of quantile level 0 and the
/// maximum of the top level across all pixels and components, split into
/// [`DEFAULT_N_EDGES`] edges. Parameters with no finite marginals get a
/// unit placeholder range.
fn default_bins(store: &ChunkedStore) -> Result<Array2<f64>, AggregateError> {
    let marginals = store
        .dataset_f64(products::NBEST_MARGINALS)?
        .into_dimensionality::<Ix5>()
        .map_err(|_| AggregateError::BadShape(products::NBEST_MARGINALS))?;
    let (_, n_params, n_marg, _, _) = marginals.dim();
    let mut edges = Array2::<f64>::zeros((n_params, DEFAULT_N_EDGES));
    for p in 0..n_params {
        let lo_plane = marginals.index_axis(Axis(1), p);
        let mut vmin = f64::INFINITY;
        let mut vmax = f64::NEG_INFINITY;
        for &v in lo_plane.index_axis(Axis(1), 0).iter() {
            if v.is_finite() && v < vmin {
                vmin = v;
            }
        }
        for &v in lo_plane.index_axis(Axis(1), n_marg - 1).iter() {
            if v.is_finite() && v > vmax {
                vmax = v;
            }
        }
        if !(vmin.is_finite() && vmax.is_finite() && vmax > vmin) {
            warn!("no finite marginal range for parameter {p}, using [0, 1]");
            vmin = 0.0;
            vmax = 1.0;
        }
        let step = (vmax - vmin) / (DEFAULT_N_EDGES - 1) as f64;
        for (i, e) in edges.row_mut(p).iter_mut().enumerate() {
            *e = vmin + step * i as f64;
        }
    }
    Ok(edges)
}

/// Bin index of `v` against ascending `edges`; the top edge is inclusive.
fn bin_index(edges: &[f64], v: f64) -> Option<usize> {
    let n = edges.len();
    if !(v >= edges[0] && v <= edges[n - 1]) {
        return None;
    }
    if v >= edges[n - 1] {
        return Some(n - 2);
    }
    let idx = edges.partition_point(|e| *e <= v);
    Some(idx - 1)
}

/// Pass 4: marginal posterior histograms.
///
/// Histograms each selected fit's posterior samples per parameter and
/// component into shared per-parameter bins, normalized to unit sum.
/// `bins` gives explicit edges of shape `(p, edges)`; by default edges
/// come from [`default_bins`]. Commits the bin midpoints as `pdf_bins`.
pub fn aggregate_pdfs(
    store: &mut ChunkedStore,
    bins: Option<Array2<f64>>,
) -> Result<(), AggregateError> {
    let (n_lon, n_lat, ncomp_max) = grid_dims(store)?;
    let conv_nbest = store
        .dataset_i32(products::CONV_NBEST)?
        .into_dimensionality::<Ix2>()
        .map_err(|_| AggregateError::BadShape(products::CONV_NBEST))?;
    let edges = match bins {
        Some(edges) => edges,
        None => default_bins(store)?,
    };
    let (n_params, n_edges) = edges.dim();
    let n_hist = n_edges - 1;

    let mut post_pdfs =
        Array5::from_elem((ncomp_max, n_params, n_hist, n_lat, n_lon), f64::NAN);
    let mut hist = vec![0.0; n_hist];
    for record in store.iter_pixel_groups() {
        let record = record?;
        let (l, b) = (record.key.i_lon, record.key.i_lat);
        let n = conv_nbest[[b, l]];
        if n < 1 {
            continue;
        }
        let n = n as usize;
        let fit = record.fit(n).ok_or(AggregateError::MissingFit {
            key: record.key,
            ncomp: n,
        })?;
        for p in 0..n_params.min(fit.n_params) {
            let row = edges.row(p).to_vec();
            for j in 0..n.min(ncomp_max) {
                hist.iter_mut().for_each(|h| *h = 0.0);
                for v in fit.posterior_column(fit.column(p, j)) {
                    if let Some(i) = bin_index(&row, v) {
                        hist[i] += 1.0;
                    }
                }
                let total: f64 = hist.iter().sum();
                if total > 0.0 {
                    hist.iter_mut().for_each(|h| *h /= total);
                }
                for (h, value) in hist.iter().enumerate() {
                    post_pdfs[[j, p, h, b, l]] = *value;
                }
            }
        }
    }

    let mut pdf_bins = Array2::<f64>::zeros((n_params, n_hist));
    for p in 0..n_params {
        for h in 0..n_hist {
            pdf_bins[[p, h]] = 0.5 * (edges[[p, h]] + edges[[p, h + 1]]);
        }
    }

    let policy = OverwritePolicy::Clobber;
    let pdf_bins = pdf_bins.into_dyn();
    store.create_dataset(products::PDF_BINS, Dataset::from_f64(&pdf_bins), policy)?;
    let post_pdfs = post_pdfs.into_dyn();
    store.create_dataset(products::POST_PDFS, Dataset::from_f64(&post_pdfs), policy)?;
    info!("aggregated posterior histograms, {n_hist} bins per parameter");
    Ok(())
}

/// Pass 5: spatially smoothed posterior histograms.
///
/// Smooths every `(component, parameter, bin)` plane over the sky, then
/// re-imposes NaN wherever the unsmoothed histogram was NaN: smoothing
/// interpolates across fit pixels but must not invent posteriors at
/// pixels that were never fit. Histograms are renormalized afterwards.
pub fn convolve_post_pdfs(store: &mut ChunkedStore, std_pix: f64) -> Result<(), AggregateError> {
    let post_pdfs = store
        .dataset_f64(products::POST_PDFS)?
        .into_dimensionality::<Ix5>()
        .map_err(|_| AggregateError::BadShape(products::POST_PDFS))?;
    let kernel = GaussianKernel2d::new(std_pix);
    let (n_comp, n_params, n_hist, n_lat, n_lon) = post_pdfs.dim();

    let mut conv = Array5::<f64>::from_elem(post_pdfs.raw_dim(), f64::NAN);
    for m in 0..n_comp {
        for p in 0..n_params {
            for h in 0..n_hist {
                let plane = post_pdfs
                    .index_axis(Axis(0), m)
                    .index_axis(Axis(0), p)
                    .index_axis(Axis(0), h)
                    .to_owned();
                let smoothed = kernel.convolve(plane.view());
                for b in 0..n_lat {
                    for l in 0..n_lon {
                        if plane[[b, l]].is_nan() {
                            continue;
                        }
                        conv[[m, p, h, b, l]] = smoothed[[b, l]];
                    }
                }
            }
        }
    }
    for m in 0..n_comp {
        for p in 0..n_params {
            for b in 0..n_lat {
                for l in 0..n_lon {
                    let total: f64 = (0..n_hist).map(|h| conv[[m, p, h, b, l]]).sum();
                    if total.is_finite() && total > 0.0 {
                        for h in 0..n_hist {
                            conv[[m, p, h, b, l]] /= total;
                        }
                    }
                }
            }
        }
    }

    let conv = conv.into_dyn();
    store.create_dataset(
        products::CONV_POST_PDFS,
        Dataset::from_f64(&conv),
        OverwritePolicy::Clobber,
    )?;
    info!("smoothed posterior histograms, std {std_pix} pix");
    Ok(())
}

/// Piecewise-linear interpolation of `x` against ascending `xp`/`fp`,
/// clamped to the endpoints.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    if x <= xp[0] {
        return fp[0];
    }
    let last = xp.len() - 1;
    if x >= xp[last] {
        return fp[last];
    }
    let i = xp.partition_point(|v| *v <= x);
    let (x0, x1) = (xp[i - 1], xp[i]);
    let (f0, f1) = (fp[i - 1], fp[i]);
    let dx = x1 - x0;
    if dx <= 0.0 {
        return f0;
    }
    f0 + (f1 - f0) * (x - x0) / dx
}

/// Pass 6a: marginal quantiles of the smoothed histograms.
///
/// Builds the cumulative distribution of each smoothed histogram and
/// interpolates the standard quantile levels from it, giving
/// spatially-coherent credible intervals.
pub fn quantize_conv_marginals(store: &mut ChunkedStore) -> Result<(), AggregateError> {
    let conv = store
        .dataset_f64(products::CONV_POST_PDFS)?
        .into_dimensionality::<Ix5>()
        .map_err(|_| AggregateError::BadShape(products::CONV_POST_PDFS))?;
    let pdf_bins = store
        .dataset_f64(products::PDF_BINS)?
        .into_dimensionality::<Ix2>()
        .map_err(|_| AggregateError::BadShape(products::PDF_BINS))?;
    let (n_comp, n_params, n_hist, n_lat, n_lon) = conv.dim();
    let n_marg = MARG_QUANTILES.len();

    let mut marginals =
        Array5::from_elem((n_comp, n_params, n_marg, n_lat, n_lon), f64::NAN);
    let mut cdf = vec![0.0; n_hist];
    for m in 0..n_comp {
        for p in 0..n_params {
            let centers = pdf_bins.row(p).to_vec();
            for b in 0..n_lat {
                for l in 0..n_lon {
                    let mut total = 0.0;
                    let mut finite = true;
                    for h in 0..n_hist {
                        let v = conv[[m, p, h, b, l]];
                        if !v.is_finite() {
                            finite = false;
                            break;
                        }
                        total += v;
                        cdf[h] = total;
                    }
                    if !finite || total <= 0.0 {
                        continue;
                    }
                    cdf.iter_mut().for_each(|c| *c /= total);
                    for (q, level) in MARG_QUANTILES.iter().enumerate() {
                        marginals[[m, p, q, b, l]] = interp(*level, &cdf, &centers);
                    }
                }
            }
        }
    }

    let marginals = marginals.into_dyn();
    store.create_dataset(
        products::CONV_MARGINALS,
        Dataset::from_f64(&marginals),
        OverwritePolicy::Clobber,
    )?;
    info!("quantized smoothed marginals");
    Ok(())
}

/// Pass 6b: model-derived intensity maps.
///
/// Evaluates each fitted component of the MAP parameter maps through the
/// component model, per transition: peak brightness and velocity-
/// integrated brightness from the full line profile, plus a deblended
/// cube that replaces the profile with a single ideal Gaussian per
/// component over the centroid-parameter bin axis, normalized to carry
/// the integrated intensity. Blended hyperfine structure thus collapses
/// into one clean line per component.
pub fn deblend_intensity<C: ComponentModel>(
    store: &mut ChunkedStore,
    model: &C,
) -> Result<(), AggregateError> {
    let nbest_map = store
        .dataset_f64(products::NBEST_MAP)?
        .into_dimensionality::<ndarray::Ix4>()
        .map_err(|_| AggregateError::BadShape(products::NBEST_MAP))?;
    let pdf_bins = store
        .dataset_f64(products::PDF_BINS)?
        .into_dimensionality::<Ix2>()
        .map_err(|_| AggregateError::BadShape(products::PDF_BINS))?;
    let (n_comp, n_params, n_lat, n_lon) = nbest_map.dim();
    if n_params != model.n_params() {
        return Err(AggregateError::ParamCountMismatch {
            stored: n_params,
            model: model.n_params(),
        });
    }

    let n_trans = model.n_transitions();
    // Velocity axis of the deblended cube: the centroid parameter's bins.
    let vaxis = pdf_bins.row(model.centroid_index()).to_vec();
    let n_vbin = vaxis.len();
    let dv_bin = (vaxis[1] - vaxis[0]).abs();

    let mut peak = Array4::from_elem((n_trans, n_comp, n_lat, n_lon), f64::NAN);
    let mut integrated = peak.clone();
    let mut deblended =
        Array5::from_elem((n_trans, n_comp, n_vbin, n_lat, n_lon), f64::NAN);
    let mut params = vec![0.0; n_params];
    for b in 0..n_lat {
        for l in 0..n_lon {
            for j in 0..n_comp {
                let mut fitted = true;
                for p in 0..n_params {
                    let v = nbest_map[[j, p, b, l]];
                    if !v.is_finite() {
                        fitted = false;
                        break;
                    }
                    params[p] = v;
                }
                if !fitted {
                    continue;
                }
                let vcen = params[model.centroid_index()];
                let sigm = params[model.width_index()];
                for t in 0..n_trans {
                    let spectrum = model.predict(&params, t);
                    let mut max = f64::NEG_INFINITY;
                    let mut sum = 0.0;
                    for v in &spectrum {
                        if *v > max {
                            max = *v;
                        }
                        sum += v;
                    }
                    let intint = sum * model.channel_width(t).abs();
                    peak[[t, j, b, l]] = max;
                    integrated[[t, j, b, l]] = intint;
                    let norm = dv_bin / (sigm * (2.0 * std::f64::consts::PI).sqrt());
                    for (s, v) in vaxis.iter().enumerate() {
                        let z = (v - vcen) / sigm;
                        deblended[[t, j, s, b, l]] = norm * intint * (-0.5 * z * z).exp();
                    }
                }
            }
        }
    }

    let policy = OverwritePolicy::Clobber;
    let peak = peak.into_dyn();
    store.create_dataset(products::PEAK_INTENSITY, Dataset::from_f64(&peak), policy)?;
    let integrated = integrated.into_dyn();
    store.create_dataset(
        products::INTEGRATED_INTENSITY,
        Dataset::from_f64(&integrated),
        policy,
    )?;
    let deblended = deblended.into_dyn();
    store.create_dataset(products::HF_DEBLENDED, Dataset::from_f64(&deblended), policy)?;
    info!("deblended component intensities over {n_trans} transitions");
    Ok(())
}

/// Knobs of the full post-processing run.
#[derive(Debug, Clone)]
pub struct PostprocessConfig {
    /// Gaussian smoothing bandwidth in map pixels
    pub std_pix: f64,
    /// Explicit histogram bin edges, `(p, edges)`; derived when `None`
    pub bins: Option<Array2<f64>>,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            std_pix: 1.0,
            bins: None,
        }
    }
}

/// Run all aggregation passes in dependency order.
pub fn postprocess<C: ComponentModel>(
    store: &mut ChunkedStore,
    model: &C,
    config: &PostprocessConfig,
) -> Result<(), AggregateError> {
    aggregate_attributes(store)?;
    convolve_evidence(store, config.std_pix)?;
    aggregate_products(store)?;
    aggregate_pdfs(store, config.bins.clone())?;
    convolve_post_pdfs(store, config.std_pix)?;
    quantize_conv_marginals(store)?;
    deblend_intensity(store, model)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use tempfile::tempdir;

    use crate::dispatch::FitDispatcher;
    use crate::sampler::SamplerConfig;
    use crate::store::ChunkedStore;
    use crate::synth::scripted_stack;

    /// The reference 2x2 scenario: accepted-2, no-signal, unresolved,
    /// accepted-1 after a rejected second order.
    fn fitted_store(dir: &std::path::Path) -> ChunkedStore {
        let (stack, factory, sampler) = scripted_stack(&[
            (0, 0, vec![0.0, 15.0, 40.0]),
            (0, 1, vec![0.0, 5.0]),
            (1, 0, vec![f64::NAN]),
            (1, 1, vec![0.0, 20.0, 25.0]),
        ]);
        let mut store = ChunkedStore::create(dir.join("run"), 2).unwrap();
        FitDispatcher::new(11.0, 2, SamplerConfig::default())
            .run(&stack, &factory, &sampler, &mut store)
            .unwrap();
        store
    }

    #[test]
    fn test_attribute_maps_match_selection() {
        let dir = tempdir().unwrap();
        let mut store = fitted_store(dir.path());
        aggregate_attributes(&mut store).unwrap();

        // Storage order (b, l).
        let nbest = store.dataset_i32(products::NBEST).unwrap();
        assert_eq!(nbest[[0, 0]], 2);
        assert_eq!(nbest[[1, 0]], 0);
        assert_eq!(nbest[[0, 1]], -1);
        assert_eq!(nbest[[1, 1]], 1);

        let evidence = store.dataset_f64(products::EVIDENCE).unwrap();
        assert_eq!(evidence.shape(), &[3, 2, 2]);
        // Pixel (0, 0): null 0, one component 15, two components 40.
        assert_eq!(evidence[[0, 0, 0]], 0.0);
        assert_eq!(evidence[[1, 0, 0]], 15.0);
        assert_eq!(evidence[[2, 0, 0]], 40.0);
        // Pixel (0, 1) never fit a second order.
        assert_eq!(evidence[[1, 1, 0]], 5.0);
        assert!(evidence[[2, 1, 0]].is_nan());
        // The unresolved pixel is NaN throughout.
        assert!(evidence[[0, 0, 1]].is_nan());

        let err = store.dataset_f64(products::EVIDENCE_ERR).unwrap();
        assert_eq!(err[[0, 0, 0]], 0.0);
        assert!(err[[1, 0, 0]] > 0.0);
    }

    fn inject_evidence_maps(
        store: &mut ChunkedStore,
        nbest: ArrayD<i32>,
        evidence: ArrayD<f64>,
    ) {
        store
            .create_dataset(products::NBEST, Dataset::from_i32(&nbest), OverwritePolicy::Clobber)
            .unwrap();
        store
            .create_dataset(
                products::EVIDENCE,
                Dataset::from_f64(&evidence),
                OverwritePolicy::Clobber,
            )
            .unwrap();
    }

    #[test]
    fn test_walk_up_promotes_at_most_one_past_nbest() {
        let dir = tempdir().unwrap();
        let mut store = ChunkedStore::create(dir.path().join("run"), 1).unwrap();
        store.insert_run_parameters(11.0, 2, "test").unwrap();
        let mut simple = crate::cube::HeaderBlock::new();
        simple.insert("NAXIS1".into(), serde_json::json!(1));
        store.insert_header(&simple.clone(), &simple, 3, 3).unwrap();

        // Uniform evidence gains of 20 per order beat the threshold
        // everywhere, so every pixel wants to walk up to order 2.
        let nbest = Array2::from_shape_vec((3, 3), vec![0, 0, 0, 0, 1, 0, 0, 0, -1]).unwrap();
        let mut evidence = Array3::<f64>::zeros((3, 3, 3));
        evidence.index_axis_mut(Axis(0), 1).fill(20.0);
        evidence.index_axis_mut(Axis(0), 2).fill(40.0);
        inject_evidence_maps(&mut store, nbest.into_dyn(), evidence.into_dyn());

        convolve_evidence(&mut store, 0.5).unwrap();
        let conv_nbest = store.dataset_i32(products::CONV_NBEST).unwrap();
        // nbest 0 pixels clamp at 1, the nbest 1 pixel reaches 2, and the
        // unresolved pixel stays -1.
        assert_eq!(conv_nbest[[0, 0]], 1);
        assert_eq!(conv_nbest[[1, 1]], 2);
        assert_eq!(conv_nbest[[2, 2]], -1);
    }

    #[test]
    fn test_no_promotion_below_threshold() {
        let dir = tempdir().unwrap();
        let mut store = ChunkedStore::create(dir.path().join("run"), 1).unwrap();
        store.insert_run_parameters(11.0, 2, "test").unwrap();
        let simple = crate::cube::HeaderBlock::new();
        store.insert_header(&simple.clone(), &simple, 2, 2).unwrap();

        let nbest = Array2::from_elem((2, 2), 2);
        let mut evidence = Array3::<f64>::zeros((3, 2, 2));
        // Gains of 5 stay below the threshold of 11.
        evidence.index_axis_mut(Axis(0), 1).fill(5.0);
        evidence.index_axis_mut(Axis(0), 2).fill(10.0);
        inject_evidence_maps(&mut store, nbest.into_dyn(), evidence.into_dyn());

        convolve_evidence(&mut store, 0.5).unwrap();
        let conv_nbest = store.dataset_i32(products::CONV_NBEST).unwrap();
        assert!(conv_nbest.iter().all(|&n| n == 0));
    }

    #[test]
    fn test_product_maps_use_smoothed_selection() {
        let dir = tempdir().unwrap();
        let mut store = fitted_store(dir.path());
        aggregate_attributes(&mut store).unwrap();
        convolve_evidence(&mut store, 0.5).unwrap();
        aggregate_products(&mut store).unwrap();

        let conv_nbest = store.dataset_i32(products::CONV_NBEST).unwrap();
        let nbest_map = store.dataset_f64(products::NBEST_MAP).unwrap();
        assert_eq!(nbest_map.shape(), &[2, 3, 2, 2]);
        // At the accepted-2 pixel both components carry MAP values.
        let n00 = conv_nbest[[0, 0]];
        assert!(n00 >= 1);
        assert!(nbest_map[[0, 0, 0, 0]].is_finite());
        // At the unresolved pixel everything stays NaN.
        assert!(nbest_map[[0, 0, 0, 1]].is_nan());

        let levels = store.dataset_f64(products::MARG_QUANTILES).unwrap();
        assert_eq!(levels.shape(), &[MARG_QUANTILES.len()]);
        assert_eq!(levels[[0]], 0.0);
        assert_eq!(levels[[MARG_QUANTILES.len() - 1]], 1.0);
    }

    #[test]
    fn test_pdf_pass_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = fitted_store(dir.path());
        aggregate_attributes(&mut store).unwrap();
        convolve_evidence(&mut store, 0.5).unwrap();
        aggregate_products(&mut store).unwrap();

        aggregate_pdfs(&mut store, None).unwrap();
        let first = store.dataset_f64(products::POST_PDFS).unwrap();
        aggregate_pdfs(&mut store, None).unwrap();
        let second = store.dataset_f64(products::POST_PDFS).unwrap();
        assert_eq!(first.shape(), second.shape());
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(a == b || (a.is_nan() && b.is_nan()));
        }
    }

    #[test]
    fn test_histograms_are_normalized_and_masked() {
        let dir = tempdir().unwrap();
        let mut store = fitted_store(dir.path());
        aggregate_attributes(&mut store).unwrap();
        convolve_evidence(&mut store, 0.5).unwrap();
        aggregate_products(&mut store).unwrap();
        aggregate_pdfs(&mut store, None).unwrap();

        let post = store.dataset_f64(products::POST_PDFS).unwrap();
        let (n_hist, conv_nbest) = (
            post.shape()[2],
            store.dataset_i32(products::CONV_NBEST).unwrap(),
        );
        // The accepted pixel's first component sums to one.
        assert!(conv_nbest[[0, 0]] >= 1);
        let total: f64 = (0..n_hist).map(|h| post[[0, 0, h, 0, 0]]).sum();
        assert!((total - 1.0).abs() < 1e-9);
        // The unresolved pixel stays NaN.
        assert!(post[[0, 0, 0, 0, 1]].is_nan());
    }

    #[test]
    fn test_smoothed_pdfs_keep_nan_mask() {
        let dir = tempdir().unwrap();
        let mut store = fitted_store(dir.path());
        aggregate_attributes(&mut store).unwrap();
        convolve_evidence(&mut store, 0.5).unwrap();
        aggregate_products(&mut store).unwrap();
        aggregate_pdfs(&mut store, None).unwrap();
        convolve_post_pdfs(&mut store, 0.5).unwrap();

        let post = store.dataset_f64(products::POST_PDFS).unwrap();
        let conv = store.dataset_f64(products::CONV_POST_PDFS).unwrap();
        assert_eq!(post.shape(), conv.shape());
        for (p, c) in post.iter().zip(conv.iter()) {
            // NaN exactly where the unsmoothed histograms are NaN.
            assert_eq!(p.is_nan(), c.is_nan());
        }
    }

    #[test]
    fn test_interp_clamps_and_interpolates() {
        let xp = [0.0, 0.5, 1.0];
        let fp = [10.0, 20.0, 40.0];
        assert_eq!(interp(-1.0, &xp, &fp), 10.0);
        assert_eq!(interp(2.0, &xp, &fp), 40.0);
        assert_eq!(interp(0.25, &xp, &fp), 15.0);
        assert_eq!(interp(0.75, &xp, &fp), 30.0);
    }

    #[test]
    fn test_bin_index_top_edge_inclusive() {
        let edges = [0.0, 1.0, 2.0];
        assert_eq!(bin_index(&edges, 0.0), Some(0));
        assert_eq!(bin_index(&edges, 0.9), Some(0));
        assert_eq!(bin_index(&edges, 1.0), Some(1));
        assert_eq!(bin_index(&edges, 2.0), Some(1));
        assert_eq!(bin_index(&edges, 2.1), None);
        assert_eq!(bin_index(&edges, -0.1), None);
    }
}
