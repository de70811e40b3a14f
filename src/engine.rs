//! # Model Selection Engine
//!
//! The per-pixel fitting loop. For one pixel the engine fits successive
//! model orders and applies the evidence-threshold stopping rule: starting
//! from the null-model baseline, each additional component must raise the
//! log-evidence by at least the threshold to be accepted. The first order
//! that fails the test stops the loop; that rejected fit is still kept for
//! diagnostics but never updates the selection.
//!
//! The rule is deliberately greedy. It does not try every order up to the
//! cap and pick the global maximum; sampler invocations dominate the cost
//! per pixel, and evidence gains are monotone up to a point in practice.
//!
//! ## Error classes
//!
//! - Non-finite samples in the input spectra: the pixel is unresolved,
//!   nothing is written, the sweep continues.
//! - Non-finite evidence (null or sampled): fatal for the worker, since
//!   the stopping rule is undefined against a non-finite baseline.

use log::{debug, info};

use crate::cube::SpectrumData;
use crate::model::{ModelFit, NullStats, PixelKey, PixelRecord, SelectionState, MARG_QUANTILES};
use crate::sampler::{
    ModelFactory, PixelModel, Sampler, SamplerConfig, SamplerError, SamplerResult,
};

/// Errors raised by the fitting loop. All of these abort the worker.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Null-model evidence came out non-finite
    #[error("non-finite null evidence at pixel {key}")]
    NonFiniteNullEvidence {
        /// Offending pixel
        key: PixelKey,
    },

    /// Sampler returned a non-finite evidence estimate
    #[error("non-finite evidence at pixel {key}, ncomp={ncomp}")]
    NonFiniteEvidence {
        /// Offending pixel
        key: PixelKey,
        /// Model order being fit
        ncomp: usize,
    },

    /// Sampler or model construction failure
    #[error(transparent)]
    Sampler(#[from] SamplerError),
}

/// Outcome of fitting one pixel.
#[derive(Debug, Clone)]
pub struct PixelFitOutcome {
    /// Selection result of the stopping rule
    pub state: SelectionState,
    /// The persisted record; `None` for unresolved pixels, which write
    /// nothing
    pub record: Option<PixelRecord>,
}

/// The per-pixel fitting loop; one instance per worker.
pub struct ModelSelectionEngine<'a, F, S> {
    factory: &'a F,
    sampler: &'a S,
    lnz_threshold: f64,
    ncomp_max: usize,
    sampler_config: SamplerConfig,
}

impl<'a, F, S> ModelSelectionEngine<'a, F, S>
where
    F: ModelFactory,
    S: Sampler<F::Model>,
{
    /// Create an engine with the given stopping rule.
    pub fn new(
        factory: &'a F,
        sampler: &'a S,
        lnz_threshold: f64,
        ncomp_max: usize,
        sampler_config: SamplerConfig,
    ) -> Self {
        Self {
            factory,
            sampler,
            lnz_threshold,
            ncomp_max,
            sampler_config,
        }
    }

    /// Evidence-improvement threshold.
    pub fn lnz_threshold(&self) -> f64 {
        self.lnz_threshold
    }

    /// Maximum model order attempted per pixel.
    pub fn ncomp_max(&self) -> usize {
        self.ncomp_max
    }

    /// Fit one pixel, producing its record and selection state.
    pub fn fit_pixel(
        &self,
        key: PixelKey,
        spectra: &[SpectrumData],
    ) -> Result<PixelFitOutcome, EngineError> {
        if spectra.iter().any(|s| s.has_nans()) {
            info!("-- {key} SKIP: has NaN values");
            return Ok(PixelFitOutcome {
                state: SelectionState::Unresolved,
                record: None,
            });
        }

        // The null model has no free parameters, so its evidence is the
        // baseline of the chain and must be finite for the rule to apply.
        let first_model = self.factory.from_data(spectra, 1)?;
        let null_lnz = first_model.null_ln_evidence();
        if !null_lnz.is_finite() {
            return Err(EngineError::NonFiniteNullEvidence { key });
        }
        let null_stats = null_information_criteria(&first_model);

        let mut fits: Vec<ModelFit> = Vec::new();
        let mut old_lnz = null_lnz;
        let mut nbest = 0usize;
        let mut model = first_model;
        let mut ncomp = 1usize;
        // Iteratively fit additional components until they no longer
        // produce a significant increase in the evidence.
        loop {
            info!("-- {key} -> N = {ncomp}");
            let result = self.sampler.run(&model, &self.sampler_config)?;
            if !result.ln_evidence.is_finite() {
                return Err(EngineError::NonFiniteEvidence { key, ncomp });
            }
            let mut fit = build_model_fit(&model, &result);
            if ncomp == 1 {
                fit.null_stats = Some(null_stats);
            }
            let delta = result.ln_evidence - old_lnz;
            fits.push(fit);
            if delta < self.lnz_threshold {
                debug!("-- {key} stop at N = {ncomp}: dlnZ = {delta:.3}");
                break;
            }
            old_lnz = result.ln_evidence;
            nbest = ncomp;
            if ncomp == self.ncomp_max {
                break;
            }
            ncomp += 1;
            model = self.factory.from_data(spectra, ncomp)?;
        }

        let state = if nbest == 0 {
            SelectionState::NoSignal
        } else {
            SelectionState::Accepted(nbest)
        };
        let record = PixelRecord {
            key,
            nbest: state.nbest(),
            fits,
        };
        Ok(PixelFitOutcome {
            state,
            record: Some(record),
        })
    }
}

/// AIC/AICc/BIC of the null model (zero free parameters).
fn null_information_criteria<M: PixelModel>(model: &M) -> NullStats {
    let ll0 = model.null_loglikelihood();
    NullStats {
        ln_evidence: model.null_ln_evidence(),
        aic: -2.0 * ll0,
        aicc: -2.0 * ll0,
        bic: -2.0 * ll0,
    }
}

/// Assemble a [`ModelFit`] from a sampler result, computing the
/// information criteria and marginal quantiles.
fn build_model_fit<M: PixelModel>(model: &M, result: &SamplerResult) -> ModelFit {
    let k = model.ndim() as f64;
    let n = model.n_data() as f64;
    let max_ll = result.max_loglike;
    let aic = 2.0 * k - 2.0 * max_ll;
    let aicc = aic + (2.0 * k * k + 2.0 * k) / (n - k - 1.0);
    let bic = k * n.ln() - 2.0 * max_ll;

    let (n_samples, ndim) = result.posteriors.dim();
    let n_params = model.n_params();
    let ncomp = model.ncomp();
    // marginals flat (M, p, m): quantile level is the slowest axis
    let mut marginals = vec![f64::NAN; MARG_QUANTILES.len() * ndim];
    for col in 0..ndim {
        let mut column: Vec<f64> = result.posteriors.column(col).to_vec();
        column.sort_by(|a, b| a.total_cmp(b));
        for (i_quan, q) in MARG_QUANTILES.iter().enumerate() {
            marginals[i_quan * ndim + col] = sorted_quantile(&column, *q);
        }
    }

    ModelFit {
        ncomp,
        n_params,
        ln_evidence: result.ln_evidence,
        ln_evidence_err: result.ln_evidence_err,
        aic,
        aicc,
        bic,
        null_stats: None,
        marg_quantiles: MARG_QUANTILES.to_vec(),
        map_params: result.map_params.clone(),
        marginals,
        n_samples,
        posteriors: result.posteriors.iter().copied().collect(),
    }
}

/// Linear-interpolation quantile of an ascending-sorted slice.
///
/// Levels 0 and 1 return the sample minimum and maximum, which the
/// histogram-binning pass relies on.
fn sorted_quantile(sorted: &[f64], level: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = level * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{scripted_stack, ScriptedFactory, ScriptedSampler};

    fn engine_over<'a>(
        factory: &'a ScriptedFactory,
        sampler: &'a ScriptedSampler,
        ncomp_max: usize,
    ) -> ModelSelectionEngine<'a, ScriptedFactory, ScriptedSampler> {
        ModelSelectionEngine::new(factory, sampler, 11.0, ncomp_max, SamplerConfig::default())
    }

    #[test]
    fn test_accepts_while_evidence_improves() {
        // Chain [0, 15, 40]: both increments beat the threshold of 11.
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![0.0, 15.0, 40.0])]);
        let engine = engine_over(&factory, &sampler, 2);
        let (spectra, _) = stack.get_spectra(0, 0);
        let outcome = engine
            .fit_pixel(PixelKey::new(0, 0), &spectra)
            .unwrap();
        assert_eq!(outcome.state, SelectionState::Accepted(2));
        let record = outcome.record.unwrap();
        assert_eq!(record.nbest, 2);
        assert_eq!(record.fits.len(), 2);
        // Evidence chain invariant: every accepted step beats the threshold.
        assert!(record.fits[0].ln_evidence - 0.0 >= 11.0);
        assert!(record.fits[1].ln_evidence - record.fits[0].ln_evidence >= 11.0);
    }

    #[test]
    fn test_rejected_first_order_gives_no_signal() {
        // Chain [0, 5]: one component does not beat the null model.
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![0.0, 5.0])]);
        let engine = engine_over(&factory, &sampler, 2);
        let (spectra, _) = stack.get_spectra(0, 0);
        let outcome = engine.fit_pixel(PixelKey::new(0, 0), &spectra).unwrap();
        assert_eq!(outcome.state, SelectionState::NoSignal);
        let record = outcome.record.unwrap();
        assert_eq!(record.nbest, 0);
        // The rejected fit is still persisted for diagnostics.
        assert_eq!(record.fits.len(), 1);
    }

    #[test]
    fn test_rejected_second_order_is_persisted() {
        // Chain [0, 20, 25]: the second increment (5) fails the threshold.
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![0.0, 20.0, 25.0])]);
        let engine = engine_over(&factory, &sampler, 2);
        let (spectra, _) = stack.get_spectra(0, 0);
        let outcome = engine.fit_pixel(PixelKey::new(0, 0), &spectra).unwrap();
        assert_eq!(outcome.state, SelectionState::Accepted(1));
        let record = outcome.record.unwrap();
        assert_eq!(record.nbest, 1);
        assert_eq!(record.fits.len(), 2);
        assert_eq!(record.fits[1].ncomp, 2);
    }

    #[test]
    fn test_nan_pixel_is_unresolved_without_record() {
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![f64::NAN])]);
        let engine = engine_over(&factory, &sampler, 2);
        let (spectra, _) = stack.get_spectra(0, 0);
        let outcome = engine.fit_pixel(PixelKey::new(0, 0), &spectra).unwrap();
        assert_eq!(outcome.state, SelectionState::Unresolved);
        assert!(outcome.record.is_none());
    }

    #[test]
    fn test_non_finite_evidence_is_fatal() {
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![0.0, f64::INFINITY])]);
        let engine = engine_over(&factory, &sampler, 2);
        let (spectra, _) = stack.get_spectra(0, 0);
        let err = engine.fit_pixel(PixelKey::new(0, 0), &spectra).unwrap_err();
        assert!(matches!(
            err,
            EngineError::NonFiniteEvidence { ncomp: 1, .. }
        ));
    }

    #[test]
    fn test_non_finite_null_evidence_is_fatal() {
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![f64::NEG_INFINITY, 5.0])]);
        let engine = engine_over(&factory, &sampler, 2);
        let (spectra, _) = stack.get_spectra(0, 0);
        let err = engine.fit_pixel(PixelKey::new(0, 0), &spectra).unwrap_err();
        assert!(matches!(err, EngineError::NonFiniteNullEvidence { .. }));
    }

    #[test]
    fn test_null_stats_on_first_order_only() {
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![0.0, 15.0, 40.0])]);
        let engine = engine_over(&factory, &sampler, 2);
        let (spectra, _) = stack.get_spectra(0, 0);
        let record = engine
            .fit_pixel(PixelKey::new(0, 0), &spectra)
            .unwrap()
            .record
            .unwrap();
        assert!(record.fits[0].null_stats.is_some());
        assert!(record.fits[1].null_stats.is_none());
    }

    #[test]
    fn test_sorted_quantile_endpoints_are_min_max() {
        let sorted = [1.0, 2.0, 4.0, 8.0];
        assert_eq!(sorted_quantile(&sorted, 0.0), 1.0);
        assert_eq!(sorted_quantile(&sorted, 1.0), 8.0);
        assert_eq!(sorted_quantile(&sorted, 0.5), 3.0);
    }
}
