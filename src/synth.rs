//! # Synthetic Data and Reference Samplers
//!
//! Self-contained stand-ins for the external collaborators, so the demo
//! binary and the test suite run without a nested-sampling library or a
//! radiative-transfer code:
//!
//! - [`GaussianFactory`] / [`GaussianModel`]: a sum-of-Gaussians spectral
//!   model with uniform priors.
//! - [`MonteCarloSampler`]: a brute-force prior-sampling evidence
//!   estimator. Crude but unbiased; good enough for smoke runs, not for
//!   science.
//! - [`ScriptedFactory`] / [`ScriptedSampler`]: deterministic evidence
//!   chains keyed by pixel, used to exercise the stopping rule and the
//!   aggregation passes with exactly known outcomes.
//! - [`synthetic_stack`]: a small demo cube stack with injected
//!   components.
//!
//! Everything here is deterministic: randomness comes from a local
//! xorshift generator seeded by the caller.

use std::collections::HashMap;

use ndarray::{Array1, Array2, Array3};

use crate::cube::{CubeStack, DataCube, HeaderBlock, NoiseMap, SpectrumData};
use crate::sampler::{
    ComponentModel, ModelFactory, PixelModel, Sampler, SamplerConfig, SamplerError, SamplerResult,
};

/// Minimal deterministic PRNG (xorshift64*), enough for synthetic noise
/// and prior draws without pulling a rand dependency into the library.
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Seeded generator; zero seeds are remapped to a fixed constant.
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9e3779b97f4a7c15 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x.wrapping_mul(0x2545f4914f6cdd1d)
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Approximately standard-normal draw (sum of uniforms).
    pub fn next_gaussian(&mut self) -> f64 {
        let mut acc = 0.0;
        for _ in 0..12 {
            acc += self.next_f64();
        }
        acc - 6.0
    }
}

fn ln_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Parameter order of the Gaussian component model: centroid velocity,
/// velocity dispersion, peak amplitude.
pub const GAUSS_N_PARAMS: usize = 3;

/// Sum-of-Gaussians likelihood for one pixel at a fixed component count.
pub struct GaussianModel {
    spectra: Vec<SpectrumData>,
    ncomp: usize,
    /// Uniform prior bounds per parameter, `(lo, hi)`
    bounds: [(f64, f64); GAUSS_N_PARAMS],
    n_data: usize,
    ln_norm: f64,
}

impl GaussianModel {
    fn predicted(&self, params: &[f64], spec: &SpectrumData) -> Array1<f64> {
        let mut model = Array1::zeros(spec.data.len());
        for j in 0..self.ncomp {
            let voff = params[j];
            let sigm = params[self.ncomp + j];
            let amp = params[2 * self.ncomp + j];
            for (i, x) in spec.xarr.iter().enumerate() {
                let z = (x - voff) / sigm;
                model[i] += amp * (-0.5 * z * z).exp();
            }
        }
        model
    }
}

impl PixelModel for GaussianModel {
    fn ncomp(&self) -> usize {
        self.ncomp
    }

    fn n_params(&self) -> usize {
        GAUSS_N_PARAMS
    }

    fn n_data(&self) -> usize {
        self.n_data
    }

    fn transform(&self, utheta: &mut [f64]) {
        for i_par in 0..GAUSS_N_PARAMS {
            let (lo, hi) = self.bounds[i_par];
            for j in 0..self.ncomp {
                let idx = i_par * self.ncomp + j;
                utheta[idx] = lo + (hi - lo) * utheta[idx];
            }
        }
    }

    fn loglikelihood(&self, params: &[f64]) -> f64 {
        let mut chi2 = 0.0;
        for spec in &self.spectra {
            let model = self.predicted(params, spec);
            for (d, m) in spec.data.iter().zip(model.iter()) {
                let r = (d - m) / spec.noise;
                chi2 += r * r;
            }
        }
        -0.5 * chi2 + self.ln_norm
    }

    fn null_ln_evidence(&self) -> f64 {
        let mut chi2 = 0.0;
        for spec in &self.spectra {
            for d in spec.data.iter() {
                let r = d / spec.noise;
                chi2 += r * r;
            }
        }
        -0.5 * chi2 + self.ln_norm
    }
}

/// Builds [`GaussianModel`] instances with fixed uniform prior bounds.
pub struct GaussianFactory {
    bounds: [(f64, f64); GAUSS_N_PARAMS],
}

impl GaussianFactory {
    /// Prior bounds over (centroid, dispersion, amplitude).
    pub fn new(bounds: [(f64, f64); GAUSS_N_PARAMS]) -> Self {
        Self { bounds }
    }
}

impl Default for GaussianFactory {
    fn default() -> Self {
        Self::new([(-4.0, 4.0), (0.1, 2.0), (0.0, 10.0)])
    }
}

impl ModelFactory for GaussianFactory {
    type Model = GaussianModel;

    fn from_data(
        &self,
        spectra: &[SpectrumData],
        ncomp: usize,
    ) -> Result<Self::Model, SamplerError> {
        if spectra.is_empty() {
            return Err(SamplerError::InvalidInput("no spectra".to_string()));
        }
        let n_data = spectra.iter().map(|s| s.data.len()).sum();
        let ln_norm: f64 = spectra
            .iter()
            .map(|s| {
                -(s.data.len() as f64) / 2.0
                    * (2.0 * std::f64::consts::PI * s.noise * s.noise).ln()
            })
            .sum();
        Ok(GaussianModel {
            spectra: spectra.to_vec(),
            ncomp,
            bounds: self.bounds,
            n_data,
            ln_norm,
        })
    }

    fn n_params(&self) -> usize {
        GAUSS_N_PARAMS
    }
}

/// Gaussian component surface for the product-synthesis pass.
pub struct GaussianComponentModel {
    xarrs: Vec<Array1<f64>>,
    dvs: Vec<f64>,
}

impl GaussianComponentModel {
    /// Build from a stack's spectral axes and channel widths.
    pub fn from_stack(stack: &CubeStack) -> Self {
        let mut xarrs = Vec::new();
        let mut dvs = Vec::new();
        for cube in stack.cubes() {
            let (spec, _) = cube.get_spectrum(0, 0);
            xarrs.push(spec.xarr);
            dvs.push(cube.dv);
        }
        Self { xarrs, dvs }
    }
}

impl ComponentModel for GaussianComponentModel {
    fn n_params(&self) -> usize {
        GAUSS_N_PARAMS
    }

    fn centroid_index(&self) -> usize {
        0
    }

    fn width_index(&self) -> usize {
        1
    }

    fn n_transitions(&self) -> usize {
        self.xarrs.len()
    }

    fn predict(&self, params: &[f64], trans: usize) -> Vec<f64> {
        let (voff, sigm, amp) = (params[0], params[1], params[2]);
        self.xarrs[trans]
            .iter()
            .map(|x| {
                let z = (x - voff) / sigm;
                amp * (-0.5 * z * z).exp()
            })
            .collect()
    }

    fn channel_width(&self, trans: usize) -> f64 {
        self.dvs[trans]
    }
}

/// Brute-force prior-sampling evidence estimator.
///
/// Draws `n_live * draws_per_live` prior samples, estimates
/// `lnZ = ln mean(exp(lnL))`, and resamples the draws by likelihood
/// weight into a posterior table. Deterministic for a fixed seed.
pub struct MonteCarloSampler {
    /// Prior draws per live point; total draws scale with `n_live`
    pub draws_per_live: usize,
    /// Posterior rows returned after weighted resampling
    pub n_posterior: usize,
}

impl Default for MonteCarloSampler {
    fn default() -> Self {
        Self {
            draws_per_live: 200,
            n_posterior: 256,
        }
    }
}

impl<M: PixelModel> Sampler<M> for MonteCarloSampler {
    fn run(&self, model: &M, config: &SamplerConfig) -> Result<SamplerResult, SamplerError> {
        let ndim = model.ndim();
        let n_draws = config.n_live * self.draws_per_live;
        if n_draws == 0 {
            return Err(SamplerError::RunFailed("zero draws configured".to_string()));
        }
        let seed = if config.seed < 0 {
            0xdecafbad
        } else {
            config.seed as u64
        };
        let mut rng = XorShift64::new(seed);

        let mut draws: Vec<Vec<f64>> = Vec::with_capacity(n_draws);
        let mut loglikes: Vec<f64> = Vec::with_capacity(n_draws);
        for _ in 0..n_draws {
            let mut theta: Vec<f64> = (0..ndim).map(|_| rng.next_f64()).collect();
            model.transform(&mut theta);
            let ll = model.loglikelihood(&theta);
            draws.push(theta);
            loglikes.push(ll);
        }

        let ln_z = ln_sum_exp(&loglikes) - (n_draws as f64).ln();
        // Standard error of the mean of the likelihood weights, pushed
        // through the log.
        let max_ll = loglikes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = loglikes.iter().map(|ll| (ll - max_ll).exp()).collect();
        let mean_w: f64 = weights.iter().sum::<f64>() / n_draws as f64;
        let var_w: f64 = weights
            .iter()
            .map(|w| (w - mean_w) * (w - mean_w))
            .sum::<f64>()
            / n_draws as f64;
        let ln_z_err = (var_w.sqrt() / (mean_w * (n_draws as f64).sqrt())).max(1e-6);

        let best = loglikes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| SamplerError::RunFailed("no draws".to_string()))?;

        // Systematic resampling into the posterior table.
        let total_w: f64 = weights.iter().sum();
        let step = total_w / self.n_posterior as f64;
        let mut posteriors = Array2::zeros((self.n_posterior, ndim));
        let mut cum = 0.0;
        let mut src = 0usize;
        let offset = step * rng.next_f64();
        for row in 0..self.n_posterior {
            let target = offset + step * row as f64;
            while cum + weights[src] < target && src + 1 < n_draws {
                cum += weights[src];
                src += 1;
            }
            for (col, v) in draws[src].iter().enumerate() {
                posteriors[[row, col]] = *v;
            }
        }

        Ok(SamplerResult {
            posteriors,
            map_params: draws[best].clone(),
            max_loglike: loglikes[best],
            ln_evidence: ln_z,
            ln_evidence_err: ln_z_err,
        })
    }
}

/// Pixel identity encoded into the first spectrum channel so scripted
/// components can key their chains by pixel.
fn encode_pixel_id(i_lon: usize, i_lat: usize) -> u64 {
    (i_lon as u64) << 16 | i_lat as u64
}

/// Scripted model: carries the pixel's evidence chain verbatim.
pub struct ScriptedModel {
    chain: Vec<f64>,
    ncomp: usize,
    pixel_id: u64,
    n_data: usize,
}

impl PixelModel for ScriptedModel {
    fn ncomp(&self) -> usize {
        self.ncomp
    }

    fn n_params(&self) -> usize {
        GAUSS_N_PARAMS
    }

    fn n_data(&self) -> usize {
        self.n_data
    }

    fn transform(&self, _utheta: &mut [f64]) {}

    fn loglikelihood(&self, _params: &[f64]) -> f64 {
        // Scripted runs never evaluate a real likelihood.
        0.0
    }

    fn null_ln_evidence(&self) -> f64 {
        self.chain[0]
    }
}

/// Factory that hands each pixel its scripted evidence chain.
///
/// `chain[0]` is the null-model evidence, `chain[k]` the evidence of
/// order `k`.
pub struct ScriptedFactory {
    chains: HashMap<u64, Vec<f64>>,
}

impl ModelFactory for ScriptedFactory {
    type Model = ScriptedModel;

    fn from_data(
        &self,
        spectra: &[SpectrumData],
        ncomp: usize,
    ) -> Result<Self::Model, SamplerError> {
        let first = spectra
            .first()
            .ok_or_else(|| SamplerError::InvalidInput("no spectra".to_string()))?;
        let pixel_id = first.data[0].round() as u64;
        let chain = self
            .chains
            .get(&pixel_id)
            .ok_or_else(|| SamplerError::InvalidInput(format!("no chain for pixel {pixel_id}")))?
            .clone();
        let n_data = spectra.iter().map(|s| s.data.len()).sum();
        Ok(ScriptedModel {
            chain,
            ncomp,
            pixel_id,
            n_data,
        })
    }

    fn n_params(&self) -> usize {
        GAUSS_N_PARAMS
    }
}

/// Sampler returning scripted evidences with deterministic posterior
/// tables and MAP points derived from the pixel id.
pub struct ScriptedSampler {
    /// Posterior rows per run
    pub n_posterior: usize,
}

impl Default for ScriptedSampler {
    fn default() -> Self {
        Self { n_posterior: 64 }
    }
}

impl ScriptedSampler {
    /// Deterministic MAP value for (pixel, order, flat column).
    ///
    /// Parameter index enters the integer part, the component index the
    /// fractional part, so every table cell is predictable in tests.
    pub fn map_value(pixel_id: u64, i_par: usize, j_comp: usize) -> f64 {
        (i_par + 1) as f64 * 10.0 + j_comp as f64 + (pixel_id % 7) as f64 * 0.01
    }
}

impl Sampler<ScriptedModel> for ScriptedSampler {
    fn run(&self, model: &ScriptedModel, _config: &SamplerConfig) -> Result<SamplerResult, SamplerError> {
        let ncomp = model.ncomp;
        let ln_evidence = *model.chain.get(ncomp).ok_or_else(|| {
            SamplerError::RunFailed(format!("no scripted evidence for ncomp={ncomp}"))
        })?;
        let ndim = model.ndim();
        let mut map_params = vec![0.0; ndim];
        for i_par in 0..model.n_params() {
            for j in 0..ncomp {
                map_params[i_par * ncomp + j] = Self::map_value(model.pixel_id, i_par, j);
            }
        }
        // A tight, deterministic cloud around the MAP point.
        let mut rng = XorShift64::new(model.pixel_id.wrapping_mul(31).wrapping_add(ncomp as u64));
        let mut posteriors = Array2::zeros((self.n_posterior, ndim));
        for row in 0..self.n_posterior {
            for col in 0..ndim {
                posteriors[[row, col]] = map_params[col] + 0.1 * rng.next_gaussian();
            }
        }
        Ok(SamplerResult {
            posteriors,
            map_params,
            max_loglike: ln_evidence,
            ln_evidence,
            ln_evidence_err: 0.1,
        })
    }
}

/// Build a one-cube stack whose pixels carry scripted evidence chains.
///
/// Each `(i_lon, i_lat, chain)` entry scripts one pixel; a chain of one
/// single NaN marks the pixel's spectrum as NaN-contaminated instead.
/// The grid is sized to cover the largest scripted indices; unscripted
/// pixels get an all-NaN spectrum so sweeps skip them.
pub fn scripted_stack(
    pixels: &[(usize, usize, Vec<f64>)],
) -> (CubeStack, ScriptedFactory, ScriptedSampler) {
    let n_lon = pixels.iter().map(|p| p.0).max().unwrap_or(0) + 1;
    let n_lat = pixels.iter().map(|p| p.1).max().unwrap_or(0) + 1;
    let n_chan = 16;
    let mut data = Array3::from_elem((n_lon, n_lat, n_chan), f64::NAN);
    let mut chains = HashMap::new();
    for (i_lon, i_lat, chain) in pixels {
        let nan_pixel = chain.len() == 1 && chain[0].is_nan();
        if nan_pixel {
            continue;
        }
        let id = encode_pixel_id(*i_lon, *i_lat);
        for s in 0..n_chan {
            data[[*i_lon, *i_lat, s]] = 0.0;
        }
        data[[*i_lon, *i_lat, 0]] = id as f64;
        chains.insert(id, chain.clone());
    }
    let xarr = Array1::linspace(-4.0, 4.0, n_chan);
    let mut simple_header = HeaderBlock::new();
    simple_header.insert("NAXIS1".into(), serde_json::json!(n_lon));
    simple_header.insert("NAXIS2".into(), serde_json::json!(n_lat));
    let cube = DataCube::new(
        data,
        xarr,
        NoiseMap::Uniform(1.0),
        1,
        0.5,
        simple_header.clone(),
        simple_header,
    )
    .expect("valid synthetic cube");
    let stack = CubeStack::new(vec![cube]).expect("non-empty stack");
    (
        stack,
        ScriptedFactory { chains },
        ScriptedSampler::default(),
    )
}

/// Build a small synthetic stack with injected Gaussian components for
/// the demo subcommand: a bright two-component core, a one-component
/// ring, and NaN-masked corners.
pub fn synthetic_stack(n_lon: usize, n_lat: usize, rms: f64, seed: u64) -> CubeStack {
    let n_chan = 64;
    let xarr: Array1<f64> = Array1::linspace(-4.0, 4.0, n_chan);
    let dv = (xarr[1] - xarr[0]).abs();
    let mut rng = XorShift64::new(seed);
    let mut data = Array3::zeros((n_lon, n_lat, n_chan));
    let (cx, cy) = (n_lon as f64 / 2.0, n_lat as f64 / 2.0);
    for l in 0..n_lon {
        for b in 0..n_lat {
            let r = ((l as f64 - cx).powi(2) + (b as f64 - cy).powi(2)).sqrt();
            for s in 0..n_chan {
                let x = xarr[s];
                let mut v = rms * rng.next_gaussian();
                if r < cx.min(cy) * 0.5 {
                    // two blended components in the core
                    v += 6.0 * (-0.5 * ((x + 0.8) / 0.4_f64).powi(2)).exp();
                    v += 4.0 * (-0.5 * ((x - 0.9) / 0.5_f64).powi(2)).exp();
                } else if r < cx.min(cy) * 0.9 {
                    v += 3.0 * (-0.5 * (x / 0.6_f64).powi(2)).exp();
                }
                data[[l, b, s]] = v;
            }
        }
    }
    // NaN-masked corner, as real mosaics have
    for s in 0..n_chan {
        data[[0, 0, s]] = f64::NAN;
    }
    let mut simple_header = HeaderBlock::new();
    simple_header.insert("NAXIS1".into(), serde_json::json!(n_lon));
    simple_header.insert("NAXIS2".into(), serde_json::json!(n_lat));
    simple_header.insert("CTYPE1".into(), serde_json::json!("RA---SIN"));
    simple_header.insert("CTYPE2".into(), serde_json::json!("DEC--SIN"));
    let cube = DataCube::new(
        data,
        xarr,
        NoiseMap::Uniform(rms),
        1,
        dv,
        simple_header.clone(),
        simple_header,
    )
    .expect("valid synthetic cube");
    CubeStack::new(vec![cube]).expect("non-empty stack")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_is_deterministic() {
        let mut a = XorShift64::new(42);
        let mut b = XorShift64::new(42);
        for _ in 0..10 {
            assert_eq!(a.next_f64(), b.next_f64());
        }
    }

    #[test]
    fn test_monte_carlo_evidence_prefers_true_model() {
        // A clear one-component spectrum: the one-component evidence must
        // beat the null evidence by a wide margin.
        let stack = synthetic_stack(8, 8, 0.3, 7);
        let (spectra, _) = stack.get_spectra(4, 4);
        let factory = GaussianFactory::default();
        let model = factory.from_data(&spectra, 1).unwrap();
        let sampler = MonteCarloSampler::default();
        let config = SamplerConfig {
            seed: 11,
            ..SamplerConfig::default()
        };
        let result = sampler.run(&model, &config).unwrap();
        assert!(result.ln_evidence.is_finite());
        assert!(result.ln_evidence > model.null_ln_evidence());
    }

    #[test]
    fn test_scripted_sampler_returns_chain_value() {
        let (stack, factory, sampler) = scripted_stack(&[(1, 2, vec![0.0, 17.0, 20.0])]);
        let (spectra, any_nans) = stack.get_spectra(1, 2);
        assert!(!any_nans);
        let model = factory.from_data(&spectra, 2).unwrap();
        let result = sampler.run(&model, &SamplerConfig::default()).unwrap();
        assert_eq!(result.ln_evidence, 20.0);
        assert_eq!(result.map_params.len(), GAUSS_N_PARAMS * 2);
    }

    #[test]
    fn test_scripted_nan_pixel_has_nan_spectrum() {
        let (stack, _, _) = scripted_stack(&[(0, 0, vec![f64::NAN]), (0, 1, vec![0.0, 5.0])]);
        assert!(stack.get_spectra(0, 0).1);
        assert!(!stack.get_spectra(0, 1).1);
    }

    #[test]
    fn test_component_model_predict_peaks_at_centroid() {
        let stack = synthetic_stack(4, 4, 0.1, 3);
        let comp = GaussianComponentModel::from_stack(&stack);
        let spec = comp.predict(&[0.5, 0.4, 2.0], 0);
        let peak_idx = spec
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        let xarr: Array1<f64> = Array1::linspace(-4.0, 4.0, 64);
        assert!((xarr[peak_idx] - 0.5).abs() < 0.2);
    }
}
