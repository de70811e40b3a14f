//! # Sampler and Model Seams
//!
//! Trait boundaries to the external collaborators the pipeline treats as
//! black boxes: the nested-sampling algorithm and the physical spectral
//! model. The fitting engine only ever talks to these traits, so swapping
//! MultiNest for dynesty-style samplers, or ammonia for another line model,
//! never touches the orchestration code.
//!
//! The division of labor per pixel and model order:
//!
//! 1. A [`ModelFactory`] builds a [`PixelModel`] from the pixel's spectra
//!    and the requested component count.
//! 2. The [`Sampler`] draws unit-cube points, maps them through
//!    [`PixelModel::transform`], and evaluates
//!    [`PixelModel::loglikelihood`] on the physical parameters.
//! 3. The sampler returns a [`SamplerResult`]: posterior samples, the MAP
//!    point, the maximum log-likelihood, and a log-evidence estimate with
//!    uncertainty.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::cube::SpectrumData;

/// Errors raised by sampler implementations.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    /// The sampler could not produce a run (configuration or internal)
    #[error("sampler run failed: {0}")]
    RunFailed(String),

    /// The model rejected its inputs
    #[error("invalid model input: {0}")]
    InvalidInput(String),
}

/// Configuration forwarded to every sampler invocation.
///
/// Field names follow the MultiNest conventions the defaults were tuned
/// for: 60 live points, evidence tolerance 1.0, sampling efficiency 0.3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of live points
    pub n_live: usize,
    /// Evidence tolerance stopping criterion
    pub tol: f64,
    /// Sampling efficiency
    pub efr: f64,
    /// Random seed; a negative value lets the sampler choose
    pub seed: i64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_live: 60,
            tol: 1.0,
            efr: 0.3,
            seed: -1,
        }
    }
}

impl SamplerConfig {
    /// One-line summary persisted into the store's run attributes.
    pub fn summary(&self) -> String {
        format!(
            "n_live={} tol={} efr={} seed={}",
            self.n_live, self.tol, self.efr, self.seed
        )
    }
}

/// Output of one sampler run at a fixed model order.
#[derive(Debug, Clone)]
pub struct SamplerResult {
    /// Posterior sample table, shape `(samples, n_params * ncomp)`,
    /// columns parameter-major
    pub posteriors: Array2<f64>,
    /// Maximum a posteriori parameter point, physical units
    pub map_params: Vec<f64>,
    /// Log-likelihood at the best-fit point, used for AIC/BIC
    pub max_loglike: f64,
    /// Log-evidence estimate
    pub ln_evidence: f64,
    /// Uncertainty of the log-evidence estimate
    pub ln_evidence_err: f64,
}

/// A fully-specified likelihood for one pixel at one model order.
pub trait PixelModel {
    /// Number of superposed spectral components
    fn ncomp(&self) -> usize;

    /// Number of free parameters per component
    fn n_params(&self) -> usize;

    /// Total dimensionality of the parameter space
    fn ndim(&self) -> usize {
        self.n_params() * self.ncomp()
    }

    /// Number of data samples across all contributing spectra, for the
    /// sample-size terms of BIC and AICc
    fn n_data(&self) -> usize;

    /// Apply the prior transform to a unit-cube point in place
    fn transform(&self, utheta: &mut [f64]);

    /// Log-likelihood of a physical parameter vector
    fn loglikelihood(&self, params: &[f64]) -> f64;

    /// Log-evidence of the null (zero-component) model; with no free
    /// parameters the evidence equals the likelihood of pure noise
    fn null_ln_evidence(&self) -> f64;

    /// Log-likelihood of the null model, for the null information criteria
    fn null_loglikelihood(&self) -> f64 {
        self.null_ln_evidence()
    }
}

/// Builds a [`PixelModel`] per pixel and model order.
///
/// Workers construct models inside their own thread; the factory itself is
/// shared read-only across workers.
pub trait ModelFactory: Send + Sync {
    /// The model type produced
    type Model: PixelModel;

    /// Build a model from the pixel's co-located spectra.
    fn from_data(&self, spectra: &[SpectrumData], ncomp: usize)
        -> Result<Self::Model, SamplerError>;

    /// Number of free parameters per component
    fn n_params(&self) -> usize;
}

/// The opaque posterior sampler.
///
/// Generic over the model type so implementations tied to one likelihood
/// family (or to scripted test chains) stay fully typed.
pub trait Sampler<M: PixelModel>: Send + Sync {
    /// Run the sampler against `model` and return posterior summaries.
    ///
    /// Implementations must return finite `map_params` and posterior rows;
    /// the evidence estimate may be non-finite, which the engine treats as
    /// fatal for the run.
    fn run(&self, model: &M, config: &SamplerConfig) -> Result<SamplerResult, SamplerError>;
}

/// Spectral-model surface consumed by the product-synthesis pass.
///
/// Evaluates one model component at a time so deblended cubes can be built
/// by superposition, one component per fitted line of sight.
pub trait ComponentModel: Send + Sync {
    /// Number of free parameters per component
    fn n_params(&self) -> usize;

    /// Parameter index of the component centroid velocity
    fn centroid_index(&self) -> usize;

    /// Parameter index of the component velocity dispersion
    fn width_index(&self) -> usize;

    /// Number of instrument transitions with distinct spectra
    fn n_transitions(&self) -> usize;

    /// Predicted spectrum of a single component for one transition.
    /// `params` has length `n_params`.
    fn predict(&self, params: &[f64], trans: usize) -> Vec<f64>;

    /// Velocity channel width of one transition, for integrated intensity
    fn channel_width(&self, trans: usize) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_multinest_defaults() {
        let config = SamplerConfig::default();
        assert_eq!(config.n_live, 60);
        assert_eq!(config.tol, 1.0);
        assert_eq!(config.efr, 0.3);
        assert!(config.seed < 0);
    }

    #[test]
    fn test_config_summary_round_trips_fields() {
        let summary = SamplerConfig::default().summary();
        assert!(summary.contains("n_live=60"));
        assert!(summary.contains("tol=1"));
    }
}
