//! # specdecomp - Spectral Decomposition by Bayesian Model Selection
//!
//! `specdecomp` fits spatial grids of spectra with successively more
//! complex multi-component models and selects the number of components
//! per pixel by Bayesian evidence comparison.
//!
//! ## Key Features
//!
//! - **Evidence-threshold model selection**: each additional spectral
//!   component must raise the log-evidence by a configurable threshold
//!   over the previous order, starting from a null (pure noise) model.
//!
//! - **Chunked store**: results land in a directory bundle with one
//!   append-only chunk file per worker and a JSON table of external links,
//!   so parallel workers never contend and a crash loses at most one pixel.
//!
//! - **Spatially-coherent post-processing**: aggregation passes smooth
//!   the evidence and posterior maps over the sky, re-select model orders
//!   from the smoothed evidence, and deblend fitted components into
//!   per-component intensity maps.
//!
//! - **Pluggable models and samplers**: the fitting engine talks to the
//!   spectral model and the posterior sampler through traits, with a
//!   self-contained Gaussian model and Monte Carlo sampler included for
//!   demos and tests.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use specdecomp::aggregate::{postprocess, PostprocessConfig};
//! use specdecomp::config::RunConfig;
//! use specdecomp::dispatch::FitDispatcher;
//! use specdecomp::store::ChunkedStore;
//! use specdecomp::synth::{
//!     synthetic_stack, GaussianComponentModel, GaussianFactory, MonteCarloSampler,
//! };
//!
//! let config = RunConfig::default();
//! let stack = synthetic_stack(16, 16, 0.3, 42);
//! let factory = GaussianFactory::default();
//! let sampler = MonteCarloSampler::default();
//!
//! let mut store = ChunkedStore::create(&config.store_path, config.nchunks)?;
//! let dispatcher = FitDispatcher::new(
//!     config.lnz_threshold,
//!     config.ncomp_max,
//!     config.sampler.clone(),
//! );
//! let summary = dispatcher.run(&stack, &factory, &sampler, &mut store)?;
//! println!("fit {} pixels", summary.n_fit);
//!
//! let model = GaussianComponentModel::from_stack(&stack);
//! postprocess(&mut store, &model, &PostprocessConfig::default())?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! This creates a directory structure:
//! ```text
//! run.store/
//! ├── table.json      # run attributes, headers, external links
//! ├── chunk0.spd      # per-worker pixel records
//! └── products.spd    # dense aggregated map datasets
//! ```

pub mod aggregate;
pub mod config;
pub mod convolve;
pub mod cube;
pub mod dispatch;
pub mod engine;
pub mod model;
pub mod sampler;
pub mod store;
pub mod synth;
