//! # specdecomp CLI
//!
//! A command-line front end for fitting and aggregating runs against the
//! built-in synthetic demo cubes.
//!
//! ## Usage
//!
//! ```bash
//! # Fit a synthetic cube into a store
//! specdecomp fit demo_run --size 16 --nchunks 4
//!
//! # Run the aggregation passes
//! specdecomp aggregate demo_run
//!
//! # Inspect a store
//! specdecomp info demo_run
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use specdecomp::aggregate::{postprocess, PostprocessConfig};
use specdecomp::config::RunConfig;
use specdecomp::dispatch::FitDispatcher;
use specdecomp::store::ChunkedStore;
use specdecomp::synth::{
    synthetic_stack, GaussianComponentModel, GaussianFactory, MonteCarloSampler,
};

/// specdecomp - Bayesian spectral decomposition over spatial grids
#[derive(Parser)]
#[command(name = "specdecomp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a synthetic demo cube into a chunked store
    Fit {
        /// Output store path (`.store` is appended if absent)
        #[arg(value_name = "STORE", default_value = "demo_run")]
        store: PathBuf,

        /// TOML run configuration file; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of chunk files and worker threads
        #[arg(long)]
        nchunks: Option<usize>,

        /// Evidence-improvement threshold of the stopping rule
        #[arg(long)]
        lnz_threshold: Option<f64>,

        /// Maximum model order attempted per pixel
        #[arg(long)]
        ncomp_max: Option<usize>,

        /// Side length of the synthetic spatial grid
        #[arg(long, default_value = "16")]
        size: usize,

        /// RMS noise of the synthetic cube
        #[arg(long, default_value = "0.3")]
        rms: f64,

        /// Seed of the synthetic noise and the sampler
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Run the aggregation passes over a fitted store
    Aggregate {
        /// Store path
        #[arg(value_name = "STORE")]
        store: PathBuf,

        /// Gaussian smoothing bandwidth in map pixels
        #[arg(long, default_value = "1.0")]
        std_pix: f64,

        /// Side length the demo cube was generated with, for the
        /// component model of the deblending pass
        #[arg(long, default_value = "16")]
        size: usize,
    },

    /// Display information about a store
    Info {
        /// Store path
        #[arg(value_name = "STORE")]
        store: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Fit {
            store,
            config,
            nchunks,
            lnz_threshold,
            ncomp_max,
            size,
            rms,
            seed,
        } => {
            let mut run = match config {
                Some(path) => RunConfig::from_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => RunConfig::default(),
            };
            run.store_path = store;
            if let Some(n) = nchunks {
                run.nchunks = n;
            }
            if let Some(t) = lnz_threshold {
                run.lnz_threshold = t;
            }
            if let Some(n) = ncomp_max {
                run.ncomp_max = n;
            }
            run.validate().context("validating run configuration")?;
            cmd_fit(&run, size, rms, seed)
        }
        Commands::Aggregate {
            store,
            std_pix,
            size,
        } => cmd_aggregate(&store, std_pix, size),
        Commands::Info { store } => cmd_info(&store),
    }
}

fn cmd_fit(run: &RunConfig, size: usize, rms: f64, seed: u64) -> Result<()> {
    let stack = synthetic_stack(size, size, rms, seed);
    let factory = GaussianFactory::default();
    let sampler = MonteCarloSampler::default();
    let mut store = ChunkedStore::create(&run.store_path, run.nchunks)
        .with_context(|| format!("creating store {}", run.store_path.display()))?;

    let dispatcher = FitDispatcher::new(run.lnz_threshold, run.ncomp_max, run.sampler.clone());
    let summary = dispatcher
        .run(&stack, &factory, &sampler, &mut store)
        .context("fit run failed")?;

    info!("store written to {}", store.dir().display());
    println!(
        "Fit complete: {} pixels fit, {} skipped, {} linked",
        summary.n_fit, summary.n_skipped, summary.n_linked
    );
    Ok(())
}

fn cmd_aggregate(store_path: &PathBuf, std_pix: f64, size: usize) -> Result<()> {
    let mut store = ChunkedStore::open(store_path)
        .with_context(|| format!("opening store {}", store_path.display()))?;
    // Noise and seed do not enter the component model, only the spectral
    // axis does, so defaults are fine here.
    let stack = synthetic_stack(size, size, 0.3, 0);
    let model = GaussianComponentModel::from_stack(&stack);
    let config = PostprocessConfig {
        std_pix,
        bins: None,
    };
    postprocess(&mut store, &model, &config).context("aggregation failed")?;

    println!("Aggregation complete: {} datasets", store.dataset_names().len());
    Ok(())
}

fn cmd_info(store_path: &PathBuf) -> Result<()> {
    let store = ChunkedStore::open(store_path)
        .with_context(|| format!("opening store {}", store_path.display()))?;
    let attrs = store.attrs();

    println!("Store: {}", store.dir().display());
    println!("  created:     {}", store.created());
    println!("  chunks:      {}", store.nchunks());
    println!("  linked:      {} pixel groups", store.n_links());
    if let (Some(n1), Some(n2)) = (attrs.naxis1, attrs.naxis2) {
        println!("  grid:        {n1} x {n2}");
    }
    if let Some(t) = attrs.lnz_threshold {
        println!("  lnZ thresh:  {t}");
    }
    if let Some(n) = attrs.n_max_components {
        println!("  max order:   {n}");
    }
    if let Some(s) = &attrs.sampler_config {
        println!("  sampler:     {s}");
    }

    let names = store.dataset_names();
    if names.is_empty() {
        println!("  products:    none");
    } else {
        println!("  products:");
        for name in names {
            let shape = store.dataset(name).map(|d| d.shape.clone()).unwrap_or_default();
            println!("    {name}  {shape:?}");
        }
    }
    Ok(())
}
