//! # Parallel Fit Dispatch
//!
//! Sweeps the spatial grid with one worker thread per chunk file. The
//! partition is row-strided: worker `i` owns every longitude row with
//! `i_lon % nchunks == i`, which balances load when emission is spatially
//! clustered. Each worker creates its own [`ChunkWriter`] inside the
//! thread and is the only writer of that file, so workers share nothing
//! but the read-only cube stack and the model factory.
//!
//! Linking happens strictly after every worker has exited cleanly. A
//! failed or panicked worker aborts the run before any link is created,
//! leaving the table without links rather than with a partial, misleading
//! set; completed chunk files stay on disk for inspection.

use std::path::PathBuf;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info};

use crate::cube::CubeStack;
use crate::engine::{EngineError, ModelSelectionEngine};
use crate::model::{PixelKey, SelectionState};
use crate::sampler::{ModelFactory, Sampler, SamplerConfig};
use crate::store::{ChunkWriter, ChunkedStore, StoreError};

/// Errors raised while dispatching a fit run.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Store-level failure (chunk file creation, record write, linking)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A worker's fitting loop failed
    #[error("worker for chunk {chunk} failed: {source}")]
    Engine {
        /// Chunk index of the failed worker
        chunk: usize,
        /// The underlying engine error
        source: EngineError,
    },

    /// A worker thread panicked
    #[error("worker for chunk {chunk} panicked")]
    WorkerPanic {
        /// Chunk index of the panicked worker
        chunk: usize,
    },
}

/// Progress event emitted once per visited pixel.
#[derive(Debug, Clone, Copy)]
pub struct FitProgress {
    /// Pixel just finished
    pub key: PixelKey,
    /// Its selection outcome
    pub state: SelectionState,
    /// Worker chunk that handled it
    pub chunk: usize,
}

/// Counts accumulated over one fit run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitSummary {
    /// Pixels fit and written to a chunk file
    pub n_fit: usize,
    /// Pixels skipped as unresolved (no record written)
    pub n_skipped: usize,
    /// External links created after the sweep
    pub n_linked: usize,
}

/// Drives a full fit run: setup, the worker sweep, then linking.
pub struct FitDispatcher {
    lnz_threshold: f64,
    ncomp_max: usize,
    sampler_config: SamplerConfig,
}

impl FitDispatcher {
    /// Create a dispatcher with the run's stopping rule and sampler
    /// configuration.
    pub fn new(lnz_threshold: f64, ncomp_max: usize, sampler_config: SamplerConfig) -> Self {
        Self {
            lnz_threshold,
            ncomp_max,
            sampler_config,
        }
    }

    /// Fit every pixel of `stack` into `store`, then link all chunks.
    ///
    /// The worker count equals the store's chunk count. Any worker error
    /// aborts the whole run before linking.
    pub fn run<F, S>(
        &self,
        stack: &CubeStack,
        factory: &F,
        sampler: &S,
        store: &mut ChunkedStore,
    ) -> Result<FitSummary, DispatchError>
    where
        F: ModelFactory,
        S: Sampler<F::Model>,
    {
        let (n_lon, n_lat) = stack.spatial_shape();
        store.insert_header(stack.simple_header(), stack.full_header(), n_lon, n_lat)?;
        store.insert_run_parameters(
            self.lnz_threshold,
            self.ncomp_max,
            &self.sampler_config.summary(),
        )?;
        // A re-run invalidates any links from the previous sweep.
        store.reset_links()?;

        let nchunks = store.nchunks();
        let chunk_files: Vec<PathBuf> = store.chunk_paths();
        info!(
            "dispatching {n_lon}x{n_lat} grid over {nchunks} workers, \
             lnZ threshold {}, N_max {}",
            self.lnz_threshold, self.ncomp_max
        );

        let (tx, rx) = unbounded::<FitProgress>();
        let mut summary = thread::scope(|scope| -> Result<FitSummary, DispatchError> {
            let mut handles = Vec::with_capacity(nchunks);
            for (chunk, chunk_file) in chunk_files.iter().enumerate() {
                let tx = tx.clone();
                handles.push(scope.spawn(move || {
                    self.run_worker(chunk, nchunks, chunk_file, stack, factory, sampler, &tx)
                }));
            }
            drop(tx);
            let summary = drain_progress(&rx);
            for (chunk, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(DispatchError::WorkerPanic { chunk }),
                }
            }
            Ok(summary)
        })?;

        summary.n_linked = store.link_all_chunks()?;
        info!(
            "run complete: {} fit, {} skipped, {} linked",
            summary.n_fit, summary.n_skipped, summary.n_linked
        );
        Ok(summary)
    }

    /// One worker's sweep over its strided share of longitude rows.
    #[allow(clippy::too_many_arguments)]
    fn run_worker<F, S>(
        &self,
        chunk: usize,
        nchunks: usize,
        chunk_file: &PathBuf,
        stack: &CubeStack,
        factory: &F,
        sampler: &S,
        tx: &Sender<FitProgress>,
    ) -> Result<(), DispatchError>
    where
        F: ModelFactory,
        S: Sampler<F::Model>,
    {
        let engine = ModelSelectionEngine::new(
            factory,
            sampler,
            self.lnz_threshold,
            self.ncomp_max,
            self.sampler_config.clone(),
        );
        // The chunk file is created here, inside the owning worker, and
        // its handle never leaves this thread.
        let mut writer = ChunkWriter::create(chunk_file)?;
        let (n_lon, n_lat) = stack.spatial_shape();
        for i_lon in (chunk..n_lon).step_by(nchunks) {
            for i_lat in 0..n_lat {
                let key = PixelKey::new(i_lon, i_lat);
                let (spectra, _) = stack.get_spectra(i_lon, i_lat);
                let outcome = engine
                    .fit_pixel(key, &spectra)
                    .map_err(|source| DispatchError::Engine { chunk, source })?;
                if let Some(record) = &outcome.record {
                    writer.write_record(record)?;
                }
                // A closed receiver only means the dispatcher stopped
                // listening; the sweep itself is unaffected.
                let _ = tx.send(FitProgress {
                    key,
                    state: outcome.state,
                    chunk,
                });
            }
        }
        debug!(
            "chunk {chunk}: {} records written",
            writer.records_written()
        );
        writer.finish()?;
        Ok(())
    }
}

/// Drain progress events until every worker has dropped its sender.
fn drain_progress(rx: &Receiver<FitProgress>) -> FitSummary {
    let mut summary = FitSummary::default();
    for progress in rx.iter() {
        match progress.state {
            SelectionState::Unresolved => summary.n_skipped += 1,
            _ => summary.n_fit += 1,
        }
        debug!(
            "chunk {} pixel {} -> nbest {}",
            progress.chunk,
            progress.key,
            progress.state.nbest()
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use crate::synth::scripted_stack;

    #[test]
    fn test_full_run_fits_links_and_records_attrs() {
        let dir = tempdir().unwrap();
        let (stack, factory, sampler) = scripted_stack(&[
            (0, 0, vec![0.0, 15.0, 40.0]),
            (0, 1, vec![0.0, 5.0]),
            (1, 0, vec![f64::NAN]),
            (1, 1, vec![0.0, 20.0, 25.0]),
        ]);
        let mut store = ChunkedStore::create(dir.path().join("run"), 2).unwrap();
        let dispatcher = FitDispatcher::new(11.0, 2, SamplerConfig::default());
        let summary = dispatcher
            .run(&stack, &factory, &sampler, &mut store)
            .unwrap();

        assert_eq!(summary.n_fit, 3);
        assert_eq!(summary.n_skipped, 1);
        assert_eq!(summary.n_linked, 3);

        let nbest: BTreeMap<(usize, usize), i32> = store
            .iter_pixel_groups()
            .map(|r| {
                let rec = r.unwrap();
                ((rec.key.i_lon, rec.key.i_lat), rec.nbest)
            })
            .collect();
        assert_eq!(nbest[&(0, 0)], 2);
        assert_eq!(nbest[&(0, 1)], 0);
        assert_eq!(nbest[&(1, 1)], 1);
        assert!(!nbest.contains_key(&(1, 0)));

        assert_eq!(store.attrs().naxis1, Some(2));
        assert_eq!(store.attrs().naxis2, Some(2));
        assert_eq!(store.attrs().lnz_threshold, Some(11.0));
        assert_eq!(store.attrs().n_max_components, Some(2));
    }

    #[test]
    fn test_partition_is_row_strided() {
        let dir = tempdir().unwrap();
        let (stack, factory, sampler) = scripted_stack(&[
            (0, 0, vec![0.0, 15.0]),
            (1, 0, vec![0.0, 15.0]),
            (2, 0, vec![0.0, 15.0]),
        ]);
        let mut store = ChunkedStore::create(dir.path().join("run"), 2).unwrap();
        let dispatcher = FitDispatcher::new(11.0, 1, SamplerConfig::default());
        dispatcher
            .run(&stack, &factory, &sampler, &mut store)
            .unwrap();

        // Rows 0 and 2 land in chunk 0, row 1 in chunk 1.
        let mut r0 = crate::store::ChunkReader::open(store.chunk_path(0)).unwrap();
        let mut lons = Vec::new();
        while let Some((_, rec)) = r0.next_record().unwrap() {
            lons.push(rec.key.i_lon);
        }
        assert_eq!(lons, vec![0, 2]);
    }

    #[test]
    fn test_worker_failure_aborts_before_linking() {
        let dir = tempdir().unwrap();
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![0.0, f64::INFINITY])]);
        let mut store = ChunkedStore::create(dir.path().join("run"), 1).unwrap();
        let dispatcher = FitDispatcher::new(11.0, 2, SamplerConfig::default());
        let err = dispatcher
            .run(&stack, &factory, &sampler, &mut store)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Engine { chunk: 0, .. }));
        assert_eq!(store.n_links(), 0);
    }

    #[test]
    fn test_rerun_resets_stale_links() {
        let dir = tempdir().unwrap();
        let (stack, factory, sampler) = scripted_stack(&[(0, 0, vec![0.0, 15.0])]);
        let mut store = ChunkedStore::create(dir.path().join("run"), 1).unwrap();
        let dispatcher = FitDispatcher::new(11.0, 1, SamplerConfig::default());
        dispatcher
            .run(&stack, &factory, &sampler, &mut store)
            .unwrap();
        assert_eq!(store.n_links(), 1);
        // A second sweep rewrites the chunk files and relinks from scratch.
        let summary = dispatcher
            .run(&stack, &factory, &sampler, &mut store)
            .unwrap();
        assert_eq!(summary.n_linked, 1);
        assert_eq!(store.n_links(), 1);
    }
}
