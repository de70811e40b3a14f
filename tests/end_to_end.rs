//! End-to-end pipeline test: scripted fit run, chunked persistence, and
//! the full aggregation chain over a small grid.
//!
//! The reference scenario is a 2x2 grid covering every selection outcome:
//! two accepted components, no signal, unresolved (NaN spectrum), and one
//! accepted component with a persisted rejected second order.

use tempfile::tempdir;

use specdecomp::aggregate::{postprocess, products, PostprocessConfig};
use specdecomp::dispatch::FitDispatcher;
use specdecomp::model::MARG_QUANTILES;
use specdecomp::sampler::SamplerConfig;
use specdecomp::store::ChunkedStore;
use specdecomp::synth::{scripted_stack, GaussianComponentModel};

const LNZ_THRESHOLD: f64 = 11.0;
const NCOMP_MAX: usize = 2;
const N_PARAMS: usize = 3;

/// Fit the reference scenario into a fresh store under `dir`.
fn run_reference_fit(dir: &std::path::Path) -> (specdecomp::cube::CubeStack, ChunkedStore) {
    let (stack, factory, sampler) = scripted_stack(&[
        (0, 0, vec![0.0, 15.0, 40.0]),
        (0, 1, vec![0.0, 5.0]),
        (1, 0, vec![f64::NAN]),
        (1, 1, vec![0.0, 20.0, 25.0]),
    ]);
    let mut store = ChunkedStore::create(dir.join("run"), 2).unwrap();
    let summary = FitDispatcher::new(LNZ_THRESHOLD, NCOMP_MAX, SamplerConfig::default())
        .run(&stack, &factory, &sampler, &mut store)
        .unwrap();
    assert_eq!(summary.n_fit, 3);
    assert_eq!(summary.n_skipped, 1);
    assert_eq!(summary.n_linked, 3);
    (stack, store)
}

#[test]
fn test_full_pipeline_over_reference_grid() {
    let dir = tempdir().unwrap();
    let (stack, mut store) = run_reference_fit(dir.path());

    let model = GaussianComponentModel::from_stack(&stack);
    let config = PostprocessConfig {
        std_pix: 0.5,
        bins: None,
    };
    postprocess(&mut store, &model, &config).unwrap();

    // Selection map in storage order (b, l).
    let nbest = store.dataset_i32(products::NBEST).unwrap();
    assert_eq!(nbest.shape(), &[2, 2]);
    assert_eq!(nbest[[0, 0]], 2);
    assert_eq!(nbest[[0, 1]], -1);
    assert_eq!(nbest[[1, 0]], 0);
    assert_eq!(nbest[[1, 1]], 1);

    // The smoothed re-selection keeps the unresolved pixel and never
    // promotes a pixel past one order beyond its accepted fit.
    let conv_nbest = store.dataset_i32(products::CONV_NBEST).unwrap();
    assert_eq!(conv_nbest[[0, 1]], -1);
    for (c, n) in conv_nbest.iter().zip(nbest.iter()) {
        if *n >= 0 {
            assert!(*c >= 0);
            assert!(*c <= n + 1, "conv_nbest {c} exceeds nbest {n} + 1");
        }
    }

    // Every product of the pipeline is committed with its documented
    // axis order.
    let n_hist = 199;
    let expected: &[(&str, Vec<usize>)] = &[
        (products::EVIDENCE, vec![NCOMP_MAX + 1, 2, 2]),
        (products::EVIDENCE_ERR, vec![NCOMP_MAX + 1, 2, 2]),
        (products::AIC, vec![NCOMP_MAX + 1, 2, 2]),
        (products::AICC, vec![NCOMP_MAX + 1, 2, 2]),
        (products::BIC, vec![NCOMP_MAX + 1, 2, 2]),
        (products::CONV_EVIDENCE, vec![NCOMP_MAX + 1, 2, 2]),
        (products::NBEST_MAP, vec![NCOMP_MAX, N_PARAMS, 2, 2]),
        (
            products::NBEST_MARGINALS,
            vec![NCOMP_MAX, N_PARAMS, MARG_QUANTILES.len(), 2, 2],
        ),
        (products::MARG_QUANTILES, vec![MARG_QUANTILES.len()]),
        (products::PDF_BINS, vec![N_PARAMS, n_hist]),
        (products::POST_PDFS, vec![NCOMP_MAX, N_PARAMS, n_hist, 2, 2]),
        (
            products::CONV_POST_PDFS,
            vec![NCOMP_MAX, N_PARAMS, n_hist, 2, 2],
        ),
        (
            products::CONV_MARGINALS,
            vec![NCOMP_MAX, N_PARAMS, MARG_QUANTILES.len(), 2, 2],
        ),
        (products::PEAK_INTENSITY, vec![1, NCOMP_MAX, 2, 2]),
        (products::INTEGRATED_INTENSITY, vec![1, NCOMP_MAX, 2, 2]),
        (products::HF_DEBLENDED, vec![1, NCOMP_MAX, n_hist, 2, 2]),
    ];
    for (name, shape) in expected {
        let dataset = store.dataset(name).unwrap();
        assert_eq!(&dataset.shape, shape, "shape of {name}");
    }

    // Evidence chain of the accepted-2 pixel.
    let evidence = store.dataset_f64(products::EVIDENCE).unwrap();
    assert_eq!(evidence[[0, 0, 0]], 0.0);
    assert_eq!(evidence[[1, 0, 0]], 15.0);
    assert_eq!(evidence[[2, 0, 0]], 40.0);
    // The rejected second order of the accepted-1 pixel is persisted.
    assert_eq!(evidence[[2, 1, 1]], 25.0);

    // Smoothed marginals are monotone in the quantile level at a fit
    // pixel, and NaN at the unresolved one.
    let conv_marg = store.dataset_f64(products::CONV_MARGINALS).unwrap();
    for q in 0..MARG_QUANTILES.len() - 1 {
        let lo = conv_marg[[0, 0, q, 0, 0]];
        let hi = conv_marg[[0, 0, q + 1, 0, 0]];
        assert!(lo.is_finite() && hi.is_finite());
        assert!(lo <= hi + 1e-9);
    }
    assert!(conv_marg[[0, 0, 0, 0, 1]].is_nan());

    // Intensity maps are NaN at the unresolved pixel and finite where a
    // component was fit.
    let peak = store.dataset_f64(products::PEAK_INTENSITY).unwrap();
    assert!(peak[[0, 0, 0, 1]].is_nan());
    assert!(peak[[0, 0, 0, 0]].is_finite());
    let integrated = store.dataset_f64(products::INTEGRATED_INTENSITY).unwrap();
    assert!(integrated[[0, 0, 0, 0]].is_finite());
}

#[test]
fn test_products_survive_store_reopen() {
    let dir = tempdir().unwrap();
    let (stack, store) = run_reference_fit(dir.path());
    let store_dir = store.dir().to_path_buf();
    drop(store);

    // Aggregation runs against a freshly opened store, exactly as a
    // separate post-processing invocation would.
    let mut store = ChunkedStore::open(&store_dir).unwrap();
    assert_eq!(store.n_links(), 3);
    assert_eq!(store.attrs().lnz_threshold, Some(LNZ_THRESHOLD));

    let model = GaussianComponentModel::from_stack(&stack);
    postprocess(&mut store, &model, &PostprocessConfig::default()).unwrap();
    drop(store);

    let store = ChunkedStore::open(&store_dir).unwrap();
    let nbest = store.dataset_i32(products::NBEST).unwrap();
    assert_eq!(nbest[[0, 0]], 2);
    assert_eq!(nbest[[0, 1]], -1);
}

#[test]
fn test_aggregation_reruns_are_stable() {
    let dir = tempdir().unwrap();
    let (stack, mut store) = run_reference_fit(dir.path());
    let model = GaussianComponentModel::from_stack(&stack);
    let config = PostprocessConfig {
        std_pix: 0.5,
        bins: None,
    };

    postprocess(&mut store, &model, &config).unwrap();
    let first = store.dataset_f64(products::CONV_MARGINALS).unwrap();
    postprocess(&mut store, &model, &config).unwrap();
    let second = store.dataset_f64(products::CONV_MARGINALS).unwrap();

    assert_eq!(first.shape(), second.shape());
    for (a, b) in first.iter().zip(second.iter()) {
        assert!(a == b || (a.is_nan() && b.is_nan()));
    }
}
