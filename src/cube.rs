//! # In-Memory Cube Stack
//!
//! Spatially-indexed spectra handed to the fitting engine. Cube file I/O
//! and unit conversion live outside this crate; callers load their cubes
//! however they like and hand over plain arrays in `(lon, lat, channel)`
//! order with an ascending spectral axis. What this module keeps is the
//! part the pipeline itself depends on: per-pixel spectrum extraction with
//! NaN detection, per-pixel noise lookup, and the two coordinate-system
//! header blocks the store persists.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Array3};

/// Header key/value block, persisted as attributes on the table file.
pub type HeaderBlock = BTreeMap<String, serde_json::Value>;

/// Errors raised while assembling a cube stack.
#[derive(Debug, thiserror::Error)]
pub enum CubeError {
    /// A cube and its noise map disagree on the spatial grid
    #[error("noise map shape {noise:?} does not match spatial shape {spatial:?}")]
    NoiseShapeMismatch {
        /// Noise map shape
        noise: (usize, usize),
        /// Cube spatial shape
        spatial: (usize, usize),
    },

    /// Cubes within one stack disagree on the spatial grid
    #[error("cube {index} spatial shape {got:?} does not match {expected:?}")]
    SpatialShapeMismatch {
        /// Index of the offending cube in the stack
        index: usize,
        /// Its spatial shape
        got: (usize, usize),
        /// The stack's spatial shape
        expected: (usize, usize),
    },

    /// Spectral axis shorter than two channels
    #[error("spectral axis needs at least 2 channels, got {0}")]
    SpectralAxisTooShort(usize),

    /// A stack must contain at least one cube
    #[error("empty cube stack")]
    EmptyStack,
}

/// Per-pixel RMS noise, either uniform or from a primary-beam image.
#[derive(Debug, Clone)]
pub enum NoiseMap {
    /// One RMS value for every pixel
    Uniform(f64),
    /// Per-pixel RMS, shape `(lon, lat)`
    PerPixel(Array2<f64>),
}

impl NoiseMap {
    /// Build a per-pixel noise map from a primary-beam response image.
    ///
    /// Beam images are typically NaN-masked outside the field; those pixels
    /// become `+inf` noise so their likelihood contribution vanishes
    /// instead of poisoning the fit.
    pub fn from_pb_image(rms: f64, pb_image: &Array2<f64>) -> Self {
        let noise = pb_image.mapv(|pb| {
            let n = rms / pb;
            if n.is_finite() {
                n
            } else {
                f64::INFINITY
            }
        });
        NoiseMap::PerPixel(noise)
    }

    /// RMS noise at one pixel.
    pub fn get_noise(&self, i_lon: usize, i_lat: usize) -> f64 {
        match self {
            NoiseMap::Uniform(rms) => *rms,
            NoiseMap::PerPixel(map) => map[[i_lon, i_lat]],
        }
    }

    fn shape(&self) -> Option<(usize, usize)> {
        match self {
            NoiseMap::Uniform(_) => None,
            NoiseMap::PerPixel(map) => {
                let d = map.dim();
                Some((d.0, d.1))
            }
        }
    }
}

/// One pixel's spectrum from one transition, as consumed by the model.
#[derive(Debug, Clone)]
pub struct SpectrumData {
    /// Spectral axis values, ascending
    pub xarr: Array1<f64>,
    /// Brightness samples
    pub data: Array1<f64>,
    /// RMS noise for this pixel
    pub noise: f64,
    /// Identifier of the transition this spectrum belongs to
    pub trans_id: usize,
}

impl SpectrumData {
    /// Whether any sample is non-finite. Such pixels are rejected outright
    /// by the engine.
    pub fn has_nans(&self) -> bool {
        self.data.iter().any(|v| !v.is_finite())
    }
}

/// One transition's data cube with its noise map and headers.
///
/// Data is stored `(lon, lat, channel)` so per-pixel spectra are
/// contiguous along the last axis.
#[derive(Debug, Clone)]
pub struct DataCube {
    data: Array3<f64>,
    xarr: Array1<f64>,
    noise_map: NoiseMap,
    /// Transition identifier carried through to products
    pub trans_id: usize,
    /// Velocity channel width, used to scale integrated intensities
    pub dv: f64,
    /// Reduced 2-D coordinate header
    pub simple_header: HeaderBlock,
    /// Full originating header
    pub full_header: HeaderBlock,
}

impl DataCube {
    /// Assemble a cube from arrays already in `(lon, lat, channel)` order.
    ///
    /// A descending spectral axis is flipped, data along with it, so the
    /// axis is always ascending afterwards.
    pub fn new(
        mut data: Array3<f64>,
        mut xarr: Array1<f64>,
        noise_map: NoiseMap,
        trans_id: usize,
        dv: f64,
        simple_header: HeaderBlock,
        full_header: HeaderBlock,
    ) -> Result<Self, CubeError> {
        if xarr.len() < 2 {
            return Err(CubeError::SpectralAxisTooShort(xarr.len()));
        }
        if xarr[1] - xarr[0] < 0.0 {
            xarr = xarr.slice(ndarray::s![..;-1]).to_owned();
            data = data.slice(ndarray::s![.., .., ..;-1]).to_owned();
        }
        let (n_lon, n_lat, _) = data.dim();
        if let Some(noise_shape) = noise_map.shape() {
            if noise_shape != (n_lon, n_lat) {
                return Err(CubeError::NoiseShapeMismatch {
                    noise: noise_shape,
                    spatial: (n_lon, n_lat),
                });
            }
        }
        Ok(Self {
            data,
            xarr,
            noise_map,
            trans_id,
            dv,
            simple_header,
            full_header,
        })
    }

    /// Full data shape `(lon, lat, channel)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Spatial grid shape `(lon, lat)`.
    pub fn spatial_shape(&self) -> (usize, usize) {
        let (l, b, _) = self.data.dim();
        (l, b)
    }

    /// Extract one pixel's spectrum together with its NaN flag.
    pub fn get_spectrum(&self, i_lon: usize, i_lat: usize) -> (SpectrumData, bool) {
        let data = self.data.slice(ndarray::s![i_lon, i_lat, ..]).to_owned();
        let spec = SpectrumData {
            xarr: self.xarr.clone(),
            data,
            noise: self.noise_map.get_noise(i_lon, i_lat),
            trans_id: self.trans_id,
        };
        let has_nans = spec.has_nans();
        (spec, has_nans)
    }
}

/// Co-located cubes from multiple transitions, fit jointly per pixel.
#[derive(Debug, Clone)]
pub struct CubeStack {
    cubes: Vec<DataCube>,
}

impl CubeStack {
    /// Build a stack, verifying all cubes share the spatial grid.
    pub fn new(cubes: Vec<DataCube>) -> Result<Self, CubeError> {
        let first = cubes.first().ok_or(CubeError::EmptyStack)?;
        let spatial = first.spatial_shape();
        for (index, cube) in cubes.iter().enumerate().skip(1) {
            let got = cube.spatial_shape();
            if got != spatial {
                return Err(CubeError::SpatialShapeMismatch {
                    index,
                    got,
                    expected: spatial,
                });
            }
        }
        Ok(Self { cubes })
    }

    /// Number of transitions in the stack.
    pub fn n_cubes(&self) -> usize {
        self.cubes.len()
    }

    /// The stacked cubes, in transition order.
    pub fn cubes(&self) -> &[DataCube] {
        &self.cubes
    }

    /// Spatial grid shape `(lon, lat)`.
    pub fn spatial_shape(&self) -> (usize, usize) {
        self.cubes[0].spatial_shape()
    }

    /// Reduced header of the first cube; all cubes share the grid.
    pub fn simple_header(&self) -> &HeaderBlock {
        &self.cubes[0].simple_header
    }

    /// Full header of the first cube.
    pub fn full_header(&self) -> &HeaderBlock {
        &self.cubes[0].full_header
    }

    /// All transitions' spectra at one pixel, plus whether any contains
    /// non-finite samples.
    pub fn get_spectra(&self, i_lon: usize, i_lat: usize) -> (Vec<SpectrumData>, bool) {
        let mut spectra = Vec::with_capacity(self.cubes.len());
        let mut any_nans = false;
        for cube in &self.cubes {
            let (spec, has_nans) = cube.get_spectrum(i_lon, i_lat);
            any_nans |= has_nans;
            spectra.push(spec);
        }
        (spectra, any_nans)
    }
}
