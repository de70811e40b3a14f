//! # Chunked Store Module
//!
//! Durable, crash-tolerant-by-partition storage for a 2-D grid of
//! independent per-pixel fit results. A store is a directory:
//!
//! ```text
//! {name}.store/
//! ├── table.json      # run attributes, header blocks, external links
//! ├── chunk{i}.spd    # per-worker pixel records, append-only
//! └── products.spd    # dense aggregation datasets, atomically replaced
//! ```
//!
//! ## Design Principles
//!
//! 1. **One writer per chunk file**: each worker owns exactly one chunk
//!    file and writes only pixel groups assigned to it, so concurrent
//!    workers never contend on a file.
//!
//! 2. **Linking is explicit and late**: the table file gains one external
//!    link per pixel group only after every worker has exited, because the
//!    set of groups is unknowable before writing completes and link
//!    creation must not race chunk writes.
//!
//! 3. **Broken links fail loudly**: a link whose target chunk file or
//!    record is missing aborts traversal. Silently skipping would punch
//!    undetectable holes into the dense product arrays downstream.
//!
//! 4. **Append-only chunk records**: each pixel group is one
//!    length-prefixed bincode record flushed on write, so a crashed worker
//!    loses at most the pixel it was writing.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::cube::HeaderBlock;
use crate::model::{PixelKey, PixelRecord};

/// Magic bytes at the head of every chunk file.
const CHUNK_MAGIC: &[u8; 8] = b"SPDCHNK1";

/// File name of the linked table inside the store directory.
const TABLE_FILE: &str = "table.json";

/// File name of the products dataset file inside the store directory.
const PRODUCTS_FILE: &str = "products.spd";

/// Prefix of chunk file names.
const CHUNK_PREFIX: &str = "chunk";

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Table serialization error
    #[error("table JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chunk or products record serialization error
    #[error("record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Opened a file that is not a chunk file
    #[error("bad magic in chunk file {0}")]
    BadMagic(PathBuf),

    /// A length prefix promised more bytes than the file holds
    #[error("truncated record in chunk file {0}")]
    TruncatedChunk(PathBuf),

    /// External link whose target cannot be resolved; always fatal
    #[error("broken external link {path}: {detail}")]
    BrokenLink {
        /// Link path, `pix/<lon>/<lat>`
        path: String,
        /// What failed while resolving it
        detail: String,
    },

    /// The same pixel group exists in more than one chunk file
    #[error("duplicate pixel group {0} across chunk files")]
    DuplicatePixel(String),

    /// Dataset name already taken and the policy forbids overwriting
    #[error("dataset {0:?} already exists")]
    DatasetExists(String),

    /// Requested dataset has not been committed
    #[error("no dataset named {0:?}")]
    MissingDataset(String),

    /// Dataset holds a different element type than requested
    #[error("dataset {0:?} has element type {1}, not {2}")]
    DatasetType(String, &'static str, &'static str),

    /// Stored shape and element count disagree
    #[error("dataset {0:?} shape {1:?} does not match {2} elements")]
    DatasetShape(String, Vec<usize>, usize),

    /// The directory exists but holds no table file
    #[error("{0} is not a store directory")]
    NotAStore(PathBuf),
}

/// What to do when a dataset name is reused.
///
/// Aggregation passes are routinely re-run, so the default replaces the
/// old dataset and logs a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    /// Replace an existing dataset, logging a warning
    #[default]
    Clobber,
    /// Refuse to replace an existing dataset
    Fail,
}

/// Scalar element storage of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatasetData {
    /// 64-bit floats; NaN is the "unfit" sentinel
    F64(Vec<f64>),
    /// 32-bit integers; used for model-order maps with `-1` sentinel
    I32(Vec<i32>),
}

impl DatasetData {
    fn len(&self) -> usize {
        match self {
            DatasetData::F64(v) => v.len(),
            DatasetData::I32(v) => v.len(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            DatasetData::F64(_) => "f64",
            DatasetData::I32(_) => "i32",
        }
    }
}

/// One named n-dimensional dataset with an explicit, fixed axis order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Axis lengths, in storage order
    pub shape: Vec<usize>,
    /// Flat element buffer, row-major
    pub data: DatasetData,
}

impl Dataset {
    /// Wrap an f64 array. The array is copied into standard layout so the
    /// stored buffer is row-major regardless of the view's strides.
    pub fn from_f64(array: &ArrayD<f64>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: DatasetData::F64(array.as_standard_layout().iter().copied().collect()),
        }
    }

    /// Wrap an i32 array.
    pub fn from_i32(array: &ArrayD<i32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: DatasetData::I32(array.as_standard_layout().iter().copied().collect()),
        }
    }

    /// View as an f64 array.
    pub fn to_f64(&self, name: &str) -> Result<ArrayD<f64>, StoreError> {
        match &self.data {
            DatasetData::F64(v) => ArrayD::from_shape_vec(IxDyn(&self.shape), v.clone())
                .map_err(|_| {
                    StoreError::DatasetShape(name.to_string(), self.shape.clone(), v.len())
                }),
            other => Err(StoreError::DatasetType(
                name.to_string(),
                other.type_name(),
                "f64",
            )),
        }
    }

    /// View as an i32 array.
    pub fn to_i32(&self, name: &str) -> Result<ArrayD<i32>, StoreError> {
        match &self.data {
            DatasetData::I32(v) => ArrayD::from_shape_vec(IxDyn(&self.shape), v.clone())
                .map_err(|_| {
                    StoreError::DatasetShape(name.to_string(), self.shape.clone(), v.len())
                }),
            other => Err(StoreError::DatasetType(
                name.to_string(),
                other.type_name(),
                "i32",
            )),
        }
    }
}

/// External link from the table into a chunk file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    /// Chunk file name relative to the store directory
    pub file: String,
    /// Byte offset of the record's length prefix
    pub offset: u64,
    /// Longitude index, duplicated for cheap traversal
    pub i_lon: usize,
    /// Latitude index
    pub i_lat: usize,
}

/// Run parameters persisted as top-level table attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAttrs {
    /// Spatial grid length along longitude
    pub naxis1: Option<usize>,
    /// Spatial grid length along latitude
    pub naxis2: Option<usize>,
    /// Evidence-improvement threshold of the stopping rule
    #[serde(rename = "lnZ_threshold")]
    pub lnz_threshold: Option<f64>,
    /// Maximum model order attempted per pixel
    pub n_max_components: Option<usize>,
    /// One-line sampler configuration summary
    pub sampler_config: Option<String>,
}

/// On-disk representation of `table.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableFileData {
    nchunks: usize,
    created: DateTime<Utc>,
    attrs: RunAttrs,
    simple_header: HeaderBlock,
    full_header: HeaderBlock,
    links: BTreeMap<String, LinkEntry>,
}

/// Append-only writer for one worker's chunk file.
///
/// Create one inside the worker that owns it, never before dispatch; the
/// handle must not cross the worker boundary.
pub struct ChunkWriter {
    path: PathBuf,
    file: BufWriter<File>,
    pos: u64,
    records_written: usize,
}

impl ChunkWriter {
    /// Create a fresh chunk file, truncating any previous run's file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(CHUNK_MAGIC)?;
        file.flush()?;
        Ok(Self {
            path,
            file,
            pos: CHUNK_MAGIC.len() as u64,
            records_written: 0,
        })
    }

    /// Append one pixel record and flush it, returning its byte offset.
    ///
    /// Records are write-once: the store never updates a pixel group in
    /// place.
    pub fn write_record(&mut self, record: &PixelRecord) -> Result<u64, StoreError> {
        let offset = self.pos;
        let bytes = bincode::serialize(record)?;
        self.file.write_all(&(bytes.len() as u64).to_le_bytes())?;
        self.file.write_all(&bytes)?;
        // One flush per pixel keeps a crashed worker's earlier pixels intact.
        self.file.flush()?;
        self.pos += 8 + bytes.len() as u64;
        self.records_written += 1;
        Ok(offset)
    }

    /// Number of records written so far.
    pub fn records_written(&self) -> usize {
        self.records_written
    }

    /// Path of the chunk file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file.
    pub fn finish(mut self) -> Result<(), StoreError> {
        self.file.flush()?;
        Ok(())
    }
}

/// Sequential reader over one chunk file.
pub struct ChunkReader {
    path: PathBuf,
    file: BufReader<File>,
    pos: u64,
    end: u64,
}

impl ChunkReader {
    /// Open a chunk file and validate its magic bytes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let end = file.metadata()?.len();
        let mut file = BufReader::new(file);
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != CHUNK_MAGIC {
            return Err(StoreError::BadMagic(path));
        }
        Ok(Self {
            path,
            file,
            pos: CHUNK_MAGIC.len() as u64,
            end,
        })
    }

    /// Read the next record, with its byte offset. `Ok(None)` at EOF.
    pub fn next_record(&mut self) -> Result<Option<(u64, PixelRecord)>, StoreError> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let offset = self.pos;
        if self.end - self.pos < 8 {
            return Err(StoreError::TruncatedChunk(self.path.clone()));
        }
        let mut len_bytes = [0u8; 8];
        self.file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if self.end - self.pos - 8 < len {
            return Err(StoreError::TruncatedChunk(self.path.clone()));
        }
        let mut bytes = vec![0u8; len as usize];
        self.file.read_exact(&mut bytes)?;
        let record = bincode::deserialize(&bytes)?;
        self.pos += 8 + len;
        Ok(Some((offset, record)))
    }

    /// Read one record at a known offset.
    pub fn record_at(&mut self, offset: u64) -> Result<PixelRecord, StoreError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        match self.next_record()? {
            Some((_, record)) => Ok(record),
            None => Err(StoreError::TruncatedChunk(self.path.clone())),
        }
    }
}

/// The chunked store: table file, chunk files, and product datasets.
#[derive(Debug)]
pub struct ChunkedStore {
    dir: PathBuf,
    table: TableFileData,
    products: BTreeMap<String, Dataset>,
}

/// Append the `.store` extension unless the caller already supplied it.
fn store_dir_path<P: AsRef<Path>>(name: P) -> PathBuf {
    let name = name.as_ref();
    match name.extension() {
        Some(ext) if ext == "store" => name.to_path_buf(),
        _ => {
            let mut s = name.as_os_str().to_os_string();
            s.push(".store");
            PathBuf::from(s)
        }
    }
}

impl ChunkedStore {
    /// Create a store directory, or re-open it if it already exists.
    ///
    /// On re-open the persisted `nchunks` wins over the argument, so a
    /// run resumed with a different process count still finds its files.
    pub fn create<P: AsRef<Path>>(name: P, nchunks: usize) -> Result<Self, StoreError> {
        let dir = store_dir_path(name);
        if dir.join(TABLE_FILE).exists() {
            let store = Self::open(&dir)?;
            if store.nchunks() != nchunks {
                info!(
                    "store {} exists with nchunks={}, ignoring requested {}",
                    dir.display(),
                    store.nchunks(),
                    nchunks
                );
            }
            return Ok(store);
        }
        fs::create_dir_all(&dir)?;
        let table = TableFileData {
            nchunks,
            created: Utc::now(),
            attrs: RunAttrs::default(),
            simple_header: HeaderBlock::new(),
            full_header: HeaderBlock::new(),
            links: BTreeMap::new(),
        };
        let mut store = Self {
            dir,
            table,
            products: BTreeMap::new(),
        };
        store.save_table()?;
        Ok(store)
    }

    /// Open an existing store.
    pub fn open<P: AsRef<Path>>(name: P) -> Result<Self, StoreError> {
        let dir = store_dir_path(name);
        let table_path = dir.join(TABLE_FILE);
        if !table_path.exists() {
            return Err(StoreError::NotAStore(dir));
        }
        let table: TableFileData = serde_json::from_reader(BufReader::new(File::open(
            &table_path,
        )?))?;
        let products_path = dir.join(PRODUCTS_FILE);
        let products = if products_path.exists() {
            bincode::deserialize_from(BufReader::new(File::open(&products_path)?))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            dir,
            table,
            products,
        })
    }

    /// Store directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of chunk files in this store.
    pub fn nchunks(&self) -> usize {
        self.table.nchunks
    }

    /// Path of chunk file `i`.
    pub fn chunk_path(&self, i: usize) -> PathBuf {
        self.dir.join(format!("{CHUNK_PREFIX}{i}.spd"))
    }

    /// Paths of every chunk file.
    pub fn chunk_paths(&self) -> Vec<PathBuf> {
        (0..self.table.nchunks).map(|i| self.chunk_path(i)).collect()
    }

    /// Run attributes.
    pub fn attrs(&self) -> &RunAttrs {
        &self.table.attrs
    }

    /// Creation timestamp of the table file.
    pub fn created(&self) -> DateTime<Utc> {
        self.table.created
    }

    /// Reduced coordinate header block.
    pub fn simple_header(&self) -> &HeaderBlock {
        &self.table.simple_header
    }

    /// Full originating header block.
    pub fn full_header(&self) -> &HeaderBlock {
        &self.table.full_header
    }

    /// Persist the coordinate headers and spatial grid dimensions.
    pub fn insert_header(
        &mut self,
        simple_header: &HeaderBlock,
        full_header: &HeaderBlock,
        naxis1: usize,
        naxis2: usize,
    ) -> Result<(), StoreError> {
        self.table.simple_header = simple_header.clone();
        self.table.full_header = full_header.clone();
        self.table.attrs.naxis1 = Some(naxis1);
        self.table.attrs.naxis2 = Some(naxis2);
        self.save_table()
    }

    /// Persist the stopping-rule and sampler parameters.
    pub fn insert_run_parameters(
        &mut self,
        lnz_threshold: f64,
        n_max_components: usize,
        sampler_config: &str,
    ) -> Result<(), StoreError> {
        self.table.attrs.lnz_threshold = Some(lnz_threshold);
        self.table.attrs.n_max_components = Some(n_max_components);
        self.table.attrs.sampler_config = Some(sampler_config.to_string());
        self.save_table()
    }

    /// Drop all pixel links, e.g. before re-linking a re-run store.
    pub fn reset_links(&mut self) -> Result<(), StoreError> {
        self.table.links.clear();
        self.save_table()
    }

    /// Number of linked pixel groups.
    pub fn n_links(&self) -> usize {
        self.table.links.len()
    }

    /// Scan every chunk file and register one external link per pixel
    /// group. Must run strictly after all workers have exited.
    ///
    /// Returns the number of links created. A pixel group found in two
    /// chunk files is an error: partitions are disjoint by construction,
    /// so a duplicate means corrupted or stale chunk files.
    pub fn link_all_chunks(&mut self) -> Result<usize, StoreError> {
        let mut created = 0usize;
        for i in 0..self.table.nchunks {
            let path = self.chunk_path(i);
            let file_name = format!("{CHUNK_PREFIX}{i}.spd");
            let mut reader = ChunkReader::open(&path)?;
            while let Some((offset, record)) = reader.next_record()? {
                let group = record.key.group_path();
                let entry = LinkEntry {
                    file: file_name.clone(),
                    offset,
                    i_lon: record.key.i_lon,
                    i_lat: record.key.i_lat,
                };
                if self.table.links.insert(group.clone(), entry).is_some() {
                    return Err(StoreError::DuplicatePixel(group));
                }
                created += 1;
            }
            debug!("linked chunk {}: {} total links", i, self.table.links.len());
        }
        self.save_table()?;
        info!("linked {} pixel groups from {} chunks", created, self.table.nchunks);
        Ok(created)
    }

    /// Lazily traverse every linked pixel group in key order.
    ///
    /// Any link whose chunk file or record cannot be resolved yields a
    /// hard [`StoreError::BrokenLink`]; traversal never skips silently.
    pub fn iter_pixel_groups(&self) -> PixelGroupIter<'_> {
        PixelGroupIter {
            store: self,
            links: self.table.links.iter().collect(),
            index: 0,
            readers: BTreeMap::new(),
        }
    }

    /// Commit a named dense dataset into the products file.
    pub fn create_dataset(
        &mut self,
        name: &str,
        dataset: Dataset,
        policy: OverwritePolicy,
    ) -> Result<(), StoreError> {
        debug_assert!(!name.is_empty());
        if self.products.contains_key(name) {
            match policy {
                OverwritePolicy::Clobber => {
                    warn!("replacing dataset {name:?}");
                }
                OverwritePolicy::Fail => {
                    return Err(StoreError::DatasetExists(name.to_string()));
                }
            }
        }
        self.products.insert(name.to_string(), dataset);
        self.save_products()
    }

    /// Fetch a committed dataset.
    pub fn dataset(&self, name: &str) -> Result<&Dataset, StoreError> {
        self.products
            .get(name)
            .ok_or_else(|| StoreError::MissingDataset(name.to_string()))
    }

    /// Fetch a committed dataset as an f64 array.
    pub fn dataset_f64(&self, name: &str) -> Result<ArrayD<f64>, StoreError> {
        self.dataset(name)?.to_f64(name)
    }

    /// Fetch a committed dataset as an i32 array.
    pub fn dataset_i32(&self, name: &str) -> Result<ArrayD<i32>, StoreError> {
        self.dataset(name)?.to_i32(name)
    }

    /// Names of all committed datasets.
    pub fn dataset_names(&self) -> Vec<&str> {
        self.products.keys().map(|s| s.as_str()).collect()
    }

    fn save_table(&self) -> Result<(), StoreError> {
        let path = self.dir.join(TABLE_FILE);
        let mut file = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
        );
        serde_json::to_writer_pretty(&mut file, &self.table)?;
        file.flush()?;
        Ok(())
    }

    /// Rewrite the products file through a temp file so a crash mid-commit
    /// leaves the previous products intact.
    fn save_products(&self) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        bincode::serialize_into(BufWriter::new(tmp.as_file_mut()), &self.products)?;
        tmp.persist(self.dir.join(PRODUCTS_FILE))
            .map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

/// Iterator over linked pixel groups; see
/// [`ChunkedStore::iter_pixel_groups`].
pub struct PixelGroupIter<'a> {
    store: &'a ChunkedStore,
    links: Vec<(&'a String, &'a LinkEntry)>,
    index: usize,
    readers: BTreeMap<String, ChunkReader>,
}

impl PixelGroupIter<'_> {
    fn resolve(&mut self, path: &str, entry: &LinkEntry) -> Result<PixelRecord, StoreError> {
        if !self.readers.contains_key(&entry.file) {
            let chunk_path = self.store.dir.join(&entry.file);
            let reader = ChunkReader::open(&chunk_path).map_err(|e| StoreError::BrokenLink {
                path: path.to_string(),
                detail: e.to_string(),
            })?;
            self.readers.insert(entry.file.clone(), reader);
        }
        // Key present per the insert above.
        let reader = self
            .readers
            .get_mut(&entry.file)
            .ok_or_else(|| StoreError::BrokenLink {
                path: path.to_string(),
                detail: "reader cache miss".to_string(),
            })?;
        let record = reader
            .record_at(entry.offset)
            .map_err(|e| StoreError::BrokenLink {
                path: path.to_string(),
                detail: e.to_string(),
            })?;
        let expected = PixelKey::new(entry.i_lon, entry.i_lat);
        if record.key != expected {
            return Err(StoreError::BrokenLink {
                path: path.to_string(),
                detail: format!("record key {} does not match link", record.key),
            });
        }
        Ok(record)
    }
}

impl Iterator for PixelGroupIter<'_> {
    type Item = Result<PixelRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.links.len() {
            return None;
        }
        let (path, entry) = self.links[self.index];
        self.index += 1;
        let (path, entry) = (path.clone(), entry.clone());
        Some(self.resolve(&path, &entry))
    }
}
