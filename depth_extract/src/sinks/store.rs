// THEORY:
// The structured store is the durable record of an extraction: one flat,
// little-endian binary file per named dataset plus a JSON manifest describing
// every dataset's dtype and shape and the parameters the extraction ran with.
//
// Key architectural principles:
// 1.  **Pre-Sized**: Every dataset file is sized to `total_frames` when the store
//     is created. Batches then seek to their frame index and write in place, so
//     the layout never depends on the order of writes.
// 2.  **Write Once**: Each frame index may be written once. A second write to the
//     same index is an error, which turns an overlap bug in the orchestrator into
//     a loud failure instead of silently overwritten data.
// 3.  **Honest Manifest**: The manifest is written when the store is created and
//     rewritten on close. Its `complete` flag is only set when every index was
//     written, so an interrupted extraction is recognizable on disk.

use super::{ExtractionSink, RetainedBatch, SinkError};
use crate::config::FrameDtype;
use crate::core_modules::scalars::SCALAR_NAMES;
use byteorder::{ByteOrder, LittleEndian};
use ndarray::{Array3, ArrayView3, s};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const FRAMES: &str = "frames";
pub const MASKS: &str = "frames_mask";
pub const CROPS: &str = "frames_crop";
pub const FLIPS: &str = "metadata/extraction/flips";

pub fn scalar_dataset(name: &str) -> String {
    format!("scalars/{name}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest {path} is invalid: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame {index} was already written")]
    DuplicateIndex { index: usize },
    #[error("frame {index} is outside the store ({total} frames)")]
    OutOfRange { index: usize, total: usize },
    #[error("dataset {dataset}: expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        dataset: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("store has no dataset named {0}")]
    UnknownDataset(String),
    #[error("store is already closed")]
    Closed,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Element type of a stored dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    U16,
    F32,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::F32 => 4,
        }
    }
}

impl From<FrameDtype> for ElementType {
    fn from(dtype: FrameDtype) -> Self {
        match dtype {
            FrameDtype::U8 => ElementType::U8,
            FrameDtype::U16 => ElementType::U16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub dtype: ElementType,
    /// Full shape; the first axis is the frame index.
    pub shape: Vec<usize>,
    /// Data file, relative to the manifest's directory.
    pub file: PathBuf,
}

impl DatasetInfo {
    /// Elements per frame.
    fn frame_elements(&self) -> usize {
        self.shape[1..].iter().product()
    }

    fn frame_bytes(&self) -> usize {
        self.frame_elements() * self.dtype.size()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub total_frames: usize,
    pub frames_written: usize,
    pub complete: bool,
    pub datasets: BTreeMap<String, DatasetInfo>,
    /// Extraction parameters, recorded verbatim.
    pub parameters: serde_json::Value,
}

impl Manifest {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(io_error(path))?;
        serde_json::from_str(&content).map_err(|source| StoreError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_error(path))
    }
}

/// Shape of everything a store holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreLayout {
    pub total_frames: usize,
    /// (rows, cols)
    pub frame_shape: (usize, usize),
    /// (rows, cols)
    pub crop_shape: (usize, usize),
    pub frame_dtype: FrameDtype,
    pub with_flips: bool,
}

impl StoreLayout {
    /// Every dataset with its dtype and full shape.
    pub fn datasets(&self) -> Vec<(String, ElementType, Vec<usize>)> {
        let n = self.total_frames;
        let (rows, cols) = self.frame_shape;
        let (crop_rows, crop_cols) = self.crop_shape;
        let mut datasets = vec![
            (FRAMES.to_string(), self.frame_dtype.into(), vec![n, rows, cols]),
            (MASKS.to_string(), ElementType::F32, vec![n, rows, cols]),
            (CROPS.to_string(), self.frame_dtype.into(), vec![n, crop_rows, crop_cols]),
        ];
        datasets.extend(
            SCALAR_NAMES
                .iter()
                .map(|name| (scalar_dataset(name), ElementType::F32, vec![n])),
        );
        if self.with_flips {
            datasets.push((FLIPS.to_string(), ElementType::U8, vec![n]));
        }
        datasets
    }
}

/// Rejects indices already written or past the end.
fn check_unwritten(written: &[bool], range: std::ops::Range<usize>) -> Result<(), StoreError> {
    if range.end > written.len() {
        return Err(StoreError::OutOfRange {
            index: range.end - 1,
            total: written.len(),
        });
    }
    match written[range.clone()].iter().position(|&w| w) {
        Some(offset) => Err(StoreError::DuplicateIndex {
            index: range.start + offset,
        }),
        None => Ok(()),
    }
}

/// Validates every part of `batch` against the layout before anything is written.
fn check_batch(layout: &StoreLayout, written: &[bool], batch: &RetainedBatch<'_>) -> Result<(), StoreError> {
    let n = batch.len();
    let (rows, cols) = layout.frame_shape;
    let (crop_rows, crop_cols) = layout.crop_shape;
    check_shape(FRAMES, &[n, rows, cols], batch.frames.shape())?;
    check_shape(MASKS, &[n, rows, cols], batch.masks.shape())?;
    check_shape(CROPS, &[n, crop_rows, crop_cols], batch.crops.shape())?;
    for (name, values) in &batch.scalars {
        check_shape(name, &[n], &[values.len()])?;
    }
    if let Some(flips) = batch.flips {
        check_shape(FLIPS, &[n], &[flips.len()])?;
    }
    check_unwritten(written, batch.output_range.clone())
}

fn check_shape(dataset: &str, expected: &[usize], got: &[usize]) -> Result<(), StoreError> {
    if expected == got {
        Ok(())
    } else {
        Err(StoreError::ShapeMismatch {
            dataset: dataset.to_string(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        })
    }
}

fn encode_u16(values: impl Iterator<Item = u16>, dtype: ElementType) -> Vec<u8> {
    let values: Vec<u16> = values.collect();
    match dtype {
        ElementType::U8 => values.iter().map(|&v| v.min(u8::MAX as u16) as u8).collect(),
        _ => {
            let mut bytes = vec![0u8; values.len() * 2];
            LittleEndian::write_u16_into(&values, &mut bytes);
            bytes
        }
    }
}

fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * 4];
    LittleEndian::write_f32_into(values, &mut bytes);
    bytes
}

struct DatasetFile {
    info: DatasetInfo,
    path: PathBuf,
    file: File,
}

/// Structured on-disk store: `<dir>/<name>.manifest.json` plus `<dir>/<name>.data/`.
pub struct FrameStore {
    name: String,
    manifest_path: PathBuf,
    layout: StoreLayout,
    datasets: BTreeMap<String, DatasetFile>,
    written: Vec<bool>,
    parameters: serde_json::Value,
    closed: bool,
}

impl FrameStore {
    pub fn create(dir: &Path, name: &str, layout: StoreLayout, parameters: serde_json::Value) -> Result<Self, StoreError> {
        let data_dir_name = format!("{name}.data");
        let mut datasets = BTreeMap::new();
        for (dataset, dtype, shape) in layout.datasets() {
            let relative = Path::new(&data_dir_name).join(format!("{dataset}.bin"));
            let path = dir.join(&relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            let info = DatasetInfo {
                dtype,
                shape,
                file: relative,
            };
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(io_error(&path))?;
            file.set_len((layout.total_frames * info.frame_bytes()) as u64)
                .map_err(io_error(&path))?;
            datasets.insert(dataset, DatasetFile { info, path, file });
        }

        let store = Self {
            name: name.to_string(),
            manifest_path: dir.join(format!("{name}.manifest.json")),
            layout,
            datasets,
            written: vec![false; layout.total_frames],
            parameters,
            closed: false,
        };
        store.manifest().save(&store.manifest_path)?;
        debug!(store = name, frames = layout.total_frames, "created frame store");
        Ok(store)
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn frames_written(&self) -> usize {
        self.written.iter().filter(|&&w| w).count()
    }

    fn manifest(&self) -> Manifest {
        let frames_written = self.frames_written();
        Manifest {
            name: self.name.clone(),
            total_frames: self.layout.total_frames,
            frames_written,
            complete: frames_written == self.layout.total_frames,
            datasets: self
                .datasets
                .iter()
                .map(|(name, d)| (name.clone(), d.info.clone()))
                .collect(),
            parameters: self.parameters.clone(),
        }
    }

    fn write_frames(&mut self, dataset: &str, first_frame: usize, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| StoreError::UnknownDataset(dataset.to_string()))?;
        let position = (first_frame * target.info.frame_bytes()) as u64;
        target
            .file
            .seek(SeekFrom::Start(position))
            .and_then(|_| target.file.write_all(bytes))
            .map_err(io_error(&target.path))
    }

    fn store_batch(&mut self, batch: &RetainedBatch<'_>) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        check_batch(&self.layout, &self.written, batch)?;

        let n = batch.len();
        let start = batch.output_range.start;
        let dtype = self.layout.frame_dtype.into();
        self.write_frames(FRAMES, start, &encode_u16(batch.frames.iter().copied(), dtype))?;
        self.write_frames(CROPS, start, &encode_u16(batch.crops.iter().copied(), dtype))?;
        let masks: Vec<f32> = batch.masks.iter().copied().collect();
        self.write_frames(MASKS, start, &encode_f32(&masks))?;
        for (name, values) in &batch.scalars {
            self.write_frames(&scalar_dataset(name), start, &encode_f32(values))?;
        }
        if self.layout.with_flips {
            let flips: Vec<u8> = match batch.flips {
                Some(flips) => flips.iter().map(|&f| u8::from(f)).collect(),
                None => vec![0; n],
            };
            self.write_frames(FLIPS, start, &flips)?;
        }
        // Only frames whose every dataset landed count as written.
        self.written[batch.output_range.clone()].fill(true);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for dataset in self.datasets.values_mut() {
            dataset.file.flush().map_err(io_error(&dataset.path))?;
        }
        let manifest = self.manifest();
        if !manifest.complete {
            warn!(
                store = %self.name,
                written = manifest.frames_written,
                total = manifest.total_frames,
                "closing incomplete frame store"
            );
        }
        manifest.save(&self.manifest_path)
    }
}

impl ExtractionSink for FrameStore {
    fn name(&self) -> &str {
        "frame store"
    }

    fn write_batch(&mut self, batch: &RetainedBatch<'_>) -> Result<(), SinkError> {
        Ok(self.store_batch(batch)?)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(self.finish()?)
    }
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.finish() {
                warn!(store = %self.name, error = %e, "failed to finalize frame store on drop");
            }
        }
    }
}

/// Read access to a finished store.
pub struct StoredRecording {
    base: PathBuf,
    pub manifest: Manifest,
}

impl StoredRecording {
    pub fn open<P: AsRef<Path>>(manifest_path: P) -> Result<Self, StoreError> {
        let manifest_path = manifest_path.as_ref();
        Ok(Self {
            base: manifest_path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            manifest: Manifest::load(manifest_path)?,
        })
    }

    fn raw(&self, dataset: &str) -> Result<(&DatasetInfo, Vec<u8>), StoreError> {
        let info = self
            .manifest
            .datasets
            .get(dataset)
            .ok_or_else(|| StoreError::UnknownDataset(dataset.to_string()))?;
        let path = self.base.join(&info.file);
        let mut bytes = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(io_error(&path))?;
        Ok((info, bytes))
    }

    fn frame_stack(&self, dataset: &str) -> Result<Array3<u16>, StoreError> {
        let (info, bytes) = self.raw(dataset)?;
        let values: Vec<u16> = match info.dtype {
            ElementType::U8 => bytes.iter().map(|&b| u16::from(b)).collect(),
            _ => {
                let mut values = vec![0u16; bytes.len() / 2];
                LittleEndian::read_u16_into(&bytes, &mut values);
                values
            }
        };
        to_stack(dataset, &info.shape, values)
    }

    pub fn frames(&self) -> Result<Array3<u16>, StoreError> {
        self.frame_stack(FRAMES)
    }

    pub fn crops(&self) -> Result<Array3<u16>, StoreError> {
        self.frame_stack(CROPS)
    }

    pub fn masks(&self) -> Result<Array3<f32>, StoreError> {
        let (info, bytes) = self.raw(MASKS)?;
        let mut values = vec![0f32; bytes.len() / 4];
        LittleEndian::read_f32_into(&bytes, &mut values);
        to_stack(MASKS, &info.shape, values)
    }

    pub fn scalar(&self, name: &str) -> Result<Vec<f32>, StoreError> {
        let (_, bytes) = self.raw(&scalar_dataset(name))?;
        let mut values = vec![0f32; bytes.len() / 4];
        LittleEndian::read_f32_into(&bytes, &mut values);
        Ok(values)
    }

    pub fn flips(&self) -> Result<Option<Vec<u8>>, StoreError> {
        if !self.manifest.datasets.contains_key(FLIPS) {
            return Ok(None);
        }
        Ok(Some(self.raw(FLIPS)?.1))
    }
}

fn to_stack<T>(dataset: &str, shape: &[usize], values: Vec<T>) -> Result<Array3<T>, StoreError> {
    let got = vec![values.len()];
    match shape {
        &[n, rows, cols] => Array3::from_shape_vec((n, rows, cols), values).map_err(|_| StoreError::ShapeMismatch {
            dataset: dataset.to_string(),
            expected: shape.to_vec(),
            got,
        }),
        _ => Err(StoreError::ShapeMismatch {
            dataset: dataset.to_string(),
            expected: shape.to_vec(),
            got,
        }),
    }
}

/// In-memory store with the same write-once semantics, for tests and embedding.
pub struct MemoryStore {
    pub layout: StoreLayout,
    pub frames: Array3<u16>,
    pub masks: Array3<f32>,
    pub crops: Array3<u16>,
    pub scalars: BTreeMap<&'static str, Vec<f32>>,
    pub flips: Vec<u8>,
    written: Vec<bool>,
    /// Number of times `close` was called.
    pub close_calls: usize,
}

impl MemoryStore {
    pub fn new(layout: StoreLayout) -> Self {
        let n = layout.total_frames;
        let (rows, cols) = layout.frame_shape;
        let (crop_rows, crop_cols) = layout.crop_shape;
        Self {
            layout,
            frames: Array3::zeros((n, rows, cols)),
            masks: Array3::zeros((n, rows, cols)),
            crops: Array3::zeros((n, crop_rows, crop_cols)),
            scalars: SCALAR_NAMES.iter().map(|&name| (name, vec![0.0; n])).collect(),
            flips: vec![0; n],
            written: vec![false; n],
            close_calls: 0,
        }
    }

    pub fn written_indices(&self) -> Vec<usize> {
        self.written
            .iter()
            .enumerate()
            .filter_map(|(i, &w)| w.then_some(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.written.iter().all(|&w| w)
    }
}

fn assign_frames<T: Copy>(target: &mut Array3<T>, start: usize, source: ArrayView3<T>, dataset: &str) -> Result<(), StoreError> {
    let n = source.shape()[0];
    let mut slot = target.slice_mut(s![start..start + n, .., ..]);
    check_shape(dataset, slot.shape(), source.shape())?;
    slot.assign(&source);
    Ok(())
}

impl ExtractionSink for MemoryStore {
    fn name(&self) -> &str {
        "memory store"
    }

    fn write_batch(&mut self, batch: &RetainedBatch<'_>) -> Result<(), SinkError> {
        check_batch(&self.layout, &self.written, batch)?;
        let start = batch.output_range.start;
        assign_frames(&mut self.frames, start, batch.frames, FRAMES)?;
        assign_frames(&mut self.masks, start, batch.masks, MASKS)?;
        assign_frames(&mut self.crops, start, batch.crops, CROPS)?;
        for (name, values) in &batch.scalars {
            if let Some(series) = self.scalars.get_mut(name) {
                series[start..start + values.len()].copy_from_slice(values);
            }
        }
        if let Some(flips) = batch.flips {
            for (slot, &f) in self.flips[start..].iter_mut().zip(flips) {
                *slot = u8::from(f);
            }
        }
        self.written[batch.output_range.clone()].fill(true);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.close_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::batch::FrameBatch;
    use ndarray::Array3;

    fn layout(total: usize) -> StoreLayout {
        StoreLayout {
            total_frames: total,
            frame_shape: (2, 3),
            crop_shape: (2, 2),
            frame_dtype: FrameDtype::U16,
            with_flips: true,
        }
    }

    struct Owned {
        batch: FrameBatch,
        frames: Array3<u16>,
        masks: Array3<f32>,
        crops: Array3<u16>,
        scalar: Vec<f32>,
        flips: Vec<bool>,
    }

    impl Owned {
        fn new(start: usize, n: usize) -> Self {
            Self {
                batch: FrameBatch { index: 0, start, end: start + n, offset: 0 },
                frames: Array3::from_shape_fn((n, 2, 3), |(f, y, x)| ((start + f) * 100 + y * 3 + x) as u16),
                masks: Array3::from_elem((n, 2, 3), -1.5),
                crops: Array3::from_elem((n, 2, 2), 9),
                scalar: (0..n).map(|i| (start + i) as f32).collect(),
                flips: (0..n).map(|i| (start + i) % 2 == 1).collect(),
            }
        }

        fn retained(&self) -> RetainedBatch<'_> {
            RetainedBatch {
                batch: &self.batch,
                output_range: self.batch.start..self.batch.end,
                recording_start: self.batch.start,
                frames: self.frames.view(),
                cleaned: self.frames.view(),
                masks: self.masks.view(),
                crops: self.crops.view(),
                scalars: vec![("centroid_x_px", self.scalar.as_slice())],
                flips: Some(&self.flips),
            }
        }
    }

    #[test]
    fn writes_out_of_order_batches_and_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::create(dir.path(), "session", layout(5), serde_json::json!({"fps": 30})).unwrap();

        let second = Owned::new(3, 2);
        let first = Owned::new(0, 3);
        store.write_batch(&second.retained()).unwrap();
        store.write_batch(&first.retained()).unwrap();
        store.close().unwrap();

        let stored = StoredRecording::open(dir.path().join("session.manifest.json")).unwrap();
        assert!(stored.manifest.complete);
        assert_eq!(stored.manifest.parameters["fps"], 30);
        let frames = stored.frames().unwrap();
        assert_eq!(frames.dim(), (5, 2, 3));
        assert_eq!(frames[[4, 1, 2]], 405);
        assert_eq!(stored.scalar("centroid_x_px").unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(stored.masks().unwrap()[[2, 0, 0]], -1.5);
        assert_eq!(stored.flips().unwrap().unwrap(), vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::create(dir.path(), "dup", layout(5), serde_json::Value::Null).unwrap();
        store.write_batch(&Owned::new(0, 3).retained()).unwrap();
        let err = store.write_batch(&Owned::new(2, 2).retained()).unwrap_err();
        assert!(matches!(err, SinkError::Store(StoreError::DuplicateIndex { index: 2 })));
    }

    #[test]
    fn rejected_batch_leaves_its_frames_unwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::create(dir.path(), "short", layout(3), serde_json::Value::Null).unwrap();
        let mut bad = Owned::new(0, 3);
        bad.scalar.pop();
        let err = store.write_batch(&bad.retained()).unwrap_err();
        assert!(matches!(err, SinkError::Store(StoreError::ShapeMismatch { .. })));
        assert_eq!(store.frames_written(), 0);

        store.write_batch(&Owned::new(0, 3).retained()).unwrap();
        store.close().unwrap();
        let manifest = Manifest::load(store.manifest_path()).unwrap();
        assert_eq!(manifest.frames_written, 3);
        assert!(manifest.complete);
    }

    #[test]
    fn memory_store_keeps_frames_of_a_rejected_duplicate() {
        let mut store = MemoryStore::new(layout(5));
        store.write_batch(&Owned::new(0, 3).retained()).unwrap();
        let mut overlapping = Owned::new(2, 2);
        overlapping.frames.fill(7);
        assert!(store.write_batch(&overlapping.retained()).is_err());
        assert_eq!(store.frames[[2, 0, 0]], 200);
        assert_eq!(store.written_indices(), vec![0, 1, 2]);
    }

    #[test]
    fn dropped_store_leaves_incomplete_manifest() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FrameStore::create(dir.path(), "partial", layout(4), serde_json::Value::Null).unwrap();
            store.write_batch(&Owned::new(0, 2).retained()).unwrap();
        }
        let manifest = Manifest::load(dir.path().join("partial.manifest.json")).unwrap();
        assert!(!manifest.complete);
        assert_eq!(manifest.frames_written, 2);
    }

    #[test]
    fn u8_frames_take_one_byte() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout {
            frame_dtype: FrameDtype::U8,
            with_flips: false,
            ..layout(1)
        };
        let mut store = FrameStore::create(dir.path(), "small", layout, serde_json::Value::Null).unwrap();
        store.close().unwrap();
        let manifest = Manifest::load(store.manifest_path()).unwrap();
        let frames = &manifest.datasets[FRAMES];
        assert_eq!(frames.dtype, ElementType::U8);
        let len = fs::metadata(dir.path().join(&frames.file)).unwrap().len();
        assert_eq!(len, 6);
        assert!(!manifest.datasets.contains_key(FLIPS));
    }

    #[test]
    fn memory_store_rejects_overlap() {
        let mut store = MemoryStore::new(layout(5));
        store.write_batch(&Owned::new(0, 3).retained()).unwrap();
        assert!(store.write_batch(&Owned::new(1, 1).retained()).is_err());
        store.write_batch(&Owned::new(3, 2).retained()).unwrap();
        assert!(store.is_complete());
        assert_eq!(store.scalars["centroid_x_px"][4], 4.0);
    }
}
