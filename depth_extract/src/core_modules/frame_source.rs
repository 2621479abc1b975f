// THEORY:
// The `frame_source` module is the bottom of the extraction stack: it turns a
// recording on disk into stacks of depth frames addressed by index. Raw depth
// recordings are headerless little-endian `u16` grids written back to back, so
// any frame can be reached with one seek.
//
// Recordings shipped inside a tar archive are read in place. The member's data
// offset inside the archive is located once when the source is opened, after
// which the member is exactly as seekable as a plain file.

use byteorder::{ByteOrder, LittleEndian};
use ndarray::{Array3, Axis};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BYTES_PER_DEPTH_VALUE: usize = 2;

/// Anything that can hand out depth frames by index.
pub trait FrameSource: Send {
    /// Total number of frames in the recording.
    fn frame_count(&self) -> usize;
    /// Frame shape as (rows, cols).
    fn frame_shape(&self) -> (usize, usize);
    /// Reads the given frames, in order, into a `(n, rows, cols)` stack.
    fn read(&mut self, indices: &[usize]) -> Result<Array3<u16>, SourceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("could not open recording {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading frames from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive {archive} has no member named {member}")]
    MemberNotFound { archive: PathBuf, member: String },
    #[error("frame {index} is outside the recording ({count} frames)")]
    OutOfRange { index: usize, count: usize },
    #[error("frame size must be non-zero")]
    InvalidFrameSize,
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// A raw depth stream backed by a file, either standalone or a tar member.
pub struct RawDepthFile {
    path: PathBuf,
    file: File,
    /// Byte position of frame 0 within `file`.
    data_offset: u64,
    frame_count: usize,
    rows: usize,
    cols: usize,
}

impl RawDepthFile {
    /// Opens `path`, treating `.tar` files as archives holding `member`.
    pub fn open_recording(path: &Path, member: &str, frame_size: [usize; 2]) -> Result<Self, SourceError> {
        if path.extension() == Some(OsStr::new("tar")) {
            Self::open_archive_member(path, member, frame_size)
        } else {
            Self::open(path, frame_size)
        }
    }

    /// Opens a standalone raw depth file. `frame_size` is (width, height).
    pub fn open(path: &Path, frame_size: [usize; 2]) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let length = file
            .metadata()
            .map_err(|source| SourceError::Open {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        Self::from_parts(path, file, 0, length, frame_size)
    }

    /// Opens the depth stream stored as `member` inside an uncompressed tar archive.
    /// A member matches on its full path or on its file name.
    pub fn open_archive_member(path: &Path, member: &str, frame_size: [usize; 2]) -> Result<Self, SourceError> {
        let open_error = |source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(open_error)?;
        let mut archive = tar::Archive::new(file);
        let mut located = None;
        for entry in archive.entries_with_seek().map_err(open_error)? {
            let entry = entry.map_err(open_error)?;
            let entry_path = entry.path().map_err(open_error)?;
            if entry_path == Path::new(member) || entry_path.file_name() == Some(OsStr::new(member)) {
                located = Some((entry.raw_file_position(), entry.size()));
                break;
            }
        }

        let (data_offset, length) = located.ok_or_else(|| SourceError::MemberNotFound {
            archive: path.to_path_buf(),
            member: member.to_string(),
        })?;
        debug!(archive = %path.display(), member, data_offset, length, "located depth stream in archive");

        let file = File::open(path).map_err(open_error)?;
        Self::from_parts(path, file, data_offset, length, frame_size)
    }

    fn from_parts(
        path: &Path,
        file: File,
        data_offset: u64,
        length: u64,
        frame_size: [usize; 2],
    ) -> Result<Self, SourceError> {
        let [cols, rows] = frame_size;
        if rows == 0 || cols == 0 {
            return Err(SourceError::InvalidFrameSize);
        }
        let frame_bytes = (rows * cols * BYTES_PER_DEPTH_VALUE) as u64;
        if length % frame_bytes != 0 {
            warn!(
                recording = %path.display(),
                trailing_bytes = length % frame_bytes,
                "recording length is not a whole number of frames; ignoring the tail"
            );
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            data_offset,
            frame_count: (length / frame_bytes) as usize,
            rows,
            cols,
        })
    }

    fn frame_bytes(&self) -> usize {
        self.rows * self.cols * BYTES_PER_DEPTH_VALUE
    }
}

impl FrameSource for RawDepthFile {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn frame_shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn read(&mut self, indices: &[usize]) -> Result<Array3<u16>, SourceError> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.frame_count) {
            return Err(SourceError::OutOfRange {
                index,
                count: self.frame_count,
            });
        }

        let frame_bytes = self.frame_bytes();
        let frame_len = self.rows * self.cols;
        let mut values = vec![0u16; indices.len() * frame_len];
        let mut buffer = Vec::new();

        // One seek per run of consecutive indices.
        let mut cursor = 0;
        while cursor < indices.len() {
            let mut run = 1;
            while cursor + run < indices.len() && indices[cursor + run] == indices[cursor] + run {
                run += 1;
            }

            buffer.resize(run * frame_bytes, 0);
            let position = self.data_offset + (indices[cursor] * frame_bytes) as u64;
            self.file
                .seek(SeekFrom::Start(position))
                .and_then(|_| self.file.read_exact(&mut buffer))
                .map_err(|source| SourceError::Read {
                    path: self.path.clone(),
                    source,
                })?;
            LittleEndian::read_u16_into(&buffer, &mut values[cursor * frame_len..(cursor + run) * frame_len]);
            cursor += run;
        }

        Ok(Array3::from_shape_vec((indices.len(), self.rows, self.cols), values)?)
    }
}

/// A recording held in memory.
pub struct InMemoryRecording {
    frames: Array3<u16>,
}

impl InMemoryRecording {
    pub fn new(frames: Array3<u16>) -> Self {
        Self { frames }
    }
}

impl FrameSource for InMemoryRecording {
    fn frame_count(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    fn frame_shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.frames.dim();
        (rows, cols)
    }

    fn read(&mut self, indices: &[usize]) -> Result<Array3<u16>, SourceError> {
        let count = self.frame_count();
        if let Some(&index) = indices.iter().find(|&&i| i >= count) {
            return Err(SourceError::OutOfRange { index, count });
        }
        Ok(self.frames.select(Axis(0), indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    fn write_recording(path: &Path, frames: usize, rows: usize, cols: usize) {
        let mut file = File::create(path).unwrap();
        for f in 0..frames {
            for p in 0..rows * cols {
                file.write_u16::<LittleEndian>((f * 100 + p) as u16).unwrap();
            }
        }
    }

    #[test]
    fn reads_scattered_frames_from_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.dat");
        write_recording(&path, 6, 2, 3);

        let mut source = RawDepthFile::open(&path, [3, 2]).unwrap();
        assert_eq!(source.frame_count(), 6);
        assert_eq!(source.frame_shape(), (2, 3));

        let stack = source.read(&[1, 2, 5]).unwrap();
        assert_eq!(stack.dim(), (3, 2, 3));
        assert_eq!(stack[[0, 0, 0]], 100);
        assert_eq!(stack[[1, 1, 2]], 205);
        assert_eq!(stack[[2, 0, 1]], 501);
    }

    #[test]
    fn rejects_indices_past_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.dat");
        write_recording(&path, 2, 2, 2);

        let mut source = RawDepthFile::open(&path, [2, 2]).unwrap();
        assert!(matches!(
            source.read(&[0, 2]),
            Err(SourceError::OutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn ignores_partial_trailing_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.dat");
        write_recording(&path, 3, 2, 2);
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        let source = RawDepthFile::open(&path, [2, 2]).unwrap();
        assert_eq!(source.frame_count(), 3);
    }

    #[test]
    fn reads_member_inside_tar_archive() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("depth.dat");
        write_recording(&raw, 4, 2, 2);

        let archive_path = dir.path().join("session.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive_path).unwrap());
            builder
                .append_path_with_name(&raw, "session/metadata.json")
                .unwrap();
            builder.append_path_with_name(&raw, "session/depth.dat").unwrap();
            builder.finish().unwrap();
        }

        let mut source = RawDepthFile::open_recording(&archive_path, "depth.dat", [2, 2]).unwrap();
        assert_eq!(source.frame_count(), 4);
        let stack = source.read(&[3]).unwrap();
        assert_eq!(stack[[0, 1, 1]], 303);
    }

    #[test]
    fn missing_archive_member_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("other.bin");
        write_recording(&raw, 1, 2, 2);
        let archive_path = dir.path().join("session.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive_path).unwrap());
            builder.append_path_with_name(&raw, "other.bin").unwrap();
            builder.finish().unwrap();
        }

        assert!(matches!(
            RawDepthFile::open_recording(&archive_path, "depth.dat", [2, 2]),
            Err(SourceError::MemberNotFound { .. })
        ));
    }

    #[test]
    fn in_memory_recording_selects_frames() {
        let frames = Array3::from_shape_fn((4, 2, 2), |(f, _, _)| f as u16);
        let mut source = InMemoryRecording::new(frames);
        let stack = source.read(&[3, 0]).unwrap();
        assert_eq!(stack[[0, 0, 0]], 3);
        assert_eq!(stack[[1, 1, 1]], 0);
    }
}
