// THEORY:
// The preview is a side-by-side video of every extracted frame:
// `[original | cleaned | aligned crop]`, depth colour-mapped from blue (low)
// through yellow to red (high), with the absolute recording frame index drawn
// in the top-left corner. Frames are streamed as raw `rgb24` into an
// external encoder process (ffmpeg by default) over its stdin.
//
// Key architectural principles:
// 1.  **Lazy Spawn**: The encoder starts on the first frame, when the canvas size
//     is known, and is reused for every later batch.
// 2.  **Owned Pipe**: A writer thread owns the encoder's stdin. Submitting a frame
//     only blocks when the bounded queue in front of that thread is full.
// 3.  **Always Reaped**: `close` drains the queue, closes stdin and waits for the
//     process. Dropping an unclosed encoder closes stdin, gives the process a
//     short grace period and then kills and reaps it.

use super::{ExtractionSink, RetainedBatch, SinkError};
use crate::config::EncoderConfig;
use image::{Rgb, RgbImage};
use ndarray::{ArrayView2, Axis};
use opencv::core::{self, Mat, Point, Scalar};
use opencv::imgproc;
use opencv::prelude::*;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const STDERR_TAIL_LINES: usize = 20;
const DROP_GRACE: Duration = Duration::from_secs(2);
const DROP_POLL: Duration = Duration::from_millis(20);
const LABEL_ORIGIN: (i32, i32) = (4, 14);
const LABEL_SCALE: f64 = 0.4;

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("could not start encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder pipe failed: {0}")]
    Pipe(#[source] std::io::Error),
    #[error("frame {got} submitted after frame {previous}")]
    OutOfOrder { previous: usize, got: usize },
    #[error("frame is {got:?} but the encoder was started at {expected:?}")]
    FrameSize { expected: (u32, u32), got: (u32, u32) },
    #[error("encoder exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },
    #[error("could not label preview frame: {0}")]
    Label(#[source] opencv::Error),
    #[error("encoder writer thread panicked")]
    WriterPanicked,
    #[error("encoder is already closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSettings {
    pub encoder: EncoderConfig,
    pub fps: f64,
    /// Depths mapped to the two ends of the colormap.
    pub depth_range: (f32, f32),
}

impl PreviewSettings {
    /// Encoder arguments for a `width` x `height` canvas writing to `output`.
    pub fn command_args(&self, width: u32, height: u32, output: &Path) -> Vec<String> {
        let output = output.display().to_string();
        if let Some(custom) = &self.encoder.args {
            return custom
                .iter()
                .map(|arg| {
                    arg.replace("{width}", &width.to_string())
                        .replace("{height}", &height.to_string())
                        .replace("{fps}", &self.fps.to_string())
                        .replace("{output}", &output)
                })
                .collect();
        }
        [
            "-y",
            "-loglevel",
            "error",
            "-threads",
            &self.encoder.threads.to_string(),
            "-framerate",
            &self.fps.to_string(),
            "-f",
            "rawvideo",
            "-s",
            &format!("{width}x{height}"),
            "-pix_fmt",
            "rgb24",
            "-i",
            "-",
            "-an",
            "-vcodec",
            &self.encoder.codec,
            "-pix_fmt",
            &self.encoder.pixel_format,
            "-vf",
            "pad=ceil(iw/2)*2:ceil(ih/2)*2",
            &output,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

// --- Colour mapping ---

/// Blue to yellow over the lower half of the range, yellow to red over the upper.
/// Depths at or below the lower bound are black.
pub fn heat_color(value: f32, (low, high): (f32, f32)) -> Rgb<u8> {
    if !(value > low) {
        return Rgb([0, 0, 0]);
    }
    let score = ((value - low) / (high - low).max(f32::EPSILON)).clamp(0.0, 1.0);
    let (r, g, b) = if score <= 0.5 {
        let ratio = score / 0.5;
        (0.0, 255.0 * ratio, 255.0 * (1.0 - ratio))
    } else {
        let ratio = (score - 0.5) / 0.5;
        (255.0 * ratio, 255.0 * (1.0 - ratio), 0.0)
    };
    Rgb([r as u8, g as u8, b as u8])
}

fn paint(canvas: &mut RgbImage, panel: ArrayView2<u16>, x0: u32, depth_range: (f32, f32)) {
    for ((y, x), &v) in panel.indexed_iter() {
        canvas.put_pixel(x0 + x as u32, y as u32, heat_color(f32::from(v), depth_range));
    }
}

/// Builds one preview frame: `[original | cleaned | crop]`.
pub fn compose_preview(
    original: ArrayView2<u16>,
    cleaned: ArrayView2<u16>,
    crop: ArrayView2<u16>,
    depth_range: (f32, f32),
) -> RgbImage {
    let (rows, cols) = original.dim();
    let (crop_rows, crop_cols) = crop.dim();
    let width = (2 * cols + crop_cols) as u32;
    let height = rows.max(crop_rows) as u32;
    let mut canvas = RgbImage::new(width, height);
    paint(&mut canvas, original, 0, depth_range);
    paint(&mut canvas, cleaned, cols as u32, depth_range);
    paint(&mut canvas, crop, (2 * cols) as u32, depth_range);
    canvas
}

/// Draws the absolute frame index into the top-left corner of a preview frame.
pub fn label_frame(canvas: &mut RgbImage, index: usize) -> opencv::Result<()> {
    let (width, height) = canvas.dimensions();
    let mut mat = Mat::new_rows_cols_with_default(height as i32, width as i32, core::CV_8UC3, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(canvas.as_raw());
    imgproc::put_text(
        &mut mat,
        &index.to_string(),
        Point::new(LABEL_ORIGIN.0, LABEL_ORIGIN.1),
        imgproc::FONT_HERSHEY_SIMPLEX,
        LABEL_SCALE,
        Scalar::all(255.0),
        1,
        imgproc::LINE_8,
        false,
    )?;
    canvas.copy_from_slice(mat.data_bytes()?);
    Ok(())
}

// --- Encoder process ---

struct RunningEncoder {
    child: Child,
    size: (u32, u32),
    frames: Option<SyncSender<Vec<u8>>>,
    writer: Option<JoinHandle<std::io::Result<()>>>,
    stderr_drain: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

fn write_frames(mut stdin: ChildStdin, frames: Receiver<Vec<u8>>) -> std::io::Result<()> {
    while let Ok(frame) = frames.recv() {
        stdin.write_all(&frame)?;
    }
    stdin.flush()
    // stdin drops here, which signals end of input to the encoder.
}

fn drain_stderr(stderr: impl std::io::Read, tail: Arc<Mutex<VecDeque<String>>>) {
    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        warn!(target: "encoder", "{line}");
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

impl RunningEncoder {
    fn spawn(settings: &PreviewSettings, output: &Path, size: (u32, u32)) -> Result<Self, EncoderError> {
        let program = &settings.encoder.program;
        let mut child = Command::new(program)
            .args(settings.command_args(size.0, size.1, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: program.clone(),
                source,
            })?;
        debug!(program = %program, width = size.0, height = size.1, "spawned preview encoder");

        let (frames, queue) = mpsc::sync_channel(settings.encoder.queue_depth.max(1));
        let writer = child.stdin.take().map(|stdin| thread::spawn(move || write_frames(stdin, queue)));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_drain = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            thread::spawn(move || drain_stderr(stderr, tail))
        });

        Ok(Self {
            child,
            size,
            frames: Some(frames),
            writer,
            stderr_drain,
            stderr_tail,
        })
    }

    /// Joins the writer; `Ok` when it wrote everything it received.
    fn join_writer(&mut self) -> Result<(), EncoderError> {
        match self.writer.take().map(JoinHandle::join) {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(EncoderError::Pipe(e)),
            Some(Err(_)) => Err(EncoderError::WriterPanicked),
        }
    }

    fn stderr_tail(&mut self) -> String {
        if let Some(drain) = self.stderr_drain.take() {
            let _ = drain.join();
        }
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    fn submit(&mut self, frame: Vec<u8>) -> Result<(), EncoderError> {
        let sender = self.frames.as_ref().ok_or(EncoderError::Closed)?;
        if sender.send(frame).is_ok() {
            return Ok(());
        }
        // The writer hung up, so the pipe is broken. Surface its error.
        self.frames = None;
        self.join_writer()?;
        Err(EncoderError::Pipe(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn finish(&mut self) -> Result<(), EncoderError> {
        self.frames = None;
        let written = self.join_writer();
        let status = self.child.wait().map_err(EncoderError::Pipe)?;
        let stderr = self.stderr_tail();
        if !status.success() {
            return Err(EncoderError::Exit { status, stderr });
        }
        written
    }

    fn abandon(&mut self) {
        self.frames = None;
        let deadline = Instant::now() + DROP_GRACE;
        let exited = loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break true,
                Ok(None) if Instant::now() < deadline => thread::sleep(DROP_POLL),
                _ => break false,
            }
        };
        if !exited {
            warn!("preview encoder did not exit after stdin closed; killing it");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        let _ = self.join_writer();
        // Grandchildren may still hold stderr open; leave the drain detached.
        self.stderr_drain = None;
    }
}

/// Streams preview frames into an encoder subprocess.
pub struct PreviewEncoder {
    output: PathBuf,
    settings: PreviewSettings,
    running: Option<RunningEncoder>,
    last_index: Option<usize>,
    closed: bool,
}

impl PreviewEncoder {
    pub fn new<P: Into<PathBuf>>(output: P, settings: PreviewSettings) -> Self {
        Self {
            output: output.into(),
            settings,
            running: None,
            last_index: None,
            closed: false,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Queues one frame. Frame indices must strictly increase.
    pub fn write_frame(&mut self, index: usize, frame: RgbImage) -> Result<(), EncoderError> {
        if self.closed {
            return Err(EncoderError::Closed);
        }
        if let Some(previous) = self.last_index {
            if index <= previous {
                return Err(EncoderError::OutOfOrder { previous, got: index });
            }
        }
        let size = frame.dimensions();
        if self.running.is_none() {
            self.running = Some(RunningEncoder::spawn(&self.settings, &self.output, size)?);
        }
        let running = self.running.as_mut().ok_or(EncoderError::Closed)?;
        if running.size != size {
            return Err(EncoderError::FrameSize {
                expected: running.size,
                got: size,
            });
        }
        running.submit(frame.into_raw())?;
        self.last_index = Some(index);
        Ok(())
    }

    /// Waits for the encoder to finish. Closing an encoder that never received
    /// a frame is a no-op.
    pub fn finish(&mut self) -> Result<(), EncoderError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.running.take() {
            Some(mut running) => {
                let result = running.finish();
                if result.is_ok() {
                    debug!(output = %self.output.display(), "preview encoder finished");
                }
                result
            }
            None => Ok(()),
        }
    }
}

impl ExtractionSink for PreviewEncoder {
    fn name(&self) -> &str {
        "preview encoder"
    }

    fn write_batch(&mut self, batch: &RetainedBatch<'_>) -> Result<(), SinkError> {
        let panels = batch
            .frames
            .axis_iter(Axis(0))
            .zip(batch.cleaned.axis_iter(Axis(0)))
            .zip(batch.crops.axis_iter(Axis(0)));
        for (i, ((original, cleaned), crop)) in panels.enumerate() {
            let index = batch.recording_start + i;
            let mut frame = compose_preview(original, cleaned, crop, self.settings.depth_range);
            label_frame(&mut frame, index).map_err(EncoderError::Label)?;
            self.write_frame(index, frame)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(self.finish()?)
    }
}

impl Drop for PreviewEncoder {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.abandon();
        }
    }
}
