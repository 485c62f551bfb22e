// THEORY:
// A `Session` is one pass over a stream of frames: read, process, write, repeat,
// until the stream ends or someone asks to stop. It is the library half of the
// session driver; the binary supplies the concrete source and sink (video file,
// preview window, encoder), the session supplies the loop and its rules:
//
// - End of stream (`Ok(None)`) ends the session normally. A read that fails
//   mid-stream is treated the same way and logged.
// - Every frame must have the size of the first one.
// - Cancellation is cooperative and checked only between frames, so a frame is
//   always either fully processed and written or not touched at all. Frames
//   read ahead by a parallel session are dropped unapplied on a stop.
// - A frame whose detection fails is skipped and the session goes on.
// - The per-frame diagnostic dump is optional and written as JSON lines.

use crate::core_modules::trajectory::TrajectoryStore;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::{Error, Result};
use crate::parallel_pipeline::ParallelPipeline;
use crate::pipeline::TrackingPipeline;
use image::RgbImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Level, debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

/// Produces frames in presentation order.
pub trait FrameSource {
    /// `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Consumes annotated frames.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Polled once after every written frame.
    fn stop_requested(&mut self) -> bool {
        false
    }
}

/// What a finished session hands back.
#[derive(Debug)]
pub struct SessionSummary {
    /// Frames processed, skipped ones included.
    pub frames: u64,
    /// Frames lost to a failed detection. They were not written.
    pub skipped: u64,
    pub frame_size: Option<(u32, u32)>,
    pub stopped_early: bool,
    pub collisions: u64,
    pub circles: TrajectoryStore,
    pub rectangles: TrajectoryStore,
}

impl SessionSummary {
    pub fn stores(&self) -> [&TrajectoryStore; 2] {
        [&self.circles, &self.rectangles]
    }
}

pub struct Session {
    dump: Option<Box<dyn Write + Send>>,
    stop: Arc<AtomicBool>,
    frame_size: Option<(u32, u32)>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            dump: None,
            stop: Arc::new(AtomicBool::new(false)),
            frame_size: None,
        }
    }

    /// Writes `{"frame": n, "circles": {...}, "rectangles": {...}}` per frame, one per line.
    pub fn with_dump(mut self, writer: impl Write + Send + 'static) -> Self {
        self.dump = Some(Box::new(writer));
        self
    }

    /// Setting the flag stops the session at the next frame boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn run(
        mut self,
        mut pipeline: TrackingPipeline,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
    ) -> Result<SessionSummary> {
        info!("session started");
        let mut stopped_early = false;

        while let Some(mut frame) = self.read(source)? {
            pipeline.process_frame(&mut frame);
            sink.write_frame(&frame)?;
            if self.wants_dump() {
                self.emit_dump(pipeline.diagnostic_dump())?;
            }

            if self.should_stop(sink) {
                stopped_early = true;
                break;
            }
        }

        let frames = pipeline.frames_processed();
        let collisions = pipeline.total_collisions();
        let (circles, rectangles) = pipeline.into_stores();
        self.finish(frames, 0, stopped_early, collisions, circles, rectangles)
    }

    /// Like [`Session::run`], reading up to one frame per worker ahead and
    /// writing results back in frame order.
    pub async fn run_parallel(
        mut self,
        pipeline: ParallelPipeline,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
    ) -> Result<SessionSummary> {
        info!(workers = pipeline.workers(), "parallel session started");
        let batch_size = pipeline.workers();
        pipeline.capture_dumps(self.wants_dump())?;
        let mut stopped_early = false;
        let mut frames = 0u64;
        let mut skipped = 0u64;
        let mut collisions = 0u64;

        'stream: loop {
            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                match self.read(source)? {
                    Some(frame) => batch.push(pipeline.process_frame(frame)),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            let at_end = batch.len() < batch_size;

            // Awaited in frame order. On a stop, the rest of the batch is
            // dropped and never reaches the stores.
            for pending in batch {
                let processed = match pending.await {
                    Ok(processed) => processed,
                    Err(e @ Error::Worker(_)) => {
                        warn!(frame = frames, error = %e, "frame lost, continuing");
                        frames += 1;
                        skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                sink.write_frame(&processed.frame)?;
                frames += 1;
                collisions += processed.report.collisions() as u64;
                if let Some(dump) = processed.dump {
                    self.emit_dump(dump)?;
                }

                if self.should_stop(sink) {
                    stopped_early = true;
                    break 'stream;
                }
            }
            if at_end {
                break;
            }
        }

        let (circles, rectangles) = pipeline.finish().await?;
        self.finish(frames, skipped, stopped_early, collisions, circles, rectangles)
    }

    /// Reads the next frame, enforcing the session frame size.
    fn read(&mut self, source: &mut dyn FrameSource) -> Result<Option<RgbImage>> {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "frame read failed, treating as end of stream");
                return Ok(None);
            }
        };

        let actual = frame.dimensions();
        match self.frame_size {
            None => {
                info!(width = actual.0, height = actual.1, "frame size locked");
                self.frame_size = Some(actual);
            }
            Some(expected) if expected != actual => return Err(Error::FrameSize { expected, actual }),
            Some(_) => {}
        }
        Ok(Some(frame))
    }

    fn should_stop(&self, sink: &mut dyn FrameSink) -> bool {
        self.stop.load(Ordering::SeqCst) || sink.stop_requested()
    }

    fn wants_dump(&self) -> bool {
        self.dump.is_some() || tracing::enabled!(Level::DEBUG)
    }

    fn emit_dump(&mut self, dump: serde_json::Value) -> Result<()> {
        debug!(%dump, "trajectories");
        if let Some(writer) = self.dump.as_mut() {
            serde_json::to_writer(&mut *writer, &dump)?;
            writeln!(writer)?;
        }
        Ok(())
    }

    fn finish(
        mut self,
        frames: u64,
        skipped: u64,
        stopped_early: bool,
        collisions: u64,
        circles: TrajectoryStore,
        rectangles: TrajectoryStore,
    ) -> Result<SessionSummary> {
        if let Some(writer) = self.dump.as_mut() {
            writer.flush()?;
        }
        if collisions > 0 {
            warn!(collisions, "detections shared a key within a frame and were merged");
        }
        info!(
            frames,
            skipped,
            stopped_early,
            circle_identities = circles.len(),
            rectangle_identities = rectangles.len(),
            "session finished"
        );
        Ok(SessionSummary {
            frames,
            skipped,
            frame_size: self.frame_size,
            stopped_early,
            collisions,
            circles,
            rectangles,
        })
    }
}

/// Still images from a directory, in file-name order.
pub struct ImageSequenceSource {
    paths: std::vec::IntoIter<PathBuf>,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::SourceUnavailable(format!("{}: {e}", dir.display())))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if path.is_file() && is_image {
                paths.push(path);
            }
        }
        paths.sort();
        debug!(dir = %dir.display(), frames = paths.len(), "image sequence opened");
        Ok(Self {
            paths: paths.into_iter(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        match self.paths.next() {
            Some(path) => image_helper::load(&path).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes frames as `frame_000000.png`, `frame_000001.png`, ...
pub struct ImageSequenceSink {
    dir: PathBuf,
    written: u64,
}

impl ImageSequenceSink {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for ImageSequenceSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let path = self.dir.join(format!("frame_{:06}.png", self.written));
        image_helper::save(&path, frame)?;
        self.written += 1;
        Ok(())
    }
}
