use anyhow::{Context, Result};
use clap::Parser;
use image::RgbImage;
use opencv::{
    core::{self, Mat, Scalar},
    highgui, imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use shape_vision::core_modules::annotator::{Annotator, load_font};
use shape_vision::core_modules::plot::PathPlot;
use shape_vision::parallel_pipeline::ParallelPipeline;
use shape_vision::pipeline::{PipelineConfig, TrackingPipeline};
use shape_vision::session::{FrameSink, FrameSource, Session, SessionSummary};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const WINDOW_NAME: &str = "Frame";
const ESC_KEY: i32 = 27;

/// Detects circles and rectangles in a video, tracks them by color and writes
/// the annotated video plus a plot of every path.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input video file
    video_path: PathBuf,

    /// Annotated output video (XVID)
    #[arg(short, long, default_value = "output.avi")]
    output: PathBuf,

    /// Frame rate of the output video
    #[arg(long, default_value_t = 20.0)]
    fps: f64,

    /// JSON pipeline config; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TrueType font for labels; without one, labels are not drawn
    #[arg(long)]
    font: Option<PathBuf>,

    /// Where to save the plot of all paths at the end
    #[arg(long, default_value = "paths.png")]
    plot: PathBuf,

    /// Write the per-frame trajectory dump here as JSON lines
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Do not open a preview window
    #[arg(long)]
    headless: bool,

    /// Run detection on this many workers (0 = one per CPU)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("visual_tester=info,shape_vision=info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    // --- 1. Configuration ---
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(font) = &args.font {
        config.render.font_path = Some(font.clone());
    }
    let font = match &config.render.font_path {
        Some(path) => Some(load_font(path).with_context(|| format!("loading font {}", path.display()))?),
        None => None,
    };

    // --- 2. Video I/O Initialization ---
    let mut source = VideoSource::open(&args.video_path)?;
    let (width, height) = (source.width, source.height);
    let mut sink = VideoSink::create(&args.output, args.fps, width, height, !args.headless)?;
    info!(
        input = %args.video_path.display(),
        output = %args.output.display(),
        width,
        height,
        fps = args.fps,
        "video opened"
    );

    // --- 3. Session Setup ---
    let mut session = Session::new();
    if let Some(path) = &args.dump {
        let file = File::create(path).with_context(|| format!("creating dump file {}", path.display()))?;
        session = session.with_dump(BufWriter::new(file));
    }
    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current frame");
            stop.store(true, Ordering::SeqCst);
        }
    });

    // --- 4. Main Processing Loop ---
    let annotator = Annotator::with_font(config.render.clone(), font.clone());
    let summary: SessionSummary = match args.workers {
        Some(workers) => {
            let workers = (workers > 0).then_some(workers);
            let pipeline = ParallelPipeline::with_annotator(config.clone(), annotator, workers)?;
            session.run_parallel(pipeline, &mut source, &mut sink).await?
        }
        None => {
            let pipeline = TrackingPipeline::with_annotator(config.clone(), annotator)?;
            session.run(pipeline, &mut source, &mut sink)?
        }
    };
    sink.close()?;

    // --- 5. Path Plot ---
    let (plot_width, plot_height) = summary.frame_size.unwrap_or((width, height));
    PathPlot::new(config.plot.clone())
        .with_font(font)
        .with_frame_size(plot_width, plot_height)
        .save(&args.plot, &summary.stores())
        .with_context(|| format!("saving plot {}", args.plot.display()))?;

    info!(
        frames = summary.frames,
        skipped = summary.skipped,
        circles = summary.circles.len(),
        rectangles = summary.rectangles.len(),
        output = %args.output.display(),
        plot = %args.plot.display(),
        "processing complete"
    );
    Ok(())
}

fn cv_error(e: impl std::fmt::Display) -> shape_vision::Error {
    shape_vision::Error::Io(std::io::Error::other(e.to_string()))
}

/// Decodes a video file into RGB frames.
struct VideoSource {
    cap: VideoCapture,
    width: u32,
    height: u32,
}

impl VideoSource {
    fn open(path: &Path) -> Result<Self> {
        let name = path.to_str().context("video path is not valid UTF-8")?;
        let cap = VideoCapture::from_file(name, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            return Err(shape_vision::Error::SourceUnavailable(path.display().to_string()).into());
        }
        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        Ok(Self { cap, width, height })
    }
}

impl FrameSource for VideoSource {
    fn next_frame(&mut self) -> shape_vision::Result<Option<RgbImage>> {
        let mut bgr = Mat::default();
        if !self.cap.read(&mut bgr).map_err(cv_error)? || bgr.empty() {
            return Ok(None);
        }

        // Convert the OpenCV Mat (BGR) to an RGB buffer for the pipeline.
        let mut rgb = Mat::default();
        imgproc::cvt_color(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(cv_error)?;
        let data = rgb.data_bytes().map_err(cv_error)?.to_vec();
        let frame = RgbImage::from_raw(rgb.cols() as u32, rgb.rows() as u32, data)
            .ok_or_else(|| cv_error("decoded frame has an unexpected buffer size"))?;
        Ok(Some(frame))
    }
}

/// Encodes annotated frames and optionally shows them in a window.
struct VideoSink {
    writer: VideoWriter,
    preview: bool,
    esc_pressed: bool,
}

impl VideoSink {
    fn create(path: &Path, fps: f64, width: u32, height: u32, preview: bool) -> Result<Self> {
        let name = path.to_str().context("output path is not valid UTF-8")?;
        let fourcc = VideoWriter::fourcc('X', 'V', 'I', 'D')?;
        let writer = VideoWriter::new(name, fourcc, fps, core::Size::new(width as i32, height as i32), true)?;
        if !writer.is_opened()? {
            anyhow::bail!("cannot open video writer for {}", path.display());
        }
        Ok(Self {
            writer,
            preview,
            esc_pressed: false,
        })
    }

    fn close(mut self) -> Result<()> {
        self.writer.release()?;
        if self.preview {
            highgui::destroy_all_windows()?;
        }
        Ok(())
    }
}

impl FrameSink for VideoSink {
    fn write_frame(&mut self, frame: &RgbImage) -> shape_vision::Result<()> {
        let mut rgb = Mat::new_rows_cols_with_default(
            frame.height() as i32,
            frame.width() as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )
        .map_err(cv_error)?;
        rgb.data_bytes_mut().map_err(cv_error)?.copy_from_slice(frame.as_raw());
        let mut bgr = Mat::default();
        imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0).map_err(cv_error)?;

        self.writer.write(&bgr).map_err(cv_error)?;
        if self.preview {
            highgui::imshow(WINDOW_NAME, &bgr).map_err(cv_error)?;
            let key = highgui::wait_key(30).map_err(cv_error)?;
            self.esc_pressed = key & 0xff == ESC_KEY;
        }
        Ok(())
    }

    fn stop_requested(&mut self) -> bool {
        self.esc_pressed
    }
}
