// THEORY:
// The `parallel_pipeline` splits the per-frame work along its one natural seam.
// Detection is stateless and expensive, so it runs on a pool of workers, many
// frames at a time. Tracking and annotation are stateful and cheap, so they run
// one frame at a time, strictly in frame order.
//
// Flow for one frame:
// 1.  `process_frame` stamps the frame with the next frame id, hands it to the
//     dispatcher (which deals frames to workers round-robin) and takes the
//     "turn" of the previous frame.
// 2.  A worker runs both detectors on the pristine frame (on the blocking pool)
//     and sends the detections back to the frame's future.
// 3.  The future waits until the previous frame has been applied, then updates
//     the stores and annotates the frame under one lock, and passes the turn on.
//
// Applying happens inside the frame's own future, so a frame is only applied
// while somebody is waiting for it. Dropping a future cancels that frame and
// every frame submitted after it; nothing past the cancelled frame ever reaches
// the stores. A frame whose detection failed still takes its turn: it is skipped
// with its index consumed, so later frames keep their ids.

use crate::core_modules::annotator::Annotator;
use crate::core_modules::detection::Detection;
use crate::core_modules::trajectory::TrajectoryStore;
use crate::error::{Error, Result};
use crate::pipeline::{FrameReport, PipelineConfig, TrackingPipeline};
use image::RgbImage;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// An annotated frame together with what was found in it.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub frame: RgbImage,
    pub report: FrameReport,
    /// The diagnostic dump right after this frame, when capture is on.
    pub dump: Option<serde_json::Value>,
}

/// Both detectors in one call: `(circles, rectangles)`.
pub(crate) type DetectFn = dyn Fn(&RgbImage) -> (Vec<Detection>, Vec<Detection>) + Send + Sync;

type Detected = (RgbImage, Vec<Detection>, Vec<Detection>);

struct FrameTask {
    frame_id: u64,
    frame: RgbImage,
    result_sender: oneshot::Sender<Result<Detected>>,
}

/// The tracking state every frame in flight applies itself to, one at a time.
struct Sequencer {
    tracking: TrackingPipeline,
    capture_dumps: bool,
}

impl Sequencer {
    fn apply(&mut self, frame_id: u64, detected: Result<Detected>) -> Result<ProcessedFrame> {
        match detected {
            Ok((mut frame, circles, rectangles)) => {
                let report = self.tracking.apply_detections(&mut frame, circles, rectangles);
                let dump = self.capture_dumps.then(|| self.tracking.diagnostic_dump());
                Ok(ProcessedFrame { frame, report, dump })
            }
            Err(e) => {
                let frame = self.tracking.skip_frame();
                warn!(frame_id, frame, error = %e, "detection failed, frame skipped");
                Err(e)
            }
        }
    }
}

/// Frame ids and turns are handed out together so they can never disagree.
struct Submission {
    next_frame_id: u64,
    last_turn: Option<oneshot::Receiver<()>>,
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<FrameTask>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(worker_count: usize, detect: Arc<DetectFn>) -> Self {
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<FrameTask>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<FrameTask>())
            .unzip();

        // A single dispatcher deals tasks to workers round-robin.
        let dispatcher = tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                if let Err(mpsc::error::SendError(task)) = worker_senders[worker_idx].send(task) {
                    let _ = task
                        .result_sender
                        .send(Err(Error::Worker(format!("worker {worker_idx} has stopped"))));
                }
                worker_idx = (worker_idx + 1) % worker_senders.len();
            }
        });

        let mut workers = Vec::with_capacity(worker_count);
        for mut worker_receiver in worker_receivers {
            let detect = Arc::clone(&detect);

            let worker = tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    let FrameTask {
                        frame_id,
                        frame,
                        result_sender,
                    } = task;
                    let detect = Arc::clone(&detect);

                    let outcome = tokio::task::spawn_blocking(move || {
                        let (circles, rectangles) = detect(&frame);
                        (frame, circles, rectangles)
                    })
                    .await
                    .map_err(|e| Error::Worker(format!("detection for frame {frame_id} failed: {e}")));

                    // The frame may have been cancelled meanwhile.
                    let _ = result_sender.send(outcome);
                }
            });
            workers.push(worker);
        }

        Self {
            task_sender,
            dispatcher,
            workers,
        }
    }

    /// Stops accepting frames and waits for every queued frame to finish.
    async fn shutdown(self) {
        drop(self.task_sender);
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "dispatcher ended abnormally");
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
    }
}

/// Multi-worker variant of [`TrackingPipeline`]. Must be created inside a tokio runtime.
pub struct ParallelPipeline {
    worker_pool: WorkerPool,
    sequencer: Arc<Mutex<Sequencer>>,
    submission: Mutex<Submission>,
    worker_count: usize,
}

impl ParallelPipeline {
    /// `workers: None` uses one worker per CPU.
    pub fn new(config: PipelineConfig, workers: Option<usize>) -> Result<Self> {
        let annotator = Annotator::new(config.render.clone())?;
        Self::with_annotator(config, annotator, workers)
    }

    pub fn with_annotator(config: PipelineConfig, annotator: Annotator, workers: Option<usize>) -> Result<Self> {
        let tracking = TrackingPipeline::with_annotator(config, annotator)?;
        let circle_detector = tracking.circle_detector().clone();
        let rectangle_detector = tracking.rectangle_detector().clone();
        let detect: Arc<DetectFn> =
            Arc::new(move |frame: &RgbImage| (circle_detector.detect(frame), rectangle_detector.detect(frame)));
        Ok(Self::with_detector(tracking, detect, workers))
    }

    pub(crate) fn with_detector(tracking: TrackingPipeline, detect: Arc<DetectFn>, workers: Option<usize>) -> Self {
        let worker_count = workers.unwrap_or_else(num_cpus::get).max(1);
        let sequencer = Arc::new(Mutex::new(Sequencer {
            tracking,
            capture_dumps: false,
        }));
        let worker_pool = WorkerPool::new(worker_count, detect);
        debug!(workers = worker_count, "parallel pipeline started");

        Self {
            worker_pool,
            sequencer,
            submission: Mutex::new(Submission {
                next_frame_id: 0,
                last_turn: None,
            }),
            worker_count,
        }
    }

    pub fn workers(&self) -> usize {
        self.worker_count
    }

    /// Queues a frame. The frame id is taken when this is called, not when the
    /// returned future is first polled, so submission order is frame order.
    ///
    /// The futures must be awaited in submission order or polled together
    /// (e.g. with `join_all`); each one waits for the frame before it. Dropping
    /// one cancels it and every later frame with [`Error::Cancelled`].
    pub fn process_frame(&self, frame: RgbImage) -> impl Future<Output = Result<ProcessedFrame>> {
        let (detection_sender, detection_receiver) = oneshot::channel();
        let (turn_sender, turn_receiver) = oneshot::channel::<()>();

        let submitted = self
            .submission
            .lock()
            .map_err(|_| Error::Worker("submission lock poisoned".to_string()))
            .and_then(|mut submission| {
                let frame_id = submission.next_frame_id;
                submission.next_frame_id += 1;
                let previous_turn = submission.last_turn.replace(turn_receiver);
                self.worker_pool
                    .task_sender
                    .send(FrameTask {
                        frame_id,
                        frame,
                        result_sender: detection_sender,
                    })
                    .map_err(|_| Error::Worker("worker pool has shut down".to_string()))?;
                Ok((frame_id, previous_turn))
            });
        let sequencer = Arc::clone(&self.sequencer);

        async move {
            let (frame_id, previous_turn) = submitted?;
            let detected = detection_receiver
                .await
                .unwrap_or_else(|_| Err(Error::Worker(format!("frame {frame_id} was dropped by its worker"))));

            if let Some(previous_turn) = previous_turn {
                previous_turn.await.map_err(|_| Error::Cancelled(frame_id))?;
            }

            let result = sequencer
                .lock()
                .map_err(|_| Error::Worker("sequencer lock poisoned".to_string()))?
                .apply(frame_id, detected);
            let _ = turn_sender.send(());
            result
        }
    }

    /// Frames applied to the stores so far, skipped frames included.
    pub fn frames_processed(&self) -> Result<u64> {
        Ok(self.lock()?.tracking.frames_processed())
    }

    /// Attach the diagnostic dump to every frame applied from now on.
    pub fn capture_dumps(&self, enabled: bool) -> Result<()> {
        self.lock()?.capture_dumps = enabled;
        Ok(())
    }

    pub fn diagnostic_dump(&self) -> Result<serde_json::Value> {
        Ok(self.lock()?.tracking.diagnostic_dump())
    }

    /// Stops the workers and hands the stores over: `(circles, rectangles)`.
    /// Frames whose futures were dropped never reach the stores.
    pub async fn finish(self) -> Result<(TrajectoryStore, TrajectoryStore)> {
        let Self {
            worker_pool, sequencer, ..
        } = self;
        worker_pool.shutdown().await;

        let sequencer = Arc::try_unwrap(sequencer)
            .map_err(|_| Error::Worker("sequencer is still shared".to_string()))?
            .into_inner()
            .map_err(|_| Error::Worker("sequencer lock poisoned".to_string()))?;
        Ok(sequencer.tracking.into_stores())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Sequencer>> {
        self.sequencer
            .lock()
            .map_err(|_| Error::Worker("sequencer lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection::{Color, Point};
    use crate::core_modules::identity::ObjectKey;
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;

    const CRASH_MARK: Rgb<u8> = Rgb([255, 255, 255]);

    fn frame(i: i32) -> RgbImage {
        let mut frame = RgbImage::from_pixel(240, 160, Rgb([0, 0, 0]));
        draw_filled_circle_mut(&mut frame, (50 + 15 * i, 80), 25, Rgb([0, 255, 0]));
        frame
    }

    fn tracking() -> TrackingPipeline {
        TrackingPipeline::new(PipelineConfig::default()).expect("pipeline")
    }

    /// Real detectors, except on frames whose top-left pixel is `CRASH_MARK`.
    fn crashing_detector(tracking: &TrackingPipeline) -> Arc<DetectFn> {
        let circles = tracking.circle_detector().clone();
        let rectangles = tracking.rectangle_detector().clone();
        Arc::new(move |frame: &RgbImage| {
            if *frame.get_pixel(0, 0) == CRASH_MARK {
                panic!("detector crashed");
            }
            (circles.detect(frame), rectangles.detect(frame))
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn results_are_applied_in_frame_order() {
        let pipeline = ParallelPipeline::new(PipelineConfig::default(), Some(3)).expect("pipeline");
        let futures: Vec<_> = (0..8).map(|i| pipeline.process_frame(frame(i))).collect();
        let results = futures::future::join_all(futures).await;

        for (i, result) in results.into_iter().enumerate() {
            let processed = result.expect("frame processed");
            assert_eq!(processed.report.frame, i as u64);
            assert_eq!(processed.frame.dimensions(), (240, 160));
        }
        assert_eq!(pipeline.frames_processed().expect("lock"), 8);

        let (circles, _) = pipeline.finish().await.expect("finished");
        let key = ObjectKey::from_color(Color::new(0, 255, 0));
        let xs: Vec<i32> = circles
            .get(key)
            .expect("tracked")
            .positions()
            .map(|p| p.map(|Point { x, .. }| x).expect("seen"))
            .collect();
        assert_eq!(xs.len(), 8);
        assert!(xs.windows(2).all(|w| w[0] < w[1]), "positions out of order: {xs:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn matches_the_sequential_pipeline() {
        let parallel = ParallelPipeline::new(PipelineConfig::default(), Some(2)).expect("pipeline");
        let mut sequential = tracking();

        let futures: Vec<_> = (0..5).map(|i| parallel.process_frame(frame(i))).collect();
        let results = futures::future::join_all(futures).await;
        for (i, result) in results.into_iter().enumerate() {
            let processed = result.expect("frame processed");
            let mut expected = frame(i as i32);
            let report = sequential.process_frame(&mut expected);
            assert_eq!(processed.report, report);
            assert_eq!(processed.frame, expected);
        }
        assert_eq!(parallel.diagnostic_dump().expect("lock"), sequential.diagnostic_dump());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn polling_order_does_not_change_apply_order() {
        let pipeline = ParallelPipeline::new(PipelineConfig::default(), Some(2)).expect("pipeline");
        pipeline.capture_dumps(true).expect("lock");
        let futures: Vec<_> = (0..4).map(|i| pipeline.process_frame(frame(i))).collect();
        let results = futures::future::join_all(futures.into_iter().rev()).await;

        for (i, result) in results.into_iter().rev().enumerate() {
            let processed = result.expect("frame processed");
            assert_eq!(processed.report.frame, i as u64);
            assert_eq!(processed.dump.map(|d| d["frame"].clone()), Some(serde_json::json!(i)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_detection_skips_the_frame_and_keeps_indices() {
        let tracking = tracking();
        let detect = crashing_detector(&tracking);
        let pipeline = ParallelPipeline::with_detector(tracking, detect, Some(2));

        let mut broken = frame(1);
        broken.put_pixel(0, 0, CRASH_MARK);
        let futures = vec![
            pipeline.process_frame(frame(0)),
            pipeline.process_frame(broken),
            pipeline.process_frame(frame(2)),
        ];
        let results = futures::future::join_all(futures).await;

        assert_eq!(results[0].as_ref().expect("frame 0").report.frame, 0);
        assert!(matches!(results[1], Err(Error::Worker(_))));
        assert_eq!(results[2].as_ref().expect("frame 2").report.frame, 2);
        assert_eq!(pipeline.frames_processed().expect("lock"), 3);

        let (circles, _) = pipeline.finish().await.expect("finished");
        let frames: Vec<u64> = circles
            .get(ObjectKey::from_color(Color::new(0, 255, 0)))
            .expect("tracked")
            .samples()
            .map(|s| s.frame)
            .collect();
        assert_eq!(frames, vec![0, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_a_frame_cancels_the_frames_after_it() {
        let pipeline = ParallelPipeline::new(PipelineConfig::default(), Some(2)).expect("pipeline");
        let first = pipeline.process_frame(frame(0));
        let second = pipeline.process_frame(frame(1));
        let third = pipeline.process_frame(frame(2));

        assert_eq!(first.await.expect("frame 0").report.frame, 0);
        drop(second);
        assert!(matches!(third.await, Err(Error::Cancelled(2))));
        assert_eq!(pipeline.frames_processed().expect("lock"), 1);

        let (circles, _) = pipeline.finish().await.expect("finished");
        let trajectory = circles.get(ObjectKey::from_color(Color::new(0, 255, 0))).expect("tracked");
        assert_eq!(trajectory.len(), 1);
    }

    #[tokio::test]
    async fn default_worker_count_uses_available_cpus() {
        let pipeline = ParallelPipeline::new(PipelineConfig::default(), None).expect("pipeline");
        assert_eq!(pipeline.workers(), num_cpus::get().max(1));
        pipeline.finish().await.expect("finished");
    }
}
