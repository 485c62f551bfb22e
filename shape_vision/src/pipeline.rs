// THEORY:
// The `pipeline` module is the top-level API for the whole engine. It wires
// the layers together into one call per frame:
//
//   pristine frame -> detectors (circles, rectangles)
//                  -> identity assigners (one store per shape kind)
//                  -> annotator (detection overlays, then trajectory overlays)
//
// Detection always runs before anything is drawn, so overlays from this frame
// can never leak into this frame's measurements. The pipeline owns every piece
// of cross-frame state; nothing lives in globals, and the stores are handed
// back to the caller at the end of a session for plotting.

use crate::core_modules::annotator::{Annotator, RenderConfig};
use crate::core_modules::circle_detector::circle_detector::{CircleDetector, CircleDetectorConfig};
use crate::core_modules::detection::{Detection, ShapeKind};
use crate::core_modules::identity::ColorKey;
use crate::core_modules::plot::PlotConfig;
use crate::core_modules::rectangle_detector::rectangle_detector::{RectangleDetector, RectangleDetectorConfig};
use crate::core_modules::tracker::{FrameAssignment, IdentityAssigner};
use crate::core_modules::trajectory::{RetentionPolicy, TrajectoryStore};
use crate::error::{Error, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

// Re-export key data structures for the public API.
pub use crate::core_modules::detection::{Color, Extent, Point};
pub use crate::core_modules::identity::ObjectKey;
pub use crate::core_modules::trajectory::{TrackEntry, TrackState, Trajectory};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub retention: RetentionPolicy,
    pub color_key: ColorKey,
}

/// Configuration for the TrackingPipeline. Every section falls back to its
/// defaults, so a config file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub circle: CircleDetectorConfig,
    pub rectangle: RectangleDetectorConfig,
    pub tracking: TrackingConfig,
    pub render: RenderConfig,
    pub plot: PlotConfig,
}

impl PipelineConfig {
    /// Reads a JSON config file and validates it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        info!(path = %path.display(), "loaded pipeline config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.circle
            .validate()
            .and_then(|_| self.rectangle.validate())
            .and_then(|_| self.tracking.retention.validate())
            .and_then(|_| self.tracking.color_key.validate())
            .and_then(|_| self.render.validate())
            .map_err(Error::InvalidConfig)
    }
}

/// The primary output of the pipeline for a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub circles: Vec<Detection>,
    pub rectangles: Vec<Detection>,
    pub circle_assignment: FrameAssignment,
    pub rectangle_assignment: FrameAssignment,
}

impl FrameReport {
    pub fn detection_count(&self) -> usize {
        self.circles.len() + self.rectangles.len()
    }

    pub fn collisions(&self) -> usize {
        self.circle_assignment.collisions + self.rectangle_assignment.collisions
    }
}

pub struct TrackingPipeline {
    config: PipelineConfig,
    circle_detector: CircleDetector,
    rectangle_detector: RectangleDetector,
    circle_assigner: IdentityAssigner,
    rectangle_assigner: IdentityAssigner,
    circles: TrajectoryStore,
    rectangles: TrajectoryStore,
    annotator: Annotator,
    frames_processed: u64,
}

impl TrackingPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let annotator = Annotator::new(config.render.clone())?;
        Self::with_annotator(config, annotator)
    }

    /// Like [`TrackingPipeline::new`], with an annotator (and font) the caller already built.
    pub fn with_annotator(config: PipelineConfig, annotator: Annotator) -> Result<Self> {
        config.validate()?;
        let retention = config.tracking.retention;
        let key = config.tracking.color_key;
        info!(
            ?retention,
            bits_per_channel = key.bits_per_channel,
            font = annotator.font().is_some(),
            "tracking pipeline ready"
        );
        Ok(Self {
            circle_detector: CircleDetector::new(config.circle.clone()),
            rectangle_detector: RectangleDetector::new(config.rectangle.clone()),
            circle_assigner: IdentityAssigner::new(key),
            rectangle_assigner: IdentityAssigner::new(key),
            circles: TrajectoryStore::new(ShapeKind::Circle, retention),
            rectangles: TrajectoryStore::new(ShapeKind::Rectangle, retention),
            annotator,
            config,
            frames_processed: 0,
        })
    }

    /// Runs one frame end to end. The frame is annotated in place.
    pub fn process_frame(&mut self, frame: &mut RgbImage) -> FrameReport {
        // Stage 1: Detection, on the frame as it arrived
        let circles = self.circle_detector.detect(frame);
        let rectangles = self.rectangle_detector.detect(frame);
        self.apply_detections(frame, circles, rectangles)
    }

    /// Stages 2 and 3 for detections already computed on `frame`.
    /// Calls must come in frame order.
    pub fn apply_detections(
        &mut self,
        frame: &mut RgbImage,
        circles: Vec<Detection>,
        rectangles: Vec<Detection>,
    ) -> FrameReport {
        // Stage 2: Identity Assignment
        let circle_assignment = self.circle_assigner.assign(&mut self.circles, &circles);
        let rectangle_assignment = self.rectangle_assigner.assign(&mut self.rectangles, &rectangles);

        // Stage 3: Annotation
        self.annotator.draw_detections(frame, &circles);
        self.annotator.draw_detections(frame, &rectangles);
        self.annotator.draw_trajectories(frame, &self.circles);
        self.annotator.draw_trajectories(frame, &self.rectangles);

        let frame_index = self.frames_processed;
        self.frames_processed += 1;

        let report = FrameReport {
            frame: frame_index,
            circles,
            rectangles,
            circle_assignment,
            rectangle_assignment,
        };
        debug!(
            frame = frame_index,
            circles = report.circles.len(),
            rectangles = report.rectangles.len(),
            collisions = report.collisions(),
            "frame processed"
        );
        report
    }

    /// Accounts for a frame whose detections never arrived. Nothing is
    /// recorded for it, but the frames after it keep their indices.
    pub fn skip_frame(&mut self) -> u64 {
        self.circle_assigner.skip();
        self.rectangle_assigner.skip();
        let frame_index = self.frames_processed;
        self.frames_processed += 1;
        debug!(frame = frame_index, "frame skipped");
        frame_index
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn annotator(&self) -> &Annotator {
        &self.annotator
    }

    pub fn circle_detector(&self) -> &CircleDetector {
        &self.circle_detector
    }

    pub fn rectangle_detector(&self) -> &RectangleDetector {
        &self.rectangle_detector
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn circles(&self) -> &TrajectoryStore {
        &self.circles
    }

    pub fn rectangles(&self) -> &TrajectoryStore {
        &self.rectangles
    }

    pub fn total_collisions(&self) -> u64 {
        self.circle_assigner.total_collisions() + self.rectangle_assigner.total_collisions()
    }

    /// Hands the stores over for end-of-session plotting: `(circles, rectangles)`.
    pub fn into_stores(self) -> (TrajectoryStore, TrajectoryStore) {
        (self.circles, self.rectangles)
    }

    /// `{"frame": n, "circles": {...}, "rectangles": {...}}` for the last processed frame.
    pub fn diagnostic_dump(&self) -> serde_json::Value {
        serde_json::json!({
            "frame": self.frames_processed.checked_sub(1),
            "circles": self.circles.dump(),
            "rectangles": self.rectangles.dump(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;
    use std::io::Write;

    const RED: Rgb<u8> = Rgb([255, 0, 0]);

    fn frame_with_circle(center: Option<(i32, i32)>) -> RgbImage {
        let mut frame = RgbImage::from_pixel(240, 160, Rgb([0, 0, 0]));
        if let Some(center) = center {
            draw_filled_circle_mut(&mut frame, center, 25, RED);
        }
        frame
    }

    fn pipeline() -> TrackingPipeline {
        TrackingPipeline::new(PipelineConfig::default()).expect("default config is valid")
    }

    #[test]
    fn moving_circle_keeps_one_identity() {
        let mut pipeline = pipeline();
        let n = 5;
        for i in 0..n {
            let mut frame = frame_with_circle(Some((60 + 20 * i, 80)));
            let report = pipeline.process_frame(&mut frame);
            assert_eq!(report.frame, i as u64);
            assert_eq!(report.circles.len(), 1, "frame {i}: {:?}", report.circles);
        }

        let key = ObjectKey::from_color(Color::new(255, 0, 0));
        assert_eq!(pipeline.circles().len(), 1);
        let trajectory = pipeline.circles().get(key).expect("tracked");
        assert_eq!(trajectory.len(), n as usize);
        let frames: Vec<u64> = trajectory.samples().map(|s| s.frame).collect();
        assert!(frames.windows(2).all(|w| w[0] <= w[1]));
        for (i, position) in trajectory.positions().enumerate() {
            let p = position.expect("seen every frame");
            assert!((p.x - (60 + 20 * i as i32)).abs() <= 3, "{p:?}");
            assert!((p.y - 80).abs() <= 3, "{p:?}");
        }
    }

    #[test]
    fn removed_circle_is_absent_only_in_that_frame() {
        let mut pipeline = pipeline();
        let k = 2;
        for i in 0..5 {
            let center = (i != k).then_some((100, 80));
            pipeline.process_frame(&mut frame_with_circle(center));
        }

        let key = ObjectKey::from_color(Color::new(255, 0, 0));
        let entries: Vec<TrackEntry> = pipeline
            .circles()
            .get(key)
            .expect("tracked")
            .samples()
            .map(|s| s.entry)
            .collect();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[k], TrackEntry::Absent);
        for (i, entry) in entries.iter().enumerate().filter(|(i, _)| *i != k) {
            assert!(entry.position().is_some(), "frame {i} should be seen");
        }
    }

    #[test]
    fn skipped_frame_keeps_later_frame_indices() {
        let mut pipeline = pipeline();
        pipeline.process_frame(&mut frame_with_circle(Some((100, 80))));
        assert_eq!(pipeline.skip_frame(), 1);
        let report = pipeline.process_frame(&mut frame_with_circle(Some((110, 80))));

        assert_eq!(report.frame, 2);
        assert_eq!(report.circle_assignment.frame, 2);
        assert_eq!(pipeline.frames_processed(), 3);
        let key = ObjectKey::from_color(Color::new(255, 0, 0));
        let frames: Vec<u64> = pipeline
            .circles()
            .get(key)
            .expect("tracked")
            .samples()
            .map(|s| s.frame)
            .collect();
        assert_eq!(frames, vec![0, 2]);
    }

    #[test]
    fn frame_is_annotated_after_detection() {
        let mut pipeline = pipeline();
        let pristine = frame_with_circle(Some((120, 80)));
        let mut frame = pristine.clone();
        let report = pipeline.process_frame(&mut frame);

        assert_ne!(frame, pristine);
        assert_eq!(report.circles, pipeline.circle_detector().detect(&pristine));
        assert!(report.circles.iter().all(|d| d.color == Color::new(255, 0, 0)));
    }

    #[test]
    fn blank_frames_produce_empty_reports() {
        let mut pipeline = pipeline();
        let pristine = frame_with_circle(None);
        let mut frame = pristine.clone();
        let report = pipeline.process_frame(&mut frame);

        assert_eq!(report.detection_count(), 0);
        assert_eq!(frame, pristine);
        assert_eq!(pipeline.frames_processed(), 1);
    }

    #[test]
    fn diagnostic_dump_has_both_kinds() {
        let mut pipeline = pipeline();
        assert_eq!(pipeline.diagnostic_dump()["frame"], serde_json::Value::Null);

        pipeline.process_frame(&mut frame_with_circle(Some((100, 80))));
        pipeline.process_frame(&mut frame_with_circle(None));
        let dump = pipeline.diagnostic_dump();

        assert_eq!(dump["frame"], 1);
        let key = ObjectKey::from_color(Color::new(255, 0, 0)).to_string();
        let positions = dump["circles"][&key].as_array().expect("circle positions");
        assert_eq!(positions.len(), 2);
        assert!(positions[0].is_array());
        assert!(positions[1].is_null());
        assert!(dump["rectangles"].is_object());
    }

    #[test]
    fn config_file_overrides_only_what_it_names() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{ "circle": {{ "min_radius": 15 }}, "tracking": {{ "retention": {{ "max_samples": 100 }} }} }}"#
        )
        .expect("write");

        let config = PipelineConfig::load(file.path()).expect("valid config");
        assert_eq!(config.circle.min_radius, 15);
        assert_eq!(config.circle.max_radius, 100);
        assert_eq!(config.tracking.retention, RetentionPolicy::MaxSamples(100));
        assert_eq!(config.rectangle, RectangleDetectorConfig::default());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "tracking": {{ "color_key": {{ "bits_per_channel": 0 }} }} }}"#).expect("write");
        assert!(matches!(PipelineConfig::load(file.path()), Err(Error::InvalidConfig(_))));

        let mut malformed = tempfile::NamedTempFile::new().expect("temp file");
        write!(malformed, "{{ not json").expect("write");
        assert!(matches!(PipelineConfig::load(malformed.path()), Err(Error::Json(_))));

        let config = PipelineConfig {
            circle: CircleDetectorConfig {
                dp: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(TrackingPipeline::new(config), Err(Error::InvalidConfig(_))));
    }
}
