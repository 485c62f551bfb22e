// The common face of both detectors. `detect` is pure; `detect_and_annotate`
// detects on the frame as it is and only then draws the overlays onto it.

use crate::core_modules::annotator::Annotator;
use crate::core_modules::circle_detector::circle_detector::CircleDetector;
use crate::core_modules::detection::{Detection, ShapeKind};
use crate::core_modules::rectangle_detector::rectangle_detector::RectangleDetector;
use image::RgbImage;

pub trait ShapeDetector: Send + Sync {
    fn kind(&self) -> ShapeKind;

    fn detect(&self, frame: &RgbImage) -> Vec<Detection>;

    fn detect_and_annotate(&self, frame: &mut RgbImage, annotator: &Annotator) -> Vec<Detection> {
        let detections = self.detect(frame);
        annotator.draw_detections(frame, &detections);
        detections
    }
}

impl ShapeDetector for CircleDetector {
    fn kind(&self) -> ShapeKind {
        ShapeKind::Circle
    }

    fn detect(&self, frame: &RgbImage) -> Vec<Detection> {
        CircleDetector::detect(self, frame)
    }
}

impl ShapeDetector for RectangleDetector {
    fn kind(&self) -> ShapeKind {
        ShapeKind::Rectangle
    }

    fn detect(&self, frame: &RgbImage) -> Vec<Detection> {
        RectangleDetector::detect(self, frame)
    }
}
