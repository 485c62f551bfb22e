// THEORY:
// The `RectangleDetector` is the polygonal half of the Shape Detection Layer.
// Where the circle detector votes, this one traces: it follows the outlines in
// an edge map and asks whether each outline is, to within a tolerance, a
// four-sided polygon.
//
// Algorithm steps:
// 1.  **Preprocessing**: intensity conversion and Gaussian smoothing, exactly as
//     for circles, so both detectors see the same denoised image.
// 2.  **Edge Map**: Canny with a fixed low/high threshold pair.
// 3.  **Contour Tree**: border following (Suzuki-Abe) over the edge map returns
//     every outline, both outer borders and the hole borders nested inside them.
// 4.  **Polygon Approximation**: each contour is simplified with closed
//     Douglas-Peucker using a tolerance of 2% of its own perimeter, so the
//     tolerance scales with the shape.
// 5.  **Quadrilateral Filter**: only polygons with exactly four vertices are
//     kept. This is a heuristic: skewed quads pass too.
// 6.  **Normalization**: the axis-aligned bounding box of the polygon gives the
//     reported center and extent; the color is sampled at that center.
//
// A single edge loop usually yields both an outer and a hole border, so one
// physical rectangle may be reported twice with nearly the same center. The
// identity layer collapses same-key detections within a frame.

use crate::core_modules::detection::{Detection, Extent, Point, ShapeKind};
use crate::core_modules::utils::geometry;
use crate::core_modules::utils::image_helper::image_helper;
use image::{GrayImage, RgbImage};
use imageproc::contours::BorderType;
use serde::{Deserialize, Serialize};

pub mod rectangle_detector {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RectangleDetectorConfig {
        pub blur_sigma: f32,
        pub canny_low: f32,
        pub canny_high: f32,
        /// Polygon tolerance as a fraction of the contour perimeter.
        pub epsilon_ratio: f64,
    }

    impl Default for RectangleDetectorConfig {
        fn default() -> Self {
            Self {
                blur_sigma: 2.0,
                canny_low: 50.0,
                canny_high: 150.0,
                epsilon_ratio: 0.02,
            }
        }
    }

    impl RectangleDetectorConfig {
        pub fn validate(&self) -> Result<(), String> {
            if self.canny_low < 0.0 || self.canny_low > self.canny_high {
                return Err(format!(
                    "rectangle canny thresholds must satisfy 0 <= low <= high, got {}/{}",
                    self.canny_low, self.canny_high
                ));
            }
            if self.epsilon_ratio <= 0.0 {
                return Err("rectangle epsilon_ratio must be positive".to_string());
            }
            Ok(())
        }
    }

    /// A four-vertex polygon found in the edge map.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Quad {
        pub vertices: Vec<Point>,
        /// `(x, y, width, height)` of the axis-aligned bounding box.
        pub bounds: (i32, i32, u32, u32),
        /// True for hole borders, i.e. the inner side of an edge loop.
        pub is_hole: bool,
        /// Index of the enclosing contour in the contour tree, if any.
        pub parent: Option<usize>,
    }

    impl Quad {
        pub fn center(&self) -> Point {
            let (x, y, w, h) = self.bounds;
            Point::new(x + (w / 2) as i32, y + (h / 2) as i32)
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct RectangleDetector {
        config: RectangleDetectorConfig,
    }

    impl RectangleDetector {
        pub fn new(config: RectangleDetectorConfig) -> Self {
            Self { config }
        }

        pub fn config(&self) -> &RectangleDetectorConfig {
            &self.config
        }

        pub fn detect(&self, frame: &RgbImage) -> Vec<Detection> {
            let smoothed = image_helper::smoothed_intensity(frame, self.config.blur_sigma);
            self.find_quads(&smoothed)
                .into_iter()
                .filter_map(|quad| {
                    let center = quad.center();
                    let color = image_helper::sample_color(frame, center)?;
                    let (_, _, width, height) = quad.bounds;
                    Some(Detection {
                        kind: ShapeKind::Rectangle,
                        position: center,
                        extent: Extent::Box { width, height },
                        color,
                    })
                })
                .collect()
        }

        /// Traces the contour tree of the smoothed image and keeps the quadrilaterals.
        pub fn find_quads(&self, gray: &GrayImage) -> Vec<Quad> {
            let edges = imageproc::edges::canny(gray, self.config.canny_low, self.config.canny_high);
            let contours = imageproc::contours::find_contours::<i32>(&edges);

            let mut quads = Vec::new();
            for contour in contours {
                let outline: Vec<Point> = contour.points.iter().map(|p| Point::new(p.x, p.y)).collect();
                if outline.len() < 4 {
                    continue;
                }

                let epsilon = self.config.epsilon_ratio * geometry::arc_length(&outline, true);
                if epsilon <= 0.0 {
                    continue;
                }
                let polygon = geometry::approximate_closed_polygon(&outline, epsilon);
                if polygon.len() != 4 {
                    continue;
                }

                if let Some(bounds) = geometry::bounding_rect(&polygon) {
                    quads.push(Quad {
                        vertices: polygon,
                        bounds,
                        is_hole: matches!(contour.border_type, BorderType::Hole),
                        parent: contour.parent,
                    });
                }
            }
            quads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::rectangle_detector::*;
    use crate::core_modules::detection::{Color, Extent, Point};
    use image::{Rgb, RgbImage};
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_polygon_mut};
    use imageproc::rect::Rect;

    fn frame_with_rect(x: i32, y: i32, w: u32, h: u32, fill: Rgb<u8>) -> RgbImage {
        let mut frame = RgbImage::from_pixel(200, 150, Rgb([0, 0, 0]));
        draw_filled_rect_mut(&mut frame, Rect::at(x, y).of_size(w, h), fill);
        frame
    }

    #[test]
    fn blank_frame_has_no_rectangles() {
        let frame = RgbImage::from_pixel(160, 120, Rgb([200, 200, 200]));
        let original = frame.clone();
        assert!(RectangleDetector::default().detect(&frame).is_empty());
        assert_eq!(frame, original);
    }

    #[test]
    fn filled_rectangle_reports_its_center() {
        // Pixels 40..=99 x 30..=69, geometric center (69.5, 49.5).
        let frame = frame_with_rect(40, 30, 60, 40, Rgb([255, 200, 0]));
        let detections = RectangleDetector::default().detect(&frame);

        assert!(!detections.is_empty(), "no rectangle detected");
        for detection in &detections {
            assert!((detection.position.x - 70).abs() <= 3, "{detection:?}");
            assert!((detection.position.y - 50).abs() <= 3, "{detection:?}");
            assert_eq!(detection.color, Color::new(255, 200, 0));
        }
    }

    #[test]
    fn skewed_quad_is_accepted() {
        let mut frame = RgbImage::from_pixel(200, 150, Rgb([0, 0, 0]));
        let quad = [
            imageproc::point::Point::new(40, 30),
            imageproc::point::Point::new(150, 40),
            imageproc::point::Point::new(130, 110),
            imageproc::point::Point::new(50, 100),
        ];
        draw_polygon_mut(&mut frame, &quad, Rgb([255, 255, 255]));

        let quads = RectangleDetector::default().find_quads(&image::imageops::grayscale(&frame));
        assert!(!quads.is_empty());
        assert!(quads.iter().all(|q| q.vertices.len() == 4));
    }

    #[test]
    fn triangles_and_circles_are_rejected() {
        let mut frame = RgbImage::from_pixel(220, 160, Rgb([0, 0, 0]));
        let triangle = [
            imageproc::point::Point::new(20, 130),
            imageproc::point::Point::new(60, 30),
            imageproc::point::Point::new(100, 130),
        ];
        draw_polygon_mut(&mut frame, &triangle, Rgb([255, 255, 255]));
        draw_filled_circle_mut(&mut frame, (160, 80), 35, Rgb([255, 255, 255]));

        // Canny may leave pixel-sized loops at the apex; only shape-sized boxes count here.
        let detections: Vec<_> = RectangleDetector::default()
            .detect(&frame)
            .into_iter()
            .filter(|d| matches!(d.extent, Extent::Box { width, height } if width >= 10 || height >= 10))
            .collect();
        assert!(detections.is_empty(), "unexpected {detections:?}");
    }

    #[test]
    fn quad_center_uses_truncating_division() {
        let quad = Quad {
            vertices: Vec::new(),
            bounds: (10, 20, 5, 7),
            is_hole: false,
            parent: None,
        };
        assert_eq!(quad.center(), Point::new(12, 23));
    }
}
