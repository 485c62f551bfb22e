// THEORY:
// The `CircleDetector` is the circular half of the Shape Detection Layer. It
// implements the "Hough gradient" method: instead of voting for every possible
// circle through every edge pixel (a 3D accumulator), each edge pixel only
// votes along its own gradient direction, because the center of a circle always
// lies on the normal of its outline.
//
// Algorithm steps:
// 1.  **Preprocessing**: intensity conversion and Gaussian smoothing suppress
//     sensor noise that would otherwise produce spurious edges.
// 2.  **Edge Map**: Canny edges mark the pixels allowed to vote.
// 3.  **Center Voting**: every edge pixel walks along its Sobel gradient (both
//     directions) across the allowed radius range and increments a 2D
//     accumulator, kept at a coarser resolution (`dp`) to make votes pile up.
// 4.  **Center Selection**: accumulator local maxima above a threshold become
//     candidates, strongest first. Candidates too close to an already accepted
//     circle are discarded (`min_dist`).
// 5.  **Radius Estimation**: for each surviving center, the distances to all
//     edge pixels are histogrammed; the radius with the best support (relative
//     to its circumference) wins, provided it has enough edge pixels behind it.
// 6.  **Stateless Utility**: nothing is remembered between frames. Overlapping
//     circles are reported independently, there is no further deduplication.

use crate::core_modules::detection::{Detection, Extent, Point, ShapeKind};
use crate::core_modules::utils::image_helper::image_helper;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

pub mod circle_detector {
    use super::*;

    /// Tuning for the Hough gradient transform. Defaults are the reference constants.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CircleDetectorConfig {
        /// Standard deviation of the smoothing blur.
        pub blur_sigma: f32,
        /// Inverse accumulator resolution: 1.2 means one cell per 1.2 pixels.
        pub dp: f64,
        /// Minimum distance in pixels between two reported centers.
        pub min_dist: f64,
        /// Upper Canny threshold; the lower one is half of it.
        pub canny_high: f32,
        /// Votes a center needs, and edge pixels a radius needs, to be accepted.
        pub acc_threshold: u32,
        pub min_radius: u32,
        pub max_radius: u32,
    }

    impl Default for CircleDetectorConfig {
        fn default() -> Self {
            Self {
                blur_sigma: 2.0,
                dp: 1.2,
                min_dist: 30.0,
                canny_high: 50.0,
                acc_threshold: 30,
                min_radius: 10,
                max_radius: 100,
            }
        }
    }

    impl CircleDetectorConfig {
        pub fn validate(&self) -> Result<(), String> {
            if self.dp <= 0.0 {
                return Err(format!("circle dp must be positive, got {}", self.dp));
            }
            if self.min_radius == 0 || self.min_radius > self.max_radius {
                return Err(format!(
                    "circle radius bounds must satisfy 0 < min <= max, got {}..{}",
                    self.min_radius, self.max_radius
                ));
            }
            if self.canny_high <= 0.0 {
                return Err("circle canny_high must be positive".to_string());
            }
            Ok(())
        }
    }

    /// A circle in pixel coordinates.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Circle {
        pub center: Point,
        pub radius: u32,
        /// Edge pixels supporting the chosen radius.
        pub support: u32,
    }

    #[derive(Debug, Clone, Default)]
    pub struct CircleDetector {
        config: CircleDetectorConfig,
    }

    impl CircleDetector {
        pub fn new(config: CircleDetectorConfig) -> Self {
            Self { config }
        }

        pub fn config(&self) -> &CircleDetectorConfig {
            &self.config
        }

        /// Finds circles in the frame and samples each one's color at its center.
        /// Circles whose center falls outside the frame are dropped.
        pub fn detect(&self, frame: &RgbImage) -> Vec<Detection> {
            let smoothed = image_helper::smoothed_intensity(frame, self.config.blur_sigma);
            self.find_circles(&smoothed)
                .into_iter()
                .filter_map(|circle| {
                    let color = image_helper::sample_color(frame, circle.center)?;
                    Some(Detection {
                        kind: ShapeKind::Circle,
                        position: circle.center,
                        extent: Extent::Radius(circle.radius),
                        color,
                    })
                })
                .collect()
        }

        /// Runs the transform on an already smoothed intensity image.
        pub fn find_circles(&self, gray: &GrayImage) -> Vec<Circle> {
            let cfg = &self.config;
            let (width, height) = gray.dimensions();
            if width == 0 || height == 0 {
                return Vec::new();
            }

            // --- 1. Edge Map & Gradients ---
            let edges = imageproc::edges::canny(gray, cfg.canny_high / 2.0, cfg.canny_high);
            let grad_x = imageproc::gradients::horizontal_sobel(gray);
            let grad_y = imageproc::gradients::vertical_sobel(gray);

            // --- 2. Center Voting ---
            let inv_dp = 1.0 / cfg.dp;
            let acc_width = (width as f64 * inv_dp).ceil() as usize + 2;
            let acc_height = (height as f64 * inv_dp).ceil() as usize + 2;
            let mut accumulator = vec![0u32; acc_width * acc_height];
            let mut edge_points: Vec<(f64, f64)> = Vec::new();

            let r_min = (cfg.min_radius as f64 * inv_dp).floor().max(1.0) as u32;
            let r_max = (cfg.max_radius as f64 * inv_dp).ceil() as u32;

            for (x, y, pixel) in edges.enumerate_pixels() {
                if pixel.0[0] == 0 {
                    continue;
                }
                let gx = grad_x.get_pixel(x, y).0[0] as f64;
                let gy = grad_y.get_pixel(x, y).0[0] as f64;
                let magnitude = (gx * gx + gy * gy).sqrt();
                if magnitude == 0.0 {
                    continue;
                }
                edge_points.push((x as f64, y as f64));

                let (sx, sy) = (gx / magnitude, gy / magnitude);
                let (ax, ay) = (x as f64 * inv_dp, y as f64 * inv_dp);
                for sign in [-1.0, 1.0] {
                    for r in r_min..=r_max {
                        let cx = ax + sign * sx * r as f64;
                        let cy = ay + sign * sy * r as f64;
                        if cx < 0.0 || cy < 0.0 {
                            break;
                        }
                        let (cx, cy) = (cx as usize, cy as usize);
                        if cx >= acc_width || cy >= acc_height {
                            break;
                        }
                        accumulator[cy * acc_width + cx] += 1;
                    }
                }
            }

            // --- 3. Center Candidates ---
            // Local maxima; ties resolve towards the top-left so plateaus yield one peak.
            let mut candidates: Vec<(usize, u32)> = Vec::new();
            for cy in 1..acc_height - 1 {
                for cx in 1..acc_width - 1 {
                    let i = cy * acc_width + cx;
                    let votes = accumulator[i];
                    if votes > cfg.acc_threshold
                        && votes > accumulator[i - 1]
                        && votes >= accumulator[i + 1]
                        && votes > accumulator[i - acc_width]
                        && votes >= accumulator[i + acc_width]
                    {
                        candidates.push((i, votes));
                    }
                }
            }
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            // --- 4. Radius Estimation & Acceptance ---
            let mut circles: Vec<Circle> = Vec::new();
            let min_dist_sq = cfg.min_dist * cfg.min_dist;
            let mut histogram = vec![0u32; cfg.max_radius as usize + 2];

            for (index, _) in candidates {
                let (cx, cy) = refine_center(&accumulator, acc_width, index, cfg.dp);

                let too_close = circles.iter().any(|c| {
                    let dx = c.center.x as f64 - cx;
                    let dy = c.center.y as f64 - cy;
                    dx * dx + dy * dy < min_dist_sq
                });
                if too_close {
                    continue;
                }

                histogram.iter_mut().for_each(|h| *h = 0);
                for &(ex, ey) in &edge_points {
                    let d = ((ex - cx).powi(2) + (ey - cy).powi(2)).sqrt().round() as u32;
                    if d >= cfg.min_radius && d <= cfg.max_radius {
                        histogram[d as usize] += 1;
                    }
                }

                if let Some((radius, support)) = best_radius(&histogram, cfg.min_radius, cfg.max_radius) {
                    if support > cfg.acc_threshold {
                        circles.push(Circle {
                            center: Point::new(cx.round() as i32, cy.round() as i32),
                            radius,
                            support,
                        });
                    }
                }
            }

            circles
        }
    }

    /// Vote-weighted centroid of the 3x3 accumulator neighbourhood, in pixel coordinates.
    fn refine_center(accumulator: &[u32], acc_width: usize, index: usize, dp: f64) -> (f64, f64) {
        let (px, py) = (index % acc_width, index / acc_width);
        let mut total = 0.0;
        let (mut sum_x, mut sum_y) = (0.0, 0.0);
        for ny in py - 1..=py + 1 {
            for nx in px - 1..=px + 1 {
                let votes = accumulator[ny * acc_width + nx] as f64;
                total += votes;
                sum_x += votes * nx as f64;
                sum_y += votes * ny as f64;
            }
        }
        // Accumulator cell (i) covers pixels [i*dp, (i+1)*dp); use the cell center.
        ((sum_x / total + 0.5) * dp, (sum_y / total + 0.5) * dp)
    }

    /// Picks the radius whose +/-1 px band holds the most edge pixels per unit of
    /// circumference, so large circles do not win just by being large.
    fn best_radius(histogram: &[u32], min_radius: u32, max_radius: u32) -> Option<(u32, u32)> {
        let mut best: Option<(u32, u32, f64)> = None;
        for r in min_radius..=max_radius {
            let i = r as usize;
            let support = histogram[i]
                + histogram.get(i.wrapping_sub(1)).copied().unwrap_or(0)
                + histogram.get(i + 1).copied().unwrap_or(0);
            if support == 0 {
                continue;
            }
            let score = support as f64 / r as f64;
            if best.is_none_or(|(_, _, s)| score > s) {
                best = Some((r, support, score));
            }
        }
        best.map(|(r, support, _)| (r, support))
    }
}
