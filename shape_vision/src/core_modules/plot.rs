// THEORY:
// The `plot` module is the offline view of a finished session. Where the
// annotator draws history on top of live frames, `PathPlot` draws every
// retained position of every identity onto a clean canvas, so the paths can be
// inspected without the video.
//
// The plot keeps image orientation (origin top-left, y grows downwards) so a
// point on the plot sits where it sat in the video. Each observed position is a
// filled dot in the identity's color; each point where an identity went
// missing gets a red cross at its last known position.

use crate::core_modules::annotator::draw_cross;
use crate::core_modules::detection::{Color, Point};
use crate::core_modules::trajectory::{TrackEntry, TrajectoryStore};
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::Result;
use ab_glyph::FontArc;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::path::Path;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const GRID: Rgb<u8> = Rgb([220, 220, 220]);
const AXIS: Rgb<u8> = Rgb([0, 0, 0]);
const MISSING: Color = Color::new(255, 0, 0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotConfig {
    /// Blank border around the data area, where the title and axis labels go.
    pub margin: u32,
    /// Grid spacing in frame pixels. 0 disables the grid.
    pub grid_step: u32,
    pub marker_radius: i32,
    pub title: String,
    pub font_scale: f32,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            margin: 40,
            grid_step: 50,
            marker_radius: 3,
            title: "Plot of paths".to_string(),
            font_scale: 18.0,
        }
    }
}

pub struct PathPlot {
    config: PlotConfig,
    font: Option<FontArc>,
    frame_size: Option<(u32, u32)>,
}

impl PathPlot {
    pub fn new(config: PlotConfig) -> Self {
        Self {
            config,
            font: None,
            frame_size: None,
        }
    }

    pub fn with_font(mut self, font: Option<FontArc>) -> Self {
        self.font = font;
        self
    }

    /// Fixes the data area to the video resolution. Without it the area is
    /// fitted to the largest plotted coordinate.
    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_size = Some((width, height));
        self
    }

    pub fn render(&self, stores: &[&TrajectoryStore]) -> RgbImage {
        let (width, height) = self.frame_size.unwrap_or_else(|| fitted_extent(stores));
        let margin = self.config.margin;
        let mut canvas = RgbImage::from_pixel(width + 2 * margin, height + 2 * margin, BACKGROUND);

        // --- 1. Grid & Axes ---
        let step = self.config.grid_step;
        if step > 0 {
            for x in (0..=width).step_by(step as usize) {
                let a = self.to_canvas(Point::new(x as i32, 0));
                let b = self.to_canvas(Point::new(x as i32, height as i32));
                draw_line_segment_mut(&mut canvas, (a.x as f32, a.y as f32), (b.x as f32, b.y as f32), GRID);
            }
            for y in (0..=height).step_by(step as usize) {
                let a = self.to_canvas(Point::new(0, y as i32));
                let b = self.to_canvas(Point::new(width as i32, y as i32));
                draw_line_segment_mut(&mut canvas, (a.x as f32, a.y as f32), (b.x as f32, b.y as f32), GRID);
            }
        }
        draw_hollow_rect_mut(
            &mut canvas,
            Rect::at(margin as i32 - 1, margin as i32 - 1).of_size(width + 2, height + 2),
            AXIS,
        );

        // --- 2. Observed Positions ---
        for store in stores {
            for trajectory in store.iter() {
                let color = trajectory.key().color().to_rgb();
                for sample in trajectory.samples() {
                    if let TrackEntry::Seen(point) = sample.entry {
                        let p = self.to_canvas(point);
                        draw_filled_circle_mut(&mut canvas, (p.x, p.y), self.config.marker_radius, color);
                    }
                }
            }
        }

        // --- 3. Missing Markers ---
        // Drawn last so they stay visible on top of dense paths.
        for store in stores {
            for trajectory in store.iter() {
                for (_, point) in trajectory.missing_markers() {
                    self.mark_missing(&mut canvas, self.to_canvas(point));
                }
            }
        }

        // --- 4. Labels ---
        if let Some(font) = &self.font {
            let scale = self.config.font_scale;
            let text = AXIS;
            let m = margin as i32;
            draw_text_mut(&mut canvas, text, m, (m - scale as i32) / 2, scale, font, &self.config.title);
            draw_text_mut(&mut canvas, text, m + width as i32 / 2, m + height as i32 + 4, scale, font, "X");
            draw_text_mut(&mut canvas, text, m / 3, m + height as i32 / 2, scale, font, "Y");
        }

        canvas
    }

    pub fn save(&self, path: &Path, stores: &[&TrajectoryStore]) -> Result<()> {
        image_helper::save(path, &self.render(stores))
    }

    fn to_canvas(&self, point: Point) -> Point {
        let m = self.config.margin as i32;
        Point::new(point.x + m, point.y + m)
    }

    fn mark_missing(&self, canvas: &mut RgbImage, at: Point) {
        draw_cross(canvas, at, self.config.marker_radius + 2, MISSING.to_rgb());
    }
}

/// The smallest area holding every observed position, at least 1x1.
fn fitted_extent(stores: &[&TrajectoryStore]) -> (u32, u32) {
    let mut extent = (1u32, 1u32);
    for store in stores {
        for trajectory in store.iter() {
            for point in trajectory.positions().flatten() {
                extent.0 = extent.0.max(point.x.max(0) as u32 + 1);
                extent.1 = extent.1.max(point.y.max(0) as u32 + 1);
            }
        }
    }
    extent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection::ShapeKind;
    use crate::core_modules::identity::ObjectKey;
    use crate::core_modules::trajectory::RetentionPolicy;

    fn config() -> PlotConfig {
        PlotConfig {
            margin: 10,
            grid_step: 0,
            ..Default::default()
        }
    }

    #[test]
    fn empty_session_renders_a_blank_framed_canvas() {
        let store = TrajectoryStore::new(ShapeKind::Circle, RetentionPolicy::Unbounded);
        let canvas = PathPlot::new(config()).with_frame_size(64, 48).render(&[&store]);

        assert_eq!(canvas.dimensions(), (84, 68));
        assert_eq!(*canvas.get_pixel(40, 30), BACKGROUND);
        assert_eq!(*canvas.get_pixel(9, 9), AXIS);
    }

    #[test]
    fn observed_positions_are_drawn_in_the_identity_color() {
        let color = Color::new(10, 120, 230);
        let mut store = TrajectoryStore::new(ShapeKind::Circle, RetentionPolicy::Unbounded);
        store.observe(ObjectKey::from_color(color), 0, Point::new(20, 30));

        let canvas = PathPlot::new(config()).with_frame_size(100, 80).render(&[&store]);
        assert_eq!(*canvas.get_pixel(30, 40), color.to_rgb());
    }

    #[test]
    fn missing_identities_get_a_red_cross_at_the_last_position() {
        let color = Color::new(0, 0, 255);
        let key = ObjectKey::from_color(color);
        let mut rectangles = TrajectoryStore::new(ShapeKind::Rectangle, RetentionPolicy::Unbounded);
        rectangles.observe(key, 0, Point::new(50, 40));
        rectangles.mark_absent(key, 1);
        let circles = TrajectoryStore::new(ShapeKind::Circle, RetentionPolicy::Unbounded);

        let canvas = PathPlot::new(config()).with_frame_size(100, 80).render(&[&circles, &rectangles]);
        // the cross passes through the marker center
        assert_eq!(*canvas.get_pixel(60, 50), Rgb([255, 0, 0]));
        // and its arms reach past the dot
        let arm = config().marker_radius + 1;
        assert_eq!(*canvas.get_pixel((60 + arm) as u32, (50 + arm) as u32), Rgb([255, 0, 0]));
    }

    #[test]
    fn canvas_fits_the_data_without_a_frame_size() {
        let mut store = TrajectoryStore::new(ShapeKind::Circle, RetentionPolicy::Unbounded);
        store.observe(ObjectKey::from_color(Color::new(1, 1, 1)), 0, Point::new(99, 19));
        let canvas = PathPlot::new(config()).render(&[&store]);
        assert_eq!(canvas.dimensions(), (120, 40));
    }

    #[test]
    fn save_writes_a_png() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("paths.png");
        let store = TrajectoryStore::new(ShapeKind::Circle, RetentionPolicy::Unbounded);
        PathPlot::new(PlotConfig::default())
            .with_frame_size(32, 32)
            .save(&path, &[&store])
            .expect("saved");

        let reloaded = image_helper::load(&path).expect("loaded");
        assert_eq!(reloaded.dimensions(), (112, 112));
    }
}
