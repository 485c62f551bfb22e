// THEORY:
// The `annotator` is the presentation layer. It never decides anything; it only
// draws what the detectors and the trajectory stores already know.
//
// Two kinds of overlays are produced:
// 1.  **Detection Overlays**: per frame, per shape. The outline in the accent
//     color, a center marker for circles, and a text label in the color that
//     was sampled from the shape itself.
// 2.  **Trajectory Overlays**: per identity, the whole retained history. A ring
//     at each observed position, a line joining consecutive observations
//     (lines bridge across absences), a filled marker at the latest position,
//     and a missing marker wherever an identity dropped out: a cross at the
//     last known position, captioned "Missing object".
//
// Text needs a font. Fonts are optional: without one, every overlay except
// the text is still drawn, so a dropped identity is always marked.

use crate::core_modules::detection::{Color, Detection, Extent, Point};
use crate::core_modules::trajectory::{TrackEntry, TrajectoryStore};
use crate::error::Result;
use ab_glyph::FontArc;
use image::RgbImage;
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut,
};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MISSING_LABEL: &str = "Missing object";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// TrueType/OpenType font for labels. No font, no text.
    pub font_path: Option<PathBuf>,
    /// Text height in pixels.
    pub font_scale: f32,
    pub outline_color: Color,
    pub center_color: Color,
    pub missing_color: Color,
    pub circle_thickness: u32,
    pub rectangle_thickness: u32,
    pub marker_radius: i32,
    pub line_thickness: u32,
    pub draw_detections: bool,
    pub draw_trajectories: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            font_scale: 16.0,
            outline_color: Color::new(255, 128, 0),
            center_color: Color::new(255, 0, 0),
            missing_color: Color::new(255, 0, 0),
            circle_thickness: 4,
            rectangle_thickness: 2,
            marker_radius: 5,
            line_thickness: 2,
            draw_detections: true,
            draw_trajectories: true,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.font_scale > 0.0) {
            return Err(format!("font_scale must be positive, got {}", self.font_scale));
        }
        if self.marker_radius < 1 {
            return Err(format!("marker_radius must be at least 1, got {}", self.marker_radius));
        }
        if self.circle_thickness == 0 || self.rectangle_thickness == 0 || self.line_thickness == 0 {
            return Err("overlay thicknesses must be at least 1".to_string());
        }
        Ok(())
    }
}

pub struct Annotator {
    config: RenderConfig,
    font: Option<FontArc>,
}

impl Annotator {
    /// Builds an annotator, loading the configured font if there is one.
    pub fn new(config: RenderConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => Some(load_font(path)?),
            None => None,
        };
        Ok(Self { config, font })
    }

    pub fn with_font(config: RenderConfig, font: Option<FontArc>) -> Self {
        Self { config, font }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn font(&self) -> Option<&FontArc> {
        self.font.as_ref()
    }

    pub fn draw_detections(&self, frame: &mut RgbImage, detections: &[Detection]) {
        if !self.config.draw_detections {
            return;
        }
        for detection in detections {
            self.draw_detection(frame, detection);
        }
    }

    pub fn draw_detection(&self, frame: &mut RgbImage, detection: &Detection) {
        let outline = self.config.outline_color.to_rgb();
        let Point { x, y } = detection.position;
        match detection.extent {
            Extent::Radius(radius) => {
                draw_thick_circle(frame, detection.position, radius as i32, self.config.circle_thickness, outline);
                draw_filled_circle_mut(frame, (x, y), self.config.marker_radius, self.config.center_color.to_rgb());
            }
            Extent::Box { width, height } => {
                let corner = detection.top_left();
                draw_thick_rect(frame, corner, width, height, self.config.rectangle_thickness, outline);
            }
        }

        let corner = detection.top_left();
        let anchor = Point::new(corner.x, corner.y - self.config.font_scale.ceil() as i32 - 2);
        self.draw_text(frame, anchor, detection.color, &detection.label());
    }

    /// Draws the retained history of every identity in the store, in store order.
    pub fn draw_trajectories(&self, frame: &mut RgbImage, store: &TrajectoryStore) {
        if !self.config.draw_trajectories {
            return;
        }
        let radius = self.config.marker_radius;
        for trajectory in store.iter() {
            let color = trajectory.key().color();
            let pixel = color.to_rgb();

            let mut previous: Option<Point> = None;
            for sample in trajectory.samples() {
                if let TrackEntry::Seen(point) = sample.entry {
                    draw_hollow_circle_mut(frame, (point.x, point.y), radius, pixel);
                    if let Some(from) = previous {
                        draw_thick_line(frame, from, point, self.config.line_thickness, pixel);
                    }
                    previous = Some(point);
                }
            }

            if let Some(last) = trajectory.last_seen() {
                draw_filled_circle_mut(frame, (last.x, last.y), radius, pixel);
            }

            for (_, point) in trajectory.missing_markers() {
                draw_cross(frame, point, radius + 2, self.config.missing_color.to_rgb());
                self.draw_text(frame, point, color, MISSING_LABEL);
            }
        }
    }

    fn draw_text(&self, frame: &mut RgbImage, at: Point, color: Color, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(frame, color.to_rgb(), at.x, at.y, self.config.font_scale, font, text);
        }
    }
}

pub fn load_font(path: &Path) -> Result<FontArc> {
    let bytes = std::fs::read(path)?;
    let font = FontArc::try_from_vec(bytes)?;
    debug!(path = %path.display(), "loaded label font");
    Ok(font)
}

/// Two-pixel wide diagonal cross reaching `arm` pixels out from `at` along each axis.
pub(crate) fn draw_cross(frame: &mut RgbImage, at: Point, arm: i32, color: image::Rgb<u8>) {
    let arm = arm as f32;
    let (x, y) = (at.x as f32, at.y as f32);
    for offset in [0.0, 1.0] {
        draw_line_segment_mut(frame, (x - arm + offset, y - arm), (x + arm + offset, y + arm), color);
        draw_line_segment_mut(frame, (x - arm + offset, y + arm), (x + arm + offset, y - arm), color);
    }
}

/// Concentric rings centered on the nominal radius.
fn draw_thick_circle(frame: &mut RgbImage, center: Point, radius: i32, thickness: u32, color: image::Rgb<u8>) {
    let thickness = thickness as i32;
    for t in 0..thickness {
        let r = radius - thickness / 2 + t;
        if r > 0 {
            draw_hollow_circle_mut(frame, (center.x, center.y), r, color);
        }
    }
}

/// Nested rectangles growing outwards from the nominal box.
fn draw_thick_rect(frame: &mut RgbImage, corner: Point, width: u32, height: u32, thickness: u32, color: image::Rgb<u8>) {
    for t in 0..thickness {
        let rect = Rect::at(corner.x - t as i32, corner.y - t as i32).of_size(width.max(1) + 2 * t, height.max(1) + 2 * t);
        draw_hollow_rect_mut(frame, rect, color);
    }
}

fn draw_thick_line(frame: &mut RgbImage, from: Point, to: Point, thickness: u32, color: image::Rgb<u8>) {
    for t in 0..thickness as i32 {
        for (dx, dy) in [(t, 0), (0, t)] {
            draw_line_segment_mut(
                frame,
                ((from.x + dx) as f32, (from.y + dy) as f32),
                ((to.x + dx) as f32, (to.y + dy) as f32),
                color,
            );
        }
    }
}
