// THEORY:
// The `detection` module holds the output of the Shape Detection Layer. A
// `Detection` is one shape found in one frame: where it is, how large it is,
// and what color it is at its center.
//
// Key architectural principles:
// 1.  **Stateless Data Container**: A `Detection` is a snapshot. It has no
//     memory of previous frames and is consumed by the identity layer as soon
//     as the frame has been analysed.
// 2.  **Shared Shape Vocabulary**: Both detectors (circles and rectangles)
//     produce the same struct. The `ShapeKind` and `Extent` fields carry the
//     per-algorithm differences, so everything downstream can be written once.
// 3.  **Color as Signature**: The sampled center color is the only feature
//     carried across frames. The identity layer derives object keys from it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A pixel coordinate in frame space. Signed so overlays may run off-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

/// An 8-bit RGB sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_rgb(self) -> image::Rgb<u8> {
        image::Rgb([self.r, self.g, self.b])
    }
}

impl From<image::Rgb<u8>> for Color {
    fn from(pixel: image::Rgb<u8>) -> Self {
        let [r, g, b] = pixel.0;
        Self { r, g, b }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.r, self.g, self.b)
    }
}

/// Which detector produced a detection. Each kind is tracked in its own store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    Circle,
    Rectangle,
}

impl ShapeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ShapeKind::Circle => "Circle",
            ShapeKind::Rectangle => "Rectangle",
        }
    }
}

/// The size of a detected shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extent {
    Radius(u32),
    /// Axis-aligned bounding box size; `Detection::position` is its center.
    Box { width: u32, height: u32 },
}

/// One shape found in one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub kind: ShapeKind,
    /// The shape's center in pixel coordinates.
    pub position: Point,
    pub extent: Extent,
    /// The frame color sampled at `position`, before any overlay was drawn.
    pub color: Color,
}

impl Detection {
    /// The text drawn next to the shape, e.g. `Circle (255, 0, 0)`.
    pub fn label(&self) -> String {
        format!("{} {}", self.kind.label(), self.color)
    }

    /// Top-left corner of the region the shape covers.
    pub fn top_left(&self) -> Point {
        match self.extent {
            Extent::Radius(r) => Point::new(self.position.x - r as i32, self.position.y - r as i32),
            Extent::Box { width, height } => Point::new(
                self.position.x - (width / 2) as i32,
                self.position.y - (height / 2) as i32,
            ),
        }
    }
}
