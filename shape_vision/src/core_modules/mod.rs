// Shape Detection Layer
pub mod circle_detector;
pub mod detection;
pub mod rectangle_detector;
pub mod shape_detector;

// Identity Layer
pub mod identity;
pub mod tracker;
pub mod trajectory;

// Presentation
pub mod annotator;
pub mod plot;

pub mod utils;
