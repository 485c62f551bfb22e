pub mod geometry;
pub mod image_helper;
