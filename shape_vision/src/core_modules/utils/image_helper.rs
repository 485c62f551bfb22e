// Small frame utilities shared by the detectors, the annotator and the plot.

pub mod image_helper {
    use crate::core_modules::detection::{Color, Point};
    use crate::error::Result;
    use image::{GrayImage, RgbImage};
    use std::path::Path;

    /// Converts a color frame to single-channel intensity and smooths it.
    /// Both detectors start from this image.
    pub fn smoothed_intensity(frame: &RgbImage, sigma: f32) -> GrayImage {
        let gray = image::imageops::grayscale(frame);
        if sigma > 0.0 {
            imageproc::filter::gaussian_blur_f32(&gray, sigma)
        } else {
            gray
        }
    }

    /// Reads the color under `point`, or `None` when it lies outside the frame.
    pub fn sample_color(frame: &RgbImage, point: Point) -> Option<Color> {
        if point.x < 0 || point.y < 0 {
            return None;
        }
        let (x, y) = (point.x as u32, point.y as u32);
        if x >= frame.width() || y >= frame.height() {
            return None;
        }
        Some(Color::from(*frame.get_pixel(x, y)))
    }

    pub fn load(path: &Path) -> Result<RgbImage> {
        Ok(image::open(path)?.to_rgb8())
    }

    pub fn save(path: &Path, frame: &RgbImage) -> Result<()> {
        frame.save(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::image_helper::*;
    use crate::core_modules::detection::{Color, Point};
    use image::{Rgb, RgbImage};

    #[test]
    fn sample_color_is_bounds_checked() {
        let mut frame = RgbImage::new(4, 3);
        frame.put_pixel(3, 2, Rgb([10, 20, 30]));

        assert_eq!(sample_color(&frame, Point::new(3, 2)), Some(Color::new(10, 20, 30)));
        assert_eq!(sample_color(&frame, Point::new(4, 2)), None);
        assert_eq!(sample_color(&frame, Point::new(-1, 0)), None);
    }

    #[test]
    fn uniform_frame_stays_uniform_after_smoothing() {
        let frame = RgbImage::from_pixel(20, 20, Rgb([90, 90, 90]));
        let smoothed = smoothed_intensity(&frame, 2.0);
        assert!(smoothed.pixels().all(|p| p.0[0].abs_diff(90) <= 1));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frame.png");
        let frame = RgbImage::from_pixel(8, 6, Rgb([1, 2, 3]));

        save(&path, &frame).expect("Error Saving File.");
        let loaded = load(&path).expect("Error Loading File.");
        assert_eq!(loaded, frame);
    }
}
