//! Decoded video frames.
//!
//! A `Frame` owns tightly packed RGB8 pixels. Sources hand frames out as
//! `Arc<Frame>` so the monitoring loop, the detector and the snapshot writer
//! can share one decode without copying.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::{Duration, Instant};

use crate::detect::BBox;

const ANNOTATION_COLOR: [u8; 3] = [255, 0, 0];
const ANNOTATION_THICKNESS: i32 = 2;

#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    captured_at: Instant,
}

impl Frame {
    /// Wrap packed RGB8 pixels. `pixels.len()` must equal `width * height * 3`.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Solid-color frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let count = (width as usize) * (height as usize);
        let mut pixels = Vec::with_capacity(count * 3);
        for _ in 0..count {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            pixels,
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Paint a rectangle, clipped to the frame.
    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, rgb: [u8; 3]) {
        let x_end = x.saturating_add(w).min(self.width);
        let y_end = y.saturating_add(h).min(self.height);
        for row in y.min(self.height)..y_end {
            for col in x.min(self.width)..x_end {
                let idx = ((row as usize) * (self.width as usize) + col as usize) * 3;
                self.pixels[idx..idx + 3].copy_from_slice(&rgb);
            }
        }
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Copy of the frame with `bbox` outlined in red.
    pub fn annotated(&self, bbox: &BBox) -> Result<RgbImage> {
        let mut image = self.to_rgb_image()?;
        draw_rect_outline(&mut image, bbox, ANNOTATION_COLOR, ANNOTATION_THICKNESS);
        Ok(image)
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn draw_rect_outline(image: &mut RgbImage, bbox: &BBox, rgb: [u8; 3], thickness: i32) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
        return;
    }
    let mut put = |x: i32, y: i32| {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            image.put_pixel(x as u32, y as u32, image::Rgb(rgb));
        }
    };
    for t in 0..thickness {
        for x in bbox.x1..=bbox.x2 {
            put(x, bbox.y1 + t);
            put(x, bbox.y2 - t);
        }
        for y in bbox.y1..=bbox.y2 {
            put(bbox.x1 + t, y);
            put(bbox.x2 - t, y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_wrong_buffer_length() {
        assert!(Frame::new(vec![0; 10], 2, 2).is_err());
        let frame = Frame::new(vec![7; 12], 2, 2).unwrap();
        assert_eq!(frame.pixels().len(), 12);
    }

    #[test]
    fn fill_rect_is_clipped() {
        let mut frame = Frame::filled(4, 4, [0, 0, 0]);
        frame.fill_rect(2, 2, 10, 10, [9, 9, 9]);
        let image = frame.to_rgb_image().unwrap();
        assert_eq!(image.get_pixel(3, 3).0, [9, 9, 9]);
        assert_eq!(image.get_pixel(1, 1).0, [0, 0, 0]);
    }

    #[test]
    fn annotation_outlines_bbox_only() {
        let frame = Frame::filled(20, 20, [0, 0, 0]);
        let image = frame.annotated(&BBox::new(5, 5, 14, 14)).unwrap();
        assert_eq!(image.get_pixel(5, 5).0, ANNOTATION_COLOR);
        assert_eq!(image.get_pixel(6, 10).0, ANNOTATION_COLOR);
        assert_eq!(image.get_pixel(14, 14).0, ANNOTATION_COLOR);
        assert_eq!(image.get_pixel(10, 10).0, [0, 0, 0]);
        // Source frame is untouched.
        assert_eq!(frame.to_rgb_image().unwrap().get_pixel(5, 5).0, [0, 0, 0]);
    }

    #[test]
    fn annotation_tolerates_out_of_frame_boxes() {
        let frame = Frame::filled(8, 8, [0, 0, 0]);
        let image = frame.annotated(&BBox::new(-5, -5, 20, 20)).unwrap();
        assert_eq!(image.get_pixel(4, 4).0, [0, 0, 0]);
    }
}
