use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BBox, Detection, Thresholds};
use crate::frame::Frame;

/// Per-pixel luma change that counts as motion.
const DIFF_THRESHOLD: u8 = 25;
/// Fewer changed pixels than this is treated as sensor noise.
const MIN_CHANGED_PIXELS: usize = 16;

/// CPU backend: frame differencing against the previous frame.
///
/// Reports at most one detection per frame, the bounding box of every changed
/// pixel. Confidence grows with how densely the box is filled.
#[derive(Default)]
pub struct MotionBackend {
    last_hash: Option<[u8; 32]>,
    last_luma: Option<(u32, u32, Vec<u8>)>,
}

impl MotionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame, thresholds: &Thresholds) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let unchanged = self.last_hash == Some(current_hash);
        self.last_hash = Some(current_hash);
        if unchanged {
            return Ok(Vec::new());
        }

        let (width, height) = (frame.width(), frame.height());
        let luma = to_luma(frame.pixels());
        let previous = self.last_luma.replace((width, height, luma));
        let Some((prev_w, prev_h, prev_luma)) = previous else {
            return Ok(Vec::new());
        };
        if (prev_w, prev_h) != (width, height) {
            return Ok(Vec::new());
        }
        let Some((_, _, luma)) = self.last_luma.as_ref() else {
            return Ok(Vec::new());
        };

        let mut changed = 0usize;
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        for (i, (&a, &b)) in prev_luma.iter().zip(luma.iter()).enumerate() {
            if a.abs_diff(b) <= DIFF_THRESHOLD {
                continue;
            }
            let x = (i % width as usize) as u32;
            let y = (i / width as usize) as u32;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            changed += 1;
        }

        if changed < MIN_CHANGED_PIXELS {
            return Ok(Vec::new());
        }

        let box_area = ((max_x - min_x + 1) as usize) * ((max_y - min_y + 1) as usize);
        let fill = changed as f32 / box_area as f32;
        let confidence = (0.5 + 0.5 * fill).min(1.0);
        if confidence < thresholds.confidence {
            return Ok(Vec::new());
        }

        let bbox = BBox::new(min_x as i32, min_y as i32, max_x as i32, max_y as i32);
        Ok(vec![Detection::person(bbox, confidence)])
    }
}

fn to_luma(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|px| {
            let y = 299 * u32::from(px[0]) + 587 * u32::from(px[1]) + 114 * u32::from(px[2]);
            (y / 1000) as u8
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_block(x: u32, y: u32, size: u32) -> Frame {
        let mut frame = Frame::filled(64, 48, [10, 10, 10]);
        frame.fill_rect(x, y, size, size, [250, 250, 250]);
        frame
    }

    #[test]
    fn first_and_repeated_frames_yield_nothing() {
        let mut backend = MotionBackend::new();
        let thresholds = Thresholds::default();
        let frame = with_block(5, 5, 8);

        assert!(backend.detect(&frame, &thresholds).unwrap().is_empty());
        assert!(backend.detect(&frame, &thresholds).unwrap().is_empty());
    }

    #[test]
    fn moving_block_is_boxed() {
        let mut backend = MotionBackend::new();
        let thresholds = Thresholds::default();

        backend
            .detect(&Frame::filled(64, 48, [10, 10, 10]), &thresholds)
            .unwrap();
        let dets = backend.detect(&with_block(20, 10, 8), &thresholds).unwrap();

        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, BBox::new(20, 10, 27, 17));
        assert_eq!(dets[0].confidence, 1.0);
        assert_eq!(dets[0].class_id, crate::detect::PERSON_CLASS_ID);
    }

    #[test]
    fn sparse_change_falls_below_threshold() {
        let mut backend = MotionBackend::new();
        backend
            .detect(&Frame::filled(64, 48, [10, 10, 10]), &Thresholds::default())
            .unwrap();

        // Two small blocks in opposite corners: a huge, mostly empty box.
        let mut frame = Frame::filled(64, 48, [10, 10, 10]);
        frame.fill_rect(0, 0, 4, 4, [250, 250, 250]);
        frame.fill_rect(60, 44, 4, 4, [250, 250, 250]);

        let strict = Thresholds {
            confidence: 0.9,
            iou: 0.45,
        };
        assert!(backend.detect(&frame, &strict).unwrap().is_empty());
    }

    #[test]
    fn single_pixel_noise_is_ignored() {
        let mut backend = MotionBackend::new();
        backend
            .detect(&Frame::filled(16, 16, [10, 10, 10]), &Thresholds::default())
            .unwrap();
        let mut frame = Frame::filled(16, 16, [10, 10, 10]);
        frame.fill_rect(3, 3, 1, 1, [255, 255, 255]);
        assert!(backend
            .detect(&frame, &Thresholds::default())
            .unwrap()
            .is_empty());
    }
}
