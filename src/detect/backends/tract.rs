#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BBox, Detection, Thresholds, PERSON_CLASS_ID};
use crate::frame::Frame;

/// Rows before the class scores in a YOLOv8 output: cx, cy, w, h.
const BOX_ROWS: usize = 4;

/// Tract-based backend for YOLOv8-style ONNX person detection.
///
/// The model is expected to take a `1x3xHxW` float input in `[0, 1]` and emit
/// `1x(4+C)xN` candidates in input pixel space. Only the person class is kept.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    model_path: PathBuf,
    input_width: u32,
    input_height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_width: u32, input_height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            model_path: model_path.to_path_buf(),
            input_width,
            input_height,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let resized = image::imageops::resize(
            &frame.to_rgb_image()?,
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, self.input_width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        frame: &Frame,
        thresholds: &Thresholds,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not [1, 4+C, N]")?;

        let rows = view.shape()[1];
        let class_row = BOX_ROWS + PERSON_CLASS_ID as usize;
        if rows <= class_row {
            return Err(anyhow!("model output has {} rows, no person scores", rows));
        }

        let sx = frame.width() as f32 / self.input_width as f32;
        let sy = frame.height() as f32 / self.input_height as f32;
        let max_x = frame.width() as f32 - 1.0;
        let max_y = frame.height() as f32 - 1.0;

        let mut candidates = Vec::new();
        for i in 0..view.shape()[2] {
            let score = view[[0, class_row, i]];
            if !score.is_finite() || score < thresholds.confidence {
                continue;
            }
            let (cx, cy) = (view[[0, 0, i]], view[[0, 1, i]]);
            let (w, h) = (view[[0, 2, i]], view[[0, 3, i]]);
            let x1 = ((cx - w / 2.0) * sx).clamp(0.0, max_x);
            let y1 = ((cy - h / 2.0) * sy).clamp(0.0, max_y);
            let x2 = ((cx + w / 2.0) * sx).clamp(0.0, max_x);
            let y2 = ((cy + h / 2.0) * sy).clamp(0.0, max_y);
            let bbox = BBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32);
            candidates.push(Detection::person(bbox, score.min(1.0)));
        }

        Ok(non_max_suppression(candidates, thresholds.iou))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn detect(&mut self, frame: &Frame, thresholds: &Thresholds) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .with_context(|| format!("ONNX inference failed ({})", self.model_path.display()))?;
        self.decode(outputs, frame, thresholds)
    }
}

/// Greedy NMS: keep the most confident box, drop everything overlapping it by
/// more than `iou_threshold`, repeat.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let strong = Detection::person(BBox::new(0, 0, 100, 100), 0.9);
        let shadow = Detection::person(BBox::new(5, 5, 100, 100), 0.6);
        let other = Detection::person(BBox::new(200, 200, 260, 260), 0.7);

        let kept = non_max_suppression(vec![shadow, other.clone(), strong.clone()], 0.45);
        assert_eq!(kept, vec![strong, other]);
    }
}
