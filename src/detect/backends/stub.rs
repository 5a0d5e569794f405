use std::collections::VecDeque;

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BBox, Detection, Thresholds};
use crate::frame::Frame;

/// Scripted backend for tests and demos.
///
/// Plays back a queue of per-frame results, then keeps returning `fallback`.
/// `StubBackend::new()` reports one person in the middle of every frame.
pub struct StubBackend {
    script: VecDeque<Vec<Detection>>,
    fallback: Option<Vec<Detection>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: None,
        }
    }

    /// Returns `detections` for every frame.
    pub fn repeating(detections: Vec<Detection>) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Some(detections),
        }
    }

    /// Returns each entry of `frames` once, in order, then nothing.
    pub fn scripted(frames: Vec<Vec<Detection>>) -> Self {
        Self {
            script: frames.into(),
            fallback: Some(Vec::new()),
        }
    }

    fn centered_person(frame: &Frame) -> Detection {
        let (w, h) = (frame.width() as i32, frame.height() as i32);
        Detection::person(BBox::new(w / 3, h / 4, 2 * w / 3, 3 * h / 4), 0.9)
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame, thresholds: &Thresholds) -> Result<Vec<Detection>> {
        let detections = match self.script.pop_front() {
            Some(next) => next,
            None => match &self.fallback {
                Some(fallback) => fallback.clone(),
                None => vec![Self::centered_person(frame)],
            },
        };
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= thresholds.confidence)
            .collect())
    }
}
