use anyhow::Result;

use crate::frame::Frame;

use super::result::{Detection, Thresholds};

/// Detector backend trait.
///
/// A backend holds whatever model state it needs between calls (previous frame,
/// loaded network). It is driven from the monitoring thread only, behind the
/// `Detector` lock, so it need not be `Sync`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame, returning boxes in frame pixel coordinates.
    ///
    /// Detections below `thresholds.confidence` must be dropped by the backend.
    fn detect(&mut self, frame: &Frame, thresholds: &Thresholds) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
