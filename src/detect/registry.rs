use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::error::SentinelError;
use crate::frame::Frame;

use super::backend::DetectorBackend;
use super::backends::{MotionBackend, StubBackend};
use super::result::{Detection, Thresholds};

/// Builds a fresh backend instance for a model name.
pub type BackendFactory = Box<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

struct DetectorState {
    active: Option<Box<dyn DetectorBackend>>,
    model_name: Option<String>,
    thresholds: Thresholds,
}

/// Model-name registry plus the single active backend.
///
/// The backend lives behind one `Mutex`: `detect` and `swap_model` are
/// mutually exclusive, so a swap never races an in-flight detection.
pub struct Detector {
    factories: HashMap<String, BackendFactory>,
    state: Mutex<DetectorState>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelInfo {
    pub model: Option<String>,
    pub backend: Option<&'static str>,
    pub loaded: bool,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub available: Vec<String>,
}

impl Detector {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            state: Mutex::new(DetectorState {
                active: None,
                model_name: None,
                thresholds: Thresholds::default(),
            }),
        }
    }

    /// Registry with the built-in `motion` and `stub` backends.
    pub fn with_default_backends() -> Self {
        let mut detector = Self::new();
        detector.register("motion", || Ok(Box::new(MotionBackend::new())));
        detector.register("stub", || Ok(Box::new(StubBackend::new())));
        detector
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Register an ONNX model file under `name`. The file is only read when the
    /// model is swapped in.
    #[cfg(feature = "backend-tract")]
    pub fn register_onnx(
        &mut self,
        name: &str,
        model_path: std::path::PathBuf,
        input_width: u32,
        input_height: u32,
    ) {
        self.register(name, move || {
            Ok(Box::new(super::backends::TractBackend::new(
                &model_path,
                input_width,
                input_height,
            )?))
        });
    }

    /// Names accepted by `swap_model`, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace the active backend.
    ///
    /// The previous backend is dropped before the new one is built. If loading
    /// fails no model is active afterwards and `detect` yields nothing.
    pub fn swap_model(&self, name: &str) -> Result<()> {
        let factory = self.factory_for(name)?;

        let mut state = self.lock()?;
        if let Some(previous) = state.active.take() {
            log::info!("releasing detector backend {}", previous.name());
        }
        state.model_name = None;

        let mut backend = factory()
            .map_err(|e| SentinelError::DetectorUnavailable(format!("{}: {:#}", name, e)))?;
        backend
            .warm_up()
            .map_err(|e| SentinelError::DetectorUnavailable(format!("{}: {:#}", name, e)))?;

        log::info!("detector model {} loaded ({})", name, backend.name());
        state.active = Some(backend);
        state.model_name = Some(name.to_string());
        Ok(())
    }

    /// Update thresholds. Values outside `[0, 1]` are rejected and leave the
    /// current thresholds in place.
    pub fn set_thresholds(&self, confidence: f32, iou: f32) -> Result<()> {
        for (label, value) in [("confidence", confidence), ("iou", iou)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SentinelError::configuration(format!(
                    "{} threshold {} is outside [0, 1]",
                    label, value
                ))
                .into());
            }
        }
        self.lock()?.thresholds = Thresholds { confidence, iou };
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        self.lock()
            .map(|state| state.thresholds)
            .unwrap_or_default()
    }

    /// Detections for `frame`; empty when no model is loaded or the backend
    /// fails. Failures are logged.
    pub fn detect(&self, frame: &Frame) -> Vec<Detection> {
        match self.try_detect(frame) {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!("{}", e);
                Vec::new()
            }
        }
    }

    /// Like `detect`, but backend failures surface as `DetectorUnavailable`.
    pub fn try_detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut state = self.lock()?;
        let thresholds = state.thresholds;
        let Some(backend) = state.active.as_mut() else {
            return Ok(Vec::new());
        };
        backend
            .detect(frame, &thresholds)
            .map_err(|e| SentinelError::DetectorUnavailable(format!("{:#}", e)).into())
    }

    pub fn model_info(&self) -> ModelInfo {
        let available = self.available();
        match self.lock() {
            Ok(state) => ModelInfo {
                model: state.model_name.clone(),
                backend: state.active.as_ref().map(|b| b.name()),
                loaded: state.active.is_some(),
                confidence_threshold: state.thresholds.confidence,
                iou_threshold: state.thresholds.iou,
                available,
            },
            Err(_) => ModelInfo {
                model: None,
                backend: None,
                loaded: false,
                confidence_threshold: 0.0,
                iou_threshold: 0.0,
                available,
            },
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().map(|s| s.active.is_some()).unwrap_or(false)
    }

    /// Drop the active backend.
    pub fn release(&self) {
        if let Ok(mut state) = self.lock() {
            if let Some(backend) = state.active.take() {
                log::info!("detector backend {} released", backend.name());
            }
            state.model_name = None;
        }
    }

    fn factory_for(&self, name: &str) -> Result<&BackendFactory> {
        self.factories.get(name).ok_or_else(|| {
            SentinelError::configuration(format!(
                "unknown detector model '{}' (available: {})",
                name,
                self.available().join(", ")
            ))
            .into()
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, DetectorState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("detector lock poisoned"))
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;

    fn frame() -> Frame {
        Frame::filled(32, 32, [0, 0, 0])
    }

    fn scripted(dets: Vec<Detection>) -> Detector {
        let mut detector = Detector::new();
        detector.register("scripted", move || {
            Ok(Box::new(StubBackend::repeating(dets.clone())))
        });
        detector.register("broken", || Err(anyhow!("weights missing")));
        detector
    }

    #[test]
    fn detect_without_model_is_empty() {
        let detector = Detector::with_default_backends();
        assert!(detector.detect(&frame()).is_empty());
        assert!(!detector.model_info().loaded);
    }

    #[test]
    fn swap_model_loads_and_reports_backend() {
        let det = Detection::person(BBox::new(1, 1, 10, 10), 0.9);
        let detector = scripted(vec![det.clone()]);
        detector.swap_model("scripted").unwrap();

        assert_eq!(detector.detect(&frame()), vec![det]);
        let info = detector.model_info();
        assert_eq!(info.model.as_deref(), Some("scripted"));
        assert_eq!(info.backend, Some("stub"));
    }

    #[test]
    fn unknown_model_is_configuration_error_and_keeps_current() {
        let detector = scripted(Vec::new());
        detector.swap_model("scripted").unwrap();
        let err = detector.swap_model("yolov99").unwrap_err();
        assert!(SentinelError::is_configuration(&err));
        assert!(detector.is_loaded());
    }

    #[test]
    fn failed_load_leaves_no_model() {
        let detector = scripted(Vec::new());
        detector.swap_model("scripted").unwrap();
        assert!(detector.swap_model("broken").is_err());
        assert!(!detector.is_loaded());
        assert!(detector.detect(&frame()).is_empty());
    }

    #[test]
    fn thresholds_outside_unit_interval_are_rejected() {
        let detector = Detector::new();
        detector.set_thresholds(0.3, 0.6).unwrap();

        let err = detector.set_thresholds(1.5, 0.5).unwrap_err();
        assert!(SentinelError::is_configuration(&err));
        assert!(detector.set_thresholds(0.5, -0.1).is_err());
        assert!(detector.set_thresholds(f32::NAN, 0.5).is_err());

        assert_eq!(
            detector.thresholds(),
            Thresholds {
                confidence: 0.3,
                iou: 0.6
            }
        );
    }

    #[test]
    fn backend_thresholds_filter_low_confidence() {
        let detector = scripted(vec![
            Detection::person(BBox::new(0, 0, 5, 5), 0.2),
            Detection::person(BBox::new(5, 5, 9, 9), 0.8),
        ]);
        detector.swap_model("scripted").unwrap();
        detector.set_thresholds(0.5, 0.45).unwrap();
        let dets = detector.detect(&frame());
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].confidence, 0.8);
    }
}
