mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{MotionBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{BackendFactory, Detector, ModelInfo};
pub use result::{BBox, Detection, Thresholds, PERSON_CLASS_ID};
