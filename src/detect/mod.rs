mod backend;
mod backends;
mod normalize;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{StubBackend, DEFAULT_STUB_CLASSES};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use normalize::{normalize, try_normalize, MIN_FLAT_STRIDE};
pub use registry::BackendRegistry;
pub use result::{BoundingBox, DetectionRecord, RawBox, RawDetectorOutput, TableRow};
