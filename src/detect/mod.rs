mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::{coco_label, TractBackend, COCO_LABELS};
pub use backends::StubBackend;
pub use registry::BackendRegistry;
pub use result::{non_max_suppression, BoundingBox, Detection};
