pub mod stub;

#[cfg(feature = "backend-tract")]
mod labels;
#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use labels::{coco_label, COCO_LABELS};
#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
