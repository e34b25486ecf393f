//! Core data model shared by every component (spec.md §3).

mod frame;
mod policy;
mod session_descriptor;

pub use frame::{AudioFrame, BYTES_PER_FRAME, FRAME_DURATION_MS, SAMPLES_PER_FRAME, SAMPLE_RATE_HZ};
pub use policy::{CatalogEntry, PolicyCatalogDocument, PolicyParameters, PolicyVariant};
pub use session_descriptor::{BackendKind, SessionDescriptor};
