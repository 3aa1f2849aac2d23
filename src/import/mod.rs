//! Import lifecycle: upload intake, the staged pipeline, and the review surface.
//!
//! An import moves `UPLOADING → PROCESSING → READY_FOR_REVIEW → CONFIRMED`, or to `FAILED`
//! from any non-terminal status. [`ImportPipeline`] is the only writer of import state.
mod locks;
mod mappers;
mod pipeline;
mod types;

pub use locks::{ImportLease, ImportLocks};
pub use pipeline::ImportPipeline;
pub use types::{ImportError, ImportReview, StageFailure, StepReport, UploadRequest};
