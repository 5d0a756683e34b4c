//! rollcall-core: face localization, description, and roster matching.
//!
//! Everything here is synchronous and self-contained. The daemon wires
//! these pieces to a frame source and serializes access from a dedicated
//! engine thread.

pub mod detector;
pub mod extractor;
pub mod imaging;
pub mod matcher;
pub mod pipeline;
pub mod roster;
pub mod types;

pub use detector::{build_detector, BackendKind, DeepBackendConfig, FaceDetector};
pub use extractor::{DescriptorExtractor, OnnxExtractor};
pub use matcher::DEFAULT_TOLERANCE;
pub use pipeline::{IdentificationPipeline, MultiFacePolicy, PipelineTuning};
pub use roster::RosterStore;
pub use types::{BoundingBox, Descriptor, Identification, RosterEntry, UNKNOWN_NAME};
