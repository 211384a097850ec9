//! rollcall-core — Face attendance engine.
//!
//! SCRFD detection and ArcFace signatures via ONNX Runtime, a nearest-neighbor
//! matcher over a directory of known faces, a once-per-session attendance
//! ledger and the frame sampling pipeline that ties them together.

pub mod alignment;
pub mod annotate;
pub mod config;
pub mod detector;
pub mod extractor;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod registry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    default_model_dir, Config, ConfigError, DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE,
};
pub use extractor::{EuclideanMetric, ExtractorError, FaceExtractor, Metric, OnnxExtractor};
pub use ledger::{AttendanceLedger, AttendanceRecord, LedgerError, RecordOutcome};
pub use matcher::NearestMatcher;
pub use pipeline::{
    DisplaySink, FrameSource, Pipeline, PipelineError, PipelineState, SourceError, SourceOpener,
    TickOutcome, TickReport,
};
pub use registry::{Registry, RegistryEntry, RegistryError};
pub use types::{BoundingBox, Detection, FaceMatch, Frame, Identity, MatchResult, Signature};
