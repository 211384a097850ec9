//! Face signature extraction capability.
//!
//! The pipeline and registry only see the [`FaceExtractor`] trait; the
//! ONNX-backed [`OnnxExtractor`] is the production implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Detection, Frame, Signature};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Distance between two signatures. Must behave as a metric.
pub trait Metric {
    fn distance(&self, a: &Signature, b: &Signature) -> f32;
}

/// Plain Euclidean distance over the signature components.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMetric;

impl Metric for EuclideanMetric {
    fn distance(&self, a: &Signature, b: &Signature) -> f32 {
        a.euclidean_distance(b)
    }
}

/// Detect faces in a frame and turn each into a signature.
pub trait FaceExtractor: Metric {
    /// Every face in a live frame, with its signature.
    fn detect_and_encode(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractorError>;

    /// Signature of the most prominent face in a reference image, if any.
    fn encode_single(&mut self, image: &Frame) -> Result<Option<Signature>, ExtractorError> {
        Ok(self
            .detect_and_encode(image)?
            .into_iter()
            .next()
            .map(|d| d.signature))
    }
}

/// SCRFD detection + ArcFace recognition via ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models. Fails fast if either file is missing or invalid.
    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl Metric for OnnxExtractor {
    fn distance(&self, a: &Signature, b: &Signature) -> f32 {
        EuclideanMetric.distance(a, b)
    }
}

impl FaceExtractor for OnnxExtractor {
    fn detect_and_encode(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractorError> {
        let faces = self.detector.detect(frame)?;
        let mut detections = Vec::with_capacity(faces.len());
        for face in faces {
            let signature = self.recognizer.extract(frame, &face)?;
            detections.push(Detection {
                region: face,
                signature,
            });
        }
        Ok(detections)
    }

    fn encode_single(&mut self, image: &Frame) -> Result<Option<Signature>, ExtractorError> {
        // Detector output is sorted by confidence; only the best face is encoded.
        let faces = self.detector.detect(image)?;
        let Some(face) = faces.first() else {
            return Ok(None);
        };
        Ok(Some(self.recognizer.extract(image, face)?))
    }
}
