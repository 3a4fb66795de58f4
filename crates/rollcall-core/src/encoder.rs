//! Face localization and encoding behind a single trait.
//!
//! Everything above this module treats the encoder as an oracle: it only
//! asks where the faces are and what their embeddings look like.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Locates faces in an image and turns each one into an embedding.
pub trait FaceEncoder {
    /// Bounding boxes of every face in `image`. The first entry is the one
    /// registration uses.
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError>;

    /// One embedding per box in `faces`, in the same order.
    fn encode_faces(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, EncoderError>;
}

/// SCRFD + ArcFace pipeline running on ONNX Runtime.
pub struct OnnxEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEncoder {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceEncoder for OnnxEncoder {
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
        let faces = self.detector.detect(image)?;
        tracing::debug!(count = faces.len(), "faces located");
        Ok(faces)
    }

    fn encode_faces(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, EncoderError> {
        faces
            .iter()
            .map(|face| self.recognizer.extract(image, face).map_err(EncoderError::from))
            .collect()
    }
}
