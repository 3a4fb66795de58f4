//! rollcall-core — Face gallery, matching, attendance log and live detection.
//!
//! Faces are located with SCRFD and encoded with ArcFace, both running via
//! ONNX Runtime on the CPU. Attendance is kept in a two-column CSV table.

pub mod alignment;
pub mod attendance;
pub mod detector;
pub mod encoder;
pub mod gallery;
pub mod live;
pub mod recognizer;
pub mod session;
pub mod types;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

pub use attendance::{AttendanceError, AttendanceLog, AttendanceRecord, MarkOutcome};
pub use encoder::{EncoderError, FaceEncoder, OnnxEncoder};
pub use gallery::{GalleryError, GalleryStore};
pub use live::{
    spawn_detection, DetectionEvent, DetectionHandle, DetectionLoop, DetectionReport, FrameDevice,
    FrameSource, LiveError, SourceError, StopFlag, StopReason,
};
pub use session::{AdminSession, ExportBlob, SessionError};
pub use types::{
    compare_faces, face_distances, BoundingBox, DistanceMatcher, Embedding, GalleryEntry, Identity,
    IdentityError, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD,
};

/// Where packaged ONNX models are installed.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}
