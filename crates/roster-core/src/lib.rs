//! roster-core — face encoding, matching and the daily attendance rule.
//!
//! Encoding uses SCRFD for face detection and ArcFace for recognition,
//! both running on ONNX Runtime for CPU inference.

pub mod alignment;
pub mod attendance;
pub mod detector;
pub mod encoder;
pub mod matcher;
pub mod onnx;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use attendance::{
    mark_many, mark_user, Attendance, AttendanceError, AttendanceRule, AttendanceState, Clock,
    CompareAndSet, ManualMarkReport, Registry, RegistryError, SystemClock,
};
pub use detector::FaceDetector;
pub use encoder::{EncodeError, FaceEncoder, OnnxEncoder};
pub use matcher::{
    cosine_equivalent, EuclideanMatcher, MatchPolicy, MatchResult, Matcher, DEFAULT_TOLERANCE,
};
pub use onnx::ModelError;
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, Enrollment, UserId};

/// Per-user data directory: `$XDG_DATA_HOME/roster`, else `~/.local/share/roster`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("roster")
}

/// Where `det_10g.onnx` and `w600k_r50.onnx` are expected by default.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
