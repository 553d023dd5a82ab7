//! touchguard-core: face-touch detection engine.
//!
//! Embeds camera frames with MobileNet (ONNX Runtime), classifies them with
//! a k-nearest-neighbor store trained during a two-step calibration, and
//! drives the calibration/monitoring session that raises alerts.

pub mod alert;
pub mod classifier;
pub mod extractor;
pub mod session;
pub mod types;

use std::path::PathBuf;

pub use alert::{AlertError, AlertGate, AlertSink, SoundEnded};
pub use classifier::{ClassifierError, ExampleStore, KnnClassifier};
pub use extractor::{EmbeddingExtractor, ExtractorError, MobileNetExtractor};
pub use session::{
    EmbeddingSource, SessionConfig, SessionController, SessionError, SessionState, SessionStatus,
    SourceProvider, TOUCH_CONFIDENCE_THRESHOLD,
};
pub use types::{ClassificationResult, Embedding, Label, LabeledExample};

/// Default location of the ONNX model files.
///
/// `$XDG_DATA_HOME/touchguard/models`, falling back to
/// `~/.local/share/touchguard/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("touchguard")
        .join("models")
}
