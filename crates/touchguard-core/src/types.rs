use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Image embedding vector produced by the feature extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "mobilenetv2-features").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// The two classes the session is calibrated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    NotTouched,
    Touched,
}

impl Label {
    pub const COUNT: usize = 2;
    pub const ALL: [Label; Label::COUNT] = [Label::NotTouched, Label::Touched];

    /// Dense index, used for per-label arrays.
    pub fn index(self) -> usize {
        match self {
            Label::NotTouched => 0,
            Label::Touched => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Label::NotTouched => "not_touched",
            Label::Touched => "touched",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown label {0:?} (expected \"not_touched\" or \"touched\")")]
pub struct ParseLabelError(String);

impl FromStr for Label {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "not_touched" | "not_touch" | "not_touching" => Ok(Label::NotTouched),
            "touched" | "touching" => Ok(Label::Touched),
            _ => Err(ParseLabelError(s.to_string())),
        }
    }
}

/// A calibration sample held by the example store.
#[derive(Debug, Clone)]
pub struct LabeledExample {
    pub embedding: Embedding,
    pub label: Label,
}

/// Outcome of classifying one embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub label: Label,
    /// Confidence per label in [0, 1], indexed by [`Label::index`].
    pub confidences: [f32; Label::COUNT],
    /// Number of neighbors that voted.
    pub neighbors: usize,
}

impl ClassificationResult {
    pub fn confidence(&self, label: Label) -> f32 {
        self.confidences[label.index()]
    }
}
