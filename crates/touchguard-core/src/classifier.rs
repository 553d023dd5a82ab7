//! k-nearest-neighbor example store.
//!
//! Holds every calibration example in memory and classifies a query embedding by
//! cosine similarity against all of them, letting the `k` closest vote.

use crate::types::{ClassificationResult, Embedding, Label, LabeledExample};
use thiserror::Error;

/// Neighbors consulted per prediction unless configured otherwise.
pub const DEFAULT_K: usize = 3;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("no examples stored; calibrate before classifying")]
    Empty,
    #[error("embedding dimension mismatch: store holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("empty embedding")]
    EmptyEmbedding,
}

/// Accumulates labeled embeddings and classifies new ones.
pub trait ExampleStore: Send {
    fn add_example(&mut self, embedding: Embedding, label: Label) -> Result<(), ClassifierError>;
    fn predict(&self, embedding: &Embedding) -> Result<ClassificationResult, ClassifierError>;
    fn example_count(&self, label: Label) -> usize;
    /// Drop every example carrying `label`.
    fn clear_label(&mut self, label: Label);
}

/// Cosine-similarity k-NN classifier.
#[derive(Debug)]
pub struct KnnClassifier {
    k: usize,
    examples: Vec<LabeledExample>,
    dim: Option<usize>,
}

impl KnnClassifier {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            examples: Vec::new(),
            dim: None,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    fn check_dim(&self, embedding: &Embedding) -> Result<(), ClassifierError> {
        if embedding.values.is_empty() {
            return Err(ClassifierError::EmptyEmbedding);
        }
        match self.dim {
            Some(expected) if expected != embedding.dim() => Err(ClassifierError::DimensionMismatch {
                expected,
                actual: embedding.dim(),
            }),
            _ => Ok(()),
        }
    }
}

impl Default for KnnClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_K)
    }
}

impl ExampleStore for KnnClassifier {
    fn add_example(&mut self, embedding: Embedding, label: Label) -> Result<(), ClassifierError> {
        self.check_dim(&embedding)?;
        self.dim.get_or_insert(embedding.dim());
        self.examples.push(LabeledExample { embedding, label });
        Ok(())
    }

    fn predict(&self, embedding: &Embedding) -> Result<ClassificationResult, ClassifierError> {
        if self.examples.is_empty() {
            return Err(ClassifierError::Empty);
        }
        self.check_dim(embedding)?;

        let mut scored: Vec<(f32, Label)> = self
            .examples
            .iter()
            .map(|ex| (embedding.similarity(&ex.embedding), ex.label))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let k = self.k.min(scored.len());
        let mut votes = [0usize; Label::COUNT];
        for &(_, label) in &scored[..k] {
            votes[label.index()] += 1;
        }

        let max_votes = votes.iter().copied().max().unwrap_or(0);
        // Ties go to whichever tied label owns the closest neighbor.
        let label = scored[..k]
            .iter()
            .map(|&(_, label)| label)
            .find(|label| votes[label.index()] == max_votes)
            .unwrap_or(scored[0].1);

        let mut confidences = [0.0f32; Label::COUNT];
        for (conf, &count) in confidences.iter_mut().zip(votes.iter()) {
            *conf = count as f32 / k as f32;
        }

        Ok(ClassificationResult {
            label,
            confidences,
            neighbors: k,
        })
    }

    fn example_count(&self, label: Label) -> usize {
        self.examples.iter().filter(|ex| ex.label == label).count()
    }

    fn clear_label(&mut self, label: Label) {
        self.examples.retain(|ex| ex.label != label);
        if self.examples.is_empty() {
            self.dim = None;
        }
    }
}
