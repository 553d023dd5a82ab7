//! MobileNet image embedder via ONNX Runtime.
//!
//! Turns a whole RGB camera frame into a feature vector: the globally
//! average-pooled activations in front of MobileNet v2's classifier
//! (1280 values). The model must expose that layer as a graph output;
//! the stock ImageNet classifier output (1000 logits) is rejected.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (ImageNet normalization) ---
const MOBILENET_INPUT_SIZE: u32 = 224;
const MOBILENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const MOBILENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const MOBILENET_MODEL_VERSION: &str = "mobilenetv2-features";
/// Width of the ImageNet classifier head; an output this wide is logits.
const IMAGENET_CLASSES: usize = 1000;
/// Name fragments of pooled feature outputs, checked in order.
const FEATURE_OUTPUT_HINTS: [&str; 4] = ["feature", "embed", "pool", "flatten"];

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0} (export MobileNet v2 up to its global average pool to ONNX)")]
    ModelNotFound(String),
    #[error("model has no output {requested:?} (outputs: {available:?})")]
    OutputNotFound {
        requested: String,
        available: Vec<String>,
    },
    #[error("model output {0:?} is the 1000-class classifier head, not a feature vector")]
    ClassifierOutput(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: {width}x{height} RGB needs {expected} bytes, got {actual}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps an RGB frame to a fixed-length embedding.
pub trait EmbeddingExtractor: Send {
    fn embed(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Embedding, ExtractorError>;
}

/// MobileNet-based frame embedder.
pub struct MobileNetExtractor {
    session: Session,
    output: String,
}

impl MobileNetExtractor {
    /// Load a MobileNet feature model from the given path.
    ///
    /// `output` names the feature output; without it the first output
    /// whose name looks like a pooled feature layer is used. A test frame
    /// is run through the model so a classifier-only export fails here
    /// rather than during calibration.
    pub fn load(model_path: &str, output: Option<&str>) -> Result<Self, ExtractorError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let output = select_output(&outputs, output)?;

        let mut extractor = Self { session, output };
        let size = MOBILENET_INPUT_SIZE;
        let gray = vec![128u8; (size * size * 3) as usize];
        let features = extractor.run(&gray, size, size)?;
        if features.len() == IMAGENET_CLASSES {
            return Err(ExtractorError::ClassifierOutput(extractor.output));
        }

        tracing::info!(
            path = model_path,
            inputs = ?extractor.session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            output = %extractor.output,
            dim = features.len(),
            "loaded MobileNet feature model"
        );

        Ok(extractor)
    }

    /// Resize an RGB frame to 224x224 and normalize it into a NCHW float tensor.
    fn preprocess(rgb: &[u8], width: u32, height: u32) -> Result<Array4<f32>, ExtractorError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(3))
            .unwrap_or(usize::MAX);
        let invalid = || ExtractorError::InvalidFrame {
            width,
            height,
            expected,
            actual: rgb.len(),
        };
        if width == 0 || height == 0 || rgb.len() < expected {
            return Err(invalid());
        }

        let image = RgbImage::from_raw(width, height, rgb[..expected].to_vec()).ok_or_else(invalid)?;

        let size = MOBILENET_INPUT_SIZE;
        let resized = if (width, height) == (size, size) {
            image
        } else {
            image::imageops::resize(&image, size, size, FilterType::Triangle)
        };

        let size = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel.0[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] =
                    (value - MOBILENET_MEAN[c]) / MOBILENET_STD[c];
            }
        }

        Ok(tensor)
    }

    /// Raw activations of the selected output.
    fn run(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<f32>, ExtractorError> {
        let input = Self::preprocess(rgb, width, height)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[self.output.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("feature extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.is_empty() {
            return Err(ExtractorError::InferenceFailed("model produced an empty output".into()));
        }
        Ok(raw)
    }
}

impl EmbeddingExtractor for MobileNetExtractor {
    fn embed(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Embedding, ExtractorError> {
        let raw = self.run(rgb, width, height)?;
        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(MOBILENET_MODEL_VERSION.to_string()),
        })
    }
}

/// Pick the feature output: the requested name, else the first output
/// named like a pooled layer, else the only output.
fn select_output(outputs: &[String], requested: Option<&str>) -> Result<String, ExtractorError> {
    let not_found = |requested: &str| ExtractorError::OutputNotFound {
        requested: requested.to_string(),
        available: outputs.to_vec(),
    };

    if let Some(name) = requested {
        return outputs
            .iter()
            .find(|o| o.as_str() == name)
            .cloned()
            .ok_or_else(|| not_found(name));
    }

    FEATURE_OUTPUT_HINTS
        .iter()
        .find_map(|hint| outputs.iter().find(|o| o.to_ascii_lowercase().contains(hint)))
        .or(match outputs {
            [only] => Some(only),
            _ => None,
        })
        .cloned()
        .ok_or_else(|| not_found("<pooled features>"))
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = MOBILENET_INPUT_SIZE as usize;

    #[test]
    fn test_preprocess_output_shape() {
        let rgb = vec![128u8; 64 * 48 * 3];
        let tensor = MobileNetExtractor::preprocess(&rgb, 64, 48).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, SIZE, SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let rgb = vec![255u8; SIZE * SIZE * 3];
        let tensor = MobileNetExtractor::preprocess(&rgb, SIZE as u32, SIZE as u32).unwrap();
        for c in 0..3 {
            let expected = (1.0 - MOBILENET_MEAN[c]) / MOBILENET_STD[c];
            let val = tensor[[0, c, 10, 10]];
            assert!((val - expected).abs() < 1e-5, "channel {c}: got {val}, expected {expected}");
        }
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        // Pure red frame: R channel high, G/B at their minimum
        let rgb: Vec<u8> = (0..SIZE * SIZE).flat_map(|_| [255u8, 0, 0]).collect();
        let tensor = MobileNetExtractor::preprocess(&rgb, SIZE as u32, SIZE as u32).unwrap();
        assert!(tensor[[0, 0, 0, 0]] > 0.0);
        assert!(tensor[[0, 1, 0, 0]] < 0.0);
        assert!(tensor[[0, 2, 0, 0]] < 0.0);
    }

    #[test]
    fn test_preprocess_rejects_short_buffer() {
        let rgb = vec![0u8; 10];
        assert!(matches!(
            MobileNetExtractor::preprocess(&rgb, 4, 4),
            Err(ExtractorError::InvalidFrame { expected: 48, actual: 10, .. })
        ));
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_load_missing_model() {
        assert!(matches!(
            MobileNetExtractor::load("/nonexistent/mobilenetv2-features.onnx", None),
            Err(ExtractorError::ModelNotFound(_))
        ));
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_output_prefers_pooled_features() {
        let outputs = names(&["logits", "global_average_pooling2d"]);
        assert_eq!(select_output(&outputs, None).unwrap(), "global_average_pooling2d");

        let outputs = names(&["output", "features"]);
        assert_eq!(select_output(&outputs, None).unwrap(), "features");
    }

    #[test]
    fn test_select_output_by_name() {
        let outputs = names(&["output", "464"]);
        assert_eq!(select_output(&outputs, Some("464")).unwrap(), "464");
        assert!(matches!(
            select_output(&outputs, Some("pool")),
            Err(ExtractorError::OutputNotFound { .. })
        ));
    }

    #[test]
    fn test_select_output_single_unnamed() {
        // A lone output is taken as-is; its width is checked at load.
        assert_eq!(select_output(&names(&["output"]), None).unwrap(), "output");
        assert!(matches!(
            select_output(&names(&["a", "b"]), None),
            Err(ExtractorError::OutputNotFound { .. })
        ));
    }

    #[test]
    fn test_preprocess_rejects_overflowing_dimensions() {
        assert!(matches!(
            MobileNetExtractor::preprocess(&[0u8; 12], u32::MAX, u32::MAX),
            Err(ExtractorError::InvalidFrame { .. })
        ));
    }
}
