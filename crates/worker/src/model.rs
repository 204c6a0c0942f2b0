//! Style model loading and batched inference
//!
//! The model is a small per-channel 3x3 filter bank with bias and a blend
//! strength, shipped to workers as a [`ModelArtifact`]. The coordinator
//! loads the artifact from a memory-mapped weights file once and broadcasts
//! it; workers build a validated `StyleModel` from the received artifact and
//! run it over whole batches.

use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::path::Path;
use styleflow_common::{Result, StyleFlowError};
use styleflow_proto::ModelArtifact;
use tracing::info;

use crate::tensor::TensorBatch;

/// A validated, ready-to-run style model.
pub struct StyleModel {
    style: String,
    channels: usize,
    kernel: Vec<f32>,
    bias: Vec<f32>,
    strength: f32,
}

impl StyleModel {
    /// Validate a received artifact into a runnable model.
    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self> {
        if artifact.channels == 0 {
            return Err(StyleFlowError::model("model has zero channels"));
        }
        if artifact.kernel.len() != ModelArtifact::kernel_len(artifact.channels) {
            return Err(StyleFlowError::model(format!(
                "kernel has {} weights, expected {} for {} channels",
                artifact.kernel.len(),
                ModelArtifact::kernel_len(artifact.channels),
                artifact.channels
            )));
        }
        if artifact.bias.len() != artifact.channels {
            return Err(StyleFlowError::model(format!(
                "bias has {} entries, expected {}",
                artifact.bias.len(),
                artifact.channels
            )));
        }
        if !artifact.strength.is_finite() || !(0.0..=1.0).contains(&artifact.strength) {
            return Err(StyleFlowError::model(format!(
                "strength {} is outside [0, 1]",
                artifact.strength
            )));
        }

        Ok(Self {
            style: artifact.style.clone(),
            channels: artifact.channels,
            kernel: artifact.kernel.clone(),
            bias: artifact.bias.clone(),
            strength: artifact.strength,
        })
    }

    /// Style name this model renders.
    pub fn style(&self) -> &str {
        &self.style
    }

    /// Run the filter bank over every image in the batch.
    ///
    /// Images are processed in parallel; the output batch has the input's
    /// shape. Border pixels use edge replication.
    pub fn stylize_batch(&self, batch: &TensorBatch) -> Result<TensorBatch> {
        let (n, h, w, c) = batch.shape();
        if c != self.channels {
            return Err(StyleFlowError::model(format!(
                "model expects {} channels, batch has {}",
                self.channels, c
            )));
        }

        let image_len = batch.image_len();
        let mut out = vec![0.0f32; batch.data().len()];

        out.par_chunks_mut(image_len)
            .zip(batch.data().par_chunks(image_len))
            .for_each(|(dst, src)| self.stylize_image(src, dst, h, w));

        TensorBatch::from_raw(out, n, h, w)
    }

    fn stylize_image(&self, src: &[f32], dst: &mut [f32], h: usize, w: usize) {
        let c = self.channels;

        for y in 0..h {
            for x in 0..w {
                for co in 0..c {
                    let mut acc = self.bias[co];
                    for ci in 0..c {
                        for ky in 0..3 {
                            let sy = (y + ky).saturating_sub(1).min(h - 1);
                            for kx in 0..3 {
                                let sx = (x + kx).saturating_sub(1).min(w - 1);
                                let weight = self.kernel[((co * c + ci) * 3 + ky) * 3 + kx];
                                acc += src[(sy * w + sx) * c + ci] * weight;
                            }
                        }
                    }
                    let orig = src[(y * w + x) * c + co];
                    dst[(y * w + x) * c + co] = orig + (acc - orig) * self.strength;
                }
            }
        }
    }
}

/// Load and validate a model artifact from a weights file.
///
/// The file is memory-mapped rather than read into an owned buffer; only the
/// coordinator does this, workers receive the artifact over the wire.
pub fn load_artifact(path: &Path) -> Result<ModelArtifact> {
    let file = File::open(path)
        .map_err(|e| StyleFlowError::model(format!("Failed to open {}: {}", path.display(), e)))?;

    // Safety: the mapping is read-only and dropped before this call returns.
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| StyleFlowError::model(format!("Failed to map {}: {}", path.display(), e)))?;

    let artifact: ModelArtifact = serde_json::from_slice(&mmap)
        .map_err(|e| StyleFlowError::model(format!("Failed to parse {}: {}", path.display(), e)))?;

    // Reject malformed weights at load time, not on the first batch.
    StyleModel::from_artifact(&artifact)?;

    info!(
        "Loaded model artifact {} ({} channels, strength {})",
        artifact.style, artifact.channels, artifact.strength
    );
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 128]))
    }

    #[test]
    fn test_identity_model_preserves_pixels() {
        let model = StyleModel::from_artifact(&ModelArtifact::identity("plain", 3)).unwrap();
        let batch = TensorBatch::from_images(vec![gradient(5, 4), gradient(5, 4)]).unwrap();

        let styled = model.stylize_batch(&batch).unwrap();

        assert_eq!(styled.shape(), batch.shape());
        for (got, want) in styled.data().iter().zip(batch.data()) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn test_zero_strength_is_a_no_op() {
        let mut artifact = ModelArtifact::identity("plain", 3);
        // A kernel that would brighten heavily, fully blended out.
        artifact.bias = vec![200.0; 3];
        artifact.strength = 0.0;
        let model = StyleModel::from_artifact(&artifact).unwrap();

        let batch = TensorBatch::from_images(vec![gradient(3, 3)]).unwrap();
        let styled = model.stylize_batch(&batch).unwrap();

        for (got, want) in styled.data().iter().zip(batch.data()) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn test_bias_shifts_channels() {
        let mut artifact = ModelArtifact::identity("brighter", 3);
        artifact.bias = vec![10.0, 0.0, 0.0];
        let model = StyleModel::from_artifact(&artifact).unwrap();

        let batch =
            TensorBatch::from_images(vec![RgbImage::from_pixel(2, 2, Rgb([50, 50, 50]))]).unwrap();
        let styled = model.stylize_batch(&batch).unwrap();

        assert!((styled.data()[0] - 60.0).abs() < 1e-4);
        assert!((styled.data()[1] - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_malformed_artifacts_rejected() {
        let mut short_kernel = ModelArtifact::identity("bad", 3);
        short_kernel.kernel.pop();
        assert!(StyleModel::from_artifact(&short_kernel).is_err());

        let mut bad_strength = ModelArtifact::identity("bad", 3);
        bad_strength.strength = 1.5;
        assert!(StyleModel::from_artifact(&bad_strength).is_err());

        let mut bad_bias = ModelArtifact::identity("bad", 3);
        bad_bias.bias = vec![0.0];
        assert!(StyleModel::from_artifact(&bad_bias).is_err());
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let model = StyleModel::from_artifact(&ModelArtifact::identity("plain", 4)).unwrap();
        let batch = TensorBatch::from_images(vec![gradient(2, 2)]).unwrap();

        assert!(model.stylize_batch(&batch).is_err());
    }

    #[test]
    fn test_load_artifact_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mosaic.json");
        let artifact = ModelArtifact::identity("mosaic", 3);
        std::fs::write(&path, serde_json::to_vec(&artifact).unwrap()).unwrap();

        let loaded = load_artifact(&path).unwrap();
        assert_eq!(loaded, artifact);

        assert!(load_artifact(&dir.path().join("missing.json")).is_err());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"{\"style\": \"x\"}").unwrap();
        assert!(load_artifact(&bad).is_err());
    }
}
