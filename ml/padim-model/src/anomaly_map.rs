//! Mahalanobis anomaly maps from a fitted per-location Gaussian.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

use crate::error::{PadimError, Result};
use crate::gaussian::GaussianModel;

/// Scores embeddings against a frozen [`GaussianModel`].
///
/// For every batch item `n` and location `(h, w)`:
///
/// ```text
/// δ     = e[n, :, h, w] − μ[:, h, w]
/// score = sqrt(δᵀ · Σ⁻¹[:, :, h, w] · δ)
/// ```
///
/// The score is the Mahalanobis distance, not its square. The `[batch, 1, H, W]`
/// distance grid is then bilinearly resized to the output size. No smoothing
/// is applied.
///
/// # Example
///
/// ```ignore
/// let generator = AnomalyMapGenerator::new((224, 224));
/// let map = generator.compute(embedding, gaussian.model()?)?; // [batch, 1, 224, 224]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyMapGenerator {
    output_size: (usize, usize),
}

impl AnomalyMapGenerator {
    /// Creates a generator producing maps of `(height, width)`.
    #[must_use]
    pub const fn new(output_size: (usize, usize)) -> Self {
        Self { output_size }
    }

    /// Output map size `(height, width)`.
    #[must_use]
    pub const fn output_size(&self) -> (usize, usize) {
        self.output_size
    }

    /// Per-location Mahalanobis distance at embedding resolution,
    /// `[batch, 1, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::ShapeMismatch`] if the embedding's channel count
    /// or grid size differs from the model.
    pub fn distance<B: Backend>(
        &self,
        embedding: Tensor<B, 4>,
        model: &GaussianModel<B>,
    ) -> Result<Tensor<B, 4>> {
        let [batch, channels, height, width] = embedding.dims();
        let expected = [model.num_features(), model.height(), model.width()];
        if [channels, height, width] != expected {
            return Err(PadimError::shape_mismatch(
                format!("[_, {}, {}, {}]", expected[0], expected[1], expected[2]),
                format!("[{batch}, {channels}, {height}, {width}]"),
            ));
        }

        let locations = height * width;
        // [H·W, batch, C′]
        let x = embedding
            .reshape([batch, channels, locations])
            .permute([2, 0, 1]);
        let mean = model.mean().clone().unsqueeze_dim::<3>(1);
        let delta = x - mean;

        let squared = delta
            .clone()
            .matmul(model.inverse_covariance().clone())
            .mul(delta)
            .sum_dim(2);

        // Rounding can push an exact-zero quadratic form slightly negative.
        let distance = squared.clamp_min(0.0).sqrt();

        Ok(distance
            .reshape([locations, batch])
            .swap_dims(0, 1)
            .reshape([batch, 1, height, width]))
    }

    /// Upsamples a `[batch, 1, H, W]` map to the output size.
    #[must_use]
    pub fn upsample<B: Backend>(&self, map: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = map.dims();
        let (out_h, out_w) = self.output_size;
        if (height, width) == (out_h, out_w) {
            return map;
        }
        interpolate(
            map,
            [out_h, out_w],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        )
    }

    /// Full anomaly map at output resolution, `[batch, 1, out_h, out_w]`.
    ///
    /// Pure function of its inputs; safe to call concurrently on a shared model.
    ///
    /// # Errors
    ///
    /// Same as [`distance`](Self::distance).
    pub fn compute<B: Backend>(
        &self,
        embedding: Tensor<B, 4>,
        model: &GaussianModel<B>,
    ) -> Result<Tensor<B, 4>> {
        let distance = self.distance(embedding, model)?;
        Ok(self.upsample(distance))
    }
}
