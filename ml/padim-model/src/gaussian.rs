//! Per-location multivariate Gaussian estimation.
//!
//! Every spatial location of the embedding grid gets its own Gaussian. All
//! locations are handled together as a batch: moments are accumulated with
//! batched matrix products over `[H·W, N, C′]` views, and the final inversion
//! is a single batched call over `[H·W, C′, C′]`.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use tracing::{debug, info, warn};

use crate::error::{PadimError, Result};
use crate::linalg::regularized_inverse;

/// Default diagonal regularization added to every covariance matrix.
pub const DEFAULT_EPSILON: f64 = 0.01;

/// Fitted per-location mean and inverse covariance.
///
/// Immutable once built. Shapes:
/// - mean: `[H·W, C′]`
/// - inverse covariance: `[H·W, C′, C′]`
#[derive(Debug, Clone)]
pub struct GaussianModel<B: Backend> {
    mean: Tensor<B, 2>,
    inv_covariance: Tensor<B, 3>,
    height: usize,
    width: usize,
    sample_count: usize,
}

impl<B: Backend> GaussianModel<B> {
    /// Wraps precomputed statistics after checking their shapes agree.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::ShapeMismatch`] if `mean` is not
    /// `[height·width, C′]` or `inv_covariance` is not `[height·width, C′, C′]`.
    pub fn new(
        mean: Tensor<B, 2>,
        inv_covariance: Tensor<B, 3>,
        height: usize,
        width: usize,
        sample_count: usize,
    ) -> Result<Self> {
        let [locations, channels] = mean.dims();
        if locations != height * width {
            return Err(PadimError::shape_mismatch(
                format!("mean with {} locations ({height}x{width})", height * width),
                format!("{locations} locations"),
            ));
        }
        let inv_dims = inv_covariance.dims();
        if inv_dims != [locations, channels, channels] {
            return Err(PadimError::shape_mismatch(
                format!("{:?}", [locations, channels, channels]),
                format!("{inv_dims:?}"),
            ));
        }
        Ok(Self {
            mean,
            inv_covariance,
            height,
            width,
            sample_count,
        })
    }

    /// Per-location means, `[H·W, C′]`.
    #[must_use]
    pub const fn mean(&self) -> &Tensor<B, 2> {
        &self.mean
    }

    /// Per-location inverse covariances, `[H·W, C′, C′]`.
    #[must_use]
    pub const fn inverse_covariance(&self) -> &Tensor<B, 3> {
        &self.inv_covariance
    }

    /// Embedding width `C′`.
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.mean.dims()[1]
    }

    /// Grid height `H`.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Grid width `W`.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Number of locations `H·W`.
    #[must_use]
    pub const fn locations(&self) -> usize {
        self.height * self.width
    }

    /// Number of training embeddings the model was fit on.
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.sample_count
    }
}

#[derive(Debug, Clone)]
struct Moments<B: Backend> {
    channels: usize,
    height: usize,
    width: usize,
    /// `[H·W, 1, C′]`
    mean: Tensor<B, 3>,
    /// Centered second-moment sum, `[H·W, C′, C′]`.
    m2: Tensor<B, 3>,
}

/// Streaming mean and covariance accumulator over embedding chunks.
///
/// Memory stays at `O(C′²·H·W)` regardless of how many samples are fed.
/// Chunks are merged with the pairwise update
///
/// ```text
/// n     = n_a + n_b
/// δ     = μ_b − μ_a
/// μ     = μ_a + δ · n_b / n
/// M2    = M2_a + M2_b + δᵀδ · n_a·n_b / n
/// ```
///
/// which matches the two-pass estimator up to floating-point ordering.
#[derive(Debug, Clone)]
pub struct MomentAccumulator<B: Backend> {
    count: usize,
    moments: Option<Moments<B>>,
}

impl<B: Backend> Default for MomentAccumulator<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> MomentAccumulator<B> {
    /// Creates an empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            moments: None,
        }
    }

    /// Number of samples accumulated so far.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// `(C′, H, W)` fixed by the first chunk, if any.
    #[must_use]
    pub fn shape(&self) -> Option<(usize, usize, usize)> {
        self.moments
            .as_ref()
            .map(|m| (m.channels, m.height, m.width))
    }

    /// Folds a `[N, C′, H, W]` chunk into the running moments.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::ShapeMismatch`] if `C′`, `H` or `W` differ from
    /// earlier chunks. The accumulator is left unchanged on error.
    #[allow(clippy::cast_precision_loss)]
    pub fn update(&mut self, chunk: Tensor<B, 4>) -> Result<()> {
        let [n, channels, height, width] = chunk.dims();
        if let Some(expected) = self.shape() {
            if expected != (channels, height, width) {
                return Err(PadimError::shape_mismatch(
                    format!("[_, {}, {}, {}]", expected.0, expected.1, expected.2),
                    format!("[{n}, {channels}, {height}, {width}]"),
                ));
            }
        }
        if n == 0 {
            return Ok(());
        }

        let locations = height * width;
        // [H·W, N, C′]
        let x = chunk.reshape([n, channels, locations]).permute([2, 0, 1]);
        let chunk_mean = x.clone().mean_dim(1);
        let centered = x - chunk_mean.clone();
        let chunk_m2 = centered.clone().swap_dims(1, 2).matmul(centered);

        let merged = match self.moments.take() {
            None => Moments {
                channels,
                height,
                width,
                mean: chunk_mean,
                m2: chunk_m2,
            },
            Some(prev) => {
                let n_a = self.count as f64;
                let n_b = n as f64;
                let total = n_a + n_b;
                let delta = chunk_mean - prev.mean.clone();
                let cross = delta
                    .clone()
                    .swap_dims(1, 2)
                    .matmul(delta.clone())
                    .mul_scalar(n_a * n_b / total);
                Moments {
                    channels,
                    height,
                    width,
                    mean: prev.mean + delta.mul_scalar(n_b / total),
                    m2: prev.m2 + chunk_m2 + cross,
                }
            }
        };

        self.moments = Some(merged);
        self.count += n;
        debug!(chunk = n, total = self.count, locations, "accumulated embedding chunk");
        Ok(())
    }

    /// Current per-location means, `[H·W, C′]`.
    #[must_use]
    pub fn mean(&self) -> Option<Tensor<B, 2>> {
        self.moments
            .as_ref()
            .map(|m| m.mean.clone().reshape([m.height * m.width, m.channels]))
    }

    /// Unbiased sample covariance (normalized by `N − 1`), `[H·W, C′, C′]`.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::InsufficientSamples`] with fewer than two samples.
    #[allow(clippy::cast_precision_loss)]
    pub fn covariance(&self) -> Result<Tensor<B, 3>> {
        match &self.moments {
            Some(m) if self.count >= 2 => Ok(m.m2.clone().div_scalar((self.count - 1) as f64)),
            _ => Err(PadimError::insufficient_samples(self.count, 2)),
        }
    }

    /// Regularizes, inverts and freezes the accumulated statistics.
    ///
    /// # Errors
    ///
    /// - [`PadimError::InsufficientSamples`] with fewer than two samples.
    /// - [`PadimError::Numerical`] if any regularized covariance cannot be
    ///   inverted.
    pub fn finalize(self, epsilon: f64) -> Result<GaussianModel<B>> {
        let covariance = self.covariance()?;
        let moments = self
            .moments
            .ok_or_else(|| PadimError::insufficient_samples(self.count, 2))?;

        if self.count <= moments.channels {
            warn!(
                samples = self.count,
                channels = moments.channels,
                "fewer samples than embedding channels; covariance is rank deficient before regularization"
            );
        }

        let inv_covariance = regularized_inverse(covariance, epsilon)?;
        let locations = moments.height * moments.width;
        GaussianModel::new(
            moments.mean.reshape([locations, moments.channels]),
            inv_covariance,
            moments.height,
            moments.width,
            self.count,
        )
    }
}

/// Closed-form per-location Gaussian estimator and holder of the fitted model.
///
/// Each call to [`fit`](Self::fit) or [`fit_stream`](Self::fit_stream)
/// replaces the previous model only after the new one is complete; a failed fit
/// leaves the prior model in place.
#[derive(Debug, Clone)]
pub struct MultiVariateGaussian<B: Backend> {
    epsilon: f64,
    model: Option<GaussianModel<B>>,
}

impl<B: Backend> Default for MultiVariateGaussian<B> {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            model: None,
        }
    }
}

impl<B: Backend> MultiVariateGaussian<B> {
    /// Creates an unfitted estimator with the given regularization.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Configuration`] unless `epsilon` is finite and
    /// positive.
    pub fn new(epsilon: f64) -> Result<Self> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(PadimError::configuration(format!(
                "regularization epsilon must be positive, got {epsilon}"
            )));
        }
        Ok(Self {
            epsilon,
            model: None,
        })
    }

    /// Regularization constant ε.
    #[must_use]
    pub const fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Fits from all training embeddings at once, `[N, C′, H, W]`.
    ///
    /// # Errors
    ///
    /// See [`fit_stream`](Self::fit_stream).
    pub fn fit(&mut self, embeddings: Tensor<B, 4>) -> Result<&GaussianModel<B>> {
        self.fit_stream(std::iter::once(embeddings))
    }

    /// Fits from a sequence of `[N_i, C′, H, W]` chunks covering the whole
    /// training set.
    ///
    /// # Errors
    ///
    /// - [`PadimError::ShapeMismatch`] if chunks disagree on `C′`, `H` or `W`.
    /// - [`PadimError::InsufficientSamples`] with fewer than two samples total.
    /// - [`PadimError::Numerical`] if an inversion fails.
    pub fn fit_stream<I>(&mut self, chunks: I) -> Result<&GaussianModel<B>>
    where
        I: IntoIterator<Item = Tensor<B, 4>>,
    {
        let mut accumulator = MomentAccumulator::new();
        for chunk in chunks {
            accumulator.update(chunk)?;
        }
        self.fit_accumulated(accumulator)
    }

    /// Finalizes an externally driven accumulator and installs the result.
    ///
    /// # Errors
    ///
    /// Same as [`MomentAccumulator::finalize`].
    pub fn fit_accumulated(
        &mut self,
        accumulator: MomentAccumulator<B>,
    ) -> Result<&GaussianModel<B>> {
        let model = accumulator.finalize(self.epsilon)?;
        info!(
            samples = model.sample_count(),
            locations = model.locations(),
            channels = model.num_features(),
            epsilon = self.epsilon,
            "fitted per-location gaussian"
        );
        Ok(self.model.insert(model))
    }

    /// Installs a model restored from elsewhere, replacing any current one.
    pub fn install(&mut self, model: GaussianModel<B>) {
        self.model = Some(model);
    }

    /// Returns `true` once a model has been fit or installed.
    #[must_use]
    pub const fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    /// The fitted model.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::NotFitted`] before the first successful fit.
    pub fn model(&self) -> Result<&GaussianModel<B>> {
        self.model.as_ref().ok_or(PadimError::NotFitted)
    }
}
