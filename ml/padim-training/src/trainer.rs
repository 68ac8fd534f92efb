//! Fit driver and evaluation loop.

use std::time::Instant;

use burn::prelude::Backend;
use burn::tensor::Tensor;
use padim_model::{
    FeatureExtractor, MomentAccumulator, Padim, PadimConfig, PadimError, host_values,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TrainingError};
use crate::metrics::{EvaluationMetrics, image_scores, roc_auc};

/// Ground-truth mask values above this count as anomalous pixels.
pub const MASK_THRESHOLD: f32 = 0.5;

/// Summary of a completed fit.
///
/// # Example
///
/// ```
/// use padim_training::FitReport;
///
/// let report = FitReport::default();
/// assert_eq!(report.samples, 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    /// Training images consumed.
    pub samples: usize,

    /// Image batches consumed.
    pub batches: usize,

    /// Spatial locations modeled, `H·W`.
    pub locations: usize,

    /// Wall-clock time of the fit in seconds.
    pub elapsed_secs: f64,
}

/// One batch of labeled test images.
#[derive(Debug, Clone)]
pub struct EvaluationBatch<B: Backend> {
    /// Images, `[batch, 3, height, width]`.
    pub images: Tensor<B, 4>,

    /// Per-image ground truth, `true` for anomalous.
    pub labels: Vec<bool>,

    /// Optional per-pixel ground truth at mask resolution, `[batch, 1, mask_h, mask_w]`.
    pub masks: Option<Tensor<B, 4>>,
}

impl<B: Backend> EvaluationBatch<B> {
    /// Creates a batch with image labels only.
    #[must_use]
    pub fn new(images: Tensor<B, 4>, labels: Vec<bool>) -> Self {
        Self {
            images,
            labels,
            masks: None,
        }
    }

    /// Attaches pixel ground truth.
    #[must_use]
    pub fn with_masks(mut self, masks: Tensor<B, 4>) -> Self {
        self.masks = Some(masks);
        self
    }
}

/// Drives a [`Padim`] model over image batches.
///
/// Fitting streams every batch through `extract → embed → accumulate` and
/// finalizes once at the end, so peak memory does not grow with the number of
/// training images. The model is only replaced after the whole pass succeeds.
///
/// # Example
///
/// ```
/// use padim_training::Trainer;
///
/// let trainer = Trainer::new().with_progress_interval(5);
/// assert_eq!(trainer.progress_interval(), 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trainer {
    progress_interval: usize,
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Trainer {
    /// Creates a trainer logging progress every 10 batches.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            progress_interval: 10,
        }
    }

    /// Sets how many batches pass between progress logs. Zero disables them.
    #[must_use]
    pub const fn with_progress_interval(mut self, batches: usize) -> Self {
        self.progress_interval = batches;
        self
    }

    /// Batches between progress logs.
    #[must_use]
    pub const fn progress_interval(&self) -> usize {
        self.progress_interval
    }

    /// Fits `padim` on every image batch in `batches`.
    ///
    /// # Errors
    ///
    /// - [`TrainingError::InvalidConfig`] if the extractor's backbone or layers
    ///   do not match the model configuration.
    /// - [`TrainingError::EmptyDataset`] if `batches` yields no images.
    /// - [`TrainingError::Model`] for extraction, assembly or fitting errors.
    pub fn fit<B, E, I>(&self, padim: &mut Padim<B>, extractor: &E, batches: I) -> Result<FitReport>
    where
        B: Backend,
        E: FeatureExtractor<B>,
        I: IntoIterator<Item = Tensor<B, 4>>,
    {
        check_extractor(padim.config(), extractor)?;

        let start = Instant::now();
        let mut accumulator = MomentAccumulator::new();
        let mut batch_count = 0;

        for images in batches {
            let features = extractor.extract(images)?;
            accumulator.update(padim.embed(&features)?)?;
            batch_count += 1;

            if self.progress_interval > 0 && batch_count % self.progress_interval == 0 {
                info!(
                    batches = batch_count,
                    samples = accumulator.count(),
                    "accumulating training embeddings"
                );
            }
        }

        if accumulator.count() == 0 {
            return Err(TrainingError::empty_dataset("no training images"));
        }

        let model = padim.fit_accumulated(accumulator)?;
        let report = FitReport {
            samples: model.sample_count(),
            batches: batch_count,
            locations: model.locations(),
            elapsed_secs: start.elapsed().as_secs_f64(),
        };

        info!(
            samples = report.samples,
            batches = report.batches,
            locations = report.locations,
            elapsed_secs = report.elapsed_secs,
            "fit complete"
        );
        Ok(report)
    }

    /// Scores labeled batches and computes image and pixel AUROC.
    ///
    /// Image scores are the maximum of each anomaly map. Pixel AUROC covers
    /// the batches that carry masks and is `None` if none do.
    ///
    /// # Errors
    ///
    /// - [`TrainingError::Model`] wrapping `NotFitted` for an unfitted model,
    ///   or any extraction and scoring error.
    /// - [`TrainingError::Evaluation`] if labels or masks disagree with the
    ///   batch or map shape.
    /// - [`TrainingError::EmptyDataset`] if `batches` yields no images.
    pub fn evaluate<B, E, I>(
        &self,
        padim: &Padim<B>,
        extractor: &E,
        batches: I,
    ) -> Result<EvaluationMetrics>
    where
        B: Backend,
        E: FeatureExtractor<B>,
        I: IntoIterator<Item = EvaluationBatch<B>>,
    {
        if !padim.is_fitted() {
            return Err(PadimError::NotFitted.into());
        }
        check_extractor(padim.config(), extractor)?;

        let mut scores = Vec::new();
        let mut labels = Vec::new();
        let mut pixel_scores = Vec::new();
        let mut pixel_labels = Vec::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let [n, _, _, _] = batch.images.dims();
            if batch.labels.len() != n {
                return Err(TrainingError::evaluation(format!(
                    "batch {index}: {} labels for {n} images",
                    batch.labels.len()
                )));
            }

            let maps = padim.anomaly_map(&extractor.extract(batch.images)?)?;

            if let Some(masks) = batch.masks {
                if masks.dims() != maps.dims() {
                    return Err(TrainingError::evaluation(format!(
                        "batch {index}: mask shape {:?} does not match anomaly map {:?}",
                        masks.dims(),
                        maps.dims()
                    )));
                }
                pixel_scores.extend(host_values(maps.clone())?);
                pixel_labels.extend(
                    host_values(masks)?
                        .into_iter()
                        .map(|v| v > MASK_THRESHOLD),
                );
            }

            scores.extend(image_scores(maps)?);
            labels.extend(batch.labels);
            debug!(batch = index, images = n, "scored evaluation batch");
        }

        if scores.is_empty() {
            return Err(TrainingError::empty_dataset("no evaluation images"));
        }

        let metrics = EvaluationMetrics::new(scores.len())
            .with_image_auroc(roc_auc(&scores, &labels))
            .with_pixel_auroc(roc_auc(&pixel_scores, &pixel_labels));

        info!(
            samples = metrics.samples,
            image_auroc = ?metrics.image_auroc,
            pixel_auroc = ?metrics.pixel_auroc,
            "evaluation complete"
        );
        Ok(metrics)
    }
}

fn check_extractor<B: Backend, E: FeatureExtractor<B>>(
    config: &PadimConfig,
    extractor: &E,
) -> Result<()> {
    if extractor.backbone() != config.backbone {
        return Err(TrainingError::invalid_config(format!(
            "extractor backbone {} differs from configured {}",
            extractor.backbone(),
            config.backbone
        )));
    }
    let provided = extractor.return_nodes();
    if let Some(missing) = config
        .return_nodes
        .iter()
        .find(|node| !provided.contains(node))
    {
        return Err(TrainingError::invalid_config(format!(
            "extractor does not provide layer '{missing}'"
        )));
    }
    Ok(())
}
