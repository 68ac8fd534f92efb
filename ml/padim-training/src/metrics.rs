//! Anomaly detection metrics.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use padim_model::host_values;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Summary of an evaluation run.
///
/// An AUROC is `None` when the corresponding ground truth holds only one
/// class, e.g. an all-normal test set or no pixel masks.
///
/// # Example
///
/// ```
/// use padim_training::EvaluationMetrics;
///
/// let metrics = EvaluationMetrics::new(10).with_image_auroc(Some(0.9));
/// assert_eq!(metrics.samples, 10);
/// assert!(metrics.pixel_auroc.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Area under the ROC curve of image-level scores.
    pub image_auroc: Option<f64>,

    /// Area under the ROC curve over all scored pixels.
    pub pixel_auroc: Option<f64>,

    /// Number of images evaluated.
    pub samples: usize,
}

impl EvaluationMetrics {
    /// Creates metrics for `samples` images with no AUROC computed.
    #[must_use]
    pub const fn new(samples: usize) -> Self {
        Self {
            image_auroc: None,
            pixel_auroc: None,
            samples,
        }
    }

    /// Sets the image-level AUROC.
    #[must_use]
    pub const fn with_image_auroc(mut self, auroc: Option<f64>) -> Self {
        self.image_auroc = auroc;
        self
    }

    /// Sets the pixel-level AUROC.
    #[must_use]
    pub const fn with_pixel_auroc(mut self, auroc: Option<f64>) -> Self {
        self.pixel_auroc = auroc;
        self
    }
}

/// Area under the ROC curve via the Mann-Whitney rank-sum statistic.
///
/// Tied scores receive their average rank, so a fully tied input scores
/// `0.5`. Returns `None` if the slices differ in length or either class is
/// absent.
///
/// # Example
///
/// ```
/// use padim_training::roc_auc;
///
/// let auc = roc_auc(&[0.1, 0.4, 0.35, 0.8], &[false, false, true, true]);
/// assert_eq!(auc, Some(0.75));
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn roc_auc(scores: &[f32], labels: &[bool]) -> Option<f64> {
    if scores.len() != labels.len() {
        return None;
    }
    let positives = labels.iter().filter(|&&l| l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0_f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]].total_cmp(&scores[order[start]]).is_eq() {
            end += 1;
        }
        // 1-based ranks start+1 ..= end share their mean.
        let rank = (start + 1 + end) as f64 / 2.0;
        let tied_positives = order[start..end].iter().filter(|&&i| labels[i]).count();
        positive_rank_sum += rank * tied_positives as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Image-level scores: the maximum of each `[batch, 1, H, W]` map.
///
/// # Errors
///
/// Returns a model error if the map cannot be read back from the device.
pub fn image_scores<B: Backend>(maps: Tensor<B, 4>) -> Result<Vec<f32>> {
    let [batch, channels, height, width] = maps.dims();
    let per_image = maps.reshape([batch, channels * height * width]).max_dim(1);
    Ok(host_values(per_image)?)
}
