//! Boundary to the frozen convolutional feature extractor.

use std::collections::HashMap;

use burn::prelude::Backend;
use burn::tensor::Tensor;

use crate::backbone::Backbone;
use crate::error::Result;

/// Per-layer feature grids for one image batch, keyed by layer name.
///
/// Each grid is `[batch, channels_l, height_l, width_l]`.
pub type LayerFeatures<B> = HashMap<String, Tensor<B, 4>>;

/// A frozen network that maps an image batch to intermediate feature grids.
///
/// Implementations run in inference mode. The returned map must contain at
/// least every name in [`return_nodes`](Self::return_nodes), each with the
/// same batch size as `images`.
pub trait FeatureExtractor<B: Backend> {
    /// Identifier of the underlying network.
    fn backbone(&self) -> Backbone;

    /// Layer names produced by [`extract`](Self::extract), in order.
    fn return_nodes(&self) -> &[String];

    /// Runs the network on `images` of shape `[batch, 3, height, width]`.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn extract(&self, images: Tensor<B, 4>) -> Result<LayerFeatures<B>>;
}
