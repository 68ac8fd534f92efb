//! Multi-layer feature alignment, concatenation and channel subsampling.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use tracing::debug;

use crate::error::{PadimError, Result};
use crate::extractor::LayerFeatures;
use crate::selection::ChannelSelection;

/// Builds per-location embeddings from a set of feature grids.
///
/// The first configured layer fixes the spatial resolution. Every later layer
/// is resized to it with nearest-neighbour interpolation so each location
/// keeps unblended statistics, then all layers are concatenated along the
/// channel axis in configured order and the stored [`ChannelSelection`] is
/// applied.
///
/// # Example
///
/// ```ignore
/// let assembler = EmbeddingAssembler::new(vec!["layer1".into(), "layer2".into()], selection);
/// let embedding = assembler.assemble(&features)?; // [batch, C′, H, W]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingAssembler {
    layers: Vec<String>,
    selection: ChannelSelection,
}

impl EmbeddingAssembler {
    /// Creates an assembler for `layers` (in order) using `selection`.
    #[must_use]
    pub fn new(layers: Vec<String>, selection: ChannelSelection) -> Self {
        Self { layers, selection }
    }

    /// Configured layer names.
    #[must_use]
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    /// Channel selection applied after concatenation.
    #[must_use]
    pub const fn selection(&self) -> &ChannelSelection {
        &self.selection
    }

    /// Embedding width `C′`.
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.selection.len()
    }

    /// Concatenates all layers at the reference resolution without subsampling.
    ///
    /// # Errors
    ///
    /// - [`PadimError::Configuration`] if a configured layer is missing or no
    ///   layers are configured.
    /// - [`PadimError::ShapeMismatch`] if layers disagree on batch size.
    pub fn concatenate<B: Backend>(&self, features: &LayerFeatures<B>) -> Result<Tensor<B, 4>> {
        let (first, rest) = self
            .layers
            .split_first()
            .ok_or_else(|| PadimError::configuration("no layers configured"))?;

        let reference = lookup(features, first)?;
        let [batch, _, height, width] = reference.dims();

        let mut grids = Vec::with_capacity(self.layers.len());
        grids.push(reference);

        for name in rest {
            let grid = lookup(features, name)?;
            let [layer_batch, _, layer_h, layer_w] = grid.dims();
            if layer_batch != batch {
                return Err(PadimError::shape_mismatch(
                    format!("batch {batch} for layer '{name}'"),
                    format!("batch {layer_batch}"),
                ));
            }
            let grid = if (layer_h, layer_w) == (height, width) {
                grid
            } else {
                interpolate(
                    grid,
                    [height, width],
                    InterpolateOptions::new(InterpolateMode::Nearest),
                )
            };
            grids.push(grid);
        }

        Ok(Tensor::cat(grids, 1))
    }

    /// Produces the `[batch, C′, H, W]` embedding.
    ///
    /// # Errors
    ///
    /// Everything [`concatenate`](Self::concatenate) returns, plus
    /// [`PadimError::Configuration`] if `C′` or any selected index exceeds the
    /// concatenated channel count.
    pub fn assemble<B: Backend>(&self, features: &LayerFeatures<B>) -> Result<Tensor<B, 4>> {
        let full = self.concatenate(features)?;
        let [batch, total_channels, height, width] = full.dims();

        if self.selection.len() > total_channels {
            return Err(PadimError::configuration(format!(
                "requested {} channels but layers provide only {total_channels}",
                self.selection.len()
            )));
        }
        if self.selection.max_index() >= total_channels {
            return Err(PadimError::configuration(format!(
                "channel index {} out of range for {total_channels} concatenated channels",
                self.selection.max_index()
            )));
        }

        debug!(
            batch,
            total_channels,
            selected = self.selection.len(),
            height,
            width,
            "assembled embedding"
        );

        let index = self.selection.to_tensor::<B>(&full.device());
        Ok(full.select(1, index))
    }
}

fn lookup<B: Backend>(features: &LayerFeatures<B>, name: &str) -> Result<Tensor<B, 4>> {
    features
        .get(name)
        .cloned()
        .ok_or_else(|| PadimError::configuration(format!("layer '{name}' missing from features")))
}
