//! Random channel subsampling of the concatenated feature embedding.

use burn::prelude::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PadimError, Result};

/// Ordered set of distinct channel indices kept from the full embedding.
///
/// Drawn once when the model is built and never regenerated afterwards. The
/// order is the draw order and is the order channels appear in the assembled
/// embedding, so it is persisted verbatim with the fitted model.
///
/// # Example
///
/// ```
/// use padim_model::ChannelSelection;
///
/// let a = ChannelSelection::seeded(448, 100, Some(42));
/// let b = ChannelSelection::seeded(448, 100, Some(42));
/// assert!(a.is_ok());
/// assert_eq!(a.ok(), b.ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct ChannelSelection {
    indices: Vec<usize>,
}

impl ChannelSelection {
    /// Draws `num_features` distinct indices from `0..max_features`.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Configuration`] if `num_features` is zero or
    /// larger than `max_features`.
    pub fn sample<R: Rng + ?Sized>(
        max_features: usize,
        num_features: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if num_features == 0 {
            return Err(PadimError::configuration("cannot select zero channels"));
        }
        if num_features > max_features {
            return Err(PadimError::configuration(format!(
                "cannot select {num_features} channels from {max_features}"
            )));
        }
        let indices = rand::seq::index::sample(rng, max_features, num_features).into_vec();
        Ok(Self { indices })
    }

    /// Draws a selection from a `ChaCha8` generator seeded with `seed`, or
    /// from entropy when `seed` is `None`.
    ///
    /// # Errors
    ///
    /// Same as [`sample`](Self::sample).
    pub fn seeded(max_features: usize, num_features: usize, seed: Option<u64>) -> Result<Self> {
        let mut rng = seed.map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        Self::sample(max_features, num_features, &mut rng)
    }

    /// Wraps explicit indices, e.g. from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Configuration`] if `indices` is empty or holds a
    /// duplicate.
    pub fn from_indices(indices: Vec<usize>) -> Result<Self> {
        if indices.is_empty() {
            return Err(PadimError::configuration("channel selection is empty"));
        }
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(PadimError::configuration(format!(
                "channel selection repeats index {}",
                w[0]
            )));
        }
        Ok(Self { indices })
    }

    /// Selected channel indices in embedding order.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Number of selected channels `C′`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Always `false`; an empty selection cannot be constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Largest selected index.
    #[must_use]
    pub fn max_index(&self) -> usize {
        self.indices.iter().copied().max().unwrap_or(0)
    }

    /// Index tensor for `Tensor::select`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let data: Vec<i64> = self.indices.iter().map(|&i| i as i64).collect();
        Tensor::from_data(TensorData::new(data, [self.indices.len()]), device)
    }
}

impl TryFrom<Vec<usize>> for ChannelSelection {
    type Error = PadimError;

    fn try_from(indices: Vec<usize>) -> Result<Self> {
        Self::from_indices(indices)
    }
}

impl From<ChannelSelection> for Vec<usize> {
    fn from(selection: ChannelSelection) -> Self {
        selection.indices
    }
}
