//! Supported feature-extractor backbones and their channel budgets.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PadimError;

/// Convolutional backbones the model knows channel budgets for.
///
/// The backbone itself is an external collaborator; this crate only needs its
/// identity (persisted with the fitted model) and its default embedding sizes.
///
/// # Example
///
/// ```
/// use padim_model::Backbone;
///
/// let backbone: Backbone = "resnet18".parse().unwrap_or_default();
/// assert_eq!(backbone.default_num_features(), 100);
/// assert_eq!(backbone.default_max_features(), 448);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Backbone {
    /// `ResNet-18`, three stages concatenate to 448 channels.
    #[default]
    #[serde(rename = "resnet18")]
    Resnet18,

    /// Wide `ResNet-50-2`, three stages concatenate to 1792 channels.
    #[serde(rename = "wide_resnet50_2")]
    WideResnet50,
}

impl Backbone {
    /// All supported backbones.
    pub const ALL: [Self; 2] = [Self::Resnet18, Self::WideResnet50];

    /// Returns the backbone identifier as persisted and configured.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Resnet18 => "resnet18",
            Self::WideResnet50 => "wide_resnet50_2",
        }
    }

    /// Default subsampled embedding width `C′`.
    #[must_use]
    pub const fn default_num_features(&self) -> usize {
        match self {
            Self::Resnet18 => 100,
            Self::WideResnet50 => 550,
        }
    }

    /// Total concatenated channel count of the default return nodes.
    #[must_use]
    pub const fn default_max_features(&self) -> usize {
        match self {
            Self::Resnet18 => 448,
            Self::WideResnet50 => 1792,
        }
    }
}

impl FromStr for Backbone {
    type Err = PadimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|b| b.name() == s)
            .ok_or_else(|| PadimError::configuration(format!("unsupported backbone '{s}'")))
    }
}

impl std::fmt::Display for Backbone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
