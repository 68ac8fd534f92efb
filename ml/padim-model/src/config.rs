//! Model configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backbone::Backbone;
use crate::error::{PadimError, Result};

/// Default output mask size `(height, width)`.
pub const DEFAULT_MASK_SIZE: (usize, usize) = (224, 224);

/// Configuration surface for a PaDiM model.
///
/// Field names are the recognized configuration keys. Unknown keys are
/// rejected, `BACKBONE` and `RETURN_NODES` are required, everything else has a
/// default. `NUM_FEATURES` and `MAX_FEATURES` default to the backbone's
/// channel budgets.
///
/// # Example
///
/// ```
/// use padim_model::{Backbone, PadimConfig};
///
/// let json = r#"{
///     "BACKBONE": "resnet18",
///     "RETURN_NODES": ["layer1", "layer2", "layer3"],
///     "SEED": 42
/// }"#;
///
/// let config = PadimConfig::from_json_str(json).unwrap_or_else(|_| PadimConfig::new(
///     Backbone::Resnet18,
///     vec!["layer1".into()],
/// ));
/// assert_eq!(config.num_features(), 100);
/// assert_eq!(config.mask_size, (224, 224));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PadimConfig {
    /// Backbone identifier.
    #[serde(rename = "BACKBONE")]
    pub backbone: Backbone,

    /// Ordered layer names; the first one fixes the embedding resolution.
    #[serde(rename = "RETURN_NODES")]
    pub return_nodes: Vec<String>,

    /// Whether the extractor uses pretrained weights.
    #[serde(rename = "PRETRAINED", default = "default_pretrained")]
    pub pretrained: bool,

    /// Anomaly map output size `(height, width)`.
    #[serde(rename = "MASK_SIZE", default = "default_mask_size")]
    pub mask_size: (usize, usize),

    /// Seed for the channel selection draw. `None` draws from entropy.
    #[serde(rename = "SEED", default)]
    pub seed: Option<u64>,

    /// Subsampled embedding width `C′`.
    #[serde(rename = "NUM_FEATURES", default, skip_serializing_if = "Option::is_none")]
    pub num_features: Option<usize>,

    /// Channel range the selection is drawn from.
    #[serde(rename = "MAX_FEATURES", default, skip_serializing_if = "Option::is_none")]
    pub max_features: Option<usize>,
}

const fn default_pretrained() -> bool {
    true
}

const fn default_mask_size() -> (usize, usize) {
    DEFAULT_MASK_SIZE
}

impl PadimConfig {
    /// Creates a configuration with default optional keys.
    #[must_use]
    pub fn new(backbone: Backbone, return_nodes: Vec<String>) -> Self {
        Self {
            backbone,
            return_nodes,
            pretrained: true,
            mask_size: DEFAULT_MASK_SIZE,
            seed: None,
            num_features: None,
            max_features: None,
        }
    }

    /// Sets the channel selection seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the anomaly map output size.
    #[must_use]
    pub fn with_mask_size(mut self, height: usize, width: usize) -> Self {
        self.mask_size = (height, width);
        self
    }

    /// Overrides the backbone's channel budgets.
    #[must_use]
    pub fn with_features(mut self, num_features: usize, max_features: usize) -> Self {
        self.num_features = Some(num_features);
        self.max_features = Some(max_features);
        self
    }

    /// Sets whether the extractor is pretrained.
    #[must_use]
    pub fn with_pretrained(mut self, pretrained: bool) -> Self {
        self.pretrained = pretrained;
        self
    }

    /// Effective embedding width `C′`.
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.num_features
            .unwrap_or_else(|| self.backbone.default_num_features())
    }

    /// Effective channel range for the selection draw.
    #[must_use]
    pub fn max_features(&self) -> usize {
        self.max_features
            .unwrap_or_else(|| self.backbone.default_max_features())
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.return_nodes.is_empty() {
            return Err(PadimError::configuration("RETURN_NODES must not be empty"));
        }
        for (i, node) in self.return_nodes.iter().enumerate() {
            if node.is_empty() {
                return Err(PadimError::configuration(format!(
                    "RETURN_NODES[{i}] is empty"
                )));
            }
            if self.return_nodes[..i].contains(node) {
                return Err(PadimError::configuration(format!(
                    "RETURN_NODES contains '{node}' more than once"
                )));
            }
        }
        if self.mask_size.0 == 0 || self.mask_size.1 == 0 {
            return Err(PadimError::configuration(format!(
                "MASK_SIZE must be positive, got {:?}",
                self.mask_size
            )));
        }
        let (num, max) = (self.num_features(), self.max_features());
        if num == 0 {
            return Err(PadimError::configuration("NUM_FEATURES must be > 0"));
        }
        if num > max {
            return Err(PadimError::configuration(format!(
                "NUM_FEATURES ({num}) exceeds MAX_FEATURES ({max})"
            )));
        }
        Ok(())
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Configuration`] on unknown or missing keys, an
    /// unsupported backbone, or a failed [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PadimError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Io`] if the file cannot be read, otherwise the
    /// same errors as [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
