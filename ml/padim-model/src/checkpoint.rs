//! Checkpoint persistence for fitted models.
//!
//! A checkpoint stores everything needed to reproduce inference exactly:
//! the backbone and layer list the embedding was assembled from, the channel
//! selection, ε, and the per-location statistics. Arrays use the layout
//!
//! - mean: `(C′, H·W)`
//! - inverse covariance: `(C′, C′, H·W)`
//!
//! flattened in row-major order.
//!
//! # Binary layout
//!
//! ```text
//! +--------+---------+-------+------------------+
//! | "PDM1" | version | flags | bincode payload  |
//! | 4 B    | u32 LE  | u32 LE| PadimCheckpoint  |
//! +--------+---------+-------+------------------+
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backbone::Backbone;
use crate::config::PadimConfig;
use crate::error::{PadimError, Result};
use crate::gaussian::GaussianModel;
use crate::linalg::host_values;
use crate::selection::ChannelSelection;

/// Magic bytes identifying a binary checkpoint.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"PDM1";

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Binary header size in bytes (magic + version + flags).
pub const CHECKPOINT_HEADER_SIZE: usize = 12;

/// Supported checkpoint file formats.
///
/// # Example
///
/// ```
/// use padim_model::CheckpointFormat;
///
/// assert_eq!(CheckpointFormat::from_extension("padim"), Some(CheckpointFormat::Binary));
/// assert_eq!(CheckpointFormat::from_extension("json"), Some(CheckpointFormat::Json));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CheckpointFormat {
    /// Header plus `bincode` payload. Compact, exact.
    #[default]
    Binary,

    /// Pretty-printed JSON for inspection.
    Json,
}

impl CheckpointFormat {
    /// Determines format from file extension.
    ///
    /// - `.bin`, `.padim` -> Binary
    /// - `.json` -> Json
    /// - Other -> None
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "bin" | "padim" => Some(Self::Binary),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Determines format from file path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Returns the default file extension for this format.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Binary => "bin",
            Self::Json => "json",
        }
    }

    /// Returns the format name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CheckpointHeader {
    magic: [u8; 4],
    version: u32,
    flags: u32,
}

impl CheckpointHeader {
    const fn current() -> Self {
        Self {
            magic: CHECKPOINT_MAGIC,
            version: CHECKPOINT_VERSION,
            flags: 0,
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        let mut version_bytes = [0u8; 4];
        reader.read_exact(&mut version_bytes)?;

        let mut flags_bytes = [0u8; 4];
        reader.read_exact(&mut flags_bytes)?;

        Ok(Self {
            magic,
            version: u32::from_le_bytes(version_bytes),
            flags: u32::from_le_bytes(flags_bytes),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.magic != CHECKPOINT_MAGIC {
            return Err(PadimError::invalid_header(format!(
                "bad magic {:?}",
                self.magic
            )));
        }
        if self.version != CHECKPOINT_VERSION {
            return Err(PadimError::invalid_header(format!(
                "unsupported version {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// Persisted state of a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadimCheckpoint {
    /// Format version, equal to [`CHECKPOINT_VERSION`] when written.
    pub version: u32,
    /// Backbone the embeddings were extracted with.
    pub backbone: Backbone,
    /// Ordered layer names.
    pub return_nodes: Vec<String>,
    /// Embedding width `C′`.
    pub num_features: usize,
    /// Regularization ε used at fit time.
    pub epsilon: f64,
    /// Ordered channel indices into the concatenated layers.
    pub channel_selection: Vec<usize>,
    /// Embedding grid height `H`.
    pub height: usize,
    /// Embedding grid width `W`.
    pub width: usize,
    /// Number of training embeddings.
    pub sample_count: usize,
    /// Means, `(C′, H·W)`.
    pub mean: Vec<f32>,
    /// Inverse covariances, `(C′, C′, H·W)`.
    pub inverse_covariance: Vec<f32>,
}

impl PadimCheckpoint {
    /// Captures a fitted model together with its assembly parameters.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::TensorData`] if the statistics cannot be read
    /// back from the device.
    pub fn from_model<B: Backend>(
        config: &PadimConfig,
        selection: &ChannelSelection,
        epsilon: f64,
        model: &GaussianModel<B>,
    ) -> Result<Self> {
        // [H·W, C′] -> [C′, H·W]
        let mean = host_values(model.mean().clone().swap_dims(0, 1))?;
        // [H·W, C′, C′] -> [C′, C′, H·W]
        let inverse_covariance =
            host_values(model.inverse_covariance().clone().permute([1, 2, 0]))?;

        Ok(Self {
            version: CHECKPOINT_VERSION,
            backbone: config.backbone,
            return_nodes: config.return_nodes.clone(),
            num_features: model.num_features(),
            epsilon,
            channel_selection: selection.indices().to_vec(),
            height: model.height(),
            width: model.width(),
            sample_count: model.sample_count(),
            mean,
            inverse_covariance,
        })
    }

    /// Checks internal consistency of the stored arrays and metadata.
    ///
    /// # Errors
    ///
    /// - [`PadimError::ShapeMismatch`] if an array length disagrees with
    ///   `C′`, `H` and `W`, or the selection length differs from `C′`.
    /// - [`PadimError::Configuration`] if the selection or ε is invalid.
    pub fn validate(&self) -> Result<()> {
        let locations = self.height * self.width;
        let c = self.num_features;

        if self.channel_selection.len() != c {
            return Err(PadimError::shape_mismatch(
                format!("{c} selected channels"),
                format!("{}", self.channel_selection.len()),
            ));
        }
        if self.mean.len() != c * locations {
            return Err(PadimError::shape_mismatch(
                format!("mean of {} values ({c}, {locations})", c * locations),
                format!("{} values", self.mean.len()),
            ));
        }
        if self.inverse_covariance.len() != c * c * locations {
            return Err(PadimError::shape_mismatch(
                format!(
                    "inverse covariance of {} values ({c}, {c}, {locations})",
                    c * c * locations
                ),
                format!("{} values", self.inverse_covariance.len()),
            ));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(PadimError::configuration(format!(
                "stored epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        ChannelSelection::from_indices(self.channel_selection.clone()).map(|_| ())
    }

    /// Checks the checkpoint against the configuration it is loaded under.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::ConfigMismatch`] naming the first of backbone,
    /// return nodes or feature count that differs.
    pub fn check_config(&self, config: &PadimConfig) -> Result<()> {
        if self.backbone != config.backbone {
            return Err(PadimError::config_mismatch(
                "BACKBONE",
                config.backbone.name(),
                self.backbone.name(),
            ));
        }
        if self.return_nodes != config.return_nodes {
            return Err(PadimError::config_mismatch(
                "RETURN_NODES",
                format!("{:?}", config.return_nodes),
                format!("{:?}", self.return_nodes),
            ));
        }
        if self.num_features != config.num_features() {
            return Err(PadimError::config_mismatch(
                "NUM_FEATURES",
                config.num_features().to_string(),
                self.num_features.to_string(),
            ));
        }
        Ok(())
    }

    /// Stored channel selection.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Configuration`] if the indices are empty or repeat.
    pub fn selection(&self) -> Result<ChannelSelection> {
        ChannelSelection::from_indices(self.channel_selection.clone())
    }

    /// Rebuilds the fitted model on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::ShapeMismatch`] if the stored arrays are
    /// inconsistent.
    pub fn to_model<B: Backend>(&self, device: &B::Device) -> Result<GaussianModel<B>> {
        self.validate()?;
        let c = self.num_features;
        let locations = self.height * self.width;

        let mean = Tensor::<B, 2>::from_data(
            TensorData::new(self.mean.clone(), [c, locations]),
            device,
        )
        .swap_dims(0, 1);
        let inv_covariance = Tensor::<B, 3>::from_data(
            TensorData::new(self.inverse_covariance.clone(), [c, c, locations]),
            device,
        )
        .permute([2, 0, 1]);

        GaussianModel::new(
            mean,
            inv_covariance,
            self.height,
            self.width,
            self.sample_count,
        )
    }
}

/// Saves a checkpoint to a file.
///
/// # Arguments
///
/// - `checkpoint`: The checkpoint to save
/// - `path`: Output file path (without extension)
/// - `format`: Checkpoint format to use
///
/// # Returns
///
/// The full path to the saved checkpoint (with extension added).
///
/// # Errors
///
/// Returns `PadimError::SaveCheckpoint` if writing fails.
pub fn save_checkpoint(
    checkpoint: &PadimCheckpoint,
    path: &str,
    format: CheckpointFormat,
) -> Result<String> {
    let full_path = format!("{}.{}", path, format.extension());
    let fail = |reason: String| PadimError::save_checkpoint(&full_path, reason);

    let file = File::create(&full_path).map_err(|e| fail(e.to_string()))?;
    let mut writer = BufWriter::new(file);

    match format {
        CheckpointFormat::Binary => {
            CheckpointHeader::current()
                .write_to(&mut writer)
                .map_err(|e| fail(e.to_string()))?;
            bincode::serialize_into(&mut writer, checkpoint).map_err(|e| fail(e.to_string()))?;
        }
        CheckpointFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, checkpoint)
                .map_err(|e| fail(e.to_string()))?;
        }
    }
    writer.flush().map_err(|e| fail(e.to_string()))?;

    info!(
        path = %full_path,
        %format,
        locations = checkpoint.height * checkpoint.width,
        channels = checkpoint.num_features,
        "saved checkpoint"
    );
    Ok(full_path)
}

/// Loads and validates a checkpoint from a file.
///
/// The format is chosen by extension.
///
/// # Errors
///
/// Returns `PadimError::CheckpointNotFound` if the file doesn't exist.
/// Returns `PadimError::UnsupportedFormat` if the format can't be determined.
/// Returns `PadimError::InvalidCheckpointHeader` for a corrupt binary header.
/// Returns `PadimError::LoadCheckpoint` if the payload cannot be decoded.
/// Returns the errors of [`PadimCheckpoint::validate`] for inconsistent contents.
pub fn load_checkpoint(path: &str) -> Result<PadimCheckpoint> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(PadimError::checkpoint_not_found(path));
    }

    let format =
        CheckpointFormat::from_path(path_obj).ok_or_else(|| PadimError::unsupported_format(path))?;

    let file = File::open(path_obj).map_err(|e| PadimError::load_checkpoint(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    let checkpoint: PadimCheckpoint = match format {
        CheckpointFormat::Binary => {
            let header = CheckpointHeader::read_from(&mut reader)
                .map_err(|e| PadimError::invalid_header(format!("truncated header: {e}")))?;
            header.validate()?;
            bincode::deserialize_from(&mut reader)
                .map_err(|e| PadimError::load_checkpoint(path, e.to_string()))?
        }
        CheckpointFormat::Json => serde_json::from_reader(&mut reader)
            .map_err(|e| PadimError::load_checkpoint(path, e.to_string()))?,
    };

    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(PadimError::load_checkpoint(
            path,
            format!("unsupported checkpoint version {}", checkpoint.version),
        ));
    }
    checkpoint.validate()?;

    info!(
        path,
        %format,
        backbone = %checkpoint.backbone,
        samples = checkpoint.sample_count,
        "loaded checkpoint"
    );
    Ok(checkpoint)
}
