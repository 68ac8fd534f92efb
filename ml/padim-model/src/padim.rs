//! The composed PaDiM model.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use tracing::{debug, info};

use crate::anomaly_map::AnomalyMapGenerator;
use crate::checkpoint::{CheckpointFormat, PadimCheckpoint, load_checkpoint, save_checkpoint};
use crate::config::PadimConfig;
use crate::embedding::EmbeddingAssembler;
use crate::error::{PadimError, Result};
use crate::extractor::LayerFeatures;
use crate::gaussian::{DEFAULT_EPSILON, GaussianModel, MomentAccumulator, MultiVariateGaussian};
use crate::selection::ChannelSelection;

/// Patch distribution model: embedding assembly, per-location Gaussian and
/// Mahalanobis scoring behind one handle.
///
/// The channel selection is drawn once in [`new`](Self::new) from the
/// configured seed and never regenerated. Scoring takes `&self`, so a fitted
/// model can be shared across threads; refitting takes `&mut self` and must
/// not overlap with scoring.
///
/// # Example
///
/// ```ignore
/// let config = PadimConfig::new(Backbone::Resnet18, vec!["layer1".into(), "layer2".into(), "layer3".into()])
///     .with_seed(42);
/// let mut padim = Padim::<MyBackend>::new(config, &device)?;
///
/// padim.fit(padim.embed(&train_features)?)?;
/// let map = padim.anomaly_map(&test_features)?; // [batch, 1, 224, 224]
/// padim.save("padim", CheckpointFormat::Binary)?;
/// ```
#[derive(Debug, Clone)]
pub struct Padim<B: Backend> {
    config: PadimConfig,
    assembler: EmbeddingAssembler,
    gaussian: MultiVariateGaussian<B>,
    generator: AnomalyMapGenerator,
    device: B::Device,
}

impl<B: Backend> Padim<B> {
    /// Creates an unfitted model with the default regularization.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Configuration`] if the configuration is invalid.
    pub fn new(config: PadimConfig, device: &B::Device) -> Result<Self> {
        Self::with_epsilon(config, DEFAULT_EPSILON, device)
    }

    /// Creates an unfitted model with regularization `epsilon`.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::Configuration`] if the configuration or
    /// `epsilon` is invalid.
    pub fn with_epsilon(config: PadimConfig, epsilon: f64, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let selection =
            ChannelSelection::seeded(config.max_features(), config.num_features(), config.seed)?;
        debug!(
            backbone = %config.backbone,
            num_features = selection.len(),
            max_features = config.max_features(),
            seed = ?config.seed,
            "drew channel selection"
        );
        let gaussian = MultiVariateGaussian::new(epsilon)?;
        Ok(Self::from_parts(config, selection, gaussian, device))
    }

    fn from_parts(
        config: PadimConfig,
        selection: ChannelSelection,
        gaussian: MultiVariateGaussian<B>,
        device: &B::Device,
    ) -> Self {
        let assembler = EmbeddingAssembler::new(config.return_nodes.clone(), selection);
        let generator = AnomalyMapGenerator::new(config.mask_size);
        Self {
            config,
            assembler,
            gaussian,
            generator,
            device: device.clone(),
        }
    }

    /// Model configuration.
    #[must_use]
    pub const fn config(&self) -> &PadimConfig {
        &self.config
    }

    /// Channel selection used by every embedding.
    #[must_use]
    pub const fn selection(&self) -> &ChannelSelection {
        self.assembler.selection()
    }

    /// Embedding assembler.
    #[must_use]
    pub const fn assembler(&self) -> &EmbeddingAssembler {
        &self.assembler
    }

    /// Anomaly map generator.
    #[must_use]
    pub const fn generator(&self) -> &AnomalyMapGenerator {
        &self.generator
    }

    /// Regularization constant ε.
    #[must_use]
    pub const fn epsilon(&self) -> f64 {
        self.gaussian.epsilon()
    }

    /// Device the fitted statistics live on.
    #[must_use]
    pub const fn device(&self) -> &B::Device {
        &self.device
    }

    /// The fitted Gaussian model.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::NotFitted`] before the first successful fit.
    pub fn model(&self) -> Result<&GaussianModel<B>> {
        self.gaussian.model()
    }

    /// Returns `true` once the model has been fit or loaded.
    #[must_use]
    pub const fn is_fitted(&self) -> bool {
        self.gaussian.is_fitted()
    }

    /// Assembles the `[batch, C′, H, W]` embedding for one feature batch.
    ///
    /// # Errors
    ///
    /// See [`EmbeddingAssembler::assemble`].
    pub fn embed(&self, features: &LayerFeatures<B>) -> Result<Tensor<B, 4>> {
        self.assembler.assemble(features)
    }

    /// Fits from the whole training set's embeddings at once.
    ///
    /// # Errors
    ///
    /// See [`MultiVariateGaussian::fit`].
    pub fn fit(&mut self, embeddings: Tensor<B, 4>) -> Result<&GaussianModel<B>> {
        self.gaussian.fit(embeddings)
    }

    /// Fits from embedding chunks that together cover the training set.
    ///
    /// # Errors
    ///
    /// See [`MultiVariateGaussian::fit_stream`].
    pub fn fit_stream<I>(&mut self, chunks: I) -> Result<&GaussianModel<B>>
    where
        I: IntoIterator<Item = Tensor<B, 4>>,
    {
        self.gaussian.fit_stream(chunks)
    }

    /// Finalizes an accumulator filled by the caller.
    ///
    /// # Errors
    ///
    /// See [`MomentAccumulator::finalize`].
    pub fn fit_accumulated(
        &mut self,
        accumulator: MomentAccumulator<B>,
    ) -> Result<&GaussianModel<B>> {
        self.gaussian.fit_accumulated(accumulator)
    }

    /// Anomaly map for a feature batch, `[batch, 1, mask_h, mask_w]`.
    ///
    /// # Errors
    ///
    /// - [`PadimError::NotFitted`] before fitting.
    /// - Assembly and scoring errors otherwise.
    pub fn anomaly_map(&self, features: &LayerFeatures<B>) -> Result<Tensor<B, 4>> {
        let model = self.gaussian.model()?;
        let embedding = self.embed(features)?;
        self.generator.compute(embedding, model)
    }

    /// Anomaly map for an already assembled embedding.
    ///
    /// # Errors
    ///
    /// - [`PadimError::NotFitted`] before fitting.
    /// - [`PadimError::ShapeMismatch`] if the embedding disagrees with the model.
    pub fn anomaly_map_from_embedding(&self, embedding: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        self.generator.compute(embedding, self.gaussian.model()?)
    }

    /// Captures the fitted state for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::NotFitted`] before fitting.
    pub fn to_checkpoint(&self) -> Result<PadimCheckpoint> {
        PadimCheckpoint::from_model(
            &self.config,
            self.selection(),
            self.epsilon(),
            self.gaussian.model()?,
        )
    }

    /// Saves the fitted model to `path` plus the format's extension.
    ///
    /// # Errors
    ///
    /// Returns [`PadimError::NotFitted`] before fitting, or
    /// [`PadimError::SaveCheckpoint`] if writing fails.
    pub fn save(&self, path: &str, format: CheckpointFormat) -> Result<String> {
        save_checkpoint(&self.to_checkpoint()?, path, format)
    }

    /// Restores a fitted model from a checkpoint produced under a compatible
    /// configuration.
    ///
    /// # Errors
    ///
    /// - Everything [`load_checkpoint`] returns.
    /// - [`PadimError::ConfigMismatch`] if the checkpoint's backbone, layer
    ///   list or `C′` differ from `config`.
    pub fn load(path: &str, config: PadimConfig, device: &B::Device) -> Result<Self> {
        let checkpoint = load_checkpoint(path)?;
        Self::from_checkpoint(&checkpoint, config, device)
    }

    /// Rebuilds a fitted model from an in-memory checkpoint.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load) minus the file errors.
    pub fn from_checkpoint(
        checkpoint: &PadimCheckpoint,
        config: PadimConfig,
        device: &B::Device,
    ) -> Result<Self> {
        config.validate()?;
        checkpoint.check_config(&config)?;

        let selection = checkpoint.selection()?;
        if selection.max_index() >= config.max_features() {
            return Err(PadimError::config_mismatch(
                "MAX_FEATURES",
                config.max_features().to_string(),
                format!("selected index {}", selection.max_index()),
            ));
        }

        let mut gaussian = MultiVariateGaussian::new(checkpoint.epsilon)?;
        gaussian.install(checkpoint.to_model(device)?);
        info!(
            backbone = %config.backbone,
            samples = checkpoint.sample_count,
            height = checkpoint.height,
            width = checkpoint.width,
            "restored fitted model"
        );
        Ok(Self::from_parts(config, selection, gaussian, device))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::backbone::Backbone;
    use crate::linalg::host_values;
    use approx::assert_relative_eq;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn config() -> PadimConfig {
        PadimConfig::new(Backbone::Resnet18, vec!["a".into(), "b".into()])
            .with_features(3, 6)
            .with_seed(7)
            .with_mask_size(8, 8)
    }

    fn grid(n: usize, c: usize, h: usize, w: usize, salt: usize) -> Tensor<TestBackend, 4> {
        let values: Vec<f32> = (0..n * c * h * w)
            .map(|i| (((i + salt) * 7919 % 211) as f32) / 100.0)
            .collect();
        Tensor::from_data(TensorData::new(values, [n, c, h, w]), &Default::default())
    }

    /// Layer "a": 4 channels at 4x4, layer "b": 2 channels at 2x2.
    fn features(n: usize, salt: usize) -> LayerFeatures<TestBackend> {
        let mut features = LayerFeatures::new();
        features.insert("a".into(), grid(n, 4, 4, 4, salt));
        features.insert("b".into(), grid(n, 2, 2, 2, salt + 3));
        features
    }

    fn fitted() -> Padim<TestBackend> {
        let mut padim = Padim::<TestBackend>::new(config(), &Default::default()).expect("new");
        let embedding = padim.embed(&features(12, 0)).expect("embed");
        padim.fit(embedding).expect("fit");
        padim
    }

    #[test]
    fn new_draws_seeded_selection() {
        let a = Padim::<TestBackend>::new(config(), &Default::default()).expect("a");
        let b = Padim::<TestBackend>::new(config(), &Default::default()).expect("b");
        assert_eq!(a.selection(), b.selection());
        assert_eq!(a.selection().len(), 3);
        assert!(a.selection().max_index() < 6);
        assert!(!a.is_fitted());
        assert_relative_eq!(a.epsilon(), DEFAULT_EPSILON);
    }

    #[test]
    fn new_rejects_invalid_config() {
        let bad = config().with_features(7, 6);
        assert!(matches!(
            Padim::<TestBackend>::new(bad, &Default::default()),
            Err(PadimError::Configuration(_))
        ));
    }

    #[test]
    fn embed_shape() {
        let padim = Padim::<TestBackend>::new(config(), &Default::default()).expect("new");
        let embedding = padim.embed(&features(2, 0)).expect("embed");
        assert_eq!(embedding.dims(), [2, 3, 4, 4]);
    }

    #[test]
    fn anomaly_map_requires_fit() {
        let padim = Padim::<TestBackend>::new(config(), &Default::default()).expect("new");
        assert!(matches!(
            padim.anomaly_map(&features(1, 0)),
            Err(PadimError::NotFitted)
        ));
        assert!(matches!(padim.to_checkpoint(), Err(PadimError::NotFitted)));
    }

    #[test]
    fn anomaly_map_has_mask_size() {
        let padim = fitted();
        let map = padim.anomaly_map(&features(2, 5)).expect("map");
        assert_eq!(map.dims(), [2, 1, 8, 8]);
    }

    #[test]
    fn anomaly_map_matches_embedding_path() {
        let padim = fitted();
        let test = features(1, 9);
        let direct = host_values(padim.anomaly_map(&test).expect("direct")).expect("v");
        let embedding = padim.embed(&test).expect("embed");
        let via = host_values(padim.anomaly_map_from_embedding(embedding).expect("via"))
            .expect("v");
        assert_eq!(direct, via);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn fitted_model_scores_from_parallel_threads() {
        assert_send_sync::<Padim<TestBackend>>();

        let padim = fitted();
        let test = features(2, 11);
        let expected = host_values(padim.anomaly_map(&test).expect("map")).expect("v");

        let results: Vec<Vec<f32>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        host_values(padim.anomaly_map(&test).expect("map")).expect("v")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("scoring thread panicked"))
                .collect()
        });

        for values in results {
            assert_eq!(values.len(), expected.len());
            for (a, b) in values.iter().zip(&expected) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn fit_stream_matches_fit() {
        let padim = fitted();
        let mut streamed = Padim::<TestBackend>::new(config(), &Default::default()).expect("new");
        let chunks = vec![
            streamed.embed(&features(12, 0)).expect("embed").slice([0..5]),
            streamed.embed(&features(12, 0)).expect("embed").slice([5..12]),
        ];
        streamed.fit_stream(chunks).expect("fit");

        let test = features(1, 4);
        let a = host_values(padim.anomaly_map(&test).expect("a")).expect("a");
        let b = host_values(streamed.anomaly_map(&test).expect("b")).expect("b");
        for (x, y) in a.iter().zip(&b) {
            assert_relative_eq!(*x, *y, epsilon = 1e-3, max_relative = 1e-3);
        }
    }

    #[test]
    fn save_load_reproduces_scores() {
        let dir = TempDir::new().expect("tempdir");
        let padim = fitted();
        let base = dir.path().join("padim").to_string_lossy().into_owned();

        for format in [CheckpointFormat::Binary, CheckpointFormat::Json] {
            let path = padim.save(&base, format).expect("save");
            let restored =
                Padim::<TestBackend>::load(&path, config(), &Default::default()).expect("load");
            assert_eq!(restored.selection(), padim.selection());
            assert!(restored.is_fitted());

            let test = features(2, 11);
            let before = host_values(padim.anomaly_map(&test).expect("before")).expect("v");
            let after = host_values(restored.anomaly_map(&test).expect("after")).expect("v");
            for (x, y) in before.iter().zip(&after) {
                assert_relative_eq!(*x, *y, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn load_ignores_seed_of_loading_config() {
        let padim = fitted();
        let checkpoint = padim.to_checkpoint().expect("checkpoint");
        let other_seed = config().with_seed(12345);
        let restored =
            Padim::<TestBackend>::from_checkpoint(&checkpoint, other_seed, &Default::default())
                .expect("restore");
        assert_eq!(restored.selection(), padim.selection());
    }

    #[test]
    fn load_rejects_mismatched_config() {
        let padim = fitted();
        let checkpoint = padim.to_checkpoint().expect("checkpoint");

        let other_nodes = PadimConfig {
            return_nodes: vec!["a".into()],
            ..config()
        };
        assert!(matches!(
            Padim::<TestBackend>::from_checkpoint(&checkpoint, other_nodes, &Default::default()),
            Err(PadimError::ConfigMismatch { .. })
        ));

        let narrower = config().with_features(2, 6);
        assert!(matches!(
            Padim::<TestBackend>::from_checkpoint(&checkpoint, narrower, &Default::default()),
            Err(PadimError::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn load_rejects_selection_outside_channel_range() {
        let padim = fitted();
        let mut checkpoint = padim.to_checkpoint().expect("checkpoint");
        checkpoint.channel_selection = vec![0, 1, 9];
        assert!(matches!(
            Padim::<TestBackend>::from_checkpoint(&checkpoint, config(), &Default::default()),
            Err(PadimError::ConfigMismatch { ref field, .. }) if field == "MAX_FEATURES"
        ));
    }
}
