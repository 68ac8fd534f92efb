//! End-to-end tests for the padim-model public API.
//!
//! A synthetic extractor stands in for the frozen backbone: it exposes the
//! image itself at half resolution as `layer1` and a scaled copy at quarter
//! resolution as `layer2`. That is enough structure for a defect in the image
//! to show up as an outlier at the matching embedding locations.

// Allow test-specific patterns
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::cast_precision_loss)]

use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use padim_model::prelude::*;
use padim_model::{DEFAULT_EPSILON, host_values};
use tempfile::TempDir;

type TestBackend = NdArray<f32>;

const IMAGE: usize = 16;

struct DownsamplingExtractor {
    nodes: Vec<String>,
}

impl DownsamplingExtractor {
    fn new() -> Self {
        Self {
            nodes: vec!["layer1".into(), "layer2".into()],
        }
    }
}

impl FeatureExtractor<TestBackend> for DownsamplingExtractor {
    fn backbone(&self) -> Backbone {
        Backbone::Resnet18
    }

    fn return_nodes(&self) -> &[String] {
        &self.nodes
    }

    fn extract(
        &self,
        images: Tensor<TestBackend, 4>,
    ) -> padim_model::Result<LayerFeatures<TestBackend>> {
        let [_, _, h, w] = images.dims();
        let nearest = || InterpolateOptions::new(InterpolateMode::Nearest);
        let layer1 = interpolate(images.clone(), [h / 2, w / 2], nearest());
        let layer2 = interpolate(images.mul_scalar(2.0), [h / 4, w / 4], nearest());

        let mut features = LayerFeatures::new();
        features.insert("layer1".into(), layer1);
        features.insert("layer2".into(), layer2);
        Ok(features)
    }
}

fn config() -> PadimConfig {
    PadimConfig::new(Backbone::Resnet18, vec!["layer1".into(), "layer2".into()])
        .with_features(4, 6)
        .with_mask_size(IMAGE, IMAGE)
        .with_seed(42)
}

/// Smooth base pattern plus small deterministic noise.
fn normal_images(n: usize, salt: u64) -> Tensor<TestBackend, 4> {
    let mut state = salt.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    let mut values = Vec::with_capacity(n * 3 * IMAGE * IMAGE);
    for _ in 0..n {
        for c in 0..3 {
            for h in 0..IMAGE {
                for w in 0..IMAGE {
                    state = state
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1_442_695_040_888_963_407);
                    let noise = ((state >> 40) as f32) / ((1u64 << 24) as f32) - 0.5;
                    let base = (c as f32) * 0.3 + (h as f32 + w as f32) / (2.0 * IMAGE as f32);
                    values.push(base + 0.1 * noise);
                }
            }
        }
    }
    Tensor::from_data(
        TensorData::new(values, [n, 3, IMAGE, IMAGE]),
        &Default::default(),
    )
}

/// Normal images with a bright defect in the top-left quadrant.
fn defective_images(n: usize, salt: u64) -> Tensor<TestBackend, 4> {
    let mut values = host_values(normal_images(n, salt)).unwrap();
    for item in 0..n {
        for c in 0..3 {
            for h in 0..IMAGE / 4 {
                for w in 0..IMAGE / 4 {
                    values[((item * 3 + c) * IMAGE + h) * IMAGE + w] += 5.0;
                }
            }
        }
    }
    Tensor::from_data(
        TensorData::new(values, [n, 3, IMAGE, IMAGE]),
        &Default::default(),
    )
}

fn fitted() -> (Padim<TestBackend>, DownsamplingExtractor) {
    let extractor = DownsamplingExtractor::new();
    let mut padim = Padim::<TestBackend>::new(config(), &Default::default()).unwrap();
    let chunks: Vec<_> = (0..4)
        .map(|i| {
            let features = extractor.extract(normal_images(8, i)).unwrap();
            padim.embed(&features).unwrap()
        })
        .collect();
    padim.fit_stream(chunks).unwrap();
    (padim, extractor)
}

fn quadrant_mean(map: &[f32], top: bool, left: bool) -> f32 {
    let rows = if top { 0..IMAGE / 4 } else { 3 * IMAGE / 4..IMAGE };
    let mut sum = 0.0;
    let mut count = 0;
    for h in rows {
        let cols = if left { 0..IMAGE / 4 } else { 3 * IMAGE / 4..IMAGE };
        for w in cols {
            sum += map[h * IMAGE + w];
            count += 1;
        }
    }
    sum / count as f32
}

// =============================================================================
// Construction
// =============================================================================

mod construction {
    use super::*;

    #[test]
    fn config_from_json_builds_model() {
        let json = r#"{
            "BACKBONE": "resnet18",
            "RETURN_NODES": ["layer1", "layer2"],
            "MASK_SIZE": [16, 16],
            "SEED": 42,
            "NUM_FEATURES": 4,
            "MAX_FEATURES": 6
        }"#;
        let parsed = PadimConfig::from_json_str(json).unwrap();
        assert_eq!(parsed, config());

        let padim = Padim::<TestBackend>::new(parsed, &Default::default()).unwrap();
        assert_eq!(padim.selection().len(), 4);
        assert!(!padim.is_fitted());
    }

    #[test]
    fn unknown_config_key_rejected() {
        let json = r#"{"BACKBONE": "resnet18", "RETURN_NODES": ["layer1"], "LAYERS": 3}"#;
        assert!(matches!(
            PadimConfig::from_json_str(json),
            Err(PadimError::Configuration(_))
        ));
    }

    #[test]
    fn unsupported_backbone_rejected() {
        let json = r#"{"BACKBONE": "vgg16", "RETURN_NODES": ["layer1"]}"#;
        assert!(matches!(
            PadimConfig::from_json_str(json),
            Err(PadimError::Configuration(_))
        ));
    }

    #[test]
    fn same_seed_same_selection() {
        let a = Padim::<TestBackend>::new(config(), &Default::default()).unwrap();
        let b = Padim::<TestBackend>::new(config(), &Default::default()).unwrap();
        assert_eq!(a.selection(), b.selection());
    }

    #[test]
    fn embedding_uses_first_layer_resolution() {
        let extractor = DownsamplingExtractor::new();
        let padim = Padim::<TestBackend>::new(config(), &Default::default()).unwrap();
        let embedding = padim
            .embed(&extractor.extract(normal_images(3, 0)).unwrap())
            .unwrap();
        assert_eq!(embedding.dims(), [3, 4, IMAGE / 2, IMAGE / 2]);
    }
}

// =============================================================================
// Fitting and scoring
// =============================================================================

mod scoring {
    use super::*;

    #[test]
    fn defect_scores_above_background() {
        let (padim, extractor) = fitted();
        let map = padim
            .anomaly_map(&extractor.extract(defective_images(1, 99)).unwrap())
            .unwrap();
        assert_eq!(map.dims(), [1, 1, IMAGE, IMAGE]);

        let values = host_values(map).unwrap();
        let defect = quadrant_mean(&values, true, true);
        let background = quadrant_mean(&values, false, false);
        assert!(
            defect > 10.0 * background,
            "defect {defect} vs background {background}"
        );
    }

    #[test]
    fn defective_image_max_exceeds_normal() {
        let (padim, extractor) = fitted();
        let max_of = |images: Tensor<TestBackend, 4>| {
            let map = padim
                .anomaly_map(&extractor.extract(images).unwrap())
                .unwrap();
            host_values(map)
                .unwrap()
                .into_iter()
                .fold(f32::NEG_INFINITY, f32::max)
        };
        assert!(max_of(defective_images(1, 7)) > max_of(normal_images(1, 7)));
    }

    #[test]
    fn scores_are_finite_and_non_negative() {
        let (padim, extractor) = fitted();
        let map = padim
            .anomaly_map(&extractor.extract(normal_images(2, 123)).unwrap())
            .unwrap();
        for v in host_values(map).unwrap() {
            assert!(v.is_finite());
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn fitted_model_is_symmetric() {
        let (padim, _) = fitted();
        let model = padim.model().unwrap();
        let c = model.num_features();
        let inv = host_values(model.inverse_covariance().clone()).unwrap();
        for loc in 0..model.locations() {
            for i in 0..c {
                for j in 0..c {
                    let a = inv[loc * c * c + i * c + j];
                    let b = inv[loc * c * c + j * c + i];
                    assert!((a - b).abs() <= 1e-3 * a.abs().max(1.0));
                }
            }
        }
    }
}

// =============================================================================
// Persistence
// =============================================================================

mod persistence {
    use super::*;

    #[test]
    fn reload_reproduces_scores() {
        let dir = TempDir::new().unwrap();
        let (padim, extractor) = fitted();
        let path = padim
            .save(
                &dir.path().join("model").to_string_lossy(),
                CheckpointFormat::Binary,
            )
            .unwrap();

        let restored = Padim::<TestBackend>::load(&path, config(), &Default::default()).unwrap();
        let features = extractor.extract(defective_images(2, 5)).unwrap();
        let before = host_values(padim.anomaly_map(&features).unwrap()).unwrap();
        let after = host_values(restored.anomaly_map(&features).unwrap()).unwrap();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() <= 1e-5 * a.abs().max(1.0));
        }
    }

    #[test]
    fn reload_under_other_backbone_fails() {
        let dir = TempDir::new().unwrap();
        let (padim, _) = fitted();
        let path = padim
            .save(
                &dir.path().join("model").to_string_lossy(),
                CheckpointFormat::Json,
            )
            .unwrap();

        let other = PadimConfig {
            backbone: Backbone::WideResnet50,
            ..config()
        };
        assert!(matches!(
            Padim::<TestBackend>::load(&path, other, &Default::default()),
            Err(PadimError::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn checkpoint_carries_persisted_layout() {
        let (padim, _) = fitted();
        let checkpoint = padim.to_checkpoint().unwrap();
        let locations = (IMAGE / 2) * (IMAGE / 2);
        assert_eq!(checkpoint.num_features, 4);
        assert_eq!(checkpoint.channel_selection, padim.selection().indices());
        assert_eq!(checkpoint.mean.len(), 4 * locations);
        assert_eq!(checkpoint.inverse_covariance.len(), 4 * 4 * locations);
        assert_eq!(checkpoint.sample_count, 32);
        assert!((checkpoint.epsilon - DEFAULT_EPSILON).abs() < f64::EPSILON);
    }
}
