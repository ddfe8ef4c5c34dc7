//! Experiment configuration.
//!
//! A single TOML file describes the model architecture, the risk-factor schema,
//! both training stages, the adversary, augmentation and evaluation checks. Every field has a default
//! so a partial file (or no file at all) yields a usable configuration.

use crate::risk_factors::{FieldKind, FieldSpec, RiskFactorSchema};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Architecture of the image encoder, aggregator and hazard head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of yearly horizons in every risk curve.
    pub horizons: usize,
    pub image_height: usize,
    pub image_width: usize,
    pub pixel_mean: f64,
    pub pixel_std: f64,
    /// Output channels of each 3x3 convolution, in order.
    pub encoder_channels: Vec<usize>,
    pub encoder_stride: usize,
    pub embedding_dim: usize,
    pub aggregator_dim: usize,
    pub use_history: bool,
    pub max_prior_exams: usize,
    /// Width of each per-field risk-factor embedding.
    pub field_dim: usize,
    /// Width of the fused risk-factor embedding (before indicator channels).
    pub risk_factor_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            horizons: 5,
            image_height: 2048,
            image_width: 1664,
            pixel_mean: 7047.99,
            pixel_std: 12005.5,
            encoder_channels: vec![8, 16, 32, 64],
            encoder_stride: 2,
            embedding_dim: 64,
            aggregator_dim: 64,
            use_history: false,
            max_prior_exams: 2,
            field_dim: 8,
            risk_factor_dim: 16,
        }
    }
}

/// Optimization settings for one training stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub epochs: usize,
    pub batch_size: usize,
    /// Epochs without a development C-index improvement before stopping.
    pub patience: usize,
    /// Hard cap on optimizer steps; 0 means unlimited.
    pub max_steps: usize,
    pub gradient_clip: f64,
}

impl StageConfig {
    pub fn stage1_default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 5e-5,
            epochs: 20,
            batch_size: 8,
            patience: 5,
            max_steps: 0,
            gradient_clip: 5.0,
        }
    }

    pub fn stage2_default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 5e-5,
            epochs: 40,
            batch_size: 32,
            patience: 8,
            max_steps: 0,
            gradient_clip: 5.0,
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::stage1_default()
    }
}

/// Device discriminator and alternation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdversaryConfig {
    pub enabled: bool,
    /// Weight of the adversarial gradient subtracted from the main update.
    pub loss_weight: f64,
    pub steps_per_main_step: usize,
    pub hidden_dim: usize,
    pub learning_rate: f64,
    /// Mean adversary loss below `dominance_ratio * ln(K)` is reported as dominating.
    pub dominance_ratio: f64,
    /// Mean adversary loss above `collapse_ratio * ln(K)` is reported as collapsed.
    pub collapse_ratio: f64,
    /// Number of recent adversary losses averaged by the monitor.
    pub monitor_window: usize,
}

impl Default for AdversaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loss_weight: 1.0,
            steps_per_main_step: 3,
            hidden_dim: 32,
            learning_rate: 1e-3,
            dominance_ratio: 0.25,
            collapse_ratio: 1.5,
            monitor_window: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub horizontal_flip_probability: f64,
    pub vertical_flip_probability: f64,
    pub max_rotation_degrees: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            horizontal_flip_probability: 0.5,
            vertical_flip_probability: 0.5,
            max_rotation_degrees: 20.0,
        }
    }
}

/// Hyperparameter grid searched in each stage. Empty lists keep the stage value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub learning_rates: Vec<f64>,
    pub weight_decays: Vec<f64>,
    /// Number of isolated execution slots candidates are spread across.
    pub device_slots: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            learning_rates: Vec::new(),
            weight_decays: Vec::new(),
            device_slots: 1,
        }
    }
}

/// Sanity checks applied when a trained model is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Lowest acceptable first-year risk for an exam whose cancer was found at that screening.
    pub min_screen_detected_risk: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            min_screen_detected_risk: 0.05,
        }
    }
}

fn default_stage1() -> StageConfig {
    StageConfig::stage1_default()
}

fn default_stage2() -> StageConfig {
    StageConfig::stage2_default()
}

fn default_model_version() -> String {
    "mammorisk-0.1.0".to_string()
}

/// The complete experiment description loaded from `experiment.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    /// Worker threads: negative leaves the pool alone, 0 picks automatically.
    #[serde(default)]
    pub threads: i64,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default = "default_schema")]
    pub risk_factors: RiskFactorSchema,
    #[serde(default = "default_stage1")]
    pub stage1: StageConfig,
    #[serde(default = "default_stage2")]
    pub stage2: StageConfig,
    #[serde(default)]
    pub adversary: AdversaryConfig,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

fn default_schema() -> RiskFactorSchema {
    RiskFactorSchema::new(vec![
        FieldSpec::new(
            "age",
            FieldKind::Continuous {
                mean: 57.0,
                std: 10.0,
            },
        ),
        FieldSpec::new("density", FieldKind::Categorical { levels: 4 }),
        FieldSpec::new("family_history", FieldKind::Binary),
        FieldSpec::new("prior_biopsy", FieldKind::Binary),
        FieldSpec::new("postmenopausal", FieldKind::Binary),
    ])
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            model_version: default_model_version(),
            threads: 0,
            model: ModelConfig::default(),
            risk_factors: default_schema(),
            stage1: StageConfig::stage1_default(),
            stage2: StageConfig::stage2_default(),
            adversary: AdversaryConfig::default(),
            augmentation: AugmentationConfig::default(),
            sweep: SweepConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut writer = BufWriter::new(fs::File::create(path)?);
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Worker threads for the rayon pool. `None` leaves the pool as it is; zero
    /// means one per CPU, capped at eight.
    pub fn worker_threads(&self) -> Option<usize> {
        match self.threads {
            t if t < 0 => None,
            0 => Some(num_cpus::get().clamp(1, 8)),
            t => Some(t as usize),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.model;
        if m.horizons == 0 {
            return Err(ConfigError::Invalid("model.horizons must be at least 1".into()));
        }
        if m.image_height == 0 || m.image_width == 0 {
            return Err(ConfigError::Invalid("model image size must be non-zero".into()));
        }
        if !(m.pixel_std.is_finite() && m.pixel_std > 0.0) || !m.pixel_mean.is_finite() {
            return Err(ConfigError::Invalid(
                "model.pixel_std must be positive and pixel_mean finite".into(),
            ));
        }
        if m.encoder_channels.is_empty() || m.encoder_channels.contains(&0) {
            return Err(ConfigError::Invalid(
                "model.encoder_channels must list at least one non-zero width".into(),
            ));
        }
        if m.encoder_stride == 0 {
            return Err(ConfigError::Invalid("model.encoder_stride must be >= 1".into()));
        }
        if m.embedding_dim == 0 || m.aggregator_dim == 0 || m.field_dim == 0 {
            return Err(ConfigError::Invalid("model dimensions must be non-zero".into()));
        }
        if m.risk_factor_dim == 0 {
            return Err(ConfigError::Invalid("model.risk_factor_dim must be non-zero".into()));
        }
        self.risk_factors
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        for (name, stage) in [("stage1", &self.stage1), ("stage2", &self.stage2)] {
            if !(stage.learning_rate.is_finite() && stage.learning_rate > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.learning_rate must be positive"
                )));
            }
            if stage.batch_size == 0 {
                return Err(ConfigError::Invalid(format!("{name}.batch_size must be >= 1")));
            }
            if stage.epochs == 0 {
                return Err(ConfigError::Invalid(format!("{name}.epochs must be >= 1")));
            }
            if stage.weight_decay < 0.0 || stage.gradient_clip < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.weight_decay and gradient_clip must be non-negative"
                )));
            }
        }

        let a = &self.adversary;
        if a.loss_weight < 0.0 || !a.loss_weight.is_finite() {
            return Err(ConfigError::Invalid(
                "adversary.loss_weight must be a non-negative number".into(),
            ));
        }
        if a.enabled && (a.hidden_dim == 0 || a.learning_rate <= 0.0) {
            return Err(ConfigError::Invalid(
                "adversary.hidden_dim and learning_rate must be positive".into(),
            ));
        }
        if a.dominance_ratio >= a.collapse_ratio {
            return Err(ConfigError::Invalid(
                "adversary.dominance_ratio must be below collapse_ratio".into(),
            ));
        }

        let aug = &self.augmentation;
        for p in [aug.horizontal_flip_probability, aug.vertical_flip_probability] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Invalid(
                    "augmentation probabilities must lie in [0, 1]".into(),
                ));
            }
        }
        if aug.max_rotation_degrees < 0.0 {
            return Err(ConfigError::Invalid(
                "augmentation.max_rotation_degrees must be non-negative".into(),
            ));
        }

        if self.sweep.device_slots == 0 {
            return Err(ConfigError::Invalid("sweep.device_slots must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.evaluation.min_screen_detected_risk) {
            return Err(ConfigError::Invalid(
                "evaluation.min_screen_detected_risk must lie in [0, 1]".into(),
            ));
        }
        if self.model_version.trim().is_empty() {
            return Err(ConfigError::Invalid("model_version must not be empty".into()));
        }
        Ok(())
    }
}
