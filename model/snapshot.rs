//! Versioned, component-scoped model snapshots.
//!
//! A stage-1 run produces an [`EncoderSnapshot`]; a stage-2 run produces a
//! [`FullSnapshot`] that carries the encoder snapshot it was trained against verbatim,
//! so a full snapshot is self-contained for inference.

use crate::adversary::{DeviceDiscriminator, DeviceVocabulary};
use crate::config::ModelConfig;
use crate::encoder::{FrozenEncoder, ImageEncoder};
use crate::risk_factors::RiskFactorSchema;
use crate::risk_model::RiskModel;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Bumped whenever the on-disk layout of a snapshot changes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const ENCODER_COMPONENT: &str = "image_encoder";
const FULL_COMPONENT: &str = "full_model";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read or write snapshot file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse snapshot TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize snapshot to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("snapshot format version {found} is not supported (expected {expected})")]
    FormatVersion { expected: u32, found: u32 },
    #[error("snapshot holds component '{found}', expected '{expected}'")]
    WrongComponent { expected: String, found: String },
    #[error("snapshot is internally inconsistent: {0}")]
    Inconsistent(String),
}

fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), SnapshotError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, SnapshotError> {
    let toml_string = fs::read_to_string(path)?;
    Ok(toml::from_str(&toml_string)?)
}

fn check_header(format_version: u32, component: &str, expected: &str) -> Result<(), SnapshotError> {
    if format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(SnapshotError::FormatVersion {
            expected: SNAPSHOT_FORMAT_VERSION,
            found: format_version,
        });
    }
    if component != expected {
        return Err(SnapshotError::WrongComponent {
            expected: expected.to_string(),
            found: component.to_string(),
        });
    }
    Ok(())
}

/// Output of stage 1: the selected image encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSnapshot {
    pub format_version: u32,
    pub component: String,
    pub model_version: String,
    /// Development C-index of the run that produced this encoder, when known.
    pub dev_c_index: Option<f64>,
    pub model: ModelConfig,
    pub encoder: ImageEncoder,
}

impl EncoderSnapshot {
    pub fn new(model_version: &str, model: &ModelConfig, encoder: ImageEncoder, dev_c_index: Option<f64>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            component: ENCODER_COMPONENT.to_string(),
            model_version: model_version.to_string(),
            dev_c_index,
            model: model.clone(),
            encoder,
        }
    }

    /// The materialized encoder as a read-only handle for stage 2.
    pub fn freeze(&self) -> FrozenEncoder {
        FrozenEncoder::new(self.encoder.clone())
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        write_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let snapshot: Self = read_toml(path)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        check_header(self.format_version, &self.component, ENCODER_COMPONENT)?;
        if self.encoder.input_shape() != (self.model.image_height, self.model.image_width) {
            return Err(SnapshotError::Inconsistent(
                "encoder input shape differs from the recorded model configuration".into(),
            ));
        }
        Ok(())
    }
}

/// Output of stage 2: everything inference needs, plus the adversary for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSnapshot {
    pub format_version: u32,
    pub component: String,
    pub model_version: String,
    pub horizons: usize,
    pub dev_c_index: Option<f64>,
    pub schema: RiskFactorSchema,
    pub encoder: EncoderSnapshot,
    pub model: RiskModel,
    pub devices: DeviceVocabulary,
    pub adversary: Option<DeviceDiscriminator>,
}

impl FullSnapshot {
    pub fn new(
        model_version: &str,
        schema: &RiskFactorSchema,
        encoder: EncoderSnapshot,
        model: RiskModel,
        devices: DeviceVocabulary,
        adversary: Option<DeviceDiscriminator>,
        dev_c_index: Option<f64>,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            component: FULL_COMPONENT.to_string(),
            model_version: model_version.to_string(),
            horizons: model.hazard.horizons(),
            dev_c_index,
            schema: schema.clone(),
            encoder,
            model,
            devices,
            adversary,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        write_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let snapshot: Self = read_toml(path)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        check_header(self.format_version, &self.component, FULL_COMPONENT)?;
        self.encoder.validate()?;
        if self.encoder.encoder.embedding_dim() != self.model.aggregator.input.inputs() {
            return Err(SnapshotError::Inconsistent(format!(
                "encoder produces {}-wide embeddings but the aggregator expects {}",
                self.encoder.encoder.embedding_dim(),
                self.model.aggregator.input.inputs()
            )));
        }
        if self.model.risk_factors.fields.len() != self.schema.len() {
            return Err(SnapshotError::Inconsistent(format!(
                "schema lists {} risk factors but the encoder has {}",
                self.schema.len(),
                self.model.risk_factors.fields.len()
            )));
        }
        if self.horizons != self.model.hazard.horizons() || self.horizons == 0 {
            return Err(SnapshotError::Inconsistent(format!(
                "snapshot declares {} horizons, hazard head produces {}",
                self.horizons,
                self.model.hazard.horizons()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::types::DeviceLabel;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    fn tiny_config() -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.model.image_height = 8;
        config.model.image_width = 8;
        config.model.encoder_channels = vec![2];
        config.model.embedding_dim = 3;
        config.model.aggregator_dim = 4;
        config.model.field_dim = 2;
        config.model.risk_factor_dim = 2;
        config
    }

    fn full_snapshot(config: &ExperimentConfig) -> FullSnapshot {
        let mut rng = StdRng::seed_from_u64(5);
        let encoder = EncoderSnapshot::new(
            &config.model_version,
            &config.model,
            ImageEncoder::new(&config.model, &mut rng),
            Some(0.61),
        );
        let devices = DeviceVocabulary::from_labels([DeviceLabel("hologic".into()), DeviceLabel("ge".into())].iter());
        let adversary = DeviceDiscriminator::new(config.model.aggregator_dim, 3, devices.len(), &mut rng);
        FullSnapshot::new(
            &config.model_version,
            &config.risk_factors,
            encoder,
            RiskModel::new(&config.model, &config.risk_factors, &mut rng),
            devices,
            Some(adversary),
            None,
        )
    }

    #[test]
    fn full_snapshot_round_trips_and_embeds_encoder_verbatim() {
        let config = tiny_config();
        let snapshot = full_snapshot(&config);
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.toml");
        snapshot.save(&path).unwrap();
        let loaded = FullSnapshot::load(&path).unwrap();
        assert_eq!(loaded, snapshot);

        let encoder_path = dir.path().join("encoder.toml");
        snapshot.encoder.save(&encoder_path).unwrap();
        assert_eq!(EncoderSnapshot::load(&encoder_path).unwrap(), loaded.encoder);
    }

    #[test]
    fn wrong_component_is_rejected() {
        let config = tiny_config();
        let snapshot = full_snapshot(&config);
        let dir = tempdir().unwrap();
        let path = dir.path().join("encoder.toml");
        snapshot.encoder.save(&path).unwrap();
        assert!(matches!(
            FullSnapshot::load(&path),
            Err(SnapshotError::Parse(_)) | Err(SnapshotError::WrongComponent { .. })
        ));
    }

    #[test]
    fn unknown_format_version_is_rejected() {
        let config = tiny_config();
        let mut snapshot = full_snapshot(&config).encoder;
        snapshot.format_version = 99;
        let dir = tempdir().unwrap();
        let path = dir.path().join("encoder.toml");
        snapshot.save(&path).unwrap();
        assert!(matches!(
            EncoderSnapshot::load(&path),
            Err(SnapshotError::FormatVersion { found: 99, .. })
        ));
    }
}
