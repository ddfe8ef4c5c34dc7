use mammorisk::config::{ExperimentConfig, ModelConfig, StageConfig};
use mammorisk::data::image::save_png16;
use mammorisk::encoder::ImageEncoder;
use mammorisk::risk_factors::{RiskFactorValue, RiskFactorVector};
use mammorisk::risk_model::RiskModel;
use mammorisk::adversary::DeviceVocabulary;
use mammorisk::snapshot::{EncoderSnapshot, FullSnapshot};
use mammorisk::types::{Exam, ExamKey, View, ViewSlot};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const SIDE: usize = 16;

/// A configuration small enough to train in a test.
pub fn tiny_config() -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.seed = 11;
    config.threads = -1;
    config.model = ModelConfig {
        horizons: 5,
        image_height: SIDE,
        image_width: SIDE,
        pixel_mean: 20_000.0,
        pixel_std: 15_000.0,
        encoder_channels: vec![2, 4],
        encoder_stride: 2,
        embedding_dim: 4,
        aggregator_dim: 4,
        use_history: true,
        max_prior_exams: 1,
        field_dim: 2,
        risk_factor_dim: 3,
    };
    config.stage1 = StageConfig {
        learning_rate: 1e-2,
        weight_decay: 0.0,
        epochs: 2,
        batch_size: 8,
        patience: 0,
        max_steps: 0,
        gradient_clip: 5.0,
    };
    config.stage2 = StageConfig {
        epochs: 3,
        ..config.stage1.clone()
    };
    config.augmentation.max_rotation_degrees = 10.0;
    config
}

/// A randomly initialized full snapshot for inference-only tests.
pub fn untrained_snapshot(config: &ExperimentConfig, seed: u64) -> FullSnapshot {
    let mut rng = StdRng::seed_from_u64(seed);
    let encoder = ImageEncoder::new(&config.model, &mut rng);
    let model = RiskModel::new(&config.model, &config.risk_factors, &mut rng);
    FullSnapshot::new(
        &config.model_version,
        &config.risk_factors,
        EncoderSnapshot::new(&config.model_version, &config.model, encoder, None),
        model,
        DeviceVocabulary::default(),
        None,
        None,
    )
}

/// Background noise, plus a bright lesion for exams with a cancer.
pub fn synthetic_image(rng: &mut StdRng, cancer: bool) -> Array2<f64> {
    let mut image = Array2::from_shape_simple_fn((SIDE, SIDE), || rng.gen_range(5_000.0..25_000.0));
    if cancer {
        let row = rng.gen_range(2..SIDE - 6);
        let col = rng.gen_range(2..SIDE - 6);
        image
            .slice_mut(ndarray::s![row..row + 4, col..col + 4])
            .fill(60_000.0);
    }
    image
}

pub fn synthetic_exam(patient: &str, exam: &str, cancer: bool, rng: &mut StdRng) -> Exam {
    let views = ViewSlot::ALL
        .iter()
        .map(|slot| View::new(*slot, synthetic_image(rng, cancer)))
        .collect();
    Exam::new(ExamKey::new(patient, exam), views).unwrap()
}

pub fn full_risk_factors() -> RiskFactorVector {
    RiskFactorVector::new()
        .with("age", RiskFactorValue::Observed(61.0))
        .with("density", RiskFactorValue::Observed(2.0))
        .with("family_history", RiskFactorValue::Observed(1.0))
        .with("prior_biopsy", RiskFactorValue::Observed(0.0))
        .with("postmenopausal", RiskFactorValue::Observed(1.0))
}

/// A study written to disk: PNG views under `img/` and a `views.csv` next to them.
pub struct SyntheticStudy {
    pub dir: TempDir,
    pub csv: PathBuf,
}

impl SyntheticStudy {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

pub fn is_cancer(exam: usize) -> bool {
    exam % 3 == 0
}

/// Writes `train`, `dev` and `test` exams. Every third exam is diagnosed at screening,
/// patients own two consecutive exams, and two acquisition devices alternate.
pub fn write_study(train: usize, dev: usize, test: usize, seed: u64) -> SyntheticStudy {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("img")).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut csv = String::from(
        "patient_id,exam_id,laterality,view,file_path,years_to_cancer,years_to_last_followup,\
         split_group,device,exam_index,age,density,family_history,postmenopausal",
    );
    let splits = std::iter::repeat_n("train", train)
        .chain(std::iter::repeat_n("dev", dev))
        .chain(std::iter::repeat_n("test", test));
    for (n, split) in splits.enumerate() {
        let cancer = is_cancer(n);
        let years_to_cancer = if cancer { 0 } else { 100 };
        let device = if n % 2 == 0 { "hologic" } else { "ge" };
        for (side, view) in [("L", "CC"), ("L", "MLO"), ("R", "CC"), ("R", "MLO")] {
            let file = format!("img/e{n}_{side}{view}.png");
            save_png16(&dir.path().join(&file), &synthetic_image(&mut rng, cancer)).unwrap();
            write!(
                csv,
                "\n{split}_p{},e{n},{side},{view},{file},{years_to_cancer},5,{split},{device},{},{},{},{},1",
                n / 2,
                n % 2,
                45 + n % 30,
                n % 4,
                n % 2
            )
            .unwrap();
        }
    }
    let path = dir.path().join("views.csv");
    fs::write(&path, csv).unwrap();
    SyntheticStudy { dir, csv: path }
}
