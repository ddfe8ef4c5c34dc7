mod common;

use common::{tiny_config, write_study};
use mammorisk::data::cohort::Cohort;
use mammorisk::predict::RiskPredictor;
use mammorisk::snapshot::{EncoderSnapshot, FullSnapshot};
use mammorisk::train::observer::{EpochSummary, TrainingObserver, TrainingStage};
use mammorisk::train::orchestrator::{
    ENCODER_SNAPSHOT_FILE, MODEL_SNAPSHOT_FILE, Protocol, ProtocolState, run_protocol,
};
use mammorisk::types::Split;
use std::sync::Mutex;

#[derive(Default)]
struct Recorder {
    stages: Mutex<Vec<TrainingStage>>,
    epochs: Mutex<Vec<EpochSummary>>,
}

impl TrainingObserver for Recorder {
    fn on_stage_start(&self, stage: TrainingStage, candidates: usize, epochs: usize) {
        assert_eq!(candidates, 1);
        assert!(epochs > 0);
        self.stages.lock().unwrap().push(stage);
    }

    fn on_epoch_end(&self, summary: &EpochSummary) {
        self.epochs.lock().unwrap().push(summary.clone());
    }
}

#[test]
fn protocol_trains_both_stages_against_a_frozen_encoder() {
    let config = tiny_config();
    let study = write_study(12, 6, 3, 21);
    let cohort = Cohort::load(&study.csv, &config.risk_factors).unwrap();
    let out = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let protocol = Protocol::new(&config, &cohort, &recorder).with_snapshot_dir(out.path());

    let state = protocol.advance(ProtocolState::Stage1Pretrain).unwrap();
    assert_eq!(state.stage(), Some(TrainingStage::Stage2Adversarial));
    let pretrained = match &state {
        ProtocolState::Stage2Adversarial { encoder } => encoder.clone(),
        other => panic!("expected stage 2, got {other:?}"),
    };
    assert_eq!(
        EncoderSnapshot::load(&out.path().join(ENCODER_SNAPSHOT_FILE)).unwrap(),
        pretrained
    );

    let state = protocol.advance(state).unwrap();
    assert!(state.is_done());
    let snapshot = match state {
        ProtocolState::Done { snapshot } => snapshot,
        other => panic!("expected done, got {other:?}"),
    };
    assert_eq!(snapshot.encoder, pretrained);
    assert_eq!(snapshot.devices.len(), 2);
    assert!(snapshot.adversary.is_some());
    assert_eq!(
        FullSnapshot::load(&out.path().join(MODEL_SNAPSHOT_FILE)).unwrap(),
        snapshot
    );

    let stages = recorder.stages.lock().unwrap().clone();
    assert_eq!(
        stages,
        vec![TrainingStage::Stage1Pretrain, TrainingStage::Stage2Adversarial]
    );
    let epochs = recorder.epochs.lock().unwrap();
    assert_eq!(epochs.iter().filter(|e| e.stage == TrainingStage::Stage1Pretrain).count(), 2);
    assert!(epochs.iter().filter(|e| e.stage == TrainingStage::Stage2Adversarial).count() >= 1);
    assert!(epochs.iter().all(|e| e.train_loss.is_finite()));
    assert!(
        epochs
            .iter()
            .filter(|e| e.stage == TrainingStage::Stage2Adversarial)
            .all(|e| e.adversary.is_some())
    );
}

#[test]
fn epoch_loss_is_averaged_over_samples_consumed_within_the_step_budget() {
    let mut config = tiny_config();
    config.stage1.max_steps = 1;
    config.stage2.batch_size = 4;
    config.stage2.max_steps = 1;
    let study = write_study(12, 6, 0, 41);
    let cohort = Cohort::load(&study.csv, &config.risk_factors).unwrap();
    let recorder = Recorder::default();
    run_protocol(&Protocol::new(&config, &cohort, &recorder)).unwrap();

    let epochs = recorder.epochs.lock().unwrap();
    let per_stage = |stage| epochs.iter().filter(|e| e.stage == stage).cloned().collect::<Vec<_>>();
    let pretrain = per_stage(TrainingStage::Stage1Pretrain);
    assert_eq!(pretrain.len(), 1);
    assert_eq!(pretrain[0].steps, 1);
    assert_eq!(pretrain[0].samples, 8);

    let adversarial = per_stage(TrainingStage::Stage2Adversarial);
    assert_eq!(adversarial.len(), 1);
    assert_eq!(adversarial[0].steps, 1);
    assert_eq!(adversarial[0].samples, 4);
    assert!(adversarial[0].train_loss.is_finite() && adversarial[0].train_loss >= 0.0);
}

#[test]
fn held_out_screen_detected_cancers_clear_the_configured_first_year_risk() {
    let mut config = tiny_config();
    config.stage2.epochs = 20;
    config.evaluation.min_screen_detected_risk = 0.2;
    let study = write_study(12, 9, 6, 31);
    let cohort = Cohort::load(&study.csv, &config.risk_factors).unwrap();
    let recorder = Recorder::default();
    let snapshot = run_protocol(&Protocol::new(&config, &cohort, &recorder)).unwrap();

    let predictor = RiskPredictor::new(snapshot);
    let calibrator = predictor.fit_calibrator(&cohort, Split::Dev).unwrap();
    let predictor = predictor.with_calibrator(calibrator).unwrap();

    let report = predictor.evaluate(&cohort, Split::Test, &config.evaluation).unwrap();
    assert_eq!(report.exams, 6);
    let screen = &report.screen_detected;
    assert_eq!(screen.exams, 2);
    assert_eq!(
        screen.below_minimum, 0,
        "lowest calibrated year 1 risk of a screen-detected test exam: {:?}",
        screen.lowest
    );
}
