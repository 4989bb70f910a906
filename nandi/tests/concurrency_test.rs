use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use nandi::analysis::{Category, HornType, Horns, Hump, HumpSize, Sex};
use nandi::decode::DecodedImage;
use nandi::inference::{AttributePrediction, FixedAttributeModel, RawQuality};
use nandi::{
    AttributeModel, Detection, FailureReason, ModelSlot, ObjectDetector, Pipeline,
    PipelineConfig, PipelineEvent, PipelineFailure, PipelineState, RawUpload, RunOptions, Stage,
};

fn zebu() -> AttributePrediction {
    AttributePrediction {
        breed_name: "Zebu Cattle".to_string(),
        breed_confidence: 0.88,
        category: Category::Cattle,
        gender: Sex::Male,
        gender_confidence: 0.76,
        hump: Hump {
            present: true,
            size: HumpSize::Large,
        },
        horns: Horns {
            present: true,
            horn_type: HornType::Curved,
        },
        coat_color: "Brown".to_string(),
        coat_pattern: "Solid".to_string(),
        quality: RawQuality {
            overall: 81.0,
            health: 84.0,
            build: 83.0,
            conformation: 77.0,
        },
    }
}

fn png_upload() -> RawUpload {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(96, 64)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    RawUpload::new(buf.into_inner(), "image/png")
}

#[derive(Clone)]
struct CowDetector;

impl ObjectDetector for CowDetector {
    fn detect(&self, _image: &DecodedImage) -> anyhow::Result<Vec<Detection>> {
        Ok(vec![Detection::new("cow", 0.9)])
    }
}

/// Sleeps before answering, so deadlines and cancel flags can fire mid-stage
struct SlowAttributes {
    delay: Duration,
}

impl AttributeModel for SlowAttributes {
    fn predict(&self, _image: &DecodedImage) -> anyhow::Result<AttributePrediction> {
        thread::sleep(self.delay);
        Ok(zebu())
    }
}

struct SlowDetector {
    delay: Duration,
}

impl ObjectDetector for SlowDetector {
    fn detect(&self, _image: &DecodedImage) -> anyhow::Result<Vec<Detection>> {
        thread::sleep(self.delay);
        Ok(vec![Detection::new("cow", 0.9)])
    }
}

#[test]
fn concurrent_runs_share_models_loaded_once() {
    let detector_loads = Arc::new(AtomicUsize::new(0));
    let attribute_loads = Arc::new(AtomicUsize::new(0));

    let detector_slot = {
        let loads = detector_loads.clone();
        Arc::new(ModelSlot::new("detector", move || {
            loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(CowDetector)
        }))
    };
    let attribute_slot = {
        let loads = attribute_loads.clone();
        Arc::new(ModelSlot::new("attributes", move || {
            loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(FixedAttributeModel::new(zebu()))
        }))
    };

    let pipeline = Arc::new(
        Pipeline::new(
            PipelineConfig::default(),
            detector_slot.clone(),
            attribute_slot.clone(),
        )
        .unwrap(),
    );

    const RUNS: usize = 8;
    let barrier = Arc::new(Barrier::new(RUNS));
    let upload = Arc::new(png_upload());
    let handles: Vec<_> = (0..RUNS)
        .map(|_| {
            let pipeline = pipeline.clone();
            let barrier = barrier.clone();
            let upload = upload.clone();
            thread::spawn(move || {
                barrier.wait();
                pipeline.run(&upload)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for result in &results {
        let result = result.as_ref().unwrap();
        assert_eq!(result.breed.name, "Zebu Cattle");
        assert_eq!(result.features.hump.size, HumpSize::Large);
    }
    assert_eq!(detector_loads.load(Ordering::SeqCst), 1);
    assert_eq!(attribute_loads.load(Ordering::SeqCst), 1);
    assert!(detector_slot.is_loaded());
    assert!(attribute_slot.is_loaded());
}

#[test]
fn failed_detector_load_is_retried_on_next_run() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let slot = {
        let attempts = attempts.clone();
        Arc::new(ModelSlot::new("detector", move || {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("model file not downloaded yet")
            }
            Ok(CowDetector)
        }))
    };
    let pipeline = Pipeline::new(
        PipelineConfig::default(),
        slot.clone(),
        Arc::new(FixedAttributeModel::new(zebu())),
    )
    .unwrap();
    let upload = png_upload();

    assert_eq!(
        pipeline.run(&upload),
        Err(PipelineFailure::new(
            Stage::SubjectPresenceGate,
            FailureReason::GateUnavailable
        ))
    );
    assert!(pipeline.run(&upload).is_ok());
    assert_eq!(slot.load_attempts(), 2);
}

#[test]
fn slow_inference_times_out() {
    let mut config = PipelineConfig::default();
    config.inference.timeout_ms = Some(50);
    let pipeline = Pipeline::new(
        config,
        Arc::new(CowDetector),
        Arc::new(SlowAttributes {
            delay: Duration::from_secs(2),
        }),
    )
    .unwrap();

    let start = Instant::now();
    let outcome = pipeline.analyze(&png_upload(), &RunOptions::default());
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(
        outcome.result,
        Err(PipelineFailure::new(
            Stage::AttributeInferenceEngine,
            FailureReason::Timeout
        ))
    );
    assert_eq!(
        outcome.final_state,
        PipelineState::Failed(Stage::AttributeInferenceEngine, FailureReason::Timeout)
    );
    // The gate still passed before the timeout
    assert!(outcome.gate.is_some());
}

#[test]
fn generous_timeout_does_not_interfere() {
    let mut config = PipelineConfig::default();
    config.gate.timeout_ms = Some(5_000);
    config.inference.timeout_ms = Some(5_000);
    let pipeline = Pipeline::new(
        config,
        Arc::new(SlowDetector {
            delay: Duration::from_millis(30),
        }),
        Arc::new(SlowAttributes {
            delay: Duration::from_millis(30),
        }),
    )
    .unwrap();

    let result = pipeline.run(&png_upload()).unwrap();
    assert_eq!(result.breed.name, "Zebu Cattle");
}

#[test]
fn cancelling_during_gate_delivers_no_result() {
    let pipeline = Arc::new(
        Pipeline::new(
            PipelineConfig::default(),
            Arc::new(SlowDetector {
                delay: Duration::from_secs(2),
            }),
            Arc::new(FixedAttributeModel::new(zebu())),
        )
        .unwrap(),
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let run = {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        thread::spawn(move || {
            let options = RunOptions {
                events: Some(tx),
                cancel: Some(cancel),
            };
            pipeline.analyze(&png_upload(), &options)
        })
    };

    // Wait until the gate is underway, then cancel
    for event in rx.iter() {
        if event
            == (PipelineEvent::StageChange {
                stage: Stage::SubjectPresenceGate,
            })
        {
            break;
        }
    }
    let start = Instant::now();
    cancel.store(true, Ordering::SeqCst);
    let outcome = run.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(
        outcome.result,
        Err(PipelineFailure::new(
            Stage::SubjectPresenceGate,
            FailureReason::Cancelled
        ))
    );
    assert!(outcome.gate.is_none());
}

#[test]
fn runs_do_not_leak_state_into_each_other() {
    let pipeline = Pipeline::new(
        PipelineConfig::default(),
        Arc::new(CowDetector),
        Arc::new(FixedAttributeModel::new(zebu())),
    )
    .unwrap();

    let rejected = pipeline.analyze(
        &RawUpload::new(vec![0xFF; 16], "image/gif"),
        &RunOptions::default(),
    );
    let accepted = pipeline.analyze(&png_upload(), &RunOptions::default());

    assert_eq!(
        rejected.final_state,
        PipelineState::Failed(Stage::FileIntegrityCheck, FailureReason::UnsupportedType)
    );
    assert_eq!(accepted.final_state, PipelineState::Done);
    assert_eq!(accepted.dimensions, Some((96, 64)));
    assert_eq!(accepted.timings.len(), 4);
}
