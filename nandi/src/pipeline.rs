//! Pipeline orchestrator.
//!
//! Runs the stages strictly in order and stops at the first failure:
//!
//! `Received → IntegrityChecked → Decoded → GatePassed → Inferred → Done`
//!
//! with `Failed(stage, reason)` reachable from every non-terminal state. A run owns
//! its upload-derived artifacts; the only state shared between runs is the pair of
//! lazily loaded, read-only models.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::analysis::AnalysisResult;
use crate::attribute_model::{BreedCatalog, OnnxAttributeModel};
use crate::config::PipelineConfig;
use crate::decode::{self, DecodedImage};
use crate::detection::ObjectDetector;
use crate::error::{ConfigError, FailureReason, PipelineFailure, Stage};
use crate::gate::{self, GateDecision};
use crate::inference::{self, AttributeModel};
use crate::integrity;
use crate::model_access::CliModelInfo;
use crate::model_slot::ModelSlot;
use crate::upload::{MediaType, RawUpload};
use crate::yolo::{candidate_floor, YoloDetector};

/// How often a waiting run re-checks its cancel flag and deadline
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Received,
    IntegrityChecked,
    Decoded,
    GatePassed,
    Inferred,
    Done,
    Failed(Stage, FailureReason),
}

/// Progress notifications streamed to an optional observer
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StageChange { stage: Stage },
    StageComplete { stage: Stage, elapsed_ms: f64 },
    Finished { state: PipelineState },
}

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Receives a [`PipelineEvent`] as each stage starts and finishes
    pub events: Option<Sender<PipelineEvent>>,
    /// Set to `true` to abandon the run. A cancelled run never delivers a result.
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: f64,
}

/// Everything known about a finished run, successful or not
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result: Result<AnalysisResult, PipelineFailure>,
    pub final_state: PipelineState,
    pub media_type: Option<MediaType>,
    pub dimensions: Option<(u32, u32)>,
    pub gate: Option<GateDecision>,
    pub timings: Vec<StageTiming>,
}

/// Mutable bookkeeping for a single run
struct RunContext<'a> {
    options: &'a RunOptions,
    state: PipelineState,
    media_type: Option<MediaType>,
    dimensions: Option<(u32, u32)>,
    gate: Option<GateDecision>,
    timings: Vec<StageTiming>,
}

impl<'a> RunContext<'a> {
    fn new(options: &'a RunOptions) -> Self {
        Self {
            options,
            state: PipelineState::Received,
            media_type: None,
            dimensions: None,
            gate: None,
            timings: Vec::new(),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.options.events {
            // A dropped receiver just means nobody is watching
            let _ = tx.send(event);
        }
    }

    fn cancelled(&self) -> bool {
        is_cancelled(self.options.cancel.as_ref())
    }

    fn enter(&mut self, stage: Stage) -> Result<Instant, PipelineFailure> {
        if self.cancelled() {
            return Err(self.fail(stage, FailureReason::Cancelled));
        }
        log::debug!("▶ {stage}");
        self.emit(PipelineEvent::StageChange { stage });
        Ok(Instant::now())
    }

    fn complete(&mut self, stage: Stage, started: Instant, next: PipelineState) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.timings.push(StageTiming { stage, elapsed_ms });
        self.emit(PipelineEvent::StageComplete { stage, elapsed_ms });
        log::trace!("{:?} → {:?} ({elapsed_ms:.1}ms)", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, stage: Stage, reason: FailureReason) -> PipelineFailure {
        self.state = PipelineState::Failed(stage, reason);
        PipelineFailure::new(stage, reason)
    }
}

fn is_cancelled(flag: Option<&Arc<AtomicBool>>) -> bool {
    flag.map(|f| f.load(Ordering::Relaxed)).unwrap_or(false)
}

/// Run `work` under an optional deadline and cancel flag.
///
/// Without either, `work` runs on the calling thread. Otherwise it runs on a named
/// worker thread that is abandoned (its result discarded) on timeout or cancellation.
fn run_guarded<T, F>(
    stage: Stage,
    on_worker_loss: FailureReason,
    timeout: Option<Duration>,
    cancel: Option<&Arc<AtomicBool>>,
    work: F,
) -> Result<T, FailureReason>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FailureReason> + Send + 'static,
{
    if timeout.is_none() && cancel.is_none() {
        return work();
    }

    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("nandi-{}", stage.as_str()))
        .spawn(move || {
            let _ = tx.send(work());
        });
    if let Err(e) = spawned {
        log::warn!("Failed to spawn worker for {stage}: {e}");
        return Err(on_worker_loss);
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if is_cancelled(cancel) {
            log::debug!("{stage} abandoned: run cancelled");
            return Err(FailureReason::Cancelled);
        }
        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    log::warn!("{stage} exceeded its {:?} timeout", timeout.unwrap_or_default());
                    return Err(FailureReason::Timeout);
                }
                (deadline - now).min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        match rx.recv_timeout(wait) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("{stage} worker exited without a result");
                return Err(on_worker_loss);
            }
        }
    }
}

/// Where the ONNX-backed models come from
#[derive(Debug, Clone, Default)]
pub struct OnnxModelOptions {
    /// Inference device (auto, cpu, coreml)
    pub device: String,
    pub detector: CliModelInfo,
    pub attributes: CliModelInfo,
    /// Breed and coat label catalog; the built-in catalog is used when absent
    pub catalog: Option<PathBuf>,
}

/// The gated classification pipeline
pub struct Pipeline {
    config: PipelineConfig,
    detector: Arc<dyn ObjectDetector>,
    attributes: Arc<dyn AttributeModel>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        detector: Arc<dyn ObjectDetector>,
        attributes: Arc<dyn AttributeModel>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            detector,
            attributes,
        })
    }

    /// Pipeline backed by the YOLO detector and the multi-head attribute model.
    ///
    /// Neither model is loaded here; each loads on first use, once.
    pub fn with_onnx_models(
        config: PipelineConfig,
        options: OnnxModelOptions,
    ) -> Result<Self, ConfigError> {
        let catalog = match &options.catalog {
            Some(path) => BreedCatalog::from_toml_file(path)?,
            None => BreedCatalog::default(),
        };

        let device = options.device.clone();
        let detector_info = options.detector.clone();
        let score_floor = candidate_floor(config.gate.threshold);
        let detector = ModelSlot::new("detector", move || {
            YoloDetector::load(&detector_info, &device, score_floor)
        });

        let device = options.device.clone();
        let attribute_info = options.attributes.clone();
        let attributes = ModelSlot::new("attribute", move || {
            OnnxAttributeModel::load(&attribute_info, &device, catalog.clone())
        });

        Self::new(config, Arc::new(detector), Arc::new(attributes))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage on `upload` and return the assessment or the first failure
    pub fn run(&self, upload: &RawUpload) -> Result<AnalysisResult, PipelineFailure> {
        self.run_with_options(upload, &RunOptions::default())
    }

    pub fn run_with_options(
        &self,
        upload: &RawUpload,
        options: &RunOptions,
    ) -> Result<AnalysisResult, PipelineFailure> {
        self.analyze(upload, options).result
    }

    /// Like [`Pipeline::run_with_options`], also reporting gate decision, image
    /// dimensions and per-stage timings
    pub fn analyze(&self, upload: &RawUpload, options: &RunOptions) -> AnalysisOutcome {
        let started = Instant::now();
        let mut ctx = RunContext::new(options);

        let result = self.execute(upload, &mut ctx);

        match &result {
            Ok(analysis) => {
                ctx.state = PipelineState::Done;
                log::info!(
                    "✅ Analysis complete in {:.1}ms: {}",
                    started.elapsed().as_secs_f64() * 1000.0,
                    analysis.summary()
                );
            }
            Err(failure) => {
                log::info!("❌ {failure}");
            }
        }
        ctx.emit(PipelineEvent::Finished { state: ctx.state });

        AnalysisOutcome {
            result,
            final_state: ctx.state,
            media_type: ctx.media_type,
            dimensions: ctx.dimensions,
            gate: ctx.gate,
            timings: ctx.timings,
        }
    }

    fn execute(
        &self,
        upload: &RawUpload,
        ctx: &mut RunContext<'_>,
    ) -> Result<AnalysisResult, PipelineFailure> {
        let cancel = ctx.options.cancel.clone();

        // FileIntegrityCheck
        let stage = Stage::FileIntegrityCheck;
        let started = ctx.enter(stage)?;
        let media_type =
            integrity::check(upload, &self.config).map_err(|reason| ctx.fail(stage, reason))?;
        ctx.media_type = Some(media_type);
        ctx.complete(stage, started, PipelineState::IntegrityChecked);

        // ImageDecodabilityCheck
        let stage = Stage::ImageDecodabilityCheck;
        let started = ctx.enter(stage)?;
        let image = decode::decode(upload, media_type, &self.config)
            .map_err(|reason| ctx.fail(stage, reason))?;
        ctx.dimensions = Some(image.dimensions());
        let image: Arc<DecodedImage> = Arc::new(image);
        ctx.complete(stage, started, PipelineState::Decoded);

        // SubjectPresenceGate
        let stage = Stage::SubjectPresenceGate;
        let started = ctx.enter(stage)?;
        let decision = {
            let image = Arc::clone(&image);
            let detector = Arc::clone(&self.detector);
            let gate_config = self.config.gate.clone();
            run_guarded(
                stage,
                FailureReason::GateUnavailable,
                self.config.gate.timeout_ms.map(Duration::from_millis),
                cancel.as_ref(),
                move || gate::gate(&image, detector.as_ref(), &gate_config),
            )
        }
        .map_err(|reason| ctx.fail(stage, reason))?;
        ctx.gate = Some(decision);
        ctx.complete(stage, started, PipelineState::GatePassed);

        // AttributeInferenceEngine
        let stage = Stage::AttributeInferenceEngine;
        let started = ctx.enter(stage)?;
        let analysis = {
            let attributes = Arc::clone(&self.attributes);
            run_guarded(
                stage,
                FailureReason::InferenceFailed,
                self.config.inference.timeout_ms.map(Duration::from_millis),
                cancel.as_ref(),
                move || inference::infer(&image, attributes.as_ref()),
            )
        }
        .map_err(|reason| ctx.fail(stage, reason))?;

        if ctx.cancelled() {
            return Err(ctx.fail(stage, FailureReason::Cancelled));
        }
        ctx.complete(stage, started, PipelineState::Inferred);

        Ok(analysis)
    }
}
