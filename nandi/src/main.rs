use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, info, Level};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use nandi::color_utils::{self, colors, symbols};
use nandi::config::{AnalyzeCommand, GlobalArgs};
use nandi::pipeline::{AnalysisOutcome, OnnxModelOptions, Pipeline, PipelineEvent, RunOptions};
use nandi::report::{metadata_path, AnalysisReport};
use nandi::{AnalysisResult, PipelineConfig, PipelineFailure, RawUpload};

#[derive(clap::Subcommand)]
enum Commands {
    /// Analyze a cattle or buffalo image
    Analyze(AnalyzeCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "nandi")]
#[command(about = "Cattle and buffalo breed, gender and quality analysis")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Default is WARN; each -v raises one level, -q drops to ERROR
fn get_log_level_from_verbosity(
    verbosity: &clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    if verbosity.is_silent() {
        return log::LevelFilter::Error;
    }
    match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug | log::LevelFilter::Trace => log::LevelFilter::Trace,
    }
}

fn init_logging(global: &GlobalArgs) {
    // RUST_LOG applies only when no -v/-q was given
    let use_env = !global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(&global.verbosity));
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => colors::error_level("ERROR"),
                Level::Warn => colors::warning_level("WARN"),
                Level::Info => colors::info_level("INFO"),
                Level::Debug => colors::debug_level("DEBUG"),
                Level::Trace => colors::trace_level("TRACE"),
            };
            writeln!(buf, "[{level_str}] {}", record.args())
        })
        .init();
}

fn print_result(result: &AnalysisResult) {
    let f = &result.features;
    let q = &result.quality_score;
    println!(
        "{}Breed:   {} ({:?}, {:.0}% confidence)",
        symbols::completed_successfully(),
        colors::emphasis(&result.breed.name),
        result.breed.category,
        result.breed.confidence * 100.0
    );
    println!(
        "   Gender:  {:?} ({:.0}% confidence)",
        result.gender.prediction,
        result.gender.confidence * 100.0
    );
    println!(
        "   Hump:    {}",
        if f.hump.present {
            format!("{:?}", f.hump.size)
        } else {
            "absent".to_string()
        }
    );
    println!(
        "   Horns:   {}",
        if f.horns.present {
            format!("{:?}", f.horns.horn_type)
        } else {
            "absent".to_string()
        }
    );
    println!("   Coat:    {} with {} pattern", f.coat.color, f.coat.pattern);
    println!(
        "   Quality: {}/100 (health {}, build {}, conformation {})",
        q.overall, q.health, q.build, q.conformation
    );
}

fn print_failure(failure: &PipelineFailure) {
    println!(
        "{}{}",
        symbols::operation_failed(),
        colors::error_level(failure.reason.user_message())
    );
    println!(
        "   {}",
        color_utils::maybe_dim(&format!("{} at {}", failure.reason.code(), failure.stage))
    );
}

fn print_json(outcome: &AnalysisOutcome) -> anyhow::Result<()> {
    let value = match &outcome.result {
        Ok(result) => serde_json::to_value(result)?,
        Err(failure) => serde_json::json!({
            "error": {
                "stage": failure.stage,
                "reason": failure.reason,
                "message": failure.reason.user_message(),
            }
        }),
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Run the pipeline while a spinner follows the stage events
fn run_with_spinner(pipeline: &Pipeline, upload: &RawUpload) -> AnalysisOutcome {
    let Some(spinner) = nandi::progress::create_stage_spinner() else {
        return pipeline.analyze(upload, &RunOptions::default());
    };

    let (tx, rx) = mpsc::channel();
    let watcher = {
        let spinner = spinner.clone();
        thread::spawn(move || {
            for event in rx {
                if let PipelineEvent::StageChange { stage } = event {
                    spinner.set_message(stage.to_string());
                }
            }
        })
    };

    let options = RunOptions {
        events: Some(tx),
        cancel: None,
    };
    let outcome = pipeline.analyze(upload, &options);
    drop(options);
    let _ = watcher.join();

    spinner.finish_and_clear();
    nandi::progress::remove_progress_bar(&spinner);
    outcome
}

fn run_analyze(global: &GlobalArgs, cmd: &AnalyzeCommand) -> anyhow::Result<bool> {
    let start = Instant::now();
    let image_path = Path::new(&cmd.image);

    let config = PipelineConfig::from_command(cmd)?;
    let detector = cmd.detector_model_info();
    let attributes = cmd.attribute_model_info();
    detector.validate()?;
    attributes.validate()?;

    info!(
        "{}Analyzing {} | gate: {:?} >= {} | device: {}",
        symbols::analysis_start(),
        image_path.display(),
        config.gate.target_labels,
        config.gate.threshold,
        global.device
    );

    let upload = RawUpload::from_file(
        image_path,
        cmd.media_type.as_deref(),
        config.max_upload_bytes,
    )?;
    let pipeline = Pipeline::with_onnx_models(
        config.clone(),
        OnnxModelOptions {
            device: global.device.clone(),
            detector,
            attributes,
            catalog: cmd.catalog.as_ref().map(PathBuf::from),
        },
    )?;

    let outcome = run_with_spinner(&pipeline, &upload);

    if cmd.json {
        print_json(&outcome)?;
    } else {
        match &outcome.result {
            Ok(result) => print_result(result),
            Err(failure) => print_failure(failure),
        }
    }

    if global.metadata {
        let path = metadata_path(image_path, global.output_dir.as_deref())?;
        let total_ms = start.elapsed().as_secs_f64() * 1000.0;
        AnalysisReport::new(image_path, &upload, &config, &outcome, total_ms).save(&path)?;
        info!("Report written to {}", path.display());
    }

    Ok(outcome.result.is_ok())
}

fn main() {
    let cli = Cli::parse();

    color_utils::init_color_config(cli.global.no_color);
    init_logging(&cli.global);

    match &cli.command {
        Some(Commands::Analyze(cmd)) => match run_analyze(&cli.global, cmd) {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                error!("{}Analysis failed: {e:#}", symbols::operation_failed());
                std::process::exit(1);
            }
        },
        Some(Commands::Version) => {
            println!("nandi v{}", env!("CARGO_PKG_VERSION"));
            println!("Detector labels: COCO ({} classes)", nandi::yolo::COCO_LABELS.len());
            println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
        }
        None => {
            use clap::CommandFactory;
            let _ = Cli::command().print_help();
        }
    }
}
