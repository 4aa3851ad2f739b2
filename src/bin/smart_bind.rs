//! smart_bind - smart bin detection daemon
//!
//! This daemon:
//! 1. Captures frames from the configured camera source
//! 2. Runs the detector and waits for a stable detection
//! 3. Optionally asks the operator to confirm it (learning mode)
//! 4. Resolves the class to a bin and drives the sorting actuator
//! 5. Serves the loopback HTTP API for front-ends

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use smart_bin::api::{ApiConfig, ApiServer, ApiState};
use smart_bin::config::{PromptMode, SmartBinConfig};
use smart_bin::prompt::ConsolePrompt;
use smart_bin::runtime::run_session;
use smart_bin::storage::shared;
use smart_bin::ui::{Ui, UiMode};
use smart_bin::{
    actuator, CameraSource, ClassificationResolver, CorrectionLearningLoop, FilesystemCorpus,
    HumanPrompt, PromptBroker, Session, SortOrchestrator, SqliteClassificationStore,
    TrainingCorpus,
};

#[derive(Parser, Debug)]
#[command(name = "smart_bind", about = "Smart bin detection and sorting daemon")]
struct Args {
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: UiMode,

    /// Stop after this many frames (runs until end of stream or Ctrl-C otherwise)
    #[arg(long, value_name = "N")]
    frames: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let stage = ui.stage("Load configuration");
    let cfg = SmartBinConfig::load()?;
    stage.done();

    let shutdown = Arc::new(AtomicBool::new(false));

    let stage = ui.stage("Open classification store");
    let store = shared(
        SqliteClassificationStore::open(&cfg.db_path)
            .with_context(|| format!("open classification store {}", cfg.db_path))?,
    );
    stage.done();

    let broker = match cfg.prompt.mode {
        PromptMode::Api => Some(PromptBroker::with_cancel_flag(
            cfg.prompt.timeout,
            shutdown.clone(),
        )),
        PromptMode::Console => None,
    };
    let prompt: Arc<dyn HumanPrompt> = match &broker {
        Some(broker) => Arc::new(broker.clone()),
        None => Arc::new(ConsolePrompt::stdio()),
    };
    let resolver = Arc::new(ClassificationResolver::new(store, prompt.clone()));

    let stage = ui.stage("Load detector");
    let detectors = cfg.detector_registry()?;
    stage.done();

    let corpus: Box<dyn TrainingCorpus> = if cfg.learning.save_images {
        Box::new(FilesystemCorpus::new(
            cfg.training_dir.clone(),
            cfg.model.class_names.clone(),
        ))
    } else {
        Box::new(FilesystemCorpus::disabled(cfg.training_dir.clone()))
    };
    let learning = CorrectionLearningLoop::new(prompt, corpus);

    let stage = ui.stage("Connect actuator");
    let actuator = actuator::connect(&cfg.actuator);
    stage.done();

    let orchestrator = SortOrchestrator::new(
        cfg.orchestrator_settings(),
        detectors,
        resolver.clone(),
        learning,
        actuator,
    );

    let stage = ui.stage("Open camera");
    let source = CameraSource::open(&cfg.camera)?;
    stage.done();

    let (commands_tx, commands_rx) = mpsc::channel();
    let api_handle = if cfg.api.enabled {
        let stage = ui.stage("Start API");
        let state = ApiState {
            resolver,
            broker: broker.clone(),
            commands: Mutex::new(commands_tx),
            shutdown: shutdown.clone(),
        };
        let handle = ApiServer::new(
            ApiConfig {
                addr: cfg.api.addr.clone(),
            },
            state,
        )
        .spawn()?;
        stage.done();
        log::info!("smart bin api listening on {}", handle.addr);
        Some(handle)
    } else {
        drop(commands_tx);
        None
    };

    {
        let shutdown = shutdown.clone();
        let broker = broker.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            if let Some(broker) = &broker {
                broker.cancel_all();
            }
        })
        .context("install Ctrl-C handler")?;
    }

    log::info!(
        "smart_bind running: camera={} backend={} learning={} store={}",
        cfg.camera.source,
        cfg.model.backend,
        cfg.learning.enabled,
        cfg.db_path
    );

    let session = Session::new(Box::new(source), orchestrator, commands_rx, shutdown.clone())
        .with_frame_limit(args.frames);
    let result = run_session(session);

    shutdown.store(true, Ordering::SeqCst);
    if let Some(broker) = &broker {
        broker.cancel_all();
    }
    if let Some(handle) = api_handle {
        handle.stop()?;
    }

    let summary = result?;
    println!(
        "smart_bind: {} frames, {} sorted ({:?})",
        summary.frames, summary.sorted, summary.end
    );
    Ok(())
}
