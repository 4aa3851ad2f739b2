use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use smart_bin::detect::TableRow;
use smart_bin::error::SortError;
use smart_bin::runtime::{run_session, SessionEnd};
use smart_bin::storage::shared;
use smart_bin::{
    BackendRegistry, BinColor, CameraConfig, CameraSource, ClassificationResolver, ClassificationStore,
    Confirmation, CorrectionLearningLoop, FilesystemCorpus, HumanPrompt, OrchestratorSettings,
    RawDetectorOutput, Session, SimulatedActuator, SortOrchestrator, SqliteClassificationStore,
    StubBackend, TriggerSettings,
};

/// Operator with canned answers that counts the questions it gets.
#[derive(Default)]
struct ScriptedOperator {
    bins: Mutex<VecDeque<Option<BinColor>>>,
    confirmations: Mutex<VecDeque<Confirmation>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

impl HumanPrompt for ScriptedOperator {
    fn ask_bin(&self, class_name: &str) -> Result<Option<BinColor>, SortError> {
        self.asked.lock().unwrap().push(format!("bin:{}", class_name));
        Ok(self.bins.lock().unwrap().pop_front().flatten())
    }

    fn confirm_detection(&self, class_name: &str) -> Result<Confirmation, SortError> {
        self.asked.lock().unwrap().push(format!("confirm:{}", class_name));
        Ok(self
            .confirmations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Confirmation::Skip))
    }
}

fn detection(name: &str, confidence: f32) -> RawDetectorOutput {
    RawDetectorOutput::Table(vec![TableRow {
        name: name.to_string(),
        confidence,
        xmin: 10.0,
        ymin: 10.0,
        xmax: 40.0,
        ymax: 30.0,
    }])
}

fn camera(frames: u64) -> CameraSource {
    CameraSource::open(&CameraConfig {
        source: format!("stub://belt?frames={}", frames),
        width: 64,
        height: 48,
        target_fps: 10,
    })
    .expect("synthetic camera")
}

fn db_path(dir: &TempDir) -> String {
    dir.path().join("smart_bin.db").to_string_lossy().into_owned()
}

fn files_with_extension(dir: &Path, ext: &str) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some(ext))
                .count()
        })
        .unwrap_or(0)
}

fn run(
    dir: &TempDir,
    script: Vec<RawDetectorOutput>,
    frames: u64,
    learning_mode: bool,
    operator: Arc<ScriptedOperator>,
) -> smart_bin::runtime::SessionSummary {
    let store = shared(SqliteClassificationStore::open(&db_path(dir)).expect("open store"));
    let resolver = Arc::new(ClassificationResolver::new(store, operator.clone()));
    let corpus = FilesystemCorpus::new(
        dir.path().join("training"),
        vec!["banana_peel".to_string(), "unknown".to_string()],
    );
    let learning = CorrectionLearningLoop::new(operator, Box::new(corpus));
    let mut detectors = BackendRegistry::new();
    detectors.register(StubBackend::scripted(script));
    let settings = OrchestratorSettings {
        learning_mode,
        min_confidence: 0.6,
        trigger: TriggerSettings {
            min_detections: 3,
            cooldown: Duration::ZERO,
        },
    };
    let orchestrator = SortOrchestrator::new(
        settings,
        detectors,
        resolver,
        learning,
        Box::new(SimulatedActuator::new()),
    );
    let (_commands_tx, commands_rx) = mpsc::channel();
    let session = Session::new(
        Box::new(camera(frames)),
        orchestrator,
        commands_rx,
        Arc::new(AtomicBool::new(false)),
    );
    run_session(session).expect("session")
}

#[test]
fn corrected_detection_is_sorted_and_recorded_for_training() {
    let dir = TempDir::new().unwrap();
    let operator = Arc::new(ScriptedOperator::default());
    operator
        .confirmations
        .lock()
        .unwrap()
        .push_back(Confirmation::Correct("Banana Peel".to_string()));

    let script = vec![detection("unknown", 0.9); 3];
    let summary = run(&dir, script, 5, true, operator.clone());

    assert_eq!(summary.end, SessionEnd::EndOfStream);
    assert_eq!(summary.frames, 5);
    assert_eq!(summary.sorted, 1);
    assert_eq!(operator.asked(), vec!["confirm:unknown".to_string()]);

    let store = SqliteClassificationStore::open(&db_path(&dir)).unwrap();
    let events = store.recent_sort_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].class_name, "banana_peel");
    assert_eq!(events[0].bin_color, BinColor::Green);
    // Static classes are never written to the learned table.
    assert!(store.entries().unwrap().is_empty());

    let training = dir.path().join("training");
    let good = training.join("banana_peel");
    let bad = training.join("_errors").join("unknown");
    assert_eq!(files_with_extension(&good, "jpg"), 1);
    assert_eq!(files_with_extension(&good, "txt"), 0);
    assert_eq!(files_with_extension(&bad, "jpg"), 1);
    assert_eq!(files_with_extension(&bad, "txt"), 1);

    let label = std::fs::read_dir(&bad)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("txt"))
        .map(|entry| std::fs::read_to_string(entry.path()).unwrap())
        .unwrap();
    assert!(label.starts_with("1 "), "label was {:?}", label);
    assert_eq!(label.split_whitespace().count(), 5);
}

#[test]
fn learned_mapping_survives_restart() {
    let dir = TempDir::new().unwrap();

    let operator = Arc::new(ScriptedOperator::default());
    operator.bins.lock().unwrap().push_back(Some(BinColor::Green));
    let summary = run(&dir, vec![detection("Mystery Item", 0.8); 3], 3, false, operator.clone());
    assert_eq!(summary.sorted, 1);
    assert_eq!(operator.asked(), vec!["bin:mystery_item".to_string()]);

    // A fresh process with nobody at the console still knows the answer.
    let operator = Arc::new(ScriptedOperator::default());
    let summary = run(&dir, vec![detection("mystery_item", 0.8); 3], 4, false, operator.clone());
    assert_eq!(summary.sorted, 1);
    assert!(operator.asked().is_empty());

    let store = SqliteClassificationStore::open(&db_path(&dir)).unwrap();
    assert_eq!(store.get("mystery_item").unwrap(), Some(BinColor::Green));
    let status = store.bin_status().unwrap();
    let green = status.iter().find(|s| s.bin_color == BinColor::Green).unwrap();
    assert_eq!(green.sorted_count, 2);
    assert!(green.last_sorted_at.is_some());
    let yellow = status.iter().find(|s| s.bin_color == BinColor::Yellow).unwrap();
    assert_eq!(yellow.sorted_count, 0);
}

#[test]
fn low_confidence_and_declined_items_are_not_sorted() {
    let dir = TempDir::new().unwrap();
    let operator = Arc::new(ScriptedOperator::default());

    let mut script = vec![detection("plastic", 0.4); 3];
    script.extend(vec![detection("gizmo", 0.9); 3]);
    let summary = run(&dir, script, 8, false, operator.clone());

    assert_eq!(summary.sorted, 0);
    assert_eq!(operator.asked(), vec!["bin:gizmo".to_string()]);
    let store = SqliteClassificationStore::open(&db_path(&dir)).unwrap();
    assert!(store.recent_sort_events(10).unwrap().is_empty());
    assert_eq!(store.get("gizmo").unwrap(), None);
}
