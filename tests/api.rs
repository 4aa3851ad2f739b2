use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use smart_bin::api::{ApiConfig, ApiServer, ApiState};
use smart_bin::detect::TableRow;
use smart_bin::runtime::{run_session, SessionEnd};
use smart_bin::storage::shared;
use smart_bin::{
    BackendRegistry, CameraConfig, CameraSource, ClassificationResolver, CorrectionLearningLoop,
    FilesystemCorpus, InMemoryClassificationStore, OperatorCommand, OrchestratorSettings,
    PromptBroker, RawDetectorOutput, Session, SimulatedActuator, SortOrchestrator, StubBackend,
    TriggerSettings,
};

fn request(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("timeout");
    let body = body.unwrap_or("");
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
        len = body.len()
    );
    stream.write_all(raw.as_bytes()).expect("write request");

    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    let (head, payload) = response.split_once("\r\n\r\n").expect("response head");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    (status, serde_json::from_str(payload).expect("json body"))
}

#[test]
fn serves_bins_classification_and_control_over_loopback() {
    let resolver = Arc::new(ClassificationResolver::new(
        shared(InMemoryClassificationStore::new()),
        Arc::new(PromptBroker::new(None)),
    ));
    let broker = PromptBroker::new(Some(Duration::from_secs(10)));
    let (tx, rx) = mpsc::channel();
    let state = ApiState {
        resolver: resolver.clone(),
        broker: Some(broker.clone()),
        commands: Mutex::new(tx),
        shutdown: Arc::new(AtomicBool::new(false)),
    };
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        state,
    )
    .spawn()
    .expect("spawn api");
    let addr = handle.addr;

    let (status, body) = request(addr, "GET", "/health", None);
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, body) = request(addr, "GET", "/bins/valid", None);
    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!(["yellow", "green", "brown"]));

    let (status, body) = request(addr, "POST", "/classify", Some(r#"{"item_name":"cardboard"}"#));
    assert_eq!(status, 200);
    assert_eq!(body["bin_color"], "yellow");

    let (status, body) = request(addr, "GET", "/classifications", None);
    assert_eq!(status, 200);
    assert!(body
        .as_array()
        .unwrap()
        .iter()
        .any(|entry| entry["class_name"] == "banana_peel" && entry["source"] == "static"));

    let (status, _) = request(addr, "POST", "/control/reset", None);
    assert_eq!(status, 202);
    let (status, _) = request(addr, "POST", "/control/correct", None);
    assert_eq!(status, 202);
    assert_eq!(rx.try_recv().unwrap(), OperatorCommand::Reset);
    assert_eq!(rx.try_recv().unwrap(), OperatorCommand::CorrectLast);

    let (status, body) = request(addr, "GET", "/bins/history?limit=5", None);
    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!([]));

    let (status, body) = request(addr, "GET", "/nowhere", None);
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");

    handle.stop().expect("stop api");
}

#[test]
fn unknown_items_wait_for_an_operator_answer() {
    let broker = PromptBroker::new(Some(Duration::from_secs(10)));
    let resolver = Arc::new(ClassificationResolver::new(
        shared(InMemoryClassificationStore::new()),
        Arc::new(broker.clone()),
    ));
    let (tx, _rx) = mpsc::channel();
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        ApiState {
            resolver,
            broker: Some(broker.clone()),
            commands: Mutex::new(tx),
            shutdown: Arc::new(AtomicBool::new(false)),
        },
    )
    .spawn()
    .expect("spawn api");
    let addr = handle.addr;

    let classify = std::thread::spawn(move || {
        request(addr, "POST", "/classify", Some(r#"{"item_name":"Coffee Cup"}"#))
    });

    let mut prompt_id = None;
    for _ in 0..200 {
        let (_, pending) = request(addr, "GET", "/prompts", None);
        if let Some(first) = pending.as_array().and_then(|p| p.first()) {
            assert_eq!(first["class_name"], "coffee_cup");
            prompt_id = first["id"].as_str().map(str::to_string);
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let prompt_id = prompt_id.expect("prompt was queued");

    let (status, _) = request(
        addr,
        "POST",
        &format!("/prompts/{}", prompt_id),
        Some(r#"{"action":"bin","bin_color":"brown"}"#),
    );
    assert_eq!(status, 200);

    let (status, body) = classify.join().unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["item_name"], "coffee_cup");
    assert_eq!(body["bin_color"], "brown");

    // Learned now: answered without a prompt.
    let (status, body) = request(addr, "POST", "/classify", Some(r#"{"item_name":"coffee cup"}"#));
    assert_eq!(status, 200);
    assert_eq!(body["bin_color"], "brown");

    handle.stop().expect("stop api");
}

#[test]
fn quit_stops_a_session_waiting_on_a_confirmation() {
    let dir = TempDir::new().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let broker = PromptBroker::with_cancel_flag(None, shutdown.clone());
    let resolver = Arc::new(ClassificationResolver::new(
        shared(InMemoryClassificationStore::new()),
        Arc::new(broker.clone()),
    ));
    let (commands_tx, commands_rx) = mpsc::channel();

    let (done_tx, done_rx) = mpsc::channel();
    let session_resolver = resolver.clone();
    let session_broker = broker.clone();
    let session_shutdown = shutdown.clone();
    let training = dir.path().join("training");
    let session = std::thread::spawn(move || {
        let mut detectors = BackendRegistry::new();
        let plastic = RawDetectorOutput::Table(vec![TableRow {
            name: "plastic".to_string(),
            confidence: 0.9,
            xmin: 10.0,
            ymin: 10.0,
            xmax: 40.0,
            ymax: 30.0,
        }]);
        detectors.register(StubBackend::scripted(vec![plastic; 3]));
        let corpus = FilesystemCorpus::disabled(training);
        let learning = CorrectionLearningLoop::new(Arc::new(session_broker), Box::new(corpus));
        let orchestrator = SortOrchestrator::new(
            OrchestratorSettings {
                learning_mode: true,
                min_confidence: 0.5,
                trigger: TriggerSettings {
                    min_detections: 3,
                    cooldown: Duration::ZERO,
                },
            },
            detectors,
            session_resolver,
            learning,
            Box::new(SimulatedActuator::new()),
        );
        let source = CameraSource::open(&CameraConfig {
            source: "stub://belt?frames=50".to_string(),
            width: 64,
            height: 48,
            target_fps: 10,
        })
        .expect("synthetic camera");
        let session = Session::new(Box::new(source), orchestrator, commands_rx, session_shutdown);
        let _ = done_tx.send(run_session(session).expect("session"));
    });

    let state = ApiState {
        resolver,
        broker: Some(broker.clone()),
        commands: Mutex::new(commands_tx),
        shutdown: shutdown.clone(),
    };
    let mut waiting = false;
    for _ in 0..500 {
        if !broker.pending().is_empty() {
            waiting = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(waiting, "session never asked for confirmation");

    let quit = smart_bin::api::route(
        &state,
        &smart_bin::api::HttpRequest {
            method: "POST".to_string(),
            path: "/control/quit".to_string(),
            raw_path: "/control/quit".to_string(),
            ..Default::default()
        },
    );
    assert_eq!(quit.status, 202);

    let summary = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("session still blocked after quit");
    assert_eq!(summary.end, SessionEnd::Shutdown);
    assert_eq!(summary.sorted, 0);
    assert!(broker.pending().is_empty());
    session.join().unwrap();
}
