//! Loopback HTTP/JSON surface for front-ends.
//!
//! Each connection gets its own thread because `POST /classify` may block on
//! an operator answer that arrives through `POST /prompts/<id>` on another
//! connection. Requests from non-loopback peers are refused when the server
//! is bound to a loopback address.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::classify::ClassificationResolver;
use crate::error::SortError;
use crate::prompt::{PromptAnswer, PromptBroker};
use crate::runtime::OperatorCommand;
use crate::storage::ClassificationStore;
use crate::{validate_class_name, BinColor};

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
        }
    }
}

/// Everything request handlers can reach.
pub struct ApiState {
    pub resolver: Arc<ClassificationResolver>,
    /// Present when operator questions are answered over the API.
    pub broker: Option<PromptBroker>,
    pub commands: Mutex<Sender<OperatorCommand>>,
    /// Session shutdown flag; raised directly on quit so a frame blocked on
    /// an operator prompt still stops.
    pub shutdown: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self {
            cfg,
            state: Arc::new(state),
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, state, shutdown_thread) {
                log::error!("ApiServer: stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<ApiState>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let state = state.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state) {
                        log::warn!("ApiServer: request rejected: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &ApiState) -> Result<()> {
    // The listener is non-blocking; accepted sockets may inherit that.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        return write_response(&mut stream, &ApiResponse::error(403, "forbidden", "loopback only"));
    }

    let response = match read_request(&mut stream) {
        Ok(request) => {
            log::debug!("ApiServer: {} {}", request.method, request.raw_path);
            route(state, &request)
        }
        Err(err) => ApiResponse::error(400, "bad_request", &err.to_string()),
    };
    write_response(&mut stream, &response)
}

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    item_name: String,
}

#[derive(Debug, Serialize)]
struct ClassifyResponse {
    item_name: String,
    bin_color: BinColor,
}

/// Status code plus JSON body.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status, body },
            Err(err) => Self::error(500, "serialization_failed", &err.to_string()),
        }
    }

    fn error(status: u16, code: &str, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": code, "message": message }).to_string().into_bytes(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        log::error!("ApiServer: {:#}", err);
        Self::error(500, "internal_error", &format!("{:#}", err))
    }
}

/// Dispatch one parsed request.
pub fn route(state: &ApiState, request: &HttpRequest) -> ApiResponse {
    let method = request.method.as_str();
    let path = request.path.as_str();
    match (method, path) {
        ("GET", "/health") => ApiResponse::json(200, &json!({ "status": "ok" })),
        ("GET", "/bins/valid") => ApiResponse::json(200, &BinColor::ALL),
        ("GET", "/bins/status") => match with_store(state, |store| store.bin_status()) {
            Ok(status) => ApiResponse::json(200, &status),
            Err(err) => ApiResponse::internal(err),
        },
        ("GET", "/bins/history") => {
            let limit = match request.query_param("limit") {
                None => DEFAULT_HISTORY_LIMIT,
                Some(raw) => match raw.parse::<usize>() {
                    Ok(limit) => limit,
                    Err(_) => {
                        return ApiResponse::error(400, "invalid_input", "limit must be a non-negative integer")
                    }
                },
            };
            match with_store(state, |store| store.recent_sort_events(limit)) {
                Ok(events) => ApiResponse::json(200, &events),
                Err(err) => ApiResponse::internal(err),
            }
        }
        ("GET", "/classifications") => match state.resolver.entries() {
            Ok(entries) => ApiResponse::json(200, &entries),
            Err(err) => ApiResponse::internal(err),
        },
        ("POST", "/classify") => classify(state, request),
        ("GET", "/prompts") => match &state.broker {
            Some(broker) => ApiResponse::json(200, &broker.pending()),
            None => ApiResponse::json(200, &Vec::<()>::new()),
        },
        ("POST", p) if p.starts_with("/prompts/") => answer_prompt(state, &p["/prompts/".len()..], request),
        ("POST", p) if p.starts_with("/control/") => control(state, &p["/control/".len()..]),
        (_, "/health" | "/bins/valid" | "/bins/status" | "/bins/history" | "/classifications" | "/classify" | "/prompts") => {
            ApiResponse::error(405, "method_not_allowed", method)
        }
        _ => ApiResponse::error(404, "not_found", path),
    }
}

fn with_store<T>(
    state: &ApiState,
    f: impl FnOnce(&dyn ClassificationStore) -> Result<T>,
) -> Result<T> {
    let store = state
        .resolver
        .store()
        .lock()
        .map_err(|_| anyhow!("classification store lock poisoned"))?;
    f(&*store)
}

fn classify(state: &ApiState, request: &HttpRequest) -> ApiResponse {
    let body: ClassifyRequest = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(err) => return ApiResponse::error(400, "invalid_input", &err.to_string()),
    };
    let item_name = match validate_class_name(&body.item_name) {
        Ok(item_name) => item_name,
        Err(err) => return ApiResponse::error(400, "invalid_input", &err.to_string()),
    };
    match state.resolver.resolve(&item_name, true) {
        Ok(Some(bin_color)) => ApiResponse::json(
            200,
            &ClassifyResponse {
                item_name,
                bin_color,
            },
        ),
        Ok(None) => {
            let err = SortError::UnknownClassification(item_name);
            ApiResponse::error(404, "unknown_classification", &err.to_string())
        }
        Err(err) => ApiResponse::internal(err),
    }
}

fn answer_prompt(state: &ApiState, id: &str, request: &HttpRequest) -> ApiResponse {
    let Some(broker) = &state.broker else {
        return ApiResponse::error(404, "prompts_disabled", "operator prompts are on the console");
    };
    let answer: PromptAnswer = match serde_json::from_slice(&request.body) {
        Ok(answer) => answer,
        Err(err) => return ApiResponse::error(400, "invalid_input", &err.to_string()),
    };
    match broker.answer(id, answer) {
        Ok(()) => ApiResponse::json(200, &json!({ "status": "answered", "id": id })),
        Err(err) => ApiResponse::error(400, "invalid_input", &err.to_string()),
    }
}

fn control(state: &ApiState, action: &str) -> ApiResponse {
    let command = match action {
        "force" => OperatorCommand::ForceSort,
        "reset" => OperatorCommand::Reset,
        "correct" => OperatorCommand::CorrectLast,
        "quit" => OperatorCommand::Quit,
        _ => return ApiResponse::error(404, "not_found", action),
    };
    if command == OperatorCommand::Quit {
        state.shutdown.store(true, Ordering::SeqCst);
        if let Some(broker) = &state.broker {
            broker.cancel_all();
        }
    }
    let sent = state
        .commands
        .lock()
        .map_err(|_| ())
        .and_then(|tx| tx.send(command).map_err(|_| ()));
    match sent {
        Ok(()) => ApiResponse::json(202, &json!({ "status": "queued", "command": command })),
        // Quit has already taken effect through the shutdown flag.
        Err(()) if command == OperatorCommand::Quit => {
            ApiResponse::json(202, &json!({ "status": "stopping", "command": command }))
        }
        Err(()) => ApiResponse::error(503, "session_unavailable", "the frame loop is not running"),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let mut request = parse_head(&data[..header_end.min(data.len())])?;

    let content_length = match request.headers.get("content-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data.get(header_end..).unwrap_or_default().to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("request body truncated"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(request)
}

fn parse_head(head: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body: Vec::new(),
    })
}

fn write_response(stream: &mut TcpStream, response: &ApiResponse) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        len = response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub raw_path: String,
    pub body: Vec<u8>,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<&str> {
        let query = self.raw_path.split_once('?')?.1;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::DeclinePrompt;
    use crate::storage::{shared, InMemoryClassificationStore};
    use crate::{SortEvent, Timestamp};
    use serde_json::Value;
    use std::sync::mpsc;

    fn state(broker: Option<PromptBroker>) -> (ApiState, mpsc::Receiver<OperatorCommand>) {
        let resolver = Arc::new(ClassificationResolver::new(
            shared(InMemoryClassificationStore::new()),
            Arc::new(DeclinePrompt),
        ));
        let (tx, rx) = mpsc::channel();
        (
            ApiState {
                resolver,
                broker,
                commands: Mutex::new(tx),
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    fn request(method: &str, raw_path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            path: raw_path.split('?').next().unwrap().to_string(),
            raw_path: raw_path.to_string(),
            body: body.as_bytes().to_vec(),
            ..HttpRequest::default()
        }
    }

    fn body(response: &ApiResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn lists_valid_bins_and_health() {
        let (state, _rx) = state(None);
        let response = route(&state, &request("GET", "/bins/valid", ""));
        assert_eq!(response.status, 200);
        assert_eq!(body(&response), json!(["yellow", "green", "brown"]));
        assert_eq!(route(&state, &request("GET", "/health", "")).status, 200);
        assert_eq!(route(&state, &request("DELETE", "/health", "")).status, 405);
        assert_eq!(route(&state, &request("GET", "/nope", "")).status, 404);
    }

    #[test]
    fn classify_uses_static_table_and_reports_unknowns() {
        let (state, _rx) = state(None);
        let response = route(&state, &request("POST", "/classify", r#"{"item_name":"Banana Peel"}"#));
        assert_eq!(response.status, 200);
        assert_eq!(
            body(&response),
            json!({ "item_name": "banana_peel", "bin_color": "green" })
        );

        let unknown = route(&state, &request("POST", "/classify", r#"{"item_name":"gizmo"}"#));
        assert_eq!(unknown.status, 404);
        assert_eq!(body(&unknown)["error"], "unknown_classification");

        assert_eq!(
            route(&state, &request("POST", "/classify", r#"{"item_name":"  "}"#)).status,
            400
        );
        assert_eq!(route(&state, &request("POST", "/classify", "not json")).status, 400);
        let escaped = route(&state, &request("POST", "/classify", r#"{"item_name":"../escaped"}"#));
        assert_eq!(escaped.status, 400);
        assert_eq!(body(&escaped)["error"], "invalid_input");
    }

    #[test]
    fn history_honours_limit() {
        let (state, _rx) = state(None);
        {
            let mut store = state.resolver.store().lock().unwrap();
            for ms in 0..3 {
                store
                    .append_sort_event(&SortEvent {
                        class_name: "paper".to_string(),
                        bin_color: BinColor::Yellow,
                        timestamp: Timestamp::from_millis(ms),
                    })
                    .unwrap();
            }
        }
        let all = route(&state, &request("GET", "/bins/history", ""));
        assert_eq!(body(&all).as_array().unwrap().len(), 3);
        let limited = route(&state, &request("GET", "/bins/history?limit=1", ""));
        let events = body(&limited);
        assert_eq!(events.as_array().unwrap().len(), 1);
        assert_eq!(events[0]["timestamp"], 2);
        assert_eq!(
            route(&state, &request("GET", "/bins/history?limit=-4", "")).status,
            400
        );

        let status = body(&route(&state, &request("GET", "/bins/status", "")));
        assert_eq!(status.as_array().unwrap().len(), 3);
    }

    #[test]
    fn control_commands_are_queued() {
        let (state, rx) = state(None);
        let response = route(&state, &request("POST", "/control/force", ""));
        assert_eq!(response.status, 202);
        assert_eq!(rx.try_recv().unwrap(), OperatorCommand::ForceSort);
        assert_eq!(route(&state, &request("POST", "/control/dance", "")).status, 404);

        drop(rx);
        assert_eq!(route(&state, &request("POST", "/control/reset", "")).status, 503);
        assert!(!state.shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn quit_raises_shutdown_and_releases_waiting_prompts() {
        let broker = PromptBroker::new(None);
        let (state, rx) = state(Some(broker.clone()));
        let asker = broker.clone();
        let handle = std::thread::spawn(move || {
            crate::prompt::HumanPrompt::confirm_detection(&asker, "bottle")
        });
        for _ in 0..200 {
            if !broker.pending().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(broker.pending().len(), 1);

        let response = route(&state, &request("POST", "/control/quit", ""));
        assert_eq!(response.status, 202);
        assert!(state.shutdown.load(Ordering::SeqCst));
        assert_eq!(rx.try_recv().unwrap(), OperatorCommand::Quit);
        assert_eq!(
            handle.join().unwrap().unwrap(),
            crate::prompt::Confirmation::Skip
        );

        drop(rx);
        assert_eq!(route(&state, &request("POST", "/control/quit", "")).status, 202);
    }

    #[test]
    fn prompts_are_listed_and_answered() {
        let broker = PromptBroker::new(None);
        let (state, _rx) = state(Some(broker.clone()));
        let asker = broker.clone();
        let handle = std::thread::spawn(move || crate::prompt::HumanPrompt::ask_bin(&asker, "mug"));

        let mut pending = Vec::new();
        for _ in 0..200 {
            pending = body(&route(&state, &request("GET", "/prompts", "")))
                .as_array()
                .unwrap()
                .clone();
            if !pending.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["kind"], "bin");
        let id = pending[0]["id"].as_str().unwrap().to_string();

        let bad = route(
            &state,
            &request("POST", &format!("/prompts/{}", id), r#"{"action":"bin","bin_color":"blue"}"#),
        );
        assert_eq!(bad.status, 400);
        let ok = route(
            &state,
            &request("POST", &format!("/prompts/{}", id), r#"{"action":"bin","bin_color":"brown"}"#),
        );
        assert_eq!(ok.status, 200);
        assert_eq!(handle.join().unwrap().unwrap(), Some(BinColor::Brown));
    }

    #[test]
    fn parses_request_heads() {
        let head = b"POST /classify?x=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 12\r\n\r\n";
        let request = parse_head(head).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/classify");
        assert_eq!(request.query_param("x"), Some("1"));
        assert_eq!(request.headers.get("content-length").map(String::as_str), Some("12"));
    }
}
