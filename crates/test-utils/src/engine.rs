//! Scriptable fake ComfyUI server.
//!
//! Every endpoint the worker talks to is served from shared in-memory
//! state that tests configure up front and inspect afterwards. WebSocket
//! behaviour is scripted per connection: each accepted upgrade consumes
//! the next queued [`WsStep`] list, and upgrades are refused with `503`
//! once the queue is empty.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Scripting types
// ---------------------------------------------------------------------------

/// One step of a scripted WebSocket session.
#[derive(Debug, Clone)]
pub enum WsStep {
    /// Push a text frame.
    Send(String),
    /// Wait before the next step.
    Pause(Duration),
    /// Send a close frame and end the session.
    Close,
}

/// How `POST /prompt` answers.
#[derive(Debug, Clone)]
pub enum PromptReply {
    /// `200` with the given prompt ID.
    Accept(String),
    /// Any status with a raw body.
    Reject { status: u16, body: String },
}

/// A received `POST /upload/image`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub filename: String,
    pub overwrite: Option<String>,
    pub size: usize,
}

/// A received `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ViewRecord {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct EngineState {
    root_status: AtomicU16,
    root_hits: AtomicUsize,
    ws_attempts: AtomicUsize,
    interrupts: AtomicUsize,
    sessions: Mutex<VecDeque<Vec<WsStep>>>,
    ws_client_ids: Mutex<Vec<String>>,
    prompt_reply: Mutex<PromptReply>,
    prompts: Mutex<Vec<Value>>,
    uploads: Mutex<Vec<UploadRecord>>,
    failing_uploads: Mutex<HashSet<String>>,
    history: Mutex<HashMap<String, Value>>,
    images: Mutex<HashMap<String, Vec<u8>>>,
    views: Mutex<Vec<ViewRecord>>,
    object_info: Mutex<Option<Value>>,
    deleted: Mutex<Vec<String>>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            root_status: AtomicU16::new(200),
            root_hits: AtomicUsize::new(0),
            ws_attempts: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            sessions: Mutex::new(VecDeque::new()),
            ws_client_ids: Mutex::new(Vec::new()),
            prompt_reply: Mutex::new(PromptReply::Accept("p1".to_string())),
            prompts: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            failing_uploads: Mutex::new(HashSet::new()),
            history: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            views: Mutex::new(Vec::new()),
            object_info: Mutex::new(None),
            deleted: Mutex::new(Vec::new()),
        }
    }
}

/// Lock a mutex, recovering the data if a panicking test poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

/// A ComfyUI look-alike listening on an ephemeral local port.
///
/// Defaults: `GET /` answers `200`, `POST /prompt` accepts with prompt
/// ID `p1`, history is empty, `/object_info` fails, and no WebSocket
/// sessions are queued.
pub struct FakeEngine {
    state: Arc<EngineState>,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for FakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeEngine")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl FakeEngine {
    /// Bind `127.0.0.1:0` and start serving.
    pub async fn start() -> std::io::Result<Self> {
        let state = Arc::new(EngineState::default());

        let app = Router::new()
            .route("/", get(root))
            .route("/ws", get(ws_upgrade))
            .route("/upload/image", post(upload_image))
            .route("/prompt", post(prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/object_info", get(object_info))
            .route("/queue", post(queue))
            .route("/interrupt", post(interrupt))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::warn!(error = %e, "Fake engine server stopped with error");
            }
        });

        Ok(Self {
            state,
            addr,
            shutdown_tx: Some(shutdown_tx),
            _task: task,
        })
    }

    /// `host:port` as accepted by `COMFY_HOST`.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// HTTP base URL (e.g. `http://127.0.0.1:12345`).
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    // ---- configuration ----

    /// Status code returned by `GET /`.
    pub fn set_root_status(&self, status: u16) {
        self.state.root_status.store(status, Ordering::SeqCst);
    }

    /// Queue the script for the next accepted WebSocket connection.
    ///
    /// A session that runs out of steps without [`WsStep::Close`] stays
    /// open until the client disconnects.
    pub fn push_ws_session(&self, steps: Vec<WsStep>) {
        lock(&self.state.sessions).push_back(steps);
    }

    pub fn set_prompt_reply(&self, reply: PromptReply) {
        *lock(&self.state.prompt_reply) = reply;
    }

    /// Make `POST /upload/image` fail with `500` for this file name.
    pub fn fail_upload(&self, filename: &str) {
        lock(&self.state.failing_uploads).insert(filename.to_string());
    }

    /// Store the history entry (`{"outputs": ...}`) for a prompt.
    pub fn set_history(&self, prompt_id: &str, entry: Value) {
        lock(&self.state.history).insert(prompt_id.to_string(), entry);
    }

    /// Make `GET /view?filename=<filename>` return `bytes`.
    pub fn add_image(&self, filename: &str, bytes: Vec<u8>) {
        lock(&self.state.images).insert(filename.to_string(), bytes);
    }

    pub fn set_object_info(&self, info: Value) {
        *lock(&self.state.object_info) = Some(info);
    }

    // ---- observations ----

    /// Number of `GET /` requests served.
    pub fn root_hits(&self) -> usize {
        self.state.root_hits.load(Ordering::SeqCst)
    }

    /// Number of WebSocket upgrade requests, refused ones included.
    pub fn ws_attempts(&self) -> usize {
        self.state.ws_attempts.load(Ordering::SeqCst)
    }

    /// `clientId` of every WebSocket upgrade request, in order.
    pub fn ws_client_ids(&self) -> Vec<String> {
        lock(&self.state.ws_client_ids).clone()
    }

    /// Bodies received by `POST /prompt`.
    pub fn prompts(&self) -> Vec<Value> {
        lock(&self.state.prompts).clone()
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        lock(&self.state.uploads).clone()
    }

    pub fn views(&self) -> Vec<ViewRecord> {
        lock(&self.state.views).clone()
    }

    /// Prompt IDs removed through `POST /queue`.
    pub fn deleted_prompts(&self) -> Vec<String> {
        lock(&self.state.deleted).clone()
    }

    pub fn interrupts(&self) -> usize {
        self.state.interrupts.load(Ordering::SeqCst)
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type Shared = State<Arc<EngineState>>;

async fn root(State(state): Shared) -> StatusCode {
    state.root_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::from_u16(state.root_status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
}

async fn ws_upgrade(
    State(state): Shared,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    state.ws_attempts.fetch_add(1, Ordering::SeqCst);
    if let Some(client_id) = params.get("clientId") {
        lock(&state.ws_client_ids).push(client_id.clone());
    }

    let Some(steps) = lock(&state.sessions).pop_front() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    ws.on_upgrade(move |socket| run_session(socket, steps))
}

async fn run_session(mut socket: WebSocket, steps: Vec<WsStep>) {
    for step in steps {
        match step {
            WsStep::Send(text) => {
                if socket.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            WsStep::Pause(delay) => tokio::time::sleep(delay).await,
            WsStep::Close => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        }
    }

    // Out of script: stay open until the client goes away.
    while let Some(Ok(msg)) = socket.recv().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}

async fn upload_image(State(state): Shared, mut multipart: Multipart) -> Response {
    let mut filename = None;
    let mut overwrite = None;
    let mut size = 0;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                filename = field.file_name().map(str::to_string);
                size = field.bytes().await.map(|b| b.len()).unwrap_or_default();
            }
            Some("overwrite") => overwrite = field.text().await.ok(),
            _ => {}
        }
    }

    let Some(filename) = filename else {
        return (StatusCode::BAD_REQUEST, "missing image part").into_response();
    };

    if lock(&state.failing_uploads).contains(&filename) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "disk full").into_response();
    }

    lock(&state.uploads).push(UploadRecord {
        filename: filename.clone(),
        overwrite,
        size,
    });
    Json(json!({"name": filename, "subfolder": "", "type": "input"})).into_response()
}

async fn prompt(State(state): Shared, Json(body): Json<Value>) -> Response {
    lock(&state.prompts).push(body);
    let reply = lock(&state.prompt_reply).clone();
    match reply {
        PromptReply::Accept(prompt_id) => {
            Json(json!({"prompt_id": prompt_id, "number": 1, "node_errors": {}})).into_response()
        }
        PromptReply::Reject { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
            (status, body).into_response()
        }
    }
}

async fn history(State(state): Shared, Path(prompt_id): Path<String>) -> Json<Value> {
    let mut doc = serde_json::Map::new();
    if let Some(entry) = lock(&state.history).get(&prompt_id).cloned() {
        doc.insert(prompt_id, entry);
    }
    Json(Value::Object(doc))
}

async fn view(State(state): Shared, Query(record): Query<ViewRecord>) -> Response {
    let bytes = lock(&state.images).get(&record.filename).cloned();
    lock(&state.views).push(record);
    match bytes {
        Some(bytes) => bytes.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn object_info(State(state): Shared) -> Response {
    match lock(&state.object_info).clone() {
        Some(info) => Json(info).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn queue(State(state): Shared, Json(body): Json<Value>) -> StatusCode {
    if let Some(ids) = body.get("delete").and_then(Value::as_array) {
        let mut deleted = lock(&state.deleted);
        deleted.extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
    }
    StatusCode::OK
}

async fn interrupt(State(state): Shared) -> StatusCode {
    state.interrupts.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}
