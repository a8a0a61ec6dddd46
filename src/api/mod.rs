//! JSON-over-HTTP request layer.
//!
//! | Route | Action |
//! |---|---|
//! | `POST /api/engine` | create a detector and load its model |
//! | `GET /api/engine` | snapshot of every detector |
//! | `GET /api/engine/{id}` | one detector's configuration and state |
//! | `DELETE /api/engine/{id}` | destroy a detector |
//! | `POST /api/inference/{id}` | run the encoded image in the body through the task queue |
//! | `POST /api/model/{name}` | store the body as a model file under the models directory |
//! | `POST /api/shutdown` | request a staged shutdown |
//! | `GET /health` | liveness |

use std::fs;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cancel::CancelToken;
use crate::detect::{DetectionMap, DetectorRegistry, EngineType, LoadParams, NameSource};
use crate::error::DispatchError;
use crate::frame::FramePayload;
use crate::http::{self, HttpRequest};
use crate::monitor::Metrics;
use crate::pool::{DetectionTask, TaskQueue};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Largest request body accepted; model uploads are the only bodies near it.
pub const MAX_MODEL_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:50051".to_string(),
        }
    }
}

/// Body of `POST /api/engine`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_engine_type")]
    pub engine_type: i32,
    pub model_path: String,
    pub names: NameSource,
    pub conf: f32,
    pub iou: f32,
    #[serde(default, rename = "useGPU")]
    pub use_gpu: bool,
}

fn default_engine_type() -> i32 {
    EngineType::SINGLE_THREAD_CODE
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceResponse<'a> {
    engine_id: &'a str,
    detections: DetectionMap,
}

/// Everything a request handler needs, shared across connection threads.
pub struct ApiState {
    pub registry: Arc<DetectorRegistry>,
    pub queue: Arc<TaskQueue>,
    pub metrics: Metrics,
    /// Fired by `POST /api/shutdown`; the owner of the server reacts to it.
    pub shutdown_requested: CancelToken,
    pub task_timeout: Duration,
    /// Where `POST /api/model/{name}` writes uploaded model files.
    pub models_dir: PathBuf,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    stop: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Requests already being served run to completion.
    pub fn stop(mut self) -> Result<()> {
        self.stop.cancel();
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
        let listener = TcpListener::bind(&self.cfg.addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let stop = CancelToken::new();
        let stop_thread = stop.clone();
        let state = self.state;
        let join = thread::Builder::new()
            .name("api-listener".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, state, stop_thread) {
                    log::error!("api server stopped: {}", err);
                }
            })?;
        log::info!("api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            stop,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<ApiState>, stop: CancelToken) -> Result<()> {
    loop {
        if stop.is_cancelled() {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                let spawned = thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &state) {
                            log::warn!("api request from {} failed: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("failed to spawn api connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                stop.wait(ACCEPT_POLL);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &ApiState) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    state.metrics.record_request();

    let request = match http::read_request(&mut stream, MAX_MODEL_UPLOAD_BYTES) {
        Ok(request) => request,
        Err(err) => {
            http::write_json(&mut stream, 400, &json!({ "error": err.to_string() }))?;
            return Ok(());
        }
    };
    let (status, body) = route(&request, state);
    http::write_json(&mut stream, status, &body)?;

    if status == 200 && request.method == "POST" && request.path == "/api/shutdown" {
        state.shutdown_requested.cancel();
    }
    Ok(())
}

fn route(request: &HttpRequest, state: &ApiState) -> (u16, serde_json::Value) {
    let segments = request.segments();
    let outcome = match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => Ok((200, json!({ "status": "ok" }))),
        ("POST", ["api", "engine"]) => create_engine(request, state),
        ("GET", ["api", "engine"]) => to_value(&state.registry.snapshot()).map(|v| (200, v)),
        ("GET", ["api", "engine", id]) => state
            .registry
            .lookup(id)
            .ok_or_else(|| DispatchError::detector_not_found(id))
            .and_then(|entry| to_value(&entry.info()))
            .map(|v| (200, v)),
        ("DELETE", ["api", "engine", id]) => state
            .registry
            .destroy(id)
            .map(|()| (200, json!({ "destroyed": id }))),
        ("POST", ["api", "inference", id]) => infer(id, request, state),
        ("POST", ["api", "model", name]) => upload_model(name, request, state),
        ("POST", ["api", "model"]) => Err(DispatchError::validation("file name cannot be empty")),
        ("POST", ["api", "shutdown"]) => {
            log::info!("shutdown requested over api");
            Ok((200, json!({ "shutdown": true })))
        }
        (_, ["health"])
        | (_, ["api", "engine"])
        | (_, ["api", "engine", _])
        | (_, ["api", "model", _]) => {
            Ok((405, json!({ "error": "method_not_allowed" })))
        }
        _ => Ok((404, json!({ "error": "not_found" }))),
    };
    match outcome {
        Ok(reply) => reply,
        Err(err) => {
            let status = err.status_code();
            if status >= 500 {
                log::error!("{} {} failed: {}", request.method, request.path, err);
            }
            (status, json!({ "error": err.to_string() }))
        }
    }
}

fn create_engine(
    request: &HttpRequest,
    state: &ApiState,
) -> crate::Result<(u16, serde_json::Value)> {
    let req: CreateRequest = serde_json::from_slice(&request.body)
        .map_err(|e| DispatchError::validation(format!("invalid create request: {}", e)))?;
    let engine_type = EngineType::from_code(req.engine_type)?;
    let params = LoadParams {
        model_path: req.model_path,
        names: req.names,
        conf: req.conf,
        iou: req.iou,
        use_gpu: req.use_gpu,
    };
    let id = state.registry.create(&req.description, engine_type, &params)?;
    Ok((201, json!({ "id": id })))
}

fn infer(id: &str, request: &HttpRequest, state: &ApiState) -> crate::Result<(u16, serde_json::Value)> {
    let entry = state
        .registry
        .lookup(id)
        .ok_or_else(|| DispatchError::detector_not_found(id))?;
    if request.body.is_empty() {
        return Err(DispatchError::validation("request body must be an encoded image"));
    }
    let (task, handle) = DetectionTask::new(
        entry.detector.clone(),
        FramePayload::Encoded(request.body.clone()),
    );
    state.queue.submit(task)?;
    let detections = handle.wait_timeout(state.task_timeout)?;
    to_value(&InferenceResponse {
        engine_id: id,
        detections,
    })
    .map(|v| (200, v))
}

/// A bare file name: no separators, no parent references.
fn validate_model_name(name: &str) -> crate::Result<()> {
    if name.trim().is_empty() {
        return Err(DispatchError::validation("file name cannot be empty"));
    }
    if name.contains("..") || name.contains(['/', '\\', '\0']) {
        return Err(DispatchError::validation(format!(
            "invalid file name {:?}",
            name
        )));
    }
    Ok(())
}

fn upload_model(
    name: &str,
    request: &HttpRequest,
    state: &ApiState,
) -> crate::Result<(u16, serde_json::Value)> {
    validate_model_name(name)?;
    fs::create_dir_all(&state.models_dir).map_err(|e| {
        DispatchError::Storage(format!(
            "failed to create {}: {}",
            state.models_dir.display(),
            e
        ))
    })?;
    let path = state.models_dir.join(name);
    fs::write(&path, &request.body)
        .map_err(|e| DispatchError::Storage(format!("failed to write {}: {}", path.display(), e)))?;
    log::info!(
        "stored model upload {} ({} bytes)",
        path.display(),
        request.body.len()
    );
    Ok((
        200,
        json!({
            "success": true,
            "message": "File uploaded successfully",
            "filePath": path.to_string_lossy(),
        }),
    ))
}

fn to_value<T: Serialize>(value: &T) -> crate::Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| DispatchError::NativeFailure(e.to_string()))
}
