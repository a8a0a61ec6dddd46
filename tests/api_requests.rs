use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::Result;
use detect_dispatch::config::DetectdConfig;
use detect_dispatch::server::{DetectionServer, ServerHandle};
use detect_dispatch::DetectorState;
use serde_json::{json, Value};

fn test_config() -> DetectdConfig {
    DetectdConfig {
        bind_host: "127.0.0.1".to_string(),
        api_port: 0,
        metrics_port: 0,
        workers: 2,
        ..DetectdConfig::default()
    }
}

fn png_frame() -> Vec<u8> {
    let img = image::RgbImage::from_fn(32, 24, |x, y| image::Rgb([x as u8 * 5, y as u8 * 9, 77]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

/// Status and decoded JSON body, whatever the status.
fn into_reply(result: Result<ureq::Response, ureq::Error>) -> Result<(u16, Value)> {
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(err) => return Err(err.into()),
    };
    let status = response.status();
    let body: Value = serde_json::from_str(&response.into_string()?)?;
    Ok((status, body))
}

fn get(addr: SocketAddr, path: &str) -> Result<(u16, Value)> {
    into_reply(ureq::get(&url(addr, path)).call())
}

fn delete(addr: SocketAddr, path: &str) -> Result<(u16, Value)> {
    into_reply(ureq::delete(&url(addr, path)).call())
}

fn post_json(addr: SocketAddr, path: &str, body: &Value) -> Result<(u16, Value)> {
    into_reply(
        ureq::post(&url(addr, path))
            .set("Content-Type", "application/json")
            .send_string(&body.to_string()),
    )
}

fn post_bytes(addr: SocketAddr, path: &str, body: &[u8]) -> Result<(u16, Value)> {
    into_reply(
        ureq::post(&url(addr, path))
            .set("Content-Type", "application/octet-stream")
            .send_bytes(body),
    )
}

fn create_request() -> Value {
    json!({
        "description": "dock camera",
        "modelPath": "models/yolov8n.onnx",
        "names": ["person", "car", "truck"],
        "conf": 0.3,
        "iou": 0.45
    })
}

struct TestServer {
    handle: Option<ServerHandle>,
}

impl TestServer {
    fn start() -> Result<Self> {
        Self::start_with(test_config())
    }

    fn start_with(config: DetectdConfig) -> Result<Self> {
        let handle = DetectionServer::new(config).start()?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    fn handle(&self) -> &ServerHandle {
        self.handle
            .as_ref()
            .expect("test server handle should be initialized")
    }

    fn api(&self) -> SocketAddr {
        self.handle().api_addr()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().expect("failed to shut down server");
        }
    }
}

#[test]
fn detector_lifecycle_over_http() -> Result<()> {
    let server = TestServer::start()?;
    let api = server.api();

    let (status, body) = post_json(api, "/api/engine", &create_request())?;
    assert_eq!(status, 201);
    let id = body["id"].as_str().expect("id").to_string();
    assert_eq!(id.len(), 36);

    let (status, info) = get(api, &format!("/api/engine/{}", id))?;
    assert_eq!(status, 200);
    assert_eq!(info["description"], "dock camera");
    assert_eq!(info["engineType"], 0x1001);
    assert_eq!(info["state"], "IDLE");
    assert_eq!(info["names"], json!(["person", "car", "truck"]));
    assert_eq!(info["useGPU"], false);

    let (status, list) = get(api, "/api/engine")?;
    assert_eq!(status, 200);
    assert_eq!(list.as_array().map(Vec::len), Some(1));

    let (status, result) = post_bytes(api, &format!("/api/inference/{}", id), &png_frame())?;
    assert_eq!(status, 200);
    assert_eq!(result["engineId"], id.as_str());
    let detections = result["detections"].as_object().expect("detections");
    assert_eq!(detections.len(), 3);
    for boxes in detections.values() {
        for det in boxes.as_array().expect("boxes") {
            assert!(det["confidence"].as_f64().expect("confidence") >= 0.3);
            assert!(det["box"]["lt"]["x"].is_number());
            assert!(det["center"]["y"].is_number());
        }
    }

    let (status, _) = delete(api, &format!("/api/engine/{}", id))?;
    assert_eq!(status, 200);
    let (status, _) = get(api, &format!("/api/engine/{}", id))?;
    assert_eq!(status, 404);
    let (status, _) = delete(api, &format!("/api/engine/{}", id))?;
    assert_eq!(status, 404);
    assert!(server.handle().registry().is_empty());
    Ok(())
}

#[test]
fn invalid_requests_map_to_client_errors() -> Result<()> {
    let server = TestServer::start()?;
    let api = server.api();

    let mut bad_conf = create_request();
    bad_conf["conf"] = json!(1.5);
    let (status, body) = post_json(api, "/api/engine", &bad_conf)?;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().expect("error").contains("confidence"));

    let mut bad_type = create_request();
    bad_type["engineType"] = json!(0x1002);
    assert_eq!(post_json(api, "/api/engine", &bad_type)?.0, 400);

    let (status, _) = post_bytes(api, "/api/engine", b"{ nope")?;
    assert_eq!(status, 400);

    let (status, _) = post_bytes(api, "/api/inference/missing", &png_frame())?;
    assert_eq!(status, 404);

    let (_, created) = post_json(api, "/api/engine", &create_request())?;
    let id = created["id"].as_str().expect("id").to_string();
    let (status, body) = post_bytes(api, &format!("/api/inference/{}", id), b"not an image")?;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().expect("error").contains("decode"));

    // a destroyed detector still referenced by a caller refuses work
    let entry = server.handle().registry().lookup(&id).expect("entry");
    entry.detector.destroy();
    assert_eq!(entry.detector.state(), DetectorState::Unregistered);
    let (status, _) = post_bytes(api, &format!("/api/inference/{}", id), &png_frame())?;
    assert_eq!(status, 409);

    let (status, _) = get(api, "/api/unknown")?;
    assert_eq!(status, 404);
    let (status, _) = delete(api, "/health")?;
    assert_eq!(status, 405);
    Ok(())
}

#[test]
fn health_metrics_and_shutdown_request() -> Result<()> {
    let server = TestServer::start()?;
    let api = server.api();

    let (status, body) = get(api, "/health")?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    get(api, "/api/engine")?;
    assert!(server.handle().metrics().requests_total() >= 2);

    let text = ureq::get(&url(server.handle().metrics_addr(), "/metrics"))
        .call()?
        .into_string()?;
    assert!(text.contains("grpc_requests_total"));
    assert!(text.contains("memory_usage_Megabytes"));
    assert!(text.contains("cpu_usage_percent"));

    let signal = server.handle().shutdown_signal();
    assert!(!signal.is_cancelled());
    let (status, body) = post_json(api, "/api/shutdown", &json!({}))?;
    assert_eq!(status, 200);
    assert_eq!(body["shutdown"], true);
    assert!(signal.wait(Duration::from_secs(2)));
    Ok(())
}

#[test]
fn malformed_http_gets_bad_request() -> Result<()> {
    let server = TestServer::start()?;

    let mut stream = TcpStream::connect(server.api())?;
    stream.write_all(b"GARBAGE\r\n\r\n")?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    assert!(response.starts_with("HTTP/1.1 400"));
    Ok(())
}

/// Raw request, for paths an HTTP client would normalise before sending.
fn raw_post(addr: SocketAddr, path: &str, body: &[u8]) -> Result<String> {
    let mut stream = TcpStream::connect(addr)?;
    write!(
        stream,
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n",
        path,
        addr,
        body.len()
    )?;
    stream.write_all(body)?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

#[test]
fn uploaded_model_can_back_a_new_engine() -> Result<()> {
    let models = tempfile::tempdir()?;
    let models_dir = models.path().join("uploads");
    let server = TestServer::start_with(DetectdConfig {
        models_dir: models_dir.clone(),
        ..test_config()
    })?;
    let api = server.api();

    let weights: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let (status, body) = post_bytes(api, "/api/model/yolov8n.onnx", &weights)?;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    let file_path = body["filePath"].as_str().expect("filePath").to_string();
    assert_eq!(
        std::path::Path::new(&file_path),
        models_dir.join("yolov8n.onnx")
    );
    assert_eq!(std::fs::read(&file_path)?, weights);

    let mut request = create_request();
    request["modelPath"] = json!(file_path);
    let (status, created) = post_json(api, "/api/engine", &request)?;
    assert_eq!(status, 201);
    let id = created["id"].as_str().expect("id").to_string();
    let (_, info) = get(api, &format!("/api/engine/{}", id))?;
    assert_eq!(info["modelPath"], file_path.as_str());
    assert_eq!(info["state"], "IDLE");

    // uploading again replaces the file
    let (status, _) = post_bytes(api, "/api/model/yolov8n.onnx", b"v2")?;
    assert_eq!(status, 200);
    assert_eq!(std::fs::read(&file_path)?, b"v2");
    Ok(())
}

#[test]
fn model_upload_rejects_names_that_escape_the_models_dir() -> Result<()> {
    let models = tempfile::tempdir()?;
    let server = TestServer::start_with(DetectdConfig {
        models_dir: models.path().to_path_buf(),
        ..test_config()
    })?;
    let api = server.api();

    let (status, body) = post_bytes(api, "/api/model/weights..onnx", b"x")?;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().expect("error").contains("invalid file name"));
    let (status, _) = post_bytes(api, "/api/model/sub%2F..%5Cnet.onnx", b"x")?;
    assert_eq!(status, 400);
    let (status, body) = post_bytes(api, "/api/model", b"x")?;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().expect("error").contains("empty"));

    let response = raw_post(api, "/api/model/..", b"x")?;
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

    let (status, _) = get(api, "/api/model/yolov8n.onnx")?;
    assert_eq!(status, 405);

    assert_eq!(std::fs::read_dir(models.path())?.count(), 0);
    Ok(())
}
