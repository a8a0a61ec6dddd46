use std::io::{BufRead, BufReader, Cursor, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::Result;
use detect_dispatch::config::{DetectdConfig, SessionTimings, StreamModelSettings};
use detect_dispatch::server::{DetectionServer, ServerHandle};
use detect_dispatch::session::WorkerSlotState;
use detect_dispatch::{LoadParams, NameSource};
use serde_json::Value;

fn stream_config() -> DetectdConfig {
    DetectdConfig {
        bind_host: "127.0.0.1".to_string(),
        api_port: 0,
        metrics_port: 0,
        stream_port: Some(0),
        session: SessionTimings {
            idle_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
        },
        stream_model: Some(StreamModelSettings {
            params: LoadParams {
                model_path: "models/yolov8n.onnx".to_string(),
                names: NameSource::from_list(["person", "car"]),
                conf: 0.25,
                iou: 0.45,
                use_gpu: false,
            },
            workers: 1,
        }),
        ..DetectdConfig::default()
    }
}

fn png_frame(seed: u8) -> Vec<u8> {
    let img = image::RgbImage::from_fn(24, 16, |x, y| image::Rgb([x as u8 ^ seed, y as u8, seed]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

struct Client {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Result<Self> {
        let writer = TcpStream::connect(addr)?;
        writer.set_read_timeout(Some(Duration::from_secs(5)))?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self { writer, reader })
    }

    fn send_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.writer.write_all(bytes)?;
        Ok(())
    }

    /// Next JSON line, or `None` once the server closed the connection.
    fn next_message(&mut self) -> Result<Option<Value>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn start() -> Result<(ServerHandle, SocketAddr)> {
    let server = DetectionServer::new(stream_config()).start()?;
    let addr = server.stream_addr().expect("stream listener enabled");
    Ok((server, addr))
}

#[test]
fn frames_are_answered_in_order_and_errors_stay_inline() -> Result<()> {
    let (server, addr) = start()?;
    let mut client = Client::connect(addr)?;

    client.send_frame(&png_frame(1))?;
    let first = client.next_message()?.expect("result line");
    assert_eq!(first["type"], "result");
    let session_id = first["sessionId"].as_str().expect("session id").to_string();
    assert_eq!(session_id.len(), 32);
    let detections = first["detections"].as_object().expect("detections");
    assert!(detections.contains_key("person") && detections.contains_key("car"));

    client.send_frame(b"this is not an image")?;
    let error = client.next_message()?.expect("error line");
    assert_eq!(error["type"], "error");
    assert_eq!(error["sessionId"], session_id.as_str());
    assert!(error["message"].as_str().expect("message").contains("decode"));

    client.send_frame(&png_frame(1))?;
    let again = client.next_message()?.expect("result line");
    assert_eq!(again["sessionId"], session_id.as_str());
    assert_eq!(again["detections"], first["detections"]);

    assert_eq!(server.sessions().active_sessions(), 1);
    drop(client);
    assert!(wait_until(Duration::from_secs(2), || server
        .sessions()
        .active_sessions()
        == 0));
    assert_eq!(server.sessions().worker_states(), vec![WorkerSlotState::Idle]);

    server.shutdown()
}

#[test]
fn busy_workers_turn_away_new_connections() -> Result<()> {
    let (server, addr) = start()?;
    let mut holder = Client::connect(addr)?;
    holder.send_frame(&png_frame(2))?;
    assert_eq!(holder.next_message()?.expect("result")["type"], "result");

    let mut rejected = Client::connect(addr)?;
    let refusal = rejected.next_message()?.expect("refusal line");
    assert_eq!(refusal["type"], "error");
    assert!(refusal["message"]
        .as_str()
        .expect("message")
        .contains("no idle session worker"));
    assert!(rejected.next_message()?.is_none());

    server.shutdown()
}

#[test]
fn idle_sessions_are_evicted_and_worker_reused() -> Result<()> {
    let (server, addr) = start()?;
    let mut client = Client::connect(addr)?;
    client.send_frame(&png_frame(3))?;
    assert!(client.next_message()?.is_some());

    let silent_since = Instant::now();
    assert!(client.next_message()?.is_none());
    let idle = silent_since.elapsed();
    assert!(idle >= Duration::from_millis(250), "evicted after {:?}", idle);
    assert!(idle < Duration::from_secs(2), "evicted after {:?}", idle);
    assert!(wait_until(Duration::from_secs(1), || server
        .sessions()
        .active_sessions()
        == 0));

    let mut next = Client::connect(addr)?;
    next.send_frame(&png_frame(4))?;
    assert_eq!(next.next_message()?.expect("result")["type"], "result");

    server.shutdown()
}

#[test]
fn shutdown_closes_open_sessions() -> Result<()> {
    let (server, addr) = start()?;
    let mut client = Client::connect(addr)?;
    client.send_frame(&png_frame(5))?;
    assert!(client.next_message()?.is_some());

    server.shutdown()?;
    assert!(client.next_message()?.is_none());
    Ok(())
}
