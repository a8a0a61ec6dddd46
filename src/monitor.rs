//! Process resource gauges and the `/metrics` endpoint.
//!
//! The sampler refreshes resident memory (MB) and CPU usage (%) of this process at a
//! fixed cadence. The request counter is only ever incremented, by the request layer.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use sysinfo::{Pid, System};

use crate::cancel::CancelToken;
use crate::http;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    memory_mb: Gauge,
    cpu_percent: Gauge,
    requests: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let memory_mb = Gauge::new("memory_usage_Megabytes", "Resident memory of the process in MB")?;
        let cpu_percent = Gauge::new("cpu_usage_percent", "CPU usage of the process in percent")?;
        let requests = IntCounter::new("grpc_requests_total", "Total number of requests served")?;
        registry.register(Box::new(memory_mb.clone()))?;
        registry.register(Box::new(cpu_percent.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        Ok(Self {
            registry,
            memory_mb,
            cpu_percent,
            requests,
        })
    }

    pub fn record_request(&self) {
        self.requests.inc();
    }

    pub fn requests_total(&self) -> u64 {
        self.requests.get()
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_mb.get()
    }

    pub fn cpu_percent(&self) -> f64 {
        self.cpu_percent.get()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

pub struct MonitorHandle {
    pub addr: SocketAddr,
    sampler: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl MonitorHandle {
    /// Wait for both threads. Cancel the token passed to `run` first.
    pub fn join(self) -> Result<()> {
        self.sampler
            .join()
            .map_err(|_| anyhow!("monitor sampler panicked"))?;
        self.listener
            .join()
            .map_err(|_| anyhow!("metrics listener panicked"))
    }
}

pub struct ProcessMonitor {
    metrics: Metrics,
    interval: Duration,
}

impl ProcessMonitor {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
            interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the `/metrics` listener on `addr` and the sampling loop.
    pub fn run(self, addr: &str, cancel: CancelToken) -> Result<MonitorHandle> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("current pid: {}", e))?;
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let metrics = self.metrics.clone();
        let listener_cancel = cancel.clone();
        let listener = thread::Builder::new()
            .name("metrics-listener".to_string())
            .spawn(move || {
                if let Err(err) = serve_metrics(listener, &metrics, &listener_cancel) {
                    log::error!("metrics listener stopped: {}", err);
                }
            })?;

        let metrics = self.metrics;
        let interval = self.interval;
        let sampler = thread::Builder::new()
            .name("process-monitor".to_string())
            .spawn(move || {
                let mut system = System::new();
                loop {
                    sample(&mut system, pid, &metrics);
                    if cancel.wait(interval) {
                        break;
                    }
                }
                log::info!("process monitor stopped");
            })?;

        log::info!("metrics endpoint on http://{}/metrics", addr);
        Ok(MonitorHandle {
            addr,
            sampler,
            listener,
        })
    }
}

fn sample(system: &mut System, pid: Pid, metrics: &Metrics) {
    if !system.refresh_process(pid) {
        log::warn!("process {} not visible to the monitor", pid);
        return;
    }
    if let Some(process) = system.process(pid) {
        let memory_mb = process.memory() as f64 / (1024.0 * 1024.0);
        let cpu = (process.cpu_usage() as f64 * 100.0).round() / 100.0;
        metrics.memory_mb.set(memory_mb);
        metrics.cpu_percent.set(cpu);
    }
}

fn serve_metrics(listener: TcpListener, metrics: &Metrics, cancel: &CancelToken) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_scrape(stream, metrics) {
                    log::warn!("metrics request failed: {}", err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                cancel.wait(ACCEPT_POLL);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_scrape(mut stream: TcpStream, metrics: &Metrics) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let request = http::read_request(&mut stream, 0)?;
    if request.method != "GET" || request.path != "/metrics" {
        return http::write_response(&mut stream, 404, "text/plain", b"not found\n");
    }
    let body = metrics.render()?;
    http::write_response(
        &mut stream,
        200,
        "text/plain; version=0.0.4",
        body.as_bytes(),
    )
}
