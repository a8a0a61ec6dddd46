use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{LoadParams, NameSource};
use crate::heartbeat::InstanceClass;

const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_API_PORT: u16 = 50051;
const DEFAULT_METRICS_PORT: u16 = 50052;
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_INSTANCE_CLASS: &str = "Cpu";
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODELS_DIR: &str = "models";
const DEFAULT_REGISTRY_INTERVAL_SECS: u64 = 5;
const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1000;

#[derive(Debug, Deserialize, Default)]
struct DetectdConfigFile {
    bind_host: Option<String>,
    api_port: Option<u16>,
    metrics_port: Option<u16>,
    stream_port: Option<u16>,
    workers: Option<i64>,
    instance_class: Option<String>,
    inference_backend: Option<String>,
    models_dir: Option<PathBuf>,
    registry: Option<RegistryConfigFile>,
    advertise_ip: Option<String>,
    session: Option<SessionConfigFile>,
    stream_model: Option<StreamModelFile>,
    task_timeout_secs: Option<u64>,
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RegistryConfigFile {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    idle_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamModelFile {
    model_path: String,
    names: NameSource,
    conf: Option<f32>,
    iou: Option<f32>,
    use_gpu: Option<bool>,
    workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DetectdConfig {
    pub bind_host: String,
    pub api_port: u16,
    pub metrics_port: u16,
    pub stream_port: Option<u16>,
    pub workers: usize,
    pub instance_class: InstanceClass,
    pub inference_backend: String,
    /// Destination of `POST /api/model/{name}` uploads.
    pub models_dir: PathBuf,
    pub registry: RegistrySettings,
    pub advertise_ip: Option<String>,
    pub session: SessionTimings,
    pub stream_model: Option<StreamModelSettings>,
    pub task_timeout: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub interval: Duration,
    pub timeout: Duration,
}

impl RegistrySettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
}

/// Model loaded into every session worker when the stream listener is enabled.
#[derive(Debug, Clone)]
pub struct StreamModelSettings {
    pub params: LoadParams,
    pub workers: usize,
}

impl Default for DetectdConfig {
    fn default() -> Self {
        Self::from_file(DetectdConfigFile::default())
    }
}

impl DetectdConfig {
    /// File named by `DETECTD_CONFIG` (if set), then `DETECTD_*` overrides, then validation.
    pub fn load() -> Result<Self> {
        let path = std::env::var("DETECTD_CONFIG").ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => DetectdConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DetectdConfigFile) -> Self {
        let registry_file = file.registry.unwrap_or_default();
        let session_file = file.session.unwrap_or_default();
        let workers = normalize_workers(file.workers.unwrap_or(DEFAULT_WORKERS as i64));
        let stream_model = file.stream_model.map(|model| StreamModelSettings {
            params: LoadParams {
                model_path: model.model_path,
                names: model.names,
                conf: model.conf.unwrap_or(0.5),
                iou: model.iou.unwrap_or(0.5),
                use_gpu: model.use_gpu.unwrap_or(false),
            },
            workers: model.workers.unwrap_or(1),
        });
        Self {
            bind_host: file
                .bind_host
                .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            api_port: file.api_port.unwrap_or(DEFAULT_API_PORT),
            metrics_port: file.metrics_port.unwrap_or(DEFAULT_METRICS_PORT),
            stream_port: file.stream_port,
            workers,
            instance_class: InstanceClass::from_config(
                file.instance_class
                    .as_deref()
                    .unwrap_or(DEFAULT_INSTANCE_CLASS),
            ),
            inference_backend: file
                .inference_backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            models_dir: file
                .models_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODELS_DIR)),
            registry: RegistrySettings {
                enabled: registry_file.enabled.unwrap_or(false),
                host: registry_file
                    .host
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                port: registry_file.port.unwrap_or(8080),
                interval: Duration::from_secs(
                    registry_file
                        .interval_secs
                        .unwrap_or(DEFAULT_REGISTRY_INTERVAL_SECS),
                ),
                timeout: Duration::from_secs(
                    registry_file
                        .timeout_secs
                        .unwrap_or(DEFAULT_REGISTRY_TIMEOUT_SECS),
                ),
            },
            advertise_ip: file.advertise_ip,
            session: SessionTimings {
                idle_timeout: Duration::from_millis(
                    session_file
                        .idle_timeout_ms
                        .unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
                ),
                poll_interval: Duration::from_millis(
                    session_file
                        .poll_interval_ms
                        .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
            stream_model,
            task_timeout: Duration::from_secs(
                file.task_timeout_secs.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS),
            ),
            shutdown_grace: Duration::from_millis(
                file.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("DETECTD_API_PORT") {
            self.api_port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECTD_API_PORT must be a port number"))?;
        }
        if let Ok(port) = std::env::var("DETECTD_METRICS_PORT") {
            self.metrics_port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECTD_METRICS_PORT must be a port number"))?;
        }
        if let Ok(workers) = std::env::var("DETECTD_WORKERS") {
            let workers: i64 = workers
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECTD_WORKERS must be an integer"))?;
            self.workers = normalize_workers(workers);
        }
        if let Ok(class) = std::env::var("DETECTD_INSTANCE_CLASS") {
            if !class.trim().is_empty() {
                self.instance_class = InstanceClass::from_config(&class);
            }
        }
        if let Ok(backend) = std::env::var("DETECTD_BACKEND") {
            if !backend.trim().is_empty() {
                self.inference_backend = backend.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("DETECTD_MODELS_DIR") {
            if !dir.trim().is_empty() {
                self.models_dir = PathBuf::from(dir.trim());
            }
        }
        if let Ok(addr) = std::env::var("DETECTD_REGISTRY_ADDR") {
            if !addr.trim().is_empty() {
                let (host, port) = addr
                    .trim()
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow!("DETECTD_REGISTRY_ADDR must be host:port"))?;
                self.registry.host = host.to_string();
                self.registry.port = port
                    .parse()
                    .map_err(|_| anyhow!("DETECTD_REGISTRY_ADDR has an invalid port"))?;
                self.registry.enabled = true;
            }
        }
        if let Ok(ip) = std::env::var("DETECTD_ADVERTISE_IP") {
            if !ip.trim().is_empty() {
                self.advertise_ip = Some(ip.trim().to_string());
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if let Some(ip) = &self.advertise_ip {
            ip.parse::<std::net::IpAddr>()
                .map_err(|_| anyhow!("advertise_ip '{}' is not an IP address", ip))?;
        }
        if self.registry.enabled && self.registry.host.trim().is_empty() {
            return Err(anyhow!("registry host must be set when registration is enabled"));
        }
        if self.registry.interval.is_zero() || self.registry.timeout.is_zero() {
            return Err(anyhow!("registry interval and timeout must be greater than zero"));
        }
        if self.session.idle_timeout.is_zero() || self.session.poll_interval.is_zero() {
            return Err(anyhow!("session idle timeout and poll interval must be greater than zero"));
        }
        if self.models_dir.as_os_str().is_empty() {
            return Err(anyhow!("models_dir cannot be empty"));
        }
        if self.task_timeout.is_zero() {
            return Err(anyhow!("task timeout must be greater than zero"));
        }
        if let Some(model) = &self.stream_model {
            model
                .params
                .validate()
                .map_err(|e| anyhow!("stream_model: {}", e))?;
            if model.workers == 0 {
                return Err(anyhow!("stream_model.workers must be at least 1"));
            }
        }
        crate::detect::backends::factory_for(&self.inference_backend)?;
        Ok(())
    }

    /// Apply a worker count from the command line with the same normalization as the file.
    pub fn set_workers(&mut self, requested: i64) {
        self.workers = normalize_workers(requested);
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.api_port)
    }

    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.metrics_port)
    }

    pub fn stream_addr(&self) -> Option<String> {
        self.stream_port
            .map(|port| format!("{}:{}", self.bind_host, port))
    }
}

fn normalize_workers(requested: i64) -> usize {
    if requested <= 0 {
        log::warn!("invalid worker count {}, defaulting to 1", requested);
        return 1;
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if requested as usize > cpus {
        log::warn!(
            "{} workers exceeds {} CPU cores; expect degraded throughput",
            requested,
            cpus
        );
    }
    requested as usize
}

fn read_config_file(path: &Path) -> Result<DetectdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
