//! Wires the registry, worker pool, session manager, heartbeat and monitor together.
//!
//! Shutdown is staged: stop intake, release sessions, drain the registry by destroying
//! every detector, close the task queue, give workers the grace period to finish, then
//! cancel the background loops.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::bounded;

use crate::api::{ApiConfig, ApiHandle, ApiServer, ApiState};
use crate::cancel::CancelToken;
use crate::config::DetectdConfig;
use crate::detect::{factory_for, Detector, DetectorRegistry, SharedFactory};
use crate::heartbeat::{outbound_ip, Announcement, HeartbeatClient, HeartbeatConfig};
use crate::monitor::{Metrics, MonitorHandle, ProcessMonitor};
use crate::pool::{PoolConfig, WorkerPool};
use crate::session::{SessionManager, SessionSettings, StreamHandle, StreamListener};

pub struct DetectionServer {
    config: DetectdConfig,
}

impl DetectionServer {
    pub fn new(config: DetectdConfig) -> Self {
        Self { config }
    }

    pub fn start(self) -> Result<ServerHandle> {
        let config = self.config;
        let factory = factory_for(&config.inference_backend)?;
        log::info!(
            "starting detectd: backend={}, workers={}, instance class={:?}",
            config.inference_backend,
            config.workers,
            config.instance_class
        );

        let registry = Arc::new(DetectorRegistry::new(factory.clone()));
        let pool = WorkerPool::start(PoolConfig::new(config.workers))?;
        let metrics = Metrics::new()?;
        let background = CancelToken::new();
        let intake = CancelToken::new();
        let shutdown_requested = CancelToken::new();

        let monitor = ProcessMonitor::new(metrics.clone())
            .run(&config.metrics_addr(), background.clone())
            .context("start process monitor")?;

        let sessions = SessionManager::new(SessionSettings {
            idle_timeout: config.session.idle_timeout,
            poll_interval: config.session.poll_interval,
        });
        let stream = match config.stream_addr() {
            Some(addr) => {
                load_session_workers(&config, &factory, &sessions)?;
                Some(
                    StreamListener::new(addr, sessions.clone())
                        .spawn(intake.clone())
                        .context("start stream listener")?,
                )
            }
            None => None,
        };

        let heartbeat = if config.registry.enabled {
            Some(start_heartbeat(&config, background.clone())?)
        } else {
            log::info!("registry disabled, skipping registration");
            None
        };

        let api = ApiServer::new(
            ApiConfig {
                addr: config.api_addr(),
            },
            ApiState {
                registry: registry.clone(),
                queue: pool.queue().clone(),
                metrics: metrics.clone(),
                shutdown_requested: shutdown_requested.clone(),
                task_timeout: config.task_timeout,
                models_dir: config.models_dir.clone(),
            },
        )
        .spawn()
        .context("start api server")?;

        Ok(ServerHandle {
            config,
            registry,
            sessions,
            metrics,
            pool,
            api,
            stream,
            monitor,
            heartbeat,
            background,
            intake,
            shutdown_requested,
        })
    }
}

fn load_session_workers(
    config: &DetectdConfig,
    factory: &SharedFactory,
    sessions: &SessionManager,
) -> Result<()> {
    let model = config
        .stream_model
        .as_ref()
        .ok_or_else(|| anyhow!("stream_port is set but stream_model is missing"))?;
    for _ in 0..model.workers {
        let detector = Detector::new(factory.as_ref())?;
        detector.load_model(&model.params)?;
        let id = sessions.add_worker(Arc::new(detector));
        log::info!("session worker {} loaded {}", id, model.params.model_path);
    }
    Ok(())
}

fn start_heartbeat(config: &DetectdConfig, cancel: CancelToken) -> Result<JoinHandle<usize>> {
    let ip: IpAddr = match &config.advertise_ip {
        Some(ip) => ip.parse()?,
        None => outbound_ip().context("discover outbound ip for registration")?,
    };
    let client = HeartbeatClient::new(&HeartbeatConfig {
        registry_addr: config.registry.addr(),
        interval: config.registry.interval,
        timeout: config.registry.timeout,
    });
    log::info!(
        "registering {}:{} with {} as {}",
        ip,
        config.api_port,
        config.registry.addr(),
        client.instance_id()
    );
    client.spawn(
        Announcement {
            ip,
            port: config.api_port,
            class: config.instance_class,
        },
        cancel,
    )
}

pub struct ServerHandle {
    config: DetectdConfig,
    registry: Arc<DetectorRegistry>,
    sessions: SessionManager,
    metrics: Metrics,
    pool: WorkerPool,
    api: ApiHandle,
    stream: Option<StreamHandle>,
    monitor: MonitorHandle,
    heartbeat: Option<JoinHandle<usize>>,
    background: CancelToken,
    intake: CancelToken,
    shutdown_requested: CancelToken,
}

impl ServerHandle {
    pub fn api_addr(&self) -> SocketAddr {
        self.api.addr
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        self.monitor.addr
    }

    pub fn stream_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().map(|s| s.addr)
    }

    pub fn registry(&self) -> &Arc<DetectorRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Token fired by `POST /api/shutdown`. Firing it directly has the same effect.
    pub fn shutdown_signal(&self) -> CancelToken {
        self.shutdown_requested.clone()
    }

    pub fn shutdown(self) -> Result<()> {
        log::info!("shutting down: stopping intake");
        self.intake.cancel();
        self.api.stop()?;
        if let Some(stream) = self.stream {
            stream.join()?;
        }
        let released = self.sessions.release_all();
        if released > 0 {
            log::info!("released {} open sessions", released);
        }

        let drained = self.registry.drain();
        log::info!("destroyed {} detectors", drained);

        self.pool.queue().close();
        let (done_tx, done_rx) = bounded::<()>(1);
        let pool = self.pool;
        let joiner = thread::Builder::new()
            .name("pool-shutdown".to_string())
            .spawn(move || {
                pool.shutdown();
                let _ = done_tx.send(());
            })?;
        if done_rx.recv_timeout(self.config.shutdown_grace).is_ok() {
            let _ = joiner.join();
        } else {
            log::warn!(
                "workers still busy after {:?} grace period; not waiting",
                self.config.shutdown_grace
            );
        }

        self.background.cancel();
        self.monitor.join()?;
        if let Some(heartbeat) = self.heartbeat {
            heartbeat
                .join()
                .map_err(|_| anyhow!("heartbeat thread panicked"))?;
        }
        log::info!("shutdown complete");
        Ok(())
    }
}
