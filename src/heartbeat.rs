//! Liveness announcements to an external instance registry.
//!
//! `POST http://{registry}/api/register` with `{id, ip, port, instanceClass, timestamp}`,
//! once immediately and then every interval until cancelled. Failures are logged and
//! the next beat goes ahead as scheduled.

use std::net::{IpAddr, UdpSocket};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accelerator class announced to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceClass {
    Dml,
    Cpu,
    Cuda,
    Rocm,
}

impl InstanceClass {
    pub fn code(self) -> i32 {
        match self {
            InstanceClass::Dml => 0x2001,
            InstanceClass::Cpu => 0x2002,
            InstanceClass::Cuda => 0x2003,
            InstanceClass::Rocm => 0x2004,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dml" => Some(InstanceClass::Dml),
            "cpu" => Some(InstanceClass::Cpu),
            "cuda" => Some(InstanceClass::Cuda),
            "rocm" => Some(InstanceClass::Rocm),
            _ => None,
        }
    }

    /// Parse a configured class, falling back to `Cpu` with a warning.
    pub fn from_config(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|| {
            log::warn!("invalid instance class '{}', defaulting to Cpu", value);
            InstanceClass::Cpu
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationMessage {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub instance_class: i32,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
    pub success: bool,
}

#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// `host:port` of the registry server.
    pub registry_addr: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl HeartbeatConfig {
    pub fn new(registry_addr: impl Into<String>) -> Self {
        Self {
            registry_addr: registry_addr.into(),
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// What this instance announces about itself.
#[derive(Clone, Debug)]
pub struct Announcement {
    pub ip: IpAddr,
    pub port: u16,
    pub class: InstanceClass,
}

pub struct HeartbeatClient {
    agent: ureq::Agent,
    url: String,
    instance_id: String,
    interval: Duration,
}

impl HeartbeatClient {
    pub fn new(config: &HeartbeatConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            agent,
            url: format!("http://{}/api/register", config.registry_addr),
            instance_id: crate::detect::new_id(),
            interval: config.interval,
        }
    }

    /// Identifier sent with every beat; stable for the life of the client.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn send_once(&self, announcement: &Announcement) -> Result<RegisterResponse> {
        let message = RegistrationMessage {
            id: self.instance_id.clone(),
            ip: announcement.ip.to_string(),
            port: announcement.port,
            instance_class: announcement.class.code(),
            timestamp: unix_now(),
        };
        let body = serde_json::to_string(&message)?;
        let response = match self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(anyhow!("registry returned {}: {}", code, body));
            }
            Err(err) => return Err(err).with_context(|| format!("post {}", self.url)),
        };
        let text = response.into_string().context("read registry response")?;
        serde_json::from_str(&text).context("decode registry response")
    }

    /// Beat immediately, then every interval until `cancel` fires. Returns the number of
    /// beats attempted.
    pub fn run(&self, announcement: &Announcement, cancel: &CancelToken) -> usize {
        let mut beats = 0;
        loop {
            self.beat(announcement);
            beats += 1;
            if cancel.wait(self.interval) {
                break;
            }
        }
        log::info!("heartbeat to {} stopped after {} beats", self.url, beats);
        beats
    }

    pub fn spawn(self, announcement: Announcement, cancel: CancelToken) -> Result<JoinHandle<usize>> {
        let handle = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || self.run(&announcement, &cancel))?;
        Ok(handle)
    }

    fn beat(&self, announcement: &Announcement) {
        match catch_unwind(AssertUnwindSafe(|| self.send_once(announcement))) {
            Ok(Ok(response)) if response.success => {
                log::debug!("registered with {} as {}", self.url, response.id);
            }
            Ok(Ok(response)) => {
                log::warn!("registry refused registration of {}", response.id);
            }
            Ok(Err(err)) => log::error!("heartbeat failed: {:#}", err),
            Err(_) => log::error!("heartbeat send panicked; continuing"),
        }
    }
}

/// Address of the interface that routes outward. No packet is sent.
pub fn outbound_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("bind route socket")?;
    socket
        .connect("8.8.8.8:80")
        .context("no outbound route")?;
    Ok(socket.local_addr()?.ip())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
