use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::RngCore;
use serde::Serialize;

use super::backend::SharedFactory;
use super::detector::{Detector, DetectorState, LoadParams};
use crate::error::{DispatchError, Result};

/// Execution mode requested when a detector is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EngineType {
    SingleThread,
    MultiThread,
}

impl EngineType {
    pub const SINGLE_THREAD_CODE: i32 = 0x1001;
    pub const MULTI_THREAD_CODE: i32 = 0x1002;

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            Self::SINGLE_THREAD_CODE => Ok(EngineType::SingleThread),
            Self::MULTI_THREAD_CODE => Ok(EngineType::MultiThread),
            other => Err(DispatchError::validation(format!(
                "invalid engine type {:#x}",
                other
            ))),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            EngineType::SingleThread => Self::SINGLE_THREAD_CODE,
            EngineType::MultiThread => Self::MULTI_THREAD_CODE,
        }
    }
}

/// A registered detector together with the metadata supplied at creation.
#[derive(Clone)]
pub struct DetectorEntry {
    pub id: String,
    pub description: String,
    pub engine_type: EngineType,
    pub detector: Arc<Detector>,
}

/// Read-only view of one registry entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorInfo {
    pub id: String,
    pub description: String,
    pub engine_type: i32,
    pub model_path: String,
    pub names: Vec<String>,
    pub conf: f32,
    pub iou: f32,
    #[serde(rename = "useGPU")]
    pub use_gpu: bool,
    pub state: DetectorState,
}

impl DetectorEntry {
    pub fn info(&self) -> DetectorInfo {
        let cfg = self.detector.check_config();
        DetectorInfo {
            id: self.id.clone(),
            description: self.description.clone(),
            engine_type: self.engine_type.code(),
            model_path: cfg.model_path,
            names: cfg.names,
            conf: cfg.conf,
            iou: cfg.iou,
            use_gpu: cfg.use_gpu,
            state: self.detector.state(),
        }
    }
}

/// Thread-safe registry of detector records keyed by opaque identifiers.
///
/// Lookups and snapshots take the read lock, inserts and removals the write lock.
/// No lock is held while a detector loads a model, runs, or is destroyed.
pub struct DetectorRegistry {
    entries: RwLock<HashMap<String, DetectorEntry>>,
    factory: SharedFactory,
}

impl DetectorRegistry {
    pub fn new(factory: SharedFactory) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Allocate a backend, load the model, then publish the detector under a fresh id.
    ///
    /// Nothing is inserted when any step fails.
    pub fn create(
        &self,
        description: &str,
        engine_type: EngineType,
        params: &LoadParams,
    ) -> Result<String> {
        if engine_type == EngineType::MultiThread {
            return Err(DispatchError::validation(
                "multi-threaded engines are not supported",
            ));
        }
        params.validate()?;

        let detector = Detector::new(self.factory.as_ref())?;
        if let Err(err) = detector.load_model(params) {
            detector.destroy();
            return Err(err);
        }

        let description = if description.trim().is_empty() {
            "Default Detector".to_string()
        } else {
            description.to_string()
        };
        let mut entries = self.write();
        let id = loop {
            let candidate = new_id();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(
            id.clone(),
            DetectorEntry {
                id: id.clone(),
                description: description.clone(),
                engine_type,
                detector: Arc::new(detector),
            },
        );
        drop(entries);
        log::info!(
            "detector '{}' added with id {} (model={})",
            description,
            id,
            params.model_path
        );
        Ok(id)
    }

    pub fn lookup(&self, id: &str) -> Option<DetectorEntry> {
        self.read().get(id).cloned()
    }

    /// Remove an entry without touching its detector.
    pub fn delete(&self, id: &str) -> Result<DetectorEntry> {
        self.write()
            .remove(id)
            .ok_or_else(|| DispatchError::detector_not_found(id))
    }

    /// Destroy the detector (waiting for an in-flight detection) and remove the entry.
    pub fn destroy(&self, id: &str) -> Result<()> {
        let entry = self
            .lookup(id)
            .ok_or_else(|| DispatchError::detector_not_found(id))?;
        entry.detector.destroy();
        // a concurrent destroy may have removed it already
        let _ = self.write().remove(id);
        log::info!("destroyed detector {}", id);
        Ok(())
    }

    /// Copy the registry under a briefly held read lock, then build views outside it.
    pub fn snapshot(&self) -> Vec<DetectorInfo> {
        let entries: Vec<DetectorEntry> = self.read().values().cloned().collect();
        let mut infos: Vec<DetectorInfo> = entries.iter().map(DetectorEntry::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Remove every entry and destroy its detector. Used during shutdown.
    pub fn drain(&self) -> usize {
        let entries = std::mem::take(&mut *self.write());
        let count = entries.len();
        for (id, entry) in entries {
            entry.detector.destroy();
            log::info!("destroyed detector {} during drain", id);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DetectorEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DetectorEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Random 128-bit identifier rendered in the 8-4-4-4-12 hex layout.
pub(crate) fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
