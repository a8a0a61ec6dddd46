use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use detect_dispatch::detect::{
    stub_factory, DetectionBackend, DetectorRegistry, EngineType, ModelSpec, RawDetection,
    SharedFactory,
};
use detect_dispatch::pool::{PoolConfig, WorkerPool};
use detect_dispatch::{
    DetectorState, DispatchError, FramePayload, ImageData, LoadParams, NameSource, StateError,
};

fn params() -> LoadParams {
    LoadParams {
        model_path: "models/yolov8n.onnx".to_string(),
        names: NameSource::from_list(["person", "car"]),
        conf: 0.5,
        iou: 0.5,
        use_gpu: false,
    }
}

fn png_frame(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7) as u8, (y * 11) as u8, ((x + y) * 3) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
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

#[test]
fn create_detect_destroy_through_the_pool() -> Result<()> {
    let registry = DetectorRegistry::new(stub_factory());
    let pool = WorkerPool::start(PoolConfig::new(2))?;

    let id = registry.create("lobby camera", EngineType::SingleThread, &params())?;
    let entry = registry.lookup(&id).expect("entry");
    assert_eq!(entry.detector.state(), DetectorState::Idle);
    assert_eq!(entry.info().names, vec!["person", "car"]);

    let handle = pool.submit(
        entry.detector.clone(),
        FramePayload::Encoded(png_frame(64, 48)),
    )?;
    let detections = handle.wait_timeout(Duration::from_secs(5))?;
    assert_eq!(
        detections.keys().collect::<Vec<_>>(),
        vec!["car", "person"]
    );
    for boxes in detections.values() {
        for det in boxes {
            assert!(det.confidence >= 0.5);
            assert!(det.quad.rb.x <= 64.0 && det.quad.rb.y <= 48.0);
        }
    }

    // same pixels, same answer
    let raw = ImageData::decode(&png_frame(64, 48))?;
    let again = pool
        .submit(entry.detector.clone(), FramePayload::Raw(raw))?
        .wait_timeout(Duration::from_secs(5))?;
    assert_eq!(again, detections);
    assert_eq!(entry.detector.state(), DetectorState::Idle);

    registry.destroy(&id)?;
    assert!(registry.lookup(&id).is_none());
    assert_eq!(entry.detector.state(), DetectorState::Unregistered);

    let err = pool
        .submit(entry.detector.clone(), FramePayload::Encoded(png_frame(8, 8)))?
        .wait_timeout(Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, DispatchError::State(StateError::NotRegistered)));

    assert!(matches!(
        registry.destroy(&id),
        Err(DispatchError::NotFound { .. })
    ));

    pool.shutdown();
    Ok(())
}

#[test]
fn registry_rejects_bad_requests_without_inserting() -> Result<()> {
    let registry = DetectorRegistry::new(stub_factory());

    assert!(matches!(
        EngineType::from_code(0x1003),
        Err(DispatchError::Validation(_))
    ));
    assert!(matches!(
        registry.create("", EngineType::MultiThread, &params()),
        Err(DispatchError::Validation(_))
    ));

    let mut bad = params();
    bad.iou = -0.1;
    assert!(matches!(
        registry.create("", EngineType::SingleThread, &bad),
        Err(DispatchError::Validation(_))
    ));

    let mut no_names = params();
    no_names.names = NameSource::from_list(Vec::<String>::new());
    assert!(registry
        .create("", EngineType::SingleThread, &no_names)
        .is_err());

    assert!(registry.is_empty());

    let id = registry.create("  ", EngineType::SingleThread, &params())?;
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, id);
    assert_eq!(snapshot[0].description, "Default Detector");
    assert_eq!(snapshot[0].engine_type, 0x1001);

    assert_eq!(registry.drain(), 1);
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn class_names_can_come_from_a_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    std::io::Write::write_all(&mut file, b"person\r\nbicycle\n\ncar\n")?;

    let registry = DetectorRegistry::new(stub_factory());
    let mut from_file = params();
    from_file.names = NameSource::File(file.path().to_path_buf());
    let id = registry.create("", EngineType::SingleThread, &from_file)?;

    let info = registry.lookup(&id).expect("entry").info();
    assert_eq!(info.names, vec!["person", "bicycle", "car"]);
    Ok(())
}

/// Panics on frames exactly 13 pixels wide, otherwise reports nothing.
struct FragileBackend;

impl DetectionBackend for FragileBackend {
    fn name(&self) -> &'static str {
        "fragile"
    }

    fn load_model(&mut self, _spec: &ModelSpec) -> Result<()> {
        Ok(())
    }

    fn detect(&mut self, image: &ImageData) -> Result<Vec<RawDetection>> {
        if image.width == 13 {
            panic!("native inference crashed");
        }
        Ok(Vec::new())
    }
}

#[test]
fn crashed_worker_loses_only_its_task() -> Result<()> {
    let factory: SharedFactory =
        Arc::new(|| -> Result<Box<dyn DetectionBackend>> { Ok(Box::new(FragileBackend)) });
    let registry = DetectorRegistry::new(factory);
    let pool = WorkerPool::start(PoolConfig {
        workers: 2,
        respawn_delay: Duration::from_millis(50),
    })?;

    let fragile = registry.create("fragile", EngineType::SingleThread, &params())?;
    let healthy = registry.create("healthy", EngineType::SingleThread, &params())?;
    let fragile = registry.lookup(&fragile).expect("fragile entry");
    let healthy = registry.lookup(&healthy).expect("healthy entry");

    let crash = ImageData::new(vec![0; 13 * 2 * 3], 13, 2, 3)?;
    let err = pool
        .submit(fragile.detector.clone(), FramePayload::Raw(crash))?
        .wait_timeout(Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, DispatchError::TaskLost));
    assert_eq!(fragile.detector.state(), DetectorState::Error);

    assert!(wait_until(Duration::from_secs(5), || pool.restarts() == 1
        && pool.active_workers() == 2));

    let detections = pool
        .submit(
            healthy.detector.clone(),
            FramePayload::Encoded(png_frame(16, 16)),
        )?
        .wait_timeout(Duration::from_secs(5))?;
    assert!(detections.values().all(Vec::is_empty));

    // a faulted record refuses work until destroyed
    let err = pool
        .submit(
            fragile.detector.clone(),
            FramePayload::Encoded(png_frame(16, 16)),
        )?
        .wait_timeout(Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, DispatchError::State(StateError::Faulted)));
    registry.destroy(&fragile.id)?;
    assert_eq!(fragile.detector.state(), DetectorState::Unregistered);

    pool.shutdown();
    Ok(())
}

#[test]
fn delete_unlists_without_destroying_and_overrides_reach_the_backend() -> Result<()> {
    let registry = DetectorRegistry::new(stub_factory());
    let id = registry.create("", EngineType::SingleThread, &params())?;

    let entry = registry.delete(&id)?;
    assert!(registry.lookup(&id).is_none());
    assert_eq!(entry.detector.state(), DetectorState::Idle);
    assert!(matches!(
        registry.delete(&id),
        Err(DispatchError::NotFound { .. })
    ));

    entry.detector.set_input_size(320)?;
    assert!(matches!(
        entry.detector.set_blob_name("images", "output0"),
        Err(DispatchError::NativeFailure(_))
    ));

    entry.detector.destroy();
    assert!(matches!(
        entry.detector.set_input_size(320),
        Err(DispatchError::State(StateError::NotRegistered))
    ));
    Ok(())
}
