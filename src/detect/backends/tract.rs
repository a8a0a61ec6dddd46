#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionBackend, ModelSpec, RawDetection};
use crate::frame::ImageData;

const DEFAULT_INPUT_SIZE: u32 = 640;
const MAX_DETECTIONS: usize = 300;

type Plan = RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>;

struct Loaded {
    plan: Plan,
    model_path: PathBuf,
    /// Square input size the plan was built for.
    input_size: u32,
    conf: f32,
    iou: f32,
    class_count: usize,
}

/// Tract-based YOLOv8 backend for ONNX models.
///
/// Expects the exported detection head `[1, 4 + classes, anchors]` with centre-size
/// boxes in network pixels. Frames are stretched to the square input size and boxes are
/// scaled back to the source image. Changing the input size after a model is loaded
/// rebuilds the plan from the same model file.
pub struct TractBackend {
    input_size: u32,
    loaded: Option<Loaded>,
}

impl Default for TractBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TractBackend {
    pub fn new() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            loaded: None,
        }
    }

    fn build_plan(model_path: &Path, input_size: u32) -> Result<Plan> {
        let size = input_size as usize;
        tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")
    }

    fn build_input(image: &ImageData, input_size: u32) -> Result<Tensor> {
        let rgb = to_rgb(image)?;
        let size = input_size;
        let resized = imageops::resize(&rgb, size, size, FilterType::Triangle);
        let size = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }
}

impl DetectionBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn load_model(&mut self, spec: &ModelSpec) -> Result<()> {
        let path = Path::new(&spec.model_path);
        let is_onnx = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("onnx"))
            .unwrap_or(false);
        if !is_onnx {
            return Err(anyhow!(
                "model path {} is not an .onnx file",
                path.display()
            ));
        }
        if spec.use_gpu {
            log::warn!("tract backend runs on CPU; ignoring useGPU");
        }
        let plan = Self::build_plan(path, self.input_size)?;
        self.loaded = Some(Loaded {
            plan,
            model_path: path.to_path_buf(),
            input_size: self.input_size,
            conf: spec.conf,
            iou: spec.iou,
            class_count: spec.class_count,
        });
        Ok(())
    }

    fn detect(&mut self, image: &ImageData) -> Result<Vec<RawDetection>> {
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| anyhow!("tract backend has no model loaded"))?;
        let input = Self::build_input(image, loaded.input_size)?;
        let outputs = loaded
            .plan
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        let view = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|_| anyhow!("unexpected output shape {:?}", shape))?;
        if shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        if classes < loaded.class_count {
            log::warn!(
                "model predicts {} classes but {} names are configured",
                classes,
                loaded.class_count
            );
        }

        let sx = image.width as f32 / loaded.input_size as f32;
        let sy = image.height as f32 / loaded.input_size as f32;
        let mut candidates = Vec::new();
        for anchor in 0..shape[2] {
            let mut best = (0usize, f32::NEG_INFINITY);
            for class in 0..classes {
                let score = view[[0, 4 + class, anchor]];
                if score > best.1 {
                    best = (class, score);
                }
            }
            if best.1 < loaded.conf {
                continue;
            }
            let cx = view[[0, 0, anchor]];
            let cy = view[[0, 1, anchor]];
            let w = view[[0, 2, anchor]];
            let h = view[[0, 3, anchor]];
            candidates.push(RawDetection {
                bbox: [
                    ((cx - w / 2.0) * sx).max(0.0),
                    ((cy - h / 2.0) * sy).max(0.0),
                    ((cx + w / 2.0) * sx).min(image.width as f32),
                    ((cy + h / 2.0) * sy).min(image.height as f32),
                ],
                score: best.1,
                class_id: best.0,
            });
        }
        Ok(non_max_suppression(candidates, loaded.iou))
    }

    fn destroy(&mut self) {
        self.loaded = None;
    }

    fn set_input_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size % 32 != 0 {
            return Err(anyhow!("input size must be a positive multiple of 32"));
        }
        if let Some(loaded) = self.loaded.as_mut() {
            if loaded.input_size != size {
                // the old plan stays in place if the rebuild fails
                loaded.plan = Self::build_plan(&loaded.model_path, size).with_context(|| {
                    format!("failed to rebuild plan for input size {}", size)
                })?;
                loaded.input_size = size;
                log::info!(
                    "rebuilt {} for input size {}",
                    loaded.model_path.display(),
                    size
                );
            }
        }
        self.input_size = size;
        Ok(())
    }
}

fn to_rgb(image: &ImageData) -> Result<image::RgbImage> {
    let pixels: Vec<u8> = match image.channels {
        3 => image.bytes.clone(),
        1 => image.bytes.iter().flat_map(|&v| [v, v, v]).collect(),
        2 | 4 => image
            .bytes
            .chunks_exact(image.channels as usize)
            .flat_map(|px| {
                if px.len() == 4 {
                    [px[0], px[1], px[2]]
                } else {
                    [px[0], px[0], px[0]]
                }
            })
            .collect(),
        other => return Err(anyhow!("unsupported channel count {}", other)),
    };
    image::RgbImage::from_raw(image.width, image.height, pixels)
        .ok_or_else(|| anyhow!("pixel buffer does not match image dimensions"))
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    inter / (area_a + area_b - inter + 1e-6)
}

/// Greedy per-class NMS, highest score first.
fn non_max_suppression(mut dets: Vec<RawDetection>, iou_thr: f32) -> Vec<RawDetection> {
    dets.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<RawDetection> = Vec::with_capacity(dets.len());
    'outer: for det in dets {
        for kept in &keep {
            if kept.class_id == det.class_id && iou(&kept.bbox, &det.bbox) > iou_thr {
                continue 'outer;
            }
        }
        keep.push(det);
        if keep.len() >= MAX_DETECTIONS {
            break;
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], score: f32, class_id: usize) -> RawDetection {
        RawDetection {
            bbox,
            score,
            class_id,
        }
    }

    #[test]
    fn nms_suppresses_overlaps_within_a_class_only() {
        let kept = non_max_suppression(
            vec![
                det([0.0, 0.0, 10.0, 10.0], 0.6, 0),
                det([1.0, 1.0, 10.0, 10.0], 0.9, 0),
                det([1.0, 1.0, 10.0, 10.0], 0.8, 1),
                det([50.0, 50.0, 60.0, 60.0], 0.5, 0),
            ],
            0.5,
        );
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].score, 0.9);
        assert!(kept.iter().any(|d| d.class_id == 1));
    }

    #[test]
    fn rejects_non_onnx_models() {
        let mut backend = TractBackend::new();
        let spec = ModelSpec {
            model_path: "models/yolo.engine".to_string(),
            conf: 0.5,
            iou: 0.5,
            use_gpu: false,
            class_count: 80,
        };
        assert!(backend.load_model(&spec).is_err());
        assert!(backend.set_input_size(100).is_err());
        assert!(backend.set_input_size(320).is_ok());
        assert!(backend.set_blob_name("images", "output0").is_err());
    }

    fn identity_plan(size: usize) -> Plan {
        let mut model = TypedModel::default();
        let input = model
            .add_source(
                "images",
                TypedFact::dt_shape(f32::datum_type(), [1, 3, size, size]),
            )
            .unwrap();
        model.set_output_outlets(&[input]).unwrap();
        model.into_runnable().unwrap()
    }

    fn loaded_backend(model_path: PathBuf) -> TractBackend {
        TractBackend {
            input_size: 64,
            loaded: Some(Loaded {
                plan: identity_plan(64),
                model_path,
                input_size: 64,
                conf: 0.5,
                iou: 0.5,
                class_count: 2,
            }),
        }
    }

    #[test]
    fn input_size_change_rebuilds_from_the_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = loaded_backend(dir.path().join("gone.onnx"));

        // same size needs no rebuild
        assert!(backend.set_input_size(64).is_ok());

        // the model file is missing, so the rebuild fails and nothing changes
        let err = backend.set_input_size(320).unwrap_err();
        assert!(format!("{:#}", err).contains("input size 320"));
        assert_eq!(backend.input_size, 64);
        let loaded = backend.loaded.as_ref().unwrap();
        assert_eq!(loaded.input_size, 64);

        // the plan still matches its own input size
        let image = ImageData::new(vec![128; 8 * 8 * 3], 8, 8, 3).unwrap();
        let input = TractBackend::build_input(&image, loaded.input_size).unwrap();
        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert!(loaded.plan.run(tvec!(input.into())).is_ok());
    }
}
