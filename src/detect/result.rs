use std::collections::BTreeMap;

use serde::Serialize;

use super::backend::RawDetection;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Axis-aligned box expressed by its four corners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Quad {
    pub lt: Position,
    pub rt: Position,
    pub rb: Position,
    pub lb: Position,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionBox {
    pub confidence: f32,
    #[serde(rename = "box")]
    pub quad: Quad,
    pub center: Position,
}

/// Detections grouped by class name. Every configured class is present as a key.
pub type DetectionMap = BTreeMap<String, Vec<DetectionBox>>;

impl From<&RawDetection> for DetectionBox {
    fn from(raw: &RawDetection) -> Self {
        let [x1, y1, x2, y2] = raw.bbox;
        let quad = Quad {
            lt: Position { x: x1, y: y1 },
            rt: Position { x: x2, y: y1 },
            rb: Position { x: x2, y: y2 },
            lb: Position { x: x1, y: y2 },
        };
        Self {
            confidence: raw.score,
            quad,
            center: Position {
                x: (x1 + x2) / 2.0,
                y: (y1 + y2) / 2.0,
            },
        }
    }
}

/// Group raw detections by class name, dropping class ids outside `names`.
pub fn group_by_class(names: &[String], raw: &[RawDetection]) -> DetectionMap {
    let mut map: DetectionMap = names.iter().map(|n| (n.clone(), Vec::new())).collect();
    for det in raw {
        match names.get(det.class_id) {
            Some(name) => {
                if let Some(entries) = map.get_mut(name) {
                    entries.push(DetectionBox::from(det));
                }
            }
            None => log::warn!(
                "dropping detection with class id {} (only {} classes configured)",
                det.class_id,
                names.len()
            ),
        }
    }
    map
}
