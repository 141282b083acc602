//! Palm detection, the first stage of hand localization.
//!
//! The MediaPipe palm detector scores 2016 anchors and regresses a box per anchor. Only the
//! best scoring palm is kept since a single hand is tracked.
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::{
    hand::CropRegion,
    nn::{letterbox, load_optimized, to_unit_tensor, NnModel},
    predictor::argmax,
};

/// Input resolution of the palm detection network.
pub const PALM_INPUT_SIZE: u32 = 192;

/// Number of anchors, and so of box and score rows, of the palm detector.
pub const NUM_ANCHORS: usize = 2016;

/// Values regressed per anchor: box center and size, then 7 keypoints.
const BOX_PARAMS: usize = 18;

/// Growth of every palm box side relative to the palm size to cover fingers and wrist.
pub const PALM_TO_HAND_GROWTH: f32 = 1.5;

/// Anchor center, normalized to the network input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    pub x_center: f32,
    pub y_center: f32,
}

/// Anchors of the palm detector: 2 per cell of a 24x24 grid, then 6 per cell of a 12x12 grid.
pub fn palm_anchors() -> Vec<Anchor> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    for (grid, per_cell) in [(24, 2), (12, 6)] {
        for y in 0..grid {
            for x in 0..grid {
                let anchor = Anchor {
                    x_center: (x as f32 + 0.5) / grid as f32,
                    y_center: (y as f32 + 0.5) / grid as f32,
                };
                anchors.extend(std::iter::repeat(anchor).take(per_cell));
            }
        }
    }

    anchors
}

/// Detected palm. Coordinates are pixels of the image it was found in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PalmBox {
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

impl PalmBox {
    /// Square region expected to contain the whole hand, centered on the palm.
    ///
    /// Not clamped; the region may reach past the frame.
    pub fn hand_region(&self) -> CropRegion {
        let side = self.width.max(self.height) * (1.0 + 2.0 * PALM_TO_HAND_GROWTH);
        let x_min = (self.x_center - side / 2.0).round() as i64;
        let y_min = (self.y_center - side / 2.0).round() as i64;
        let side = side.round() as i64;

        CropRegion {
            x_min,
            y_min,
            x_max: x_min + side,
            y_max: y_min + side,
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decode the best scoring anchor into a box normalized to the network input.
///
/// `boxes` holds [`BOX_PARAMS`] values per anchor in input pixels relative to the anchor
/// center, `scores` holds one logit per anchor. Anchors below `min_score` are ignored.
pub fn decode_best(
    anchors: &[Anchor],
    boxes: &[f32],
    scores: &[f32],
    min_score: f32,
) -> Option<PalmBox> {
    let size = PALM_INPUT_SIZE as f32;
    let scores: Vec<f32> = scores
        .iter()
        .take(anchors.len())
        .map(|logit| sigmoid(*logit))
        .collect();
    let (index, score) = argmax(&scores).filter(|(_, score)| *score >= min_score)?;

    let params = boxes.get(index * BOX_PARAMS..index * BOX_PARAMS + 4)?;
    let anchor = anchors[index];

    Some(PalmBox {
        x_center: params[0] / size + anchor.x_center,
        y_center: params[1] / size + anchor.y_center,
        width: params[2] / size,
        height: params[3] / size,
        score,
    })
}

/// Detector of the most prominent palm in a frame.
pub trait PalmDetector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Option<PalmBox>>;
}

/// Palm detection network (MediaPipe layout) exported to ONNX.
///
/// Outputs: box regressors `[1, 2016, 18]` and score logits `[1, 2016, 1]`.
pub struct OnnxPalmDetector {
    model: NnModel,
    anchors: Vec<Anchor>,
    min_detection_confidence: f32,
}

impl OnnxPalmDetector {
    pub fn new(model_path: impl AsRef<Path>, min_detection_confidence: f32) -> Result<Self> {
        let size = PALM_INPUT_SIZE as usize;
        let model_path = model_path.as_ref();
        let model = load_optimized(model_path, [1, size, size, 3])
            .with_context(|| format!("failed to load palm detector {}", model_path.display()))?
            .into_runnable()?;
        log::info!("Loaded palm detector {}", model_path.display());

        Ok(Self {
            model,
            anchors: palm_anchors(),
            min_detection_confidence,
        })
    }
}

impl PalmDetector for OnnxPalmDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Option<PalmBox>> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Ok(None);
        }

        let (input, placement) = letterbox(frame, PALM_INPUT_SIZE);
        let input: Tensor = to_unit_tensor(&input).into();
        let outputs = self.model.run(tvec!(input.into()))?;

        // Tell the outputs apart by size, exporters disagree on their order
        let mut boxes = None;
        let mut scores = None;
        for output in outputs.iter() {
            let values = output.to_array_view::<f32>()?;
            match values.len() {
                n if n == NUM_ANCHORS * BOX_PARAMS => boxes = Some(values),
                n if n == NUM_ANCHORS => scores = Some(values),
                _ => {}
            }
        }
        let (boxes, scores) = match (boxes, scores) {
            (Some(boxes), Some(scores)) => (boxes, scores),
            _ => bail!("palm detector returned unexpected outputs"),
        };
        let boxes: Vec<f32> = boxes.iter().copied().collect();
        let scores: Vec<f32> = scores.iter().copied().collect();

        let palm = match decode_best(&self.anchors, &boxes, &scores, self.min_detection_confidence)
        {
            Some(palm) => palm,
            None => {
                log::debug!("No palm above detection confidence");
                return Ok(None);
            }
        };

        // Back from normalized input coordinates to frame pixels
        let size = PALM_INPUT_SIZE as f32;
        let (x_center, y_center) = placement.unmap(palm.x_center * size, palm.y_center * size);
        Ok(Some(PalmBox {
            x_center,
            y_center,
            width: palm.width * size / placement.scale,
            height: palm.height * size / placement.scale,
            score: palm.score,
        }))
    }
}
