//! Hand localization: palm detection, landmark detection on the palm region and cropping
//! of the hand.
//!
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::{
    nn::{letterbox, load_optimized, to_unit_tensor, NnModel},
    palm::PalmDetector,
};

/// Number of landmarks predicted per hand.
pub const NUM_LANDMARKS: usize = 21;

/// Padding in pixels added around the landmark bounding box.
pub const CROP_PADDING: i64 = 20;

/// Input resolution of the hand landmark network.
const LANDMARK_INPUT_SIZE: u32 = 224;

/// Landmarks of one detected hand.
#[derive(Clone, Debug, PartialEq)]
pub struct HandLandmarks {
    /// Landmark positions normalized to the searched image, `(0, 0)` top-left, `(1, 1)`
    /// bottom-right.
    pub points: Vec<[f32; 2]>,
    /// Hand presence score of the detection.
    pub presence: f32,
}

/// Detector for the landmarks of a single hand.
pub trait LandmarkDetector: Send + Sync {
    /// Detect the landmarks of the first hand in `frame`, or `None` if there is no hand.
    fn detect(&self, frame: &RgbImage) -> Result<Option<HandLandmarks>>;
}

/// Hand landmark network (MediaPipe layout) exported to ONNX.
///
/// Expects an image roughly centered on a single hand, see [`PalmHandDetector`]. Outputs
/// in order: screen landmarks `[1, 63]` as x/y/z triples in input pixels, hand presence
/// `[1, 1]`, handedness `[1, 1]`. The image is letterboxed into the square network
/// input, so coordinates are mapped back through the letterbox placement.
pub struct OnnxHandLandmarker {
    model: NnModel,
    min_presence: f32,
}

impl OnnxHandLandmarker {
    pub fn new(model_path: impl AsRef<Path>, min_presence: f32) -> Result<Self> {
        let size = LANDMARK_INPUT_SIZE as usize;
        let model_path = model_path.as_ref();
        let model = load_optimized(model_path, [1, size, size, 3])
            .with_context(|| format!("failed to load hand landmarker {}", model_path.display()))?
            .into_runnable()?;
        log::info!("Loaded hand landmarker {}", model_path.display());

        Ok(Self {
            model,
            min_presence,
        })
    }
}

impl LandmarkDetector for OnnxHandLandmarker {
    fn detect(&self, frame: &RgbImage) -> Result<Option<HandLandmarks>> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Ok(None);
        }

        let (input, placement) = letterbox(frame, LANDMARK_INPUT_SIZE);
        let input: Tensor = to_unit_tensor(&input).into();
        let outputs = self.model.run(tvec!(input.into()))?;
        if outputs.len() < 2 {
            bail!("hand landmarker returned {} outputs", outputs.len());
        }

        let presence = outputs[1]
            .to_array_view::<f32>()?
            .iter()
            .copied()
            .next()
            .unwrap_or(0.0);
        if presence < self.min_presence {
            log::debug!("Hand presence {presence:.2} below threshold");
            return Ok(None);
        }

        let coords = outputs[0].to_array_view::<f32>()?;
        if coords.len() != NUM_LANDMARKS * 3 {
            bail!("unexpected landmark output shape {:?}", coords.shape());
        }
        let coords: Vec<f32> = coords.iter().copied().collect();
        let points = coords
            .chunks(3)
            .map(|xyz| {
                let (x, y) = placement.unmap(xyz[0], xyz[1]);
                [x / width as f32, y / height as f32]
            })
            .collect();

        Ok(Some(HandLandmarks { points, presence }))
    }
}

/// Two-stage hand detection: a palm detector finds the hand, the landmark detector runs on
/// a square crop around the palm.
pub struct PalmHandDetector {
    palm: Box<dyn PalmDetector>,
    landmarker: Box<dyn LandmarkDetector>,
}

impl PalmHandDetector {
    pub fn new(palm: Box<dyn PalmDetector>, landmarker: Box<dyn LandmarkDetector>) -> Self {
        Self { palm, landmarker }
    }
}

impl LandmarkDetector for PalmHandDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Option<HandLandmarks>> {
        let palm = match self.palm.detect(frame)? {
            Some(palm) => palm,
            None => return Ok(None),
        };
        let region = palm.hand_region();
        if region.is_empty() {
            return Ok(None);
        }
        log::debug!("Palm score {:.2}, hand region {region:?}", palm.score);

        let crop = crop_padded(frame, region);
        let landmarks = match self.landmarker.detect(&crop)? {
            Some(landmarks) => landmarks,
            None => return Ok(None),
        };

        // Crop-normalized to frame-normalized coordinates
        let (width, height) = frame.dimensions();
        let points = landmarks
            .points
            .iter()
            .map(|&[x, y]| {
                [
                    (region.x_min as f32 + x * region.width() as f32) / width as f32,
                    (region.y_min as f32 + y * region.height() as f32) / height as f32,
                ]
            })
            .collect();

        Ok(Some(HandLandmarks {
            points,
            presence: landmarks.presence,
        }))
    }
}

/// Copy `region` out of `frame`, filling the parts outside the frame with black.
pub fn crop_padded(frame: &RgbImage, region: CropRegion) -> RgbImage {
    let mut crop = RgbImage::new(region.width(), region.height());
    image::imageops::overlay(&mut crop, frame, -region.x_min, -region.y_min);
    crop
}

/// Pixel region of a frame, `[x_min, x_max) x [y_min, y_max)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CropRegion {
    pub x_min: i64,
    pub y_min: i64,
    pub x_max: i64,
    pub y_max: i64,
}

impl CropRegion {
    /// Bounding box of normalized landmark points scaled to a `width` x `height` frame
    /// and grown by `padding` pixels on every side.
    ///
    /// Coordinates are truncated toward zero before padding.
    pub fn around(points: &[[f32; 2]], width: u32, height: u32, padding: i64) -> Option<Self> {
        let xs = points.iter().map(|p| p[0] * width as f32);
        let ys = points.iter().map(|p| p[1] * height as f32);

        let x_min = xs.clone().reduce(f32::min)?;
        let x_max = xs.reduce(f32::max)?;
        let y_min = ys.clone().reduce(f32::min)?;
        let y_max = ys.reduce(f32::max)?;

        Some(Self {
            x_min: x_min as i64 - padding,
            y_min: y_min as i64 - padding,
            x_max: x_max as i64 + padding,
            y_max: y_max as i64 + padding,
        })
    }

    /// Clamp the region to the bounds of a `width` x `height` frame.
    pub fn clamp(self, width: u32, height: u32) -> Self {
        let (width, height) = (width as i64, height as i64);
        Self {
            x_min: self.x_min.max(0),
            y_min: self.y_min.max(0),
            x_max: self.x_max.min(width),
            y_max: self.y_max.min(height),
        }
    }

    pub fn width(&self) -> u32 {
        (self.x_max - self.x_min).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y_max - self.y_min).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Finds the hand in a frame and crops it out.
pub struct HandLocalizer {
    detector: Box<dyn LandmarkDetector>,
    padding: i64,
}

impl HandLocalizer {
    pub fn new(detector: Box<dyn LandmarkDetector>) -> Self {
        Self {
            detector,
            padding: CROP_PADDING,
        }
    }

    /// Region of the hand in `frame`, clamped to the frame bounds.
    pub fn hand_region(&self, frame: &RgbImage) -> Result<Option<CropRegion>> {
        let (width, height) = frame.dimensions();
        let region = self.detector.detect(frame)?.and_then(|landmarks| {
            CropRegion::around(&landmarks.points, width, height, self.padding)
        });

        Ok(region
            .map(|region| region.clamp(width, height))
            .filter(|region| !region.is_empty()))
    }

    /// Cropped hand sub-image, or `None` if no hand was found.
    pub fn locate(&self, frame: &RgbImage) -> Result<Option<RgbImage>> {
        Ok(self.hand_region(frame)?.map(|region| {
            image::imageops::crop_imm(
                frame,
                region.x_min as u32,
                region.y_min as u32,
                region.width(),
                region.height(),
            )
            .to_image()
        }))
    }
}
