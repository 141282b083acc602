//! Neural network plumbing on top of `tract-onnx` and the sign classifier.
//!
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

pub type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Input image size of the sign classifier.
pub const CLASSIFIER_INPUT_SIZE: u32 = 224;

/// Image classification function returning a probability distribution over the label set.
pub trait Classifier: Send + Sync {
    /// Classify a `(1, 224, 224, 3)` NHWC tensor with values in `[0, 1]`.
    fn classify(&self, input: tract_ndarray::Array4<f32>) -> Result<Vec<f32>>;

    /// Number of classes the output distribution has, if known up front.
    fn num_classes(&self) -> Option<usize> {
        None
    }
}

/// Convolutional sign classifier exported to ONNX.
pub struct OnnxClassifier {
    model: NnModel,
    num_classes: Option<usize>,
}

impl OnnxClassifier {
    pub fn new(model_path: impl AsRef<Path>) -> Result<Self> {
        let size = CLASSIFIER_INPUT_SIZE as usize;
        let model_path = model_path.as_ref();
        let model = load_optimized(model_path, [1, size, size, 3])
            .with_context(|| format!("failed to load classifier {}", model_path.display()))?;

        // Width of the softmax layer, used to check against the label set
        let num_classes = model
            .output_fact(0)?
            .shape
            .as_concrete()
            .and_then(|shape| shape.last().copied());
        log::info!(
            "Loaded classifier {} with {:?} classes",
            model_path.display(),
            num_classes
        );

        Ok(Self {
            model: model.into_runnable()?,
            num_classes,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&self, input: tract_ndarray::Array4<f32>) -> Result<Vec<f32>> {
        let input: Tensor = input.into();
        let outputs = self.model.run(tvec!(input.into()))?;
        let probabilities = outputs[0].to_array_view::<f32>()?.iter().copied().collect();

        Ok(probabilities)
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }
}

/// Load an ONNX model with a fixed `f32` input shape and optimize it.
pub fn load_optimized(model_path: &Path, input_shape: [usize; 4]) -> Result<TypedModel> {
    if !model_path.exists() {
        bail!("model file {} not found", model_path.display());
    }
    let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(
        input_shape[0],
        input_shape[1],
        input_shape[2],
        input_shape[3]
    ));
    let model = tract_onnx::onnx()
        .model_for_path(model_path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?;

    Ok(model)
}

/// Resize an image to the square classifier input.
pub fn resize_for_classifier(image: &RgbImage) -> RgbImage {
    image::imageops::resize(
        image,
        CLASSIFIER_INPUT_SIZE,
        CLASSIFIER_INPUT_SIZE,
        FilterType::Triangle,
    )
}

/// Convert an image to a `(1, height, width, 3)` tensor with values scaled to `[0, 1]`.
pub fn to_unit_tensor(image: &RgbImage) -> tract_ndarray::Array4<f32> {
    let (width, height) = image.dimensions();
    tract_ndarray::Array4::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, c)| image[(x as _, y as _)][c] as f32 / 255.0,
    )
}

/// Placement of an image scaled into a square canvas with its aspect ratio kept.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a point in canvas pixels to pixels of the original image.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Scale `image` into a black `size` x `size` canvas, centered and aspect-preserving.
pub fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = f32::min(size as f32 / width as f32, size as f32 / height as f32);
    let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized =
        image::imageops::resize(image, scaled_width, scaled_height, FilterType::Triangle);

    let pad_x = (size - scaled_width) / 2;
    let pad_y = (size - scaled_height) / 2;
    let mut canvas = RgbImage::new(size, size);
    image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

#[cfg(test)]
mod test {

    use super::*;
    use image::Rgb;

    #[test]
    fn test_unit_tensor_layout() {
        let mut image = RgbImage::new(2, 3);
        image.put_pixel(1, 2, Rgb([255, 0, 51]));

        let tensor = to_unit_tensor(&image);
        assert_eq!(tensor.shape(), &[1, 3, 2, 3]);
        assert_eq!(tensor[[0, 2, 1, 0]], 1.0);
        assert_eq!(tensor[[0, 2, 1, 1]], 0.0);
        assert!((tensor[[0, 2, 1, 2]] - 0.2).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_resize_for_classifier() {
        let image = RgbImage::new(640, 480);
        assert_eq!(resize_for_classifier(&image).dimensions(), (224, 224));
    }

    #[test]
    fn test_letterbox_wide_image() {
        let image = RgbImage::from_pixel(400, 200, Rgb([10, 20, 30]));
        let (canvas, placement) = letterbox(&image, 200);

        assert_eq!(canvas.dimensions(), (200, 200));
        assert_eq!(placement.scale, 0.5);
        assert_eq!(placement.pad_x, 0.0);
        assert_eq!(placement.pad_y, 50.0);
        // Padding stays black, the image is centered
        assert_eq!(canvas[(100, 10)], Rgb([0, 0, 0]));
        assert_eq!(canvas[(100, 100)], Rgb([10, 20, 30]));

        assert_eq!(placement.unmap(100.0, 100.0), (200.0, 100.0));
    }

    #[test]
    fn test_missing_model_file() {
        let result = OnnxClassifier::new("does/not/exist.onnx");
        assert!(result.is_err());
    }
}
