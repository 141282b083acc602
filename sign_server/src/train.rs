//! Training of the sign classifier on a directory-per-class dataset with `burn`.
//!
//! The network takes NCHW batches with values in `[0, 1]`: three 3x3 convolutions with
//! ReLU, each followed by 2x2 max pooling, then a dense layer of 128 units, dropout of 0.5
//! and one output per class.
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    backend::{autodiff::Autodiff, ndarray::NdArray},
    module::{AutodiffModule, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig,
    },
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::{
        activation::{relu, softmax},
        backend::Backend,
        Int, Tensor, TensorData,
    },
};
use image::{imageops::FilterType, ImageFormat};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tract_onnx::prelude::tract_ndarray::Array4;

use crate::{
    labels::{sidecar_path, LabelSet},
    nn::{Classifier, CLASSIFIER_INPUT_SIZE},
    predictor::argmax,
};

/// Backend classifying single frames.
pub type InferBackend = NdArray<f32>;
/// Backend of the training loop.
pub type TrainBackend = Autodiff<InferBackend>;

/// Smallest input side that survives the three conv and pool stages.
const MIN_INPUT_SIZE: usize = 22;

#[derive(Clone, Debug)]
pub struct TrainConfig {
    /// Side of the square network input in pixels.
    pub input_size: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Share of every class held out for validation.
    pub val_ratio: f32,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            input_size: CLASSIFIER_INPUT_SIZE as usize,
            epochs: 20,
            batch_size: 32,
            learning_rate: 1e-3,
            val_ratio: 0.2,
            seed: 42,
        }
    }
}

#[derive(Module, Debug)]
pub struct SignNet<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    dense: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> SignNet<B> {
    pub fn new(num_classes: usize, input_size: usize, device: &B::Device) -> Self {
        let conv = |channels: [usize; 2]| Conv2dConfig::new(channels, [3, 3]).init(device);
        let side = feature_map_size(input_size);

        Self {
            conv1: conv([3, 32]),
            conv2: conv([32, 64]),
            conv3: conv([64, 128]),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dense: LinearConfig::new(128 * side * side, 128).init(device),
            dropout: DropoutConfig::new(0.5).init(),
            output: LinearConfig::new(128, num_classes).init(device),
        }
    }

    /// Class logits of a `(batch, 3, size, size)` tensor.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(relu(self.conv1.forward(images)));
        let x = self.pool.forward(relu(self.conv2.forward(x)));
        let x = self.pool.forward(relu(self.conv3.forward(x)));
        let x: Tensor<B, 2> = x.flatten(1, 3);
        let x = self.dropout.forward(relu(self.dense.forward(x)));

        self.output.forward(x)
    }
}

/// Side of the last feature map: each stage is an unpadded 3x3 conv and a 2x2 pool.
pub fn feature_map_size(input_size: usize) -> usize {
    (0..3).fold(input_size, |side, _| side.saturating_sub(2) / 2)
}

/// One image of the dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub path: PathBuf,
    pub class: usize,
}

/// Training and validation samples of a dataset directory.
///
/// Image files of every class are sorted by name; the first `val_ratio` share of each
/// class is held out for validation.
pub fn split_dataset(
    dataset_dir: &Path,
    labels: &LabelSet,
    val_ratio: f32,
) -> Result<(Vec<Sample>, Vec<Sample>)> {
    let mut train = vec![];
    let mut validation = vec![];

    for (class, label) in labels.iter().enumerate() {
        let class_dir = dataset_dir.join(label);
        let mut files = vec![];
        for entry in std::fs::read_dir(&class_dir)
            .with_context(|| format!("failed to read class directory {}", class_dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && ImageFormat::from_path(&path).is_ok() {
                files.push(path);
            }
        }
        files.sort();

        let num_validation = (files.len() as f32 * val_ratio) as usize;
        log::info!(
            "Class {label}: {} training and {num_validation} validation images",
            files.len() - num_validation
        );
        for (index, path) in files.into_iter().enumerate() {
            let sample = Sample { path, class };
            match index < num_validation {
                true => validation.push(sample),
                false => train.push(sample),
            }
        }
    }

    Ok((train, validation))
}

/// Decode an image, resize it to the network input and lay it out as CHW in `[0, 1]`.
fn load_chw(path: &Path, input_size: usize) -> Result<Vec<f32>> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode training image {}", path.display()))?
        .to_rgb8();
    let size = input_size as u32;
    let image = image::imageops::resize(&image, size, size, FilterType::Triangle);

    let mut chw = vec![0.0; 3 * input_size * input_size];
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            chw[(c * input_size + y as usize) * input_size + x as usize] = pixel[c] as f32 / 255.0;
        }
    }

    Ok(chw)
}

fn load_batch<B: Backend>(
    samples: &[Sample],
    input_size: usize,
    device: &B::Device,
) -> Result<(Tensor<B, 4>, Tensor<B, 1, Int>)> {
    let mut pixels = Vec::with_capacity(samples.len() * 3 * input_size * input_size);
    for sample in samples {
        pixels.extend(load_chw(&sample.path, input_size)?);
    }
    let targets: Vec<i64> = samples.iter().map(|s| s.class as i64).collect();

    let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), device).reshape([
        samples.len(),
        3,
        input_size,
        input_size,
    ]);
    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [samples.len()]), device);

    Ok((images, targets))
}

/// Number of samples whose highest logit is their class.
fn count_correct<B: Backend>(logits: Tensor<B, 2>, samples: &[Sample]) -> Result<usize> {
    let num_classes = logits.dims()[1];
    let logits = logits
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("{e:?}"))?;

    Ok(logits
        .chunks(num_classes)
        .zip(samples)
        .filter(|(row, sample)| argmax(row).map(|(index, _)| index) == Some(sample.class))
        .count())
}

/// Share of `samples` the model classifies correctly.
fn accuracy(model: &SignNet<InferBackend>, samples: &[Sample], config: &TrainConfig) -> Result<f32> {
    if samples.is_empty() {
        return Ok(0.0);
    }

    let device = Default::default();
    let mut correct = 0;
    for chunk in samples.chunks(config.batch_size) {
        let (images, _) = load_batch::<InferBackend>(chunk, config.input_size, &device)?;
        correct += count_correct(model.forward(images), chunk)?;
    }

    Ok(correct as f32 / samples.len() as f32)
}

/// Train a classifier on `dataset_dir` and persist it to `model_path`.
///
/// The label set derived from the dataset is written next to the model. The record file
/// always carries the `.bin` extension.
pub fn train_classifier(
    dataset_dir: &Path,
    model_path: &Path,
    config: &TrainConfig,
) -> Result<LabelSet> {
    if config.input_size < MIN_INPUT_SIZE {
        bail!("input size {} is below {MIN_INPUT_SIZE}", config.input_size);
    }
    if config.batch_size == 0 {
        bail!("batch size must be positive");
    }

    let labels = LabelSet::from_dataset_dir(dataset_dir)?;
    let (mut train, validation) = split_dataset(dataset_dir, &labels, config.val_ratio)?;
    if train.is_empty() {
        bail!("no training images in {}", dataset_dir.display());
    }
    log::info!(
        "Training on {} images of {} classes for {} epochs",
        train.len(),
        labels.len(),
        config.epochs
    );

    TrainBackend::seed(config.seed);
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut model = SignNet::<TrainBackend>::new(labels.len(), config.input_size, &device);
    let mut optim = AdamConfig::new().init();
    let loss_fn = CrossEntropyLossConfig::new().init(&device);

    for epoch in 1..=config.epochs {
        train.shuffle(&mut rng);
        let mut loss_sum = 0.0;
        let mut correct = 0;

        for chunk in train.chunks(config.batch_size) {
            let (images, targets) = load_batch::<TrainBackend>(chunk, config.input_size, &device)?;
            let logits = model.forward(images);
            correct += count_correct(logits.clone(), chunk)?;

            let loss = loss_fn.forward(logits, targets);
            loss_sum += loss.clone().into_scalar() * chunk.len() as f32;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);
        }

        let val_accuracy = accuracy(&model.valid(), &validation, config)?;
        log::info!(
            "Epoch {epoch}/{}: loss {:.4}, accuracy {:.3}, validation accuracy {val_accuracy:.3}",
            config.epochs,
            loss_sum / train.len() as f32,
            correct as f32 / train.len() as f32
        );
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .valid()
        .save_file(model_path, &recorder)
        .map_err(|e| anyhow!("failed to save trained classifier: {e:?}"))?;
    labels.save(sidecar_path(model_path))?;
    log::info!("Saved trained classifier to {}", model_path.display());

    Ok(labels)
}

/// Sign classifier trained with [`train_classifier`].
pub struct BurnClassifier {
    model: Mutex<SignNet<InferBackend>>,
    device: <InferBackend as Backend>::Device,
    input_size: usize,
    num_classes: usize,
}

impl BurnClassifier {
    pub fn load(model_path: &Path, num_classes: usize, input_size: usize) -> Result<Self> {
        if input_size < MIN_INPUT_SIZE {
            bail!("input size {input_size} is below {MIN_INPUT_SIZE}");
        }
        if !model_path.exists() {
            bail!("model file {} not found", model_path.display());
        }

        let device = Default::default();
        let model = SignNet::<InferBackend>::new(num_classes, input_size, &device)
            .load_file(
                model_path,
                &BinFileRecorder::<FullPrecisionSettings>::new(),
                &device,
            )
            .map_err(|e| anyhow!("failed to load classifier {}: {e:?}", model_path.display()))?;
        log::info!(
            "Loaded classifier {} with {num_classes} classes",
            model_path.display()
        );

        Ok(Self {
            model: Mutex::new(model),
            device,
            input_size,
            num_classes,
        })
    }
}

impl Classifier for BurnClassifier {
    fn classify(&self, input: Array4<f32>) -> Result<Vec<f32>> {
        let size = self.input_size;
        if input.shape() != [1, size, size, 3] {
            bail!("unexpected classifier input shape {:?}", input.shape());
        }

        // NHWC to NCHW
        let values: Vec<f32> = input.permuted_axes([0, 3, 1, 2]).iter().copied().collect();
        let images =
            Tensor::<InferBackend, 1>::from_floats(values.as_slice(), &self.device)
                .reshape([1, 3, size, size]);

        let logits = match self.model.lock() {
            Ok(model) => model.forward(images),
            Err(_) => bail!("classifier lock poisoned"),
        };

        softmax(logits, 1)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("{e:?}"))
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.num_classes)
    }
}
