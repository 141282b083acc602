//! Startup loading, or training, of the classifier and its label set, plus the hand
//! detection networks.
//!
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::{
    config::Config,
    hand::{HandLocalizer, OnnxHandLandmarker, PalmHandDetector},
    labels::{sidecar_path, LabelSet},
    nn::{Classifier, OnnxClassifier},
    palm::OnnxPalmDetector,
    predictor::FramePredictor,
    train::{train_classifier, BurnClassifier, TrainConfig},
    utils::download_file,
};

/// Resolve the label set of the model at `model_path`.
///
/// The label file stored next to the model is authoritative. If the dataset directory
/// exists as well, both have to agree. Without a label file, the set is derived from the
/// dataset directory and written next to the model so that later loads are pinned.
pub fn resolve_labels(model_path: &Path, dataset_dir: &Path) -> Result<LabelSet> {
    let sidecar = sidecar_path(model_path);
    let from_dataset = match dataset_dir.is_dir() {
        true => Some(LabelSet::from_dataset_dir(dataset_dir)?),
        false => None,
    };

    match (sidecar.exists(), from_dataset) {
        (true, Some(from_dataset)) => {
            let stored = LabelSet::load(&sidecar)?;
            if stored != from_dataset {
                bail!(
                    "label set mismatch: {} has {:?} but {} has {:?}",
                    sidecar.display(),
                    stored.iter().collect::<Vec<_>>(),
                    dataset_dir.display(),
                    from_dataset.iter().collect::<Vec<_>>()
                );
            }
            Ok(stored)
        }
        (true, None) => LabelSet::load(&sidecar),
        (false, Some(from_dataset)) => {
            from_dataset.save(&sidecar)?;
            log::info!(
                "Pinned {} labels from {} to {}",
                from_dataset.len(),
                dataset_dir.display(),
                sidecar.display()
            );
            Ok(from_dataset)
        }
        (false, None) => bail!(
            "no label set: neither {} nor dataset directory {} exists",
            sidecar.display(),
            dataset_dir.display()
        ),
    }
}

/// Fail if the classifier's output width is known and differs from the label count.
pub fn check_output_width(classifier: &dyn Classifier, labels: &LabelSet) -> Result<()> {
    match classifier.num_classes() {
        Some(num_classes) if num_classes != labels.len() => bail!(
            "classifier has {num_classes} outputs but the label set has {} labels",
            labels.len()
        ),
        _ => Ok(()),
    }
}

/// Storage format of the sign classifier, picked by the model file extension.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModelFormat {
    /// Network exported to ONNX, run with tract. Cannot be trained here.
    Onnx,
    /// `burn` record written by [`train_classifier`].
    Burn,
}

impl ModelFormat {
    pub fn from_path(model_path: &Path) -> Result<Self> {
        match model_path.extension().and_then(|ext| ext.to_str()) {
            Some("onnx") => Ok(ModelFormat::Onnx),
            Some("bin") => Ok(ModelFormat::Burn),
            _ => bail!(
                "unsupported classifier file {}: expected .onnx or .bin",
                model_path.display()
            ),
        }
    }
}

/// Load the persisted classifier together with its label set.
///
/// A missing `.bin` classifier is trained on `dataset_dir` first and saved to `model_path`.
pub fn load_classifier(
    model_path: &Path,
    dataset_dir: &Path,
    train: &TrainConfig,
) -> Result<(Box<dyn Classifier>, LabelSet)> {
    let format = ModelFormat::from_path(model_path)?;
    if !model_path.exists() {
        if format == ModelFormat::Onnx {
            bail!(
                "no classifier at {}: ONNX models cannot be trained, use a .bin model path",
                model_path.display()
            );
        }
        log::info!(
            "No classifier at {}, training one on {}",
            model_path.display(),
            dataset_dir.display()
        );
        train_classifier(dataset_dir, model_path, train)?;
    }

    let labels = resolve_labels(model_path, dataset_dir)?;
    let classifier: Box<dyn Classifier> = match format {
        ModelFormat::Onnx => Box::new(OnnxClassifier::new(model_path)?),
        ModelFormat::Burn => Box::new(BurnClassifier::load(
            model_path,
            labels.len(),
            train.input_size,
        )?),
    };
    check_output_width(classifier.as_ref(), &labels)?;
    log::info!(
        "Classes: {}",
        labels.iter().collect::<Vec<_>>().join(", ")
    );

    Ok((classifier, labels))
}

/// Make sure a network file exists, downloading it from `url` if given.
pub async fn ensure_model_file(path: &Path, url: Option<&str>, what: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    match url {
        Some(url) => {
            log::info!("Downloading {what} from {url}");
            download_file(&reqwest::Client::new(), url, path)
                .await
                .with_context(|| format!("failed to download {what} from {url}"))
        }
        None => bail!("{what} {} not found", path.display()),
    }
}

/// Build the frame predictor described by the configuration.
///
/// Trains the classifier first if there is none yet.
pub async fn build_predictor(config: &Config) -> Result<FramePredictor> {
    let palm_model = config.palm_model_path();
    ensure_model_file(&palm_model, config.palm_model_url.as_deref(), "palm detection model")
        .await?;
    let landmark_model = config.landmark_model_path();
    ensure_model_file(
        &landmark_model,
        config.landmark_model_url.as_deref(),
        "hand landmark model",
    )
    .await?;

    let (model_path, data_dir, train) = (
        config.model_path.clone(),
        config.data_dir.clone(),
        config.train(),
    );
    let (classifier, labels) =
        tokio::task::spawn_blocking(move || load_classifier(&model_path, &data_dir, &train))
            .await??;

    let palm = OnnxPalmDetector::new(&palm_model, config.min_detection_confidence)?;
    let landmarker = OnnxHandLandmarker::new(&landmark_model, config.min_tracking_confidence)?;
    log::info!(
        "Hand detection: single hand, min palm score {}, min landmark presence {}",
        config.min_detection_confidence,
        config.min_tracking_confidence
    );

    Ok(FramePredictor::new(
        HandLocalizer::new(Box::new(PalmHandDetector::new(
            Box::new(palm),
            Box::new(landmarker),
        ))),
        classifier,
        labels,
    ))
}

#[cfg(test)]
mod test {

    use super::*;
    use std::fs;
    use tract_onnx::prelude::tract_ndarray::Array4;

    struct Width(Option<usize>);

    impl Classifier for Width {
        fn classify(&self, _input: Array4<f32>) -> Result<Vec<f32>> {
            Ok(vec![])
        }

        fn num_classes(&self) -> Option<usize> {
            self.0
        }
    }

    fn dataset(root: &Path, classes: &[&str]) -> Result<std::path::PathBuf> {
        let dir = root.join("data");
        for class in classes {
            fs::create_dir_all(dir.join(class))?;
        }
        Ok(dir)
    }

    #[test]
    fn test_labels_pinned_from_dataset() -> Result<()> {
        let root = tempfile::tempdir()?;
        let data = dataset(root.path(), &["B", "A"])?;
        let model = root.path().join("model.onnx");

        let labels = resolve_labels(&model, &data)?;
        assert_eq!(labels.iter().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(LabelSet::load(sidecar_path(&model))?, labels);

        // Dataset may disappear after pinning
        fs::remove_dir_all(&data)?;
        assert_eq!(resolve_labels(&model, &data)?, labels);

        Ok(())
    }

    #[test]
    fn test_label_mismatch_fails() -> Result<()> {
        let root = tempfile::tempdir()?;
        let model = root.path().join("model.onnx");
        LabelSet::new(vec!["A".into(), "B".into()])?.save(sidecar_path(&model))?;
        let data = dataset(root.path(), &["A", "B", "C"])?;

        let err = resolve_labels(&model, &data).unwrap_err();
        assert!(err.to_string().contains("label set mismatch"));

        Ok(())
    }

    #[test]
    fn test_no_labels_anywhere() -> Result<()> {
        let root = tempfile::tempdir()?;
        let result = resolve_labels(&root.path().join("model.onnx"), &root.path().join("data"));
        assert!(result.is_err());

        Ok(())
    }

    #[test]
    fn test_missing_model_is_trained() -> Result<()> {
        let root = tempfile::tempdir()?;
        let data = dataset(root.path(), &["A", "B"])?;
        for (class, color) in [("A", [200, 10, 10]), ("B", [10, 10, 200])] {
            for i in 0..3 {
                image::RgbImage::from_pixel(24, 24, image::Rgb(color))
                    .save(data.join(class).join(format!("{i}.png")))?;
            }
        }
        let model = root.path().join("model.bin");
        let train = TrainConfig {
            input_size: 24,
            epochs: 1,
            batch_size: 2,
            ..Default::default()
        };

        let (classifier, labels) = load_classifier(&model, &data, &train)?;
        assert!(model.exists());
        assert_eq!(labels.iter().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(classifier.num_classes(), Some(2));

        // A second start loads the saved model instead of training again
        let modified = fs::metadata(&model)?.modified()?;
        let (_, reloaded) = load_classifier(&model, &data, &train)?;
        assert_eq!(reloaded, labels);
        assert_eq!(fs::metadata(&model)?.modified()?, modified);

        Ok(())
    }

    #[test]
    fn test_missing_onnx_model_cannot_be_trained() -> Result<()> {
        let root = tempfile::tempdir()?;
        let data = dataset(root.path(), &["A"])?;
        let model = root.path().join("model.onnx");
        let err = load_classifier(&model, &data, &TrainConfig::default())
            .err()
            .expect("training into ONNX must fail");
        assert!(err.to_string().contains("cannot be trained"));

        Ok(())
    }

    #[test]
    fn test_model_format_from_extension() {
        assert_eq!(
            ModelFormat::from_path(Path::new("signs.onnx")).unwrap(),
            ModelFormat::Onnx
        );
        assert_eq!(
            ModelFormat::from_path(Path::new("models/signs.bin")).unwrap(),
            ModelFormat::Burn
        );
        assert!(ModelFormat::from_path(Path::new("signs.h5")).is_err());
        assert!(ModelFormat::from_path(Path::new("signs")).is_err());
    }

    #[test]
    fn test_output_width_check() -> Result<()> {
        let labels = LabelSet::new(vec!["A".into(), "B".into()])?;
        assert!(check_output_width(&Width(Some(2)), &labels).is_ok());
        assert!(check_output_width(&Width(None), &labels).is_ok());
        assert!(check_output_width(&Width(Some(3)), &labels).is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_model_file_without_url() {
        let result = ensure_model_file(Path::new("does/not/exist.onnx"), None, "palm model").await;
        assert!(result.is_err());
    }
}
