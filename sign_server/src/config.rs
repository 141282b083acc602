//! Command line configuration of the server.
//!
use std::path::PathBuf;

use clap::Parser;

use crate::{
    sensors::CameraConfig, train::TrainConfig, utils::default_cache_dir, video::DEFAULT_STEP,
};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Hand-sign recognition server")]
pub struct Config {
    /// Address to serve HTTP on
    #[clap(long, default_value = "127.0.0.1:5000")]
    pub server_address: String,

    /// Sign classifier, `.bin` (trained on the dataset when missing) or `.onnx`; its label
    /// set is kept next to it as `.labels.json`
    #[clap(long, default_value = "sign_classifier.bin")]
    pub model_path: PathBuf,

    /// Dataset directory with one sub-directory per sign class
    #[clap(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Training epochs when the classifier has to be trained
    #[clap(long, default_value_t = 20)]
    pub train_epochs: usize,

    /// Training batch size
    #[clap(long, default_value_t = 32, value_parser = parse_positive)]
    pub train_batch_size: usize,

    /// Palm detection model (ONNX), defaults to the cache directory
    #[clap(long)]
    pub palm_model: Option<PathBuf>,

    /// URL to download the palm detection model from when it is missing
    #[clap(long)]
    pub palm_model_url: Option<String>,

    /// Hand landmark model (ONNX), defaults to the cache directory
    #[clap(long)]
    pub landmark_model: Option<PathBuf>,

    /// URL to download the hand landmark model from when it is missing
    #[clap(long)]
    pub landmark_model_url: Option<String>,

    /// Minimum palm detection score to accept a hand
    #[clap(long, default_value_t = 0.5)]
    pub min_detection_confidence: f32,

    /// Minimum hand presence score of the landmarks found in the palm region
    #[clap(long, default_value_t = 0.5)]
    pub min_tracking_confidence: f32,

    /// Directory uploaded videos are saved to
    #[clap(long, default_value = "uploads")]
    pub upload_dir: PathBuf,

    /// Classify every n-th frame of uploaded videos
    #[clap(long, default_value_t = DEFAULT_STEP, value_parser = parse_positive)]
    pub video_step: usize,

    /// Maximum size of uploaded files in bytes
    #[clap(long, default_value_t = 256 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Video device of the live feed
    #[clap(long, default_value = "/dev/video0")]
    pub camera_device: String,

    /// TrueType font for the live feed overlay
    #[clap(long, default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf")]
    pub font_path: PathBuf,
}

impl Config {
    pub fn palm_model_path(&self) -> PathBuf {
        self.palm_model
            .clone()
            .unwrap_or_else(|| default_cache_dir().join("palm_detection.onnx"))
    }

    pub fn landmark_model_path(&self) -> PathBuf {
        self.landmark_model
            .clone()
            .unwrap_or_else(|| default_cache_dir().join("hand_landmark.onnx"))
    }

    pub fn train(&self) -> TrainConfig {
        TrainConfig {
            epochs: self.train_epochs,
            batch_size: self.train_batch_size,
            ..Default::default()
        }
    }

    pub fn camera(&self) -> CameraConfig {
        CameraConfig {
            device: self.camera_device.clone(),
            ..Default::default()
        }
    }
}

fn parse_positive(arg: &str) -> Result<usize, String> {
    match arg.parse::<usize>() {
        Ok(0) => Err("value must be positive".to_owned()),
        Ok(step) => Ok(step),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["sign_server"]);

        assert_eq!(config.video_step, 5);
        assert_eq!(config.min_detection_confidence, 0.5);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.model_path, PathBuf::from("sign_classifier.bin"));
        assert!(config
            .palm_model_path()
            .ends_with("sign_server/palm_detection.onnx"));
        assert!(config
            .landmark_model_path()
            .ends_with("sign_server/hand_landmark.onnx"));
        assert_eq!(config.train().epochs, 20);
        assert_eq!(config.train().batch_size, 32);
        assert_eq!(config.train().input_size, 224);
        assert_eq!(config.camera().device, "/dev/video0");
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse_from([
            "sign_server",
            "--video-step",
            "3",
            "--landmark-model",
            "models/hand.onnx",
            "--camera-device",
            "/dev/video2",
        ]);

        assert_eq!(config.video_step, 3);
        assert_eq!(config.landmark_model_path(), PathBuf::from("models/hand.onnx"));
        assert_eq!(config.camera().device, "/dev/video2");
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(Config::try_parse_from(["sign_server", "--video-step", "0"]).is_err());
        assert!(Config::try_parse_from(["sign_server", "--train-batch-size", "0"]).is_err());
    }
}
