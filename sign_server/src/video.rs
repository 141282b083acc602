//! Video decoding and video-level sign prediction.
//!
use std::{
    io::{BufReader, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use image::RgbImage;
use serde::Deserialize;

use crate::{
    predictor::{FramePredictor, Prediction},
    sequence::collapse,
};

/// Default stride between classified frames.
pub const DEFAULT_STEP: usize = 5;

/// Predict the signs of a frame sequence and collapse them into a label sequence.
///
/// Every `step`-th frame, starting with the first, is classified. Frames without a hand
/// are dropped entirely before collapsing.
pub fn process_video<I>(predictor: &FramePredictor, frames: I, step: usize) -> Result<String>
where
    I: IntoIterator<Item = RgbImage>,
{
    if step == 0 {
        bail!("frame step must be positive");
    }

    let mut labels = vec![];
    for frame in frames.into_iter().step_by(step) {
        match predictor.predict(&frame)? {
            Prediction::Sign { label, .. } => labels.push(label),
            Prediction::NoHand => log::debug!("Dropping frame without hand"),
        }
    }
    log::info!("Collapsing {} labels", labels.len());

    Ok(collapse(labels))
}

/// Decoded frames of a stored video.
pub type Frames = Box<dyn Iterator<Item = RgbImage> + Send>;

/// Opens the frames of a stored video, once per uploaded video.
pub type VideoOpener = Arc<dyn Fn(&Path) -> Result<Frames> + Send + Sync>;

/// Video opener decoding with `ffmpeg`.
pub fn ffmpeg_opener() -> VideoOpener {
    Arc::new(|path: &Path| -> Result<Frames> { Ok(Box::new(FfmpegDecoder::open(path)?)) })
}

/// Frame-by-frame video decoder reading raw RGB frames from an `ffmpeg` child process.
///
/// Only the first video stream is decoded. Its rotation metadata is applied, so frames come
/// out upright. The child process is killed and reaped when the decoder is dropped.
pub struct FfmpegDecoder {
    child: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
    frame_index: usize,
}

impl FfmpegDecoder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (width, height) = stream_dimensions(path)?;
        log::info!("Decoding {} ({width}x{height})", path.display());

        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg")?;
        let stdout = child
            .stdout
            .take()
            .context("ffmpeg stdout not captured")?;

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            width,
            height,
            frame_index: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Iterator for FfmpegDecoder {
    type Item = RgbImage;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = vec![0_u8; self.width as usize * self.height as usize * 3];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {
                self.frame_index += 1;
                RgbImage::from_raw(self.width, self.height, buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::debug!("End of video after {} frames", self.frame_index);
                None
            }
            Err(e) => {
                log::warn!("Stopped decoding at frame {}: {e}", self.frame_index);
                None
            }
        }
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

/// Upright width and height of the first video stream.
fn stream_dimensions(path: &Path) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height:stream_tags=rotate:stream_side_data=rotation",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .context("failed to run ffprobe")?;
    if !output.status.success() {
        bail!(
            "ffprobe failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_dimensions(&output.stdout)
        .with_context(|| format!("no video stream in {}", path.display()))
}

#[derive(Deserialize)]
struct StreamReport {
    #[serde(default)]
    streams: Vec<VideoStream>,
}

#[derive(Deserialize)]
struct VideoStream {
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    tags: StreamTags,
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

#[derive(Default, Deserialize)]
struct StreamTags {
    rotate: Option<String>,
}

#[derive(Deserialize)]
struct SideData {
    rotation: Option<f64>,
}

impl VideoStream {
    /// Rotation in degrees, from the display matrix or else the legacy `rotate` tag.
    fn rotation(&self) -> i64 {
        let from_side_data = self
            .side_data_list
            .iter()
            .find_map(|side_data| side_data.rotation)
            .map(|degrees| degrees.round() as i64);
        let from_tag = || {
            self.tags
                .rotate
                .as_deref()
                .and_then(|degrees| degrees.trim().parse::<i64>().ok())
        };

        from_side_data.or_else(from_tag).unwrap_or(0)
    }
}

/// Parse the JSON stream report of `ffprobe` into upright `(width, height)`.
///
/// Streams rotated by a quarter turn have their stored dimensions swapped.
fn parse_dimensions(json: &[u8]) -> Result<(u32, u32)> {
    let report: StreamReport = serde_json::from_slice(json).context("malformed ffprobe output")?;
    let stream = match report.streams.first() {
        Some(stream) => stream,
        None => bail!("no video stream"),
    };
    let (width, height) = match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => (width, height),
        dims => bail!("invalid video dimensions {dims:?}"),
    };

    match stream.rotation().rem_euclid(180) {
        90 => Ok((height, width)),
        _ => Ok((width, height)),
    }
}
