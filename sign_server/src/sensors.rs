//! Sensors module.
//!
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

/// Source of live colour frames, released when dropped.
pub trait FrameSource: Send {
    /// Capture the next frame, or `None` once the source is exhausted or unavailable.
    fn capture(&mut self) -> Option<RgbImage>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Option<RgbImage> {
        (**self).capture()
    }
}

/// Opens a fresh frame source for each live stream.
pub type CameraOpener = Arc<dyn Fn() -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Settings of the V4L2 capture device.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub device: String,
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<(u32, u32)>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_owned(),
            resolution: None,
            frame_rate: None,
        }
    }
}

/// Camera opener for the configured capture device.
pub fn camera_opener(config: CameraConfig) -> CameraOpener {
    Arc::new(move || open_camera(&config))
}

#[cfg(feature = "v4l")]
fn open_camera(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    let camera = v4l::MjpgCamera::open(config)?;
    Ok(Box::new(camera))
}

#[cfg(not(feature = "v4l"))]
fn open_camera(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    anyhow::bail!(
        "cannot open {}: built without webcam support (feature `v4l`)",
        config.device
    )
}

#[cfg(feature = "v4l")]
pub use v4l::{get_max_frame_rate, get_max_resolution, MjpgCamera};

#[cfg(feature = "v4l")]
mod v4l {
    use anyhow::Result;
    use image::RgbImage;
    use rscam::{Camera, Config};
    use simple_error::simple_error;

    use super::{CameraConfig, FrameSource};

    const FORMAT: &[u8] = b"MJPG";

    /// Initialized Motion-JPEG camera. Capturing stops when it is dropped.
    pub struct MjpgCamera {
        cam: Camera,
        device: String,
    }

    impl MjpgCamera {
        pub fn open(config: &CameraConfig) -> Result<Self> {
            let mut cam = Camera::new(&config.device)?;
            log_supported_formats(&cam);

            let resolution = match config.resolution {
                Some(resolution) => resolution,
                None => get_max_resolution(&cam, FORMAT)?,
            };
            let frame_rate = match config.frame_rate {
                Some(frame_rate) => frame_rate,
                None => get_max_frame_rate(&cam, FORMAT, resolution)?,
            };

            cam.start(&Config {
                interval: frame_rate,
                resolution,
                format: FORMAT,
                ..Default::default()
            })?;
            log::info!(
                "Using camera {} at {}x{}, interval {}/{}",
                config.device,
                resolution.0,
                resolution.1,
                frame_rate.0,
                frame_rate.1
            );

            Ok(Self {
                cam,
                device: config.device.clone(),
            })
        }

        /// Capture a raw JPEG frame.
        pub fn capture_jpeg(&self) -> Option<Vec<u8>> {
            match self.cam.capture() {
                Ok(frame) => Some(frame[..].to_vec()),
                Err(e) => {
                    log::error!("Error capturing frame from {}: {e}", self.device);
                    None
                }
            }
        }
    }

    impl FrameSource for MjpgCamera {
        fn capture(&mut self) -> Option<RgbImage> {
            let jpeg = self.capture_jpeg()?;
            match turbojpeg::decompress_image(&jpeg) {
                Ok(image) => Some(image),
                Err(e) => {
                    log::error!("Error decoding frame from {}: {e}", self.device);
                    None
                }
            }
        }
    }

    impl Drop for MjpgCamera {
        fn drop(&mut self) {
            log::info!("Releasing camera {}", self.device);
        }
    }

    /// Get the maximum supported resolution for the given format.
    pub fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32)> {
        let resolution_info = cam.resolutions(format)?;
        log::debug!("Found resolutions: {:?}", &resolution_info);
        let resolution = match resolution_info {
            rscam::ResolutionInfo::Discretes(resolutions) => resolutions
                .iter()
                // Highest resolution in terms of number of pixels
                .max_by_key(|res| res.0 * res.1)
                .copied(),
            rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
        };

        resolution.ok_or_else(|| simple_error!("No resolution found").into())
    }

    /// Get the maximum supported frame rate for the given format and resolution.
    pub fn get_max_frame_rate(
        cam: &Camera,
        format: &[u8],
        resolution: (u32, u32),
    ) -> Result<(u32, u32)> {
        let interval_info = cam.intervals(format, resolution)?;
        log::debug!("Found frame rates: {:?}", &interval_info);
        let interval = match interval_info {
            rscam::IntervalInfo::Discretes(intervals) => intervals
                .iter()
                // Shortest interval, i.e. the highest frame rate
                .max_by(|a, b| (a.1 * b.0).cmp(&(b.1 * a.0)))
                .copied(),
            rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
        };

        interval.ok_or_else(|| simple_error!("No frame rate found").into())
    }

    fn log_supported_formats(cam: &Camera) {
        let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
        log::debug!(
            "Supported formats: {:?}, using format {:?}",
            formats,
            String::from_utf8_lossy(FORMAT)
        );
    }

    #[cfg(test)]
    mod test {

        use super::*;

        #[test]
        fn get_cam_info_if_available() -> Result<()> {
            let cam_name = "/dev/video0";
            let cam = Camera::new(cam_name);

            match cam {
                Err(err) => println!("Could not initialize camera (maybe non available): {err}"),
                Ok(cam) => {
                    let formats: Vec<_> = cam.formats().collect();
                    println!("Supported formats: {formats:?}");

                    if let Ok(selected_resolution) = get_max_resolution(&cam, FORMAT) {
                        let frame_rate = get_max_frame_rate(&cam, FORMAT, selected_resolution);
                        println!("Selected {selected_resolution:?} at {frame_rate:?}");
                    }
                }
            }

            Ok(())
        }
    }
}
