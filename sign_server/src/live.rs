//! Live feed of annotated webcam frames as Motion-JPEG parts.
//!
use std::{path::Path, sync::Arc};

use anyhow::Result;
use bytes::Bytes;
use common::protocol::STREAM_BOUNDARY;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;

use crate::{meter::METER, predictor::FramePredictor, sensors::FrameSource};

/// JPEG quality of streamed frames.
const JPEG_QUALITY: i32 = 90;

const TEXT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_SCALE: f32 = 28.0;
const TEXT_POSITION: (i32, i32) = (10, 10);

/// Wrap JPEG data into one part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::from(
        [
            format!("--{STREAM_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes(),
            data,
            "\r\n".as_bytes(),
        ]
        .concat(),
    )
}

/// Text renderer for prediction overlays.
///
/// Without a font, frames are streamed without text.
pub struct Overlay {
    font: Option<rusttype::Font<'static>>,
}

impl Overlay {
    /// Load the overlay font from a TrueType file.
    pub fn load(font_path: impl AsRef<Path>) -> Self {
        let font_path = font_path.as_ref();
        let font = std::fs::read(font_path)
            .ok()
            .and_then(rusttype::Font::try_from_vec);
        match &font {
            Some(_) => log::info!("Loaded overlay font {}", font_path.display()),
            None => log::warn!(
                "Failed to load font {}, live frames carry no text",
                font_path.display()
            ),
        }

        Self { font }
    }

    pub fn without_text() -> Self {
        Self { font: None }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, frame: &mut RgbImage, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(
                frame,
                TEXT_COLOR,
                TEXT_POSITION.0,
                TEXT_POSITION.1,
                rusttype::Scale::uniform(TEXT_SCALE),
                font,
                text,
            );
        }
    }
}

/// Pull-based producer of annotated stream parts, one per captured frame.
///
/// Ends when the source stops yielding frames. An `Err` item ends the feed as well. The
/// frame source is released when the feed is dropped, whether exhausted or not.
pub struct LiveFeed<S: FrameSource> {
    source: S,
    predictor: Arc<FramePredictor>,
    overlay: Arc<Overlay>,
    done: bool,
}

impl<S: FrameSource> LiveFeed<S> {
    pub fn new(source: S, predictor: Arc<FramePredictor>, overlay: Arc<Overlay>) -> Self {
        Self {
            source,
            predictor,
            overlay,
            done: false,
        }
    }

    fn render(&self, mut frame: RgbImage) -> Result<Bytes> {
        let prediction = self.predictor.predict(&frame)?;
        self.overlay.draw(&mut frame, &prediction.display_text());

        let jpeg = turbojpeg::compress_image(&frame, JPEG_QUALITY, turbojpeg::Subsamp::Sub2x2)?;
        Ok(as_jpeg_stream_item(&jpeg))
    }
}

impl<S: FrameSource> Iterator for LiveFeed<S> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let frame = match self.source.capture() {
            Some(frame) => frame,
            None => {
                log::info!("Frame source exhausted, ending live feed");
                self.done = true;
                return None;
            }
        };

        let item = self.render(frame);
        match &item {
            Ok(_) => METER.live_frame(),
            Err(e) => {
                log::error!("Ending live feed: {e:#}");
                self.done = true;
            }
        }

        Some(item)
    }
}
