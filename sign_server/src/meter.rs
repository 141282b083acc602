//! Throughput accounting of the recognition pipeline.
//!
//! Request handlers and the live feed count what they process; a background task logs one
//! summary line per window while anything happens.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

/// Length of one logged window.
const LOG_WINDOW: Duration = Duration::from_secs(5);

pub static METER: PipelineMeter = PipelineMeter::new();

#[derive(Default)]
pub struct PipelineMeter {
    hand_crops: AtomicU64,
    handless_frames: AtomicU64,
    live_frames: AtomicU64,
}

/// Counts of one window.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Window {
    /// Hand crops that went through the classifier.
    pub hand_crops: u64,
    /// Examined frames in which no hand was found.
    pub handless_frames: u64,
    /// Annotated frames sent to live stream clients.
    pub live_frames: u64,
}

impl PipelineMeter {
    pub const fn new() -> PipelineMeter {
        PipelineMeter {
            hand_crops: AtomicU64::new(0),
            handless_frames: AtomicU64::new(0),
            live_frames: AtomicU64::new(0),
        }
    }

    pub fn hand_crop(&self) {
        self.hand_crops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handless_frame(&self) {
        self.handless_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_frame(&self) {
        self.live_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts since the previous call.
    pub fn take_window(&self) -> Window {
        Window {
            hand_crops: self.hand_crops.swap(0, Ordering::Relaxed),
            handless_frames: self.handless_frames.swap(0, Ordering::Relaxed),
            live_frames: self.live_frames.swap(0, Ordering::Relaxed),
        }
    }
}

impl Window {
    pub fn is_idle(&self) -> bool {
        *self == Window::default()
    }

    /// Share of examined frames that contained a hand.
    pub fn hand_rate(&self) -> Option<f32> {
        let examined = self.hand_crops + self.handless_frames;
        (examined > 0).then(|| self.hand_crops as f32 / examined as f32)
    }

    pub fn summary(&self, elapsed: Duration) -> String {
        let secs = elapsed.as_secs_f32().max(f32::EPSILON);
        let mut summary = format!(
            "{:.1} hand crops/s, {:.1} frames/s without hand",
            self.hand_crops as f32 / secs,
            self.handless_frames as f32 / secs
        );
        if let Some(rate) = self.hand_rate() {
            summary += &format!(" ({:.0}% with hand)", rate * 100.0);
        }
        if self.live_frames > 0 {
            summary += &format!(", {:.1} live frames/s", self.live_frames as f32 / secs);
        }

        summary
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(LOG_WINDOW);
        log_interval.tick().await;
        let mut window_start = Instant::now();

        loop {
            log_interval.tick().await;
            let window = METER.take_window();
            let elapsed = window_start.elapsed();
            window_start = Instant::now();

            if !window.is_idle() {
                log::info!("Pipeline: {}", window.summary(elapsed));
            }
        }
    })
}
