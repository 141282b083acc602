use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::TimestampPrecision;
use sign_client::SignClient;
use sign_server::sensors::{camera_opener, CameraConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Client of the hand-sign recognition server")]
struct Args {
    /// Address of the sign server to connect to
    #[clap(long, default_value = "127.0.0.1:5000")]
    address: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Predict the sign shown in an image
    Image { path: PathBuf },

    /// Predict the sign sequence of a video
    Video { path: PathBuf },

    /// Send webcam snapshots and print every change of the predicted sign
    Live {
        /// Video device to capture from
        #[clap(long, default_value = "/dev/video0")]
        device: String,

        /// Milliseconds between snapshots
        #[clap(long, default_value_t = 500)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let client = SignClient::new(&args.address);

    match args.command {
        Command::Image { path } => {
            let prediction = client.predict_image(&path).await?;
            println!("{} ({:.2})", prediction.prediction, prediction.confidence);
        }
        Command::Video { path } => {
            let prediction = client.predict_video(&path).await?;
            println!("{}", prediction.prediction);
        }
        Command::Live {
            device,
            interval_ms,
        } => send_snapshots(&client, device, Duration::from_millis(interval_ms)).await?,
    }

    Ok(())
}

async fn send_snapshots(client: &SignClient, device: String, interval: Duration) -> Result<()> {
    log::info!("Sending snapshots of {device} every {interval:?}");

    let open = camera_opener(CameraConfig {
        device,
        ..Default::default()
    });
    let mut camera = open()?;
    let mut ticker = tokio::time::interval(interval);
    let mut last_label = None;

    loop {
        ticker.tick().await;

        let Some(frame) = camera.capture() else {
            log::warn!("Camera stopped delivering frames");
            return Ok(());
        };
        let jpeg = turbojpeg::compress_image(&frame, 90, turbojpeg::Subsamp::Sub2x2)
            .context("failed to encode snapshot")?;

        match client.predict_image_data("snapshot.jpg", jpeg.to_vec()).await {
            Ok(prediction) => {
                if last_label.as_ref() != Some(&prediction.prediction) {
                    println!("{} ({:.2})", prediction.prediction, prediction.confidence);
                    last_label = Some(prediction.prediction);
                }
            }
            Err(e) => log::error!("Prediction failed: {e:#}"),
        }
    }
}
