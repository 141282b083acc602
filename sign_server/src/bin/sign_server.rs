//! Sign server binary.
//!
use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use env_logger::TimestampPrecision;
use sign_server::{
    config::Config,
    endpoints::{router, AppState},
    live::Overlay,
    meter::spawn_meter_logger,
    model_store::build_predictor,
    sensors::camera_opener,
    video::ffmpeg_opener,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    // Load or train the classifier and load the hand networks before serving anything
    let predictor = build_predictor(&config).await?;

    let state = Arc::new(AppState {
        predictor: Arc::new(predictor),
        overlay: Arc::new(Overlay::load(&config.font_path)),
        camera: camera_opener(config.camera()),
        video: ffmpeg_opener(),
        upload_dir: config.upload_dir.clone(),
        video_step: config.video_step,
    });

    spawn_meter_logger();

    // Build HTTP server with endpoints
    let app = router(state, config.max_upload_bytes);

    // Serve HTTP server
    let addr: SocketAddr = config.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
