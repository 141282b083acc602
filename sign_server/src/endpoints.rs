//! Endpoints of HTTP server.
//!
use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    body::StreamBody,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use common::protocol::{
    ErrorBody, ImagePrediction, VideoPrediction, MISSING_FILE_MSG, STREAM_CONTENT_TYPE,
    UPLOAD_FIELD,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    live::{LiveFeed, Overlay},
    predictor::FramePredictor,
    sensors::CameraOpener,
    upload::{decode_image, save_upload},
    video::{process_video, VideoOpener},
};

/// Number of encoded live frames buffered ahead of the client.
const LIVE_BUFFER: usize = 2;

/// Read-only state shared by all requests.
pub struct AppState {
    pub predictor: Arc<FramePredictor>,
    pub overlay: Arc<Overlay>,
    pub camera: CameraOpener,
    pub video: VideoOpener,
    pub upload_dir: PathBuf,
    pub video_step: usize,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/predict_image", post(predict_image))
        .route("/predict_video", post(predict_video))
        .route("/predict_live", get(predict_live))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(Extension(state))
}

/// Error of a request, rendered as JSON body `{"error": ...}`.
///
/// Internal errors only expose their outermost context, the full chain is logged.
#[derive(Debug)]
pub enum ApiError {
    MissingFile,
    Internal(anyhow::Error),
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MissingFile => (StatusCode::BAD_REQUEST, MISSING_FILE_MSG.to_owned()),
            ApiError::Internal(err) => {
                log::error!("Request failed: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        (status, Json(ErrorBody::new(message))).into_response()
    }
}

/// Uploaded file of a multipart request.
struct Upload {
    filename: String,
    data: Bytes,
}

/// Extract the upload field, skipping any other fields.
async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Upload, ApiError> {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            log::debug!("Request without multipart body: {rejection}");
            return Err(ApiError::MissingFile);
        }
    };

    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(UPLOAD_FIELD) {
            let filename = field.file_name().unwrap_or_default().to_owned();
            let data = field.bytes().await?;
            return Ok(Upload { filename, data });
        }
    }

    Err(ApiError::MissingFile)
}

/// Landing page.
pub async fn index() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>Sign Recognition</title></head>
<body>
    <h3>Image</h3>
    <form action="/predict_image" method="post" enctype="multipart/form-data">
        <input type="file" name="file" accept="image/*"><input type="submit" value="Predict">
    </form>
    <h3>Video</h3>
    <form action="/predict_video" method="post" enctype="multipart/form-data">
        <input type="file" name="file" accept="video/*"><input type="submit" value="Predict">
    </form>
    <h3>Live</h3>
    <img src="/predict_live" width="640">
</body>
</html>
"#,
    )
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Predict the sign shown in an uploaded image.
pub async fn predict_image(
    Extension(state): Extension<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ImagePrediction>, ApiError> {
    let upload = read_upload(multipart).await?;
    log::info!(
        "Image prediction for {:?} ({} bytes)",
        upload.filename,
        upload.data.len()
    );

    let predictor = Arc::clone(&state.predictor);
    let prediction = tokio::task::spawn_blocking(move || {
        let frame = decode_image(&upload.data).context("failed to decode image")?;
        predictor
            .predict(&frame)
            .context("failed to predict image")
    })
    .await??;

    Ok(Json(prediction.into()))
}

/// Predict the collapsed sign sequence of an uploaded video.
pub async fn predict_video(
    Extension(state): Extension<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VideoPrediction>, ApiError> {
    let upload = read_upload(multipart).await?;
    let path = save_upload(&state.upload_dir, &upload.filename, &upload.data)
        .await
        .context("failed to store upload")?;

    let predictor = Arc::clone(&state.predictor);
    let open = Arc::clone(&state.video);
    let step = state.video_step;
    let prediction = tokio::task::spawn_blocking(move || {
        let frames = (*open)(&path).context("failed to decode video")?;
        process_video(&predictor, frames, step).context("failed to process video")
    })
    .await??;
    log::info!("Video prediction: {prediction:?}");

    Ok(Json(VideoPrediction { prediction }))
}

/// Stream annotated webcam frames as `multipart/x-mixed-replace`.
///
/// The feed runs on a blocking task and ends, releasing the camera, as soon as the camera
/// stops delivering frames or the client goes away.
pub async fn predict_live(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    log::info!("Live stream requested");

    let camera = Arc::clone(&state.camera);
    let source = tokio::task::spawn_blocking(move || (*camera)()).await??;
    let feed = LiveFeed::new(source, Arc::clone(&state.predictor), Arc::clone(&state.overlay));

    let (tx, rx) = mpsc::channel::<Bytes>(LIVE_BUFFER);
    tokio::task::spawn_blocking(move || {
        for item in feed {
            match item {
                Ok(part) => {
                    if tx.blocking_send(part).is_err() {
                        log::info!("Live stream client disconnected");
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(ReceiverStream::new(rx).map(Ok::<_, std::io::Error>));
    let headers = [(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)];

    Ok((headers, body))
}
