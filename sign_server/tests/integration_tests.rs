use std::{
    io::Cursor,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use common::protocol::{ErrorBody, ImagePrediction};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use sign_server::{
    endpoints::{router, AppState},
    hand::{HandLandmarks, HandLocalizer, LandmarkDetector},
    labels::LabelSet,
    live::{LiveFeed, Overlay},
    nn::Classifier,
    predictor::FramePredictor,
    sensors::{CameraOpener, FrameSource},
    video::{process_video, Frames, VideoOpener},
};
use tower::ServiceExt;
use tract_onnx::prelude::tract_ndarray::Array4;

const BOUNDARY: &str = "XyZBoundary";

/// Synthetic frames: red 255 shows a hand, green selects the class, blue is the frame index.
fn frame(hand: bool, class: u8, index: u8) -> RgbImage {
    RgbImage::from_pixel(160, 120, Rgb([if hand { 255 } else { 0 }, class, index]))
}

/// Detector finding a hand in the center of red frames, recording the frames it saw.
#[derive(Default)]
struct RedHandDetector {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl LandmarkDetector for RedHandDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Option<HandLandmarks>> {
        let pixel = frame[(0, 0)];
        self.seen.lock().unwrap().push(pixel[2]);

        Ok((pixel[0] == 255).then(|| HandLandmarks {
            points: vec![[0.3, 0.3], [0.7, 0.6], [0.5, 0.5]],
            presence: 0.99,
        }))
    }
}

/// Classifier voting for the class encoded in the green channel.
struct GreenClassifier {
    num_classes: usize,
}

impl Classifier for GreenClassifier {
    fn classify(&self, input: Array4<f32>) -> Result<Vec<f32>> {
        let class = (input[[0, 0, 0, 1]] * 255.0).round() as usize % self.num_classes;
        let rest = 0.1 / (self.num_classes - 1) as f32;
        Ok((0..self.num_classes)
            .map(|i| if i == class { 0.9 } else { rest })
            .collect())
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.num_classes)
    }
}

fn predictor_with_log() -> (FramePredictor, Arc<Mutex<Vec<u8>>>) {
    let detector = RedHandDetector::default();
    let seen = Arc::clone(&detector.seen);
    let labels = LabelSet::new(vec!["A".into(), "B".into(), "C".into()]).unwrap();
    let predictor = FramePredictor::new(
        HandLocalizer::new(Box::new(detector)),
        Box::new(GreenClassifier { num_classes: 3 }),
        labels,
    );

    (predictor, seen)
}

/// Camera yielding a fixed number of hand frames, flagging when it is released.
struct FakeCamera {
    remaining: usize,
    released: Arc<AtomicBool>,
}

impl FrameSource for FakeCamera {
    fn capture(&mut self) -> Option<RgbImage> {
        self.remaining = self.remaining.checked_sub(1)?;
        Some(frame(true, 1, self.remaining as u8))
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Video opener reading the stored upload as one class per byte, `255` for no hand.
///
/// Every byte becomes five frames, so a step of five classifies each byte once.
fn byte_video_opener() -> VideoOpener {
    Arc::new(|path: &Path| -> Result<Frames> {
        let data = std::fs::read(path)?;
        let frames = data
            .into_iter()
            .flat_map(|byte| std::iter::repeat(byte).take(5))
            .enumerate()
            .map(|(i, byte)| frame(byte != 255, byte, i as u8));
        Ok(Box::new(frames) as Frames)
    })
}

fn app(num_live_frames: usize, released: Arc<AtomicBool>) -> (Router, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let camera: CameraOpener = Arc::new(move || {
        Ok(Box::new(FakeCamera {
            remaining: num_live_frames,
            released: Arc::clone(&released),
        }) as Box<dyn FrameSource>)
    });

    let state = Arc::new(AppState {
        predictor: Arc::new(predictor_with_log().0),
        overlay: Arc::new(Overlay::without_text()),
        camera,
        video: byte_video_opener(),
        upload_dir: root.path().join("uploads"),
        video_step: 5,
    });

    (router(state, 16 * 1024 * 1024), root)
}

fn png(image: RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(vec![]);
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, ImageOutputFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn multipart_request(uri: &str, field: &str, filename: &str, data: &[u8]) -> Request<Body> {
    let body = [
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
             filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
        data,
        format!("\r\n--{BOUNDARY}--\r\n").as_bytes(),
    ]
    .concat();

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    hyper::body::to_bytes(response.into_body())
        .await
        .unwrap()
        .to_vec()
}

#[test]
fn test_video_samples_every_fifth_frame() -> Result<()> {
    let (predictor, seen) = predictor_with_log();
    let frames = (0..12).map(|i| frame(true, 0, i));

    let sequence = process_video(&predictor, frames, 5)?;

    assert_eq!(*seen.lock().unwrap(), vec![0, 5, 10]);
    assert_eq!(sequence, "A");

    Ok(())
}

#[test]
fn test_video_dropped_frame_keeps_runs_adjacent() -> Result<()> {
    let (predictor, _) = predictor_with_log();
    let frames = (0..12).map(|i| frame(i != 5, 0, i));

    assert_eq!(process_video(&predictor, frames, 5)?, "A");

    Ok(())
}

#[test]
fn test_video_sequence_collapsed() -> Result<()> {
    let (predictor, _) = predictor_with_log();
    // Classes per sampled frame: A A B B A, with hand-less frames in between
    let classes = [0, 0, 1, 1, 0];
    let frames = classes
        .iter()
        .enumerate()
        .flat_map(|(i, &class)| [frame(true, class, i as u8), frame(false, 0, 0)]);

    assert_eq!(process_video(&predictor, frames, 1)?, "A B A");

    Ok(())
}

#[test]
fn test_video_without_hands_or_frames() -> Result<()> {
    let (predictor, _) = predictor_with_log();

    let frames = (0..7).map(|i| frame(false, 0, i));
    assert_eq!(process_video(&predictor, frames, 5)?, "");
    assert_eq!(process_video(&predictor, Vec::new(), 5)?, "");
    assert!(process_video(&predictor, Vec::new(), 0).is_err());

    Ok(())
}

#[test]
fn test_live_feed_releases_camera_on_cancel() -> Result<()> {
    let (predictor, _) = predictor_with_log();
    let released = Arc::new(AtomicBool::new(false));
    let camera = FakeCamera {
        remaining: 100,
        released: Arc::clone(&released),
    };

    let mut feed = LiveFeed::new(camera, Arc::new(predictor), Arc::new(Overlay::without_text()));
    let part = feed.next().expect("one part")?;
    assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8"));
    assert!(part.ends_with(b"\r\n"));
    assert!(!released.load(Ordering::SeqCst));

    drop(feed);
    assert!(released.load(Ordering::SeqCst));

    Ok(())
}

#[test]
fn test_live_feed_ends_with_source() -> Result<()> {
    let (predictor, _) = predictor_with_log();
    let camera = FakeCamera {
        remaining: 3,
        released: Arc::new(AtomicBool::new(false)),
    };

    let feed = LiveFeed::new(camera, Arc::new(predictor), Arc::new(Overlay::without_text()));
    let parts = feed.collect::<Result<Vec<_>>>()?;
    assert_eq!(parts.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_predict_image() {
    let (app, _root) = app(0, Arc::new(AtomicBool::new(false)));
    let request = multipart_request("/predict_image", "file", "hand.png", &png(frame(true, 2, 0)));

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let prediction: ImagePrediction = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(prediction.prediction, "C");
    assert!((prediction.confidence - 0.9).abs() < 1e-6);
}

#[tokio::test]
async fn test_predict_image_without_hand() {
    let (app, _root) = app(0, Arc::new(AtomicBool::new(false)));
    let request = multipart_request("/predict_image", "file", "empty.png", &png(frame(false, 2, 0)));

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(
        body,
        serde_json::json!({"prediction": "No Hand Detected", "confidence": 0.0})
    );
}

#[tokio::test]
async fn test_missing_file_field() {
    for uri in ["/predict_image", "/predict_video"] {
        let (app, _root) = app(0, Arc::new(AtomicBool::new(false)));
        let request = multipart_request(uri, "other", "hand.png", b"ignored");

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body, ErrorBody::new("No file uploaded"));
    }
}

#[tokio::test]
async fn test_request_without_multipart_body() {
    let (app, _root) = app(0, Arc::new(AtomicBool::new(false)));
    let request = Request::builder()
        .method("POST")
        .uri("/predict_image")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_corrupt_image_is_server_error() {
    let (app, _root) = app(0, Arc::new(AtomicBool::new(false)));
    let request = multipart_request("/predict_image", "file", "broken.png", b"not an image");

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Only the outermost context reaches the client
    let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body, ErrorBody::new("failed to decode image"));
}

#[tokio::test]
async fn test_predict_video() {
    let (app, root) = app(0, Arc::new(AtomicBool::new(false)));
    let video = [0, 0, 255, 1, 255, 0];
    let request = multipart_request("/predict_video", "file", "../x y.mp4", &video);

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body, serde_json::json!({"prediction": "A B A"}));

    // Stored flat under the upload directory with a sanitized name
    let stored = root.path().join("uploads").join("x_y.mp4");
    assert_eq!(std::fs::read(stored).unwrap(), video);
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_server_error_hides_paths() {
    let (app, root) = app(0, Arc::new(AtomicBool::new(false)));
    let root_dir = root.path().display().to_string();
    // Directory in place of the upload file makes storing fail
    std::fs::create_dir_all(root.path().join("uploads").join("clip.mp4")).unwrap();
    let request = multipart_request("/predict_video", "file", "clip.mp4", b"data");

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body, ErrorBody::new("failed to store upload"));
    assert!(!body.error.contains(&root_dir));
}

#[tokio::test]
async fn test_live_stream() {
    let released = Arc::new(AtomicBool::new(false));
    let (app, _root) = app(3, Arc::clone(&released));
    let request = Request::builder()
        .uri("/predict_live")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );

    // The stream ends once the camera runs out of frames
    let body = body_bytes(response).await;
    let marker = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let parts = body.windows(marker.len()).filter(|w| *w == &marker[..]).count();
    assert_eq!(parts, 3);
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_healthcheck() {
    let (app, _root) = app(0, Arc::new(AtomicBool::new(false)));
    let request = Request::builder()
        .uri("/healthcheck")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"healthy");
}
