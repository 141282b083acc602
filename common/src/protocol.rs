//! Wire types of the HTTP interface.
//!
use serde::{Deserialize, Serialize};

/// Label reported for frames in which no hand was found.
pub const NO_HAND_LABEL: &str = "No Hand Detected";

/// Name of the multipart field carrying uploaded media.
pub const UPLOAD_FIELD: &str = "file";

/// Boundary separating the JPEG parts of the live stream.
pub const STREAM_BOUNDARY: &str = "frame";

/// Content type of the live stream.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Error message for requests without the upload field.
pub const MISSING_FILE_MSG: &str = "No file uploaded";

/// Response of the single image prediction.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ImagePrediction {
    pub prediction: String,
    pub confidence: f32,
}

/// Response of the video prediction, holding the collapsed label sequence.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VideoPrediction {
    pub prediction: String,
}

/// Error body returned for failed requests.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
