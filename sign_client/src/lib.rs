//! HTTP client of the sign recognition server.
//!
use std::path::Path;

use anyhow::{bail, Context, Result};
use common::protocol::{ErrorBody, ImagePrediction, VideoPrediction, UPLOAD_FIELD};
use reqwest::multipart;
use serde::de::DeserializeOwned;

pub struct SignClient {
    client: reqwest::Client,
    base_url: String,
}

impl SignClient {
    /// Client of the server at `address`, given as `host:port` or full URL.
    pub fn new(address: &str) -> Self {
        let address = address.trim_end_matches('/');
        let base_url = match address.starts_with("http://") || address.starts_with("https://") {
            true => address.to_owned(),
            false => format!("http://{address}"),
        };

        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Predict the sign of an encoded image.
    pub async fn predict_image_data(
        &self,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<ImagePrediction> {
        self.post_file("predict_image", filename, data).await
    }

    pub async fn predict_image(&self, path: &Path) -> Result<ImagePrediction> {
        let (filename, data) = read_file(path).await?;
        self.predict_image_data(&filename, data).await
    }

    /// Predict the collapsed sign sequence of a video file.
    pub async fn predict_video(&self, path: &Path) -> Result<VideoPrediction> {
        let (filename, data) = read_file(path).await?;
        self.post_file("predict_video", &filename, data).await
    }

    async fn post_file<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<T> {
        let part = multipart::Part::bytes(data).file_name(filename.to_owned());
        let form = multipart::Form::new().part(UPLOAD_FIELD, part);

        let response = self
            .client
            .post(self.url(endpoint))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await?;
            match serde_json::from_slice::<ErrorBody>(&body) {
                Ok(ErrorBody { error }) => bail!("server responded {status}: {error}"),
                Err(_) => bail!("server responded {status}"),
            }
        }

        Ok(response.json().await?)
    }
}

async fn read_file(path: &Path) -> Result<(String, Vec<u8>)> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok((filename, data))
}
