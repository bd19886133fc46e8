// Face detection lives in a separate service; this is the client for it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

/// A detected face, in source-image pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    #[serde(default)]
    pub confidence: f32,
}

#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<Vec<FaceBox>>;
}

/// Posts images to a face-detection REST service (`POST /api/v1/detect`, multipart `image`).
pub struct HttpFaceDetector {
    client: reqwest::Client,
    url: String,
    min_confidence: f32,
    timeout: Duration,
}

impl HttpFaceDetector {
    pub fn new(client: reqwest::Client, base_url: &str, min_confidence: f32, timeout: Duration) -> Self {
        Self {
            client,
            url: format!("{}/api/v1/detect", base_url.trim_end_matches('/')),
            min_confidence,
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct DetectResponse {
    faces: Vec<FaceBox>,
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn detect(&self, image: &[u8]) -> Result<Vec<FaceBox>> {
        let part = Part::bytes(image.to_vec())
            .file_name("image.png")
            .mime_str("image/png")
            .context("failed to build multipart body")?;
        let form = Form::new()
            .part("image", part)
            .text("confidence_threshold", self.min_confidence.to_string());
        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .context("failed to reach face detector")?
            .error_for_status()
            .context("face detector returned an error")?;
        let parsed: DetectResponse = response.json().await.context("failed to parse detector response")?;
        let faces: Vec<FaceBox> = parsed
            .faces
            .into_iter()
            .filter(|f| f.confidence >= self.min_confidence)
            .collect();
        debug!("Detector found {} face(s)", faces.len());
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::Multipart, routing::post, Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::testutil;

    #[test_log::test(tokio::test)]
    async fn test_detect() {
        let app = Router::new().route(
            "/api/v1/detect",
            post(|mut multipart: Multipart| async move {
                let mut image_len = 0;
                while let Some(field) = multipart.next_field().await.unwrap() {
                    if field.name() == Some("image") {
                        image_len = field.bytes().await.unwrap().len();
                    }
                }
                assert_eq!(image_len, 4);
                Json::<Value>(json!({
                    "faces": [
                        {"x1": 10.0, "y1": 20.0, "x2": 50.0, "y2": 70.0, "confidence": 0.98},
                        {"x1": 0.0, "y1": 0.0, "x2": 5.0, "y2": 5.0, "confidence": 0.2},
                    ],
                    "inference_time_ms": 12,
                }))
            }),
        );
        let addr = testutil::serve(app).await;
        let detector = HttpFaceDetector::new(
            reqwest::Client::new(),
            &format!("http://{}/", addr),
            0.5,
            Duration::from_secs(5),
        );
        let faces = detector.detect(b"\x89PNG").await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].x1, 10.0);
        assert_eq!(faces[0].y2, 70.0);
    }

    #[test_log::test(tokio::test)]
    async fn test_detector_error() {
        let app = Router::new().route(
            "/api/v1/detect",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "no model") }),
        );
        let addr = testutil::serve(app).await;
        let detector = HttpFaceDetector::new(
            reqwest::Client::new(),
            &format!("http://{}", addr),
            0.5,
            Duration::from_secs(5),
        );
        assert!(detector.detect(b"\x89PNG").await.is_err());
    }
}
