// Post-processing of generated images: face crops to object storage, and optionally
// the generated images themselves.
//
// Face detection is a soft dependency. Without a detector or a store it is skipped,
// and when it fails the job still succeeds with an empty list.

use std::sync::Arc;

use anyhow::Context;
use image::GenericImageView;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::WorkerError,
    faces::FaceDetector,
    storage::ObjectStore,
    utils,
};

/// A face found in a generated image and the crop we stored for it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectedFace {
    pub id: String,
    pub index: usize,
    /// (x1, y1, x2, y2) of the detection in the source image.
    pub bbox: [f32; 4],
    pub location: String,
}

#[derive(Clone)]
pub struct PostProcessor {
    detector: Option<Arc<dyn FaceDetector>>,
    store: Option<Arc<dyn ObjectStore>>,
    padding: u32,
    key_prefix: String,
}

impl PostProcessor {
    pub fn new(
        detector: Option<Arc<dyn FaceDetector>>,
        store: Option<Arc<dyn ObjectStore>>,
        padding: u32,
        key_prefix: String,
    ) -> Self {
        Self {
            detector,
            store,
            padding,
            key_prefix,
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Detects faces in one base64 image and stores a crop of each.
    /// Never fails: problems are logged and yield an empty list.
    pub async fn detect_faces(&self, job_id: &str, image: &str) -> Vec<DetectedFace> {
        let (Some(detector), Some(store)) = (&self.detector, &self.store) else {
            debug!("Face detection not configured, skipping");
            return Vec::new();
        };
        match self.try_detect_faces(detector.as_ref(), store.as_ref(), job_id, image).await {
            Ok(faces) => faces,
            Err(e) => {
                warn!("{}", e);
                Vec::new()
            }
        }
    }

    async fn try_detect_faces(
        &self,
        detector: &dyn FaceDetector,
        store: &dyn ObjectStore,
        job_id: &str,
        image: &str,
    ) -> Result<Vec<DetectedFace>, WorkerError> {
        let fail = |e: anyhow::Error| WorkerError::PostProcessingFailure(format!("{:#}", e));
        let bytes = utils::decode_base64_image(image).map_err(fail)?;
        let decoded = image::load_from_memory(&bytes)
            .context("failed to decode generated image")
            .map_err(fail)?;
        let boxes = detector.detect(&bytes).await.map_err(fail)?;
        info!("Found {} face(s) in job {}", boxes.len(), job_id);
        let (width, height) = decoded.dimensions();

        let mut faces = Vec::with_capacity(boxes.len());
        for (index, face) in boxes.iter().enumerate() {
            let Some(region) = utils::padded_region(face, self.padding, width, height) else {
                debug!("Face {} lies outside the image, skipping", index);
                continue;
            };
            let png = utils::crop_png(&decoded, region).map_err(fail)?;
            let id = Uuid::new_v4().to_string();
            let key = utils::object_key(&self.key_prefix, job_id, &format!("{}.png", id));
            let location = store.put_png(&key, png).await.map_err(fail)?;
            faces.push(DetectedFace {
                id,
                index,
                bbox: [face.x1, face.y1, face.x2, face.y2],
                location,
            });
        }
        Ok(faces)
    }

    /// Uploads every generated image and returns their locations, in order.
    pub async fn upload_images(&self, job_id: &str, images: &[Value]) -> Result<Vec<String>, WorkerError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| WorkerError::PostProcessingFailure("no object store configured".to_string()))?;
        let fail = |e: anyhow::Error| WorkerError::PostProcessingFailure(format!("{:#}", e));
        let mut locations = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            let image = image
                .as_str()
                .ok_or_else(|| WorkerError::PostProcessingFailure(format!("image {} is not a string", i)))?;
            let bytes = utils::decode_base64_image(image).map_err(fail)?;
            let key = utils::object_key(&self.key_prefix, job_id, &format!("images/{}.png", i));
            locations.push(store.put_png(&key, bytes).await.map_err(fail)?);
        }
        Ok(locations)
    }
}
