// The single-job entry point: shape, generate, post-process.
//
// handle() never fails. Whatever goes wrong ends up in an {error, details?} object so
// the job platform always gets a well-formed answer.

use log::{debug, error, info};
use serde_json::{json, Value};

use crate::{
    error::WorkerError,
    gateway::InferenceGateway,
    job::Job,
    postprocess::PostProcessor,
    shaper::RequestShaper,
    WorkerContext,
};

pub struct JobHandler {
    shaper: RequestShaper,
    gateway: InferenceGateway,
    post: PostProcessor,
    direct_return: bool,
}

impl JobHandler {
    pub fn new(context: &WorkerContext) -> Self {
        let config = &context.config;
        Self {
            shaper: RequestShaper::new(config.modifiers.clone(), config.face_swap.clone()),
            gateway: InferenceGateway::new(context.client.clone(), config.engine.clone()),
            post: PostProcessor::new(
                context.detector.clone(),
                context.store.clone(),
                config.faces.padding,
                config.storage.key_prefix.clone(),
            ),
            direct_return: config.storage.direct_return,
        }
    }

    pub async fn handle(&self, job: &Job) -> Value {
        match self.run(job).await {
            Ok(output) => {
                info!("Job {} completed", job.id);
                output
            }
            Err(e) => {
                error!("Job {} failed: {}", job.id, e);
                e.to_job_output()
            }
        }
    }

    async fn run(&self, job: &Job) -> Result<Value, WorkerError> {
        let request = self.shaper.shape(&job.input)?;
        info!("Job {}: generating via {}", job.id, request.route());
        if let Some(args) = request.face_swap() {
            debug!("Job {}: face swap at strength {}", job.id, args.restore_visibility);
        }
        let mut result = self.gateway.generate(&request).await?;

        // Detecting faces on a face-swap result would only find the swapped face again.
        if request.is_face_swap() {
            debug!("Job {} is a face-swap job, skipping face detection", job.id);
        } else {
            let first_image = result
                .get("images")
                .and_then(Value::as_array)
                .and_then(|images| images.first())
                .and_then(Value::as_str);
            let faces = match first_image {
                Some(image) => self.post.detect_faces(&job.id, image).await,
                None => Vec::new(),
            };
            result.insert("detected_faces".to_string(), json!(faces));
        }

        // Face-swap results go back inline; they never touch storage.
        if !self.direct_return && self.post.has_store() && !request.is_face_swap() {
            let images = match result.remove("images") {
                Some(Value::Array(images)) => images,
                _ => Vec::new(),
            };
            let locations = self.post.upload_images(&job.id, &images).await?;
            result.insert("image_urls".to_string(), json!(locations));
        }

        Ok(Value::Object(result))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use axum::{extract::State, http::StatusCode as AxumStatus, routing::post, Json, Router};

    use super::*;
    use crate::{
        config::WorkerConfig,
        faces::FaceDetector,
        postprocess::tests::{one_face, FixedDetector},
        shutdown::ShutdownSignal,
        storage::{tests::MemoryStore, ObjectStore},
        testutil,
    };

    struct Fixture {
        handler: JobHandler,
        detector: Arc<FixedDetector>,
        store: Arc<MemoryStore>,
        image: String,
        hits: Arc<AtomicU32>,
    }

    // A handler wired to a fake engine that returns one 64x64 image, or `status` if it isn't OK.
    async fn fixture(status: AxumStatus, direct_return: bool) -> Fixture {
        let image = testutil::png_base64(64, 64);
        let hits = Arc::new(AtomicU32::new(0));
        let body = json!({"images": [image.clone()], "parameters": {}, "info": "{}"});
        let app = Router::new()
            .route(
                "/sdapi/v1/txt2img",
                post(move |State(hits): State<Arc<AtomicU32>>| {
                    let body = body.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        if status == AxumStatus::OK {
                            (status, Json(body))
                        } else {
                            (status, Json(json!({"detail": "out of memory"})))
                        }
                    }
                }),
            )
            .with_state(hits.clone());
        let addr = testutil::serve(app).await;

        let mut config = WorkerConfig::default();
        config.engine.api_url = format!("http://{}/sdapi/v1", addr);
        config.engine.max_attempts = 1;
        config.storage.direct_return = direct_return;
        let detector = Arc::new(one_face());
        let store = Arc::new(MemoryStore::default());
        let context = WorkerContext {
            config,
            client: reqwest::Client::new(),
            detector: Some(detector.clone() as Arc<dyn FaceDetector>),
            store: Some(store.clone() as Arc<dyn ObjectStore>),
            shutdown: ShutdownSignal::new(),
        };
        Fixture {
            handler: JobHandler::new(&context),
            detector,
            store,
            image,
            hits,
        }
    }

    fn job(input: Value) -> Job {
        Job {
            id: "job-1".to_string(),
            input,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_cat_job() {
        let f = fixture(AxumStatus::OK, true).await;
        let output = f.handler.handle(&job(json!({"prompt": "a cat"}))).await;
        assert_eq!(output["images"], json!([f.image]));
        let faces = output["detected_faces"].as_array().unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0]["index"], 0);
        assert!(faces[0]["id"].is_string());
        assert_eq!(*f.detector.calls.lock().unwrap(), 1);
        assert_eq!(f.store.objects.lock().unwrap().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_face_swap_job_skips_detection() {
        let f = fixture(AxumStatus::OK, true).await;
        let output = f
            .handler
            .handle(&job(json!({"prompt": "a portrait", "face_swap_image": "aGVsbG8="})))
            .await;
        assert_eq!(output["images"], json!([f.image]));
        assert!(output.get("detected_faces").is_none());
        assert_eq!(*f.detector.calls.lock().unwrap(), 0);
        assert!(f.store.objects.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_plugin_scripts_skip_detection() {
        let f = fixture(AxumStatus::OK, true).await;
        let output = f
            .handler
            .handle(&job(json!({"prompt": "x", "alwayson_scripts": {"reactor": {"args": []}}})))
            .await;
        assert!(output.get("detected_faces").is_none());
        assert_eq!(*f.detector.calls.lock().unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_malformed_input() {
        let f = fixture(AxumStatus::OK, true).await;
        let output = f.handler.handle(&job(json!({"prompt": 7}))).await;
        assert_eq!(output["error"], "malformed request: prompt must be a string");
        // The engine is never called for unusable input.
        assert_eq!(f.hits.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_engine_error() {
        let f = fixture(AxumStatus::INTERNAL_SERVER_ERROR, true).await;
        let output = f.handler.handle(&job(json!({"prompt": "a cat"}))).await;
        assert_eq!(output["error"], "engine returned HTTP 500");
        assert_eq!(output["details"]["status"], 500);
        assert!(output["details"]["body"].as_str().unwrap().contains("out of memory"));
    }

    #[test_log::test(tokio::test)]
    async fn test_face_swap_job_never_uploads() {
        let f = fixture(AxumStatus::OK, false).await;
        let output = f
            .handler
            .handle(&job(json!({"prompt": "a portrait", "face_swap_image": "aGVsbG8="})))
            .await;
        assert_eq!(output["images"], json!([f.image]));
        assert!(output.get("image_urls").is_none());
        assert!(output.get("detected_faces").is_none());
        assert!(f.store.objects.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_instead_of_direct_return() {
        let f = fixture(AxumStatus::OK, false).await;
        let output = f.handler.handle(&job(json!({"prompt": "a cat"}))).await;
        assert!(output.get("images").is_none());
        assert_eq!(output["image_urls"], json!(["mem://faces/job-1/images/0.png"]));
        // One face crop plus the image itself.
        assert_eq!(f.store.objects.lock().unwrap().len(), 2);
    }
}
