// The job platform side of the worker.
//
// A JobSource hands out jobs and takes their results back. The worker only ever asks
// for one job, but a source doesn't need to know that.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::WorkerError;

fn default_job_id() -> String {
    "local-test".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "default_job_id")]
    pub id: String,
    pub input: Value,
}

#[async_trait]
pub trait JobSource: Send {
    /// Waits for the next job. None means there is nothing to do.
    async fn next_job(&mut self) -> Result<Option<Job>, WorkerError>;
    /// Hands a job's output back to the platform.
    async fn complete(&mut self, job: &Job, output: Value) -> Result<(), WorkerError>;
}

/// Test mode: one job from a JSON file, output printed to stdout.
pub struct LocalJobSource {
    path: PathBuf,
    taken: bool,
}

impl LocalJobSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path, taken: false }
    }
}

#[async_trait]
impl JobSource for LocalJobSource {
    async fn next_job(&mut self) -> Result<Option<Job>, WorkerError> {
        if self.taken {
            return Ok(None);
        }
        self.taken = true;
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            WorkerError::Platform(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let job: Job = serde_json::from_str(&text).map_err(|e| {
            WorkerError::Platform(format!("failed to parse {}: {}", self.path.display(), e))
        })?;
        info!("Loaded test job {} from {}", job.id, self.path.display());
        Ok(Some(job))
    }

    async fn complete(&mut self, job: &Job, output: Value) -> Result<(), WorkerError> {
        let text = serde_json::to_string_pretty(&json!({ "id": job.id, "output": output }))
            .map_err(|e| WorkerError::Platform(format!("failed to serialize output: {}", e)))?;
        println!("{}", text);
        Ok(())
    }
}

/// Pulls jobs over HTTP and posts results back.
pub struct HttpJobSource {
    client: reqwest::Client,
    get_url: String,
    post_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl HttpJobSource {
    pub fn new(
        client: reqwest::Client,
        get_url: String,
        post_url: String,
        api_key: Option<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            get_url,
            post_url,
            api_key,
            poll_interval,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl JobSource for HttpJobSource {
    async fn next_job(&mut self) -> Result<Option<Job>, WorkerError> {
        loop {
            let response = match self.authorize(self.client.get(&self.get_url)).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Failed to poll for jobs: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };
            let status = response.status();
            if status == StatusCode::NO_CONTENT {
                debug!("No job yet");
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            if !status.is_success() {
                return Err(WorkerError::Platform(format!("job poll returned HTTP {}", status)));
            }
            let text = response
                .text()
                .await
                .map_err(|e| WorkerError::Platform(format!("failed to read job: {}", e)))?;
            if text.trim().is_empty() {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            let job: Job = serde_json::from_str(&text)
                .map_err(|e| WorkerError::Platform(format!("failed to parse job: {}", e)))?;
            info!("Received job {}", job.id);
            return Ok(Some(job));
        }
    }

    async fn complete(&mut self, job: &Job, output: Value) -> Result<(), WorkerError> {
        let url = self.post_url.replace("{job_id}", &job.id);
        debug!("Posting output of job {} to {}", job.id, url);
        self.authorize(self.client.post(&url))
            .json(&json!({ "output": output }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| WorkerError::Platform(format!("failed to post output of job {}: {}", job.id, e)))?;
        Ok(())
    }
}
