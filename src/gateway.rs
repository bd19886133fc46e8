// Talks to the engine's generation endpoints.

use std::{fmt, time::Duration};

use log::{debug, trace, warn};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};

use crate::{config::EngineConfig, error::WorkerError, shaper::ShapedRequest};

/// Statuses the engine's reverse proxy hands out while it is busy or restarting.
const TRANSIENT: [StatusCode; 3] = [
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum CallError {
    Status { status: StatusCode, body: String },
    Transport(reqwest::Error),
}

impl CallError {
    fn is_transient(&self) -> bool {
        match self {
            CallError::Status { status, .. } => TRANSIENT.contains(status),
            // Timeouts are not retried; a timed-out generation is likely still running.
            CallError::Transport(e) => e.is_connect(),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Status { status, .. } => write!(f, "HTTP {}", status),
            CallError::Transport(e) => write!(f, "{}", e),
        }
    }
}

pub struct InferenceGateway {
    client: reqwest::Client,
    engine: EngineConfig,
}

impl InferenceGateway {
    pub fn new(client: reqwest::Client, engine: EngineConfig) -> Self {
        Self { client, engine }
    }

    /// Sends one shaped request and returns the engine's JSON object.
    pub async fn generate(&self, request: &ShapedRequest) -> Result<Map<String, Value>, WorkerError> {
        let url = self.engine.endpoint(request.route());
        let body = request.to_body();
        let retries = self.engine.max_attempts.saturating_sub(1) as usize;
        // 100ms, 200ms, 400ms, ... capped.
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(MAX_BACKOFF)
            .take(retries);
        debug!("POST {}", url);
        let result = RetryIf::spawn(
            strategy,
            || self.post_once(&url, &body),
            |e: &CallError| {
                let transient = e.is_transient();
                if transient {
                    warn!("Engine call failed ({}), retrying", e);
                }
                transient
            },
        )
        .await;
        result.map_err(|e| match e {
            CallError::Status { status, body } => WorkerError::EngineError {
                status: status.as_u16(),
                body,
            },
            CallError::Transport(e) => WorkerError::TransportError(format!("{}: {}", url, e)),
        })
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<Map<String, Value>, CallError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(self.engine.inference_timeout())
            .send()
            .await
            .map_err(CallError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(CallError::Transport)?;
        trace!("Response: {}", text);
        if !status.is_success() {
            return Err(CallError::Status { status, body: text });
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            // A 2xx that isn't a JSON object is still the engine's fault.
            _ => Err(CallError::Status { status, body: text }),
        }
    }
}
