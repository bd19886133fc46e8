// Error taxonomy for the worker.
//
// Only startup, config and job-platform failures are allowed to end the process.
// Everything that happens while a job is being processed is turned into an
// error-shaped job result by the handler instead.

use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The engine never became ready, or died while we were waiting for it.
    #[error("engine failed to start: {0}")]
    StartupFailure(String),
    /// The caller's input can't be turned into an engine request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// The engine answered, but not with a success.
    #[error("engine returned HTTP {status}")]
    EngineError { status: u16, body: String },
    /// We couldn't talk to the engine at all, even after retrying.
    #[error("failed to reach engine: {0}")]
    TransportError(String),
    #[error("post-processing failed: {0}")]
    PostProcessingFailure(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("job platform error: {0}")]
    Platform(String),
    /// Shutdown was requested before a job arrived.
    #[error("shutdown requested")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Whether this error should take the whole worker down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::StartupFailure(_)
                | WorkerError::Config(_)
                | WorkerError::Platform(_)
                | WorkerError::Io(_)
        )
    }

    /// The `{error, details?}` object the job platform receives.
    pub fn to_job_output(&self) -> Value {
        match self {
            WorkerError::EngineError { status, body } => json!({
                "error": self.to_string(),
                "details": { "status": status, "body": body },
            }),
            _ => json!({ "error": self.to_string() }),
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        WorkerError::TransportError(e.to_string())
    }
}
