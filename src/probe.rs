// Readiness probing for the engine's HTTP API.

use std::time::{Duration, Instant};

use log::{debug, info};
use reqwest::StatusCode;

use crate::{error::WorkerError, shutdown::ShutdownSignal};

// How many failed attempts between "still waiting" log lines.
const LOG_EVERY: u32 = 15;

pub struct ReadinessProber {
    client: reqwest::Client,
    interval: Duration,
    request_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(client: reqwest::Client, interval: Duration, request_timeout: Duration) -> Self {
        Self {
            client,
            interval,
            request_timeout,
        }
    }

    /// The engine answers 405 on some routes when it is up but doesn't like GET.
    fn is_ready(status: StatusCode) -> bool {
        status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED
    }

    /// Polls `url` until it reports ready, `max_wait` elapses, or shutdown is requested.
    /// Returns the number of attempts it took.
    pub async fn wait_until_ready(
        &self,
        url: &str,
        max_wait: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<u32, WorkerError> {
        let deadline = Instant::now() + max_wait;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            // Never let a single probe run past the deadline, but give it a moment at least.
            let timeout = self.request_timeout.min(remaining).max(Duration::from_millis(10));
            match self.client.get(url).timeout(timeout).send().await {
                Ok(response) if Self::is_ready(response.status()) => {
                    info!("Engine ready after {} attempt(s)", attempts);
                    return Ok(attempts);
                }
                Ok(response) => debug!("Probe {} got HTTP {}", attempts, response.status()),
                Err(e) => debug!("Probe {} failed: {}", attempts, e),
            }
            if attempts % LOG_EVERY == 0 {
                info!("Engine not ready yet after {} attempts, retrying...", attempts);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WorkerError::StartupFailure(format!(
                    "{} not ready after {:?} ({} attempts)",
                    url, max_wait, attempts
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval.min(remaining)) => {},
                _ = shutdown.wait() => {
                    info!("Shutdown requested while waiting for engine");
                    return Err(WorkerError::Interrupted);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use axum::{extract::State, http::StatusCode as AxumStatus, routing::get, Router};

    use super::*;
    use crate::testutil;

    // Fails with 503 until the Nth request, then succeeds.
    async fn flaky_server(succeed_on: u32) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/sd-models",
                get(move |State(hits): State<Arc<AtomicU32>>| async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    if n >= succeed_on {
                        AxumStatus::OK
                    } else {
                        AxumStatus::SERVICE_UNAVAILABLE
                    }
                }),
            )
            .with_state(hits.clone());
        let addr = testutil::serve(app).await;
        (format!("http://{}/sd-models", addr), hits)
    }

    fn prober(interval: Duration) -> ReadinessProber {
        ReadinessProber::new(reqwest::Client::new(), interval, Duration::from_secs(2))
    }

    #[test_log::test(tokio::test)]
    async fn test_ready_on_nth_attempt() {
        let (url, hits) = flaky_server(4).await;
        let interval = Duration::from_millis(50);
        let start = Instant::now();
        let attempts = prober(interval)
            .wait_until_ready(&url, Duration::from_secs(10), &ShutdownSignal::new())
            .await
            .unwrap();
        assert!(attempts >= 4);
        assert!(hits.load(Ordering::SeqCst) >= 4);
        // No busy loop: at least three full intervals between four attempts.
        assert!(start.elapsed() >= interval * 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_method_not_allowed_counts_as_ready() {
        let app = Router::new().route("/sd-models", axum::routing::post(|| async { "ok" }));
        let addr = testutil::serve(app).await;
        let attempts = prober(Duration::from_millis(50))
            .wait_until_ready(
                &format!("http://{}/sd-models", addr),
                Duration::from_secs(5),
                &ShutdownSignal::new(),
            )
            .await
            .unwrap();
        assert_eq!(attempts, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_gives_up_at_deadline() {
        let addr = testutil::dead_addr().await;
        let interval = Duration::from_millis(100);
        let max_wait = Duration::from_millis(500);
        let start = Instant::now();
        let err = prober(interval)
            .wait_until_ready(&format!("http://{}/sd-models", addr), max_wait, &ShutdownSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::StartupFailure(_)));
        let elapsed = start.elapsed();
        assert!(elapsed >= max_wait);
        assert!(elapsed <= max_wait + interval, "took {:?}", elapsed);
    }

    #[test_log::test(tokio::test)]
    async fn test_never_ready_server() {
        let (url, hits) = flaky_server(u32::MAX).await;
        let err = prober(Duration::from_millis(50))
            .wait_until_ready(&url, Duration::from_millis(300), &ShutdownSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::StartupFailure(_)));
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancelled_by_shutdown() {
        let addr = testutil::dead_addr().await;
        let shutdown = ShutdownSignal::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                shutdown.trigger();
            });
        }
        let start = Instant::now();
        let err = prober(Duration::from_millis(50))
            .wait_until_ready(&format!("http://{}/", addr), Duration::from_secs(30), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Interrupted));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
