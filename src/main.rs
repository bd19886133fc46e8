use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use crate::{
    config::WorkerConfig,
    error::WorkerError,
    faces::{FaceDetector, HttpFaceDetector},
    job::{HttpJobSource, LocalJobSource},
    shutdown::ShutdownSignal,
    storage::{ObjectStore, S3Store},
    supervisor::Supervisor,
};

mod config;
mod engine;
mod error;
mod faces;
mod gateway;
mod handler;
mod job;
mod postprocess;
mod probe;
mod shaper;
mod shutdown;
mod storage;
mod supervisor;
#[cfg(test)]
mod testutil;
mod utils;

/// Everything the worker shares between components, built once at startup.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub client: reqwest::Client,
    pub detector: Option<Arc<dyn FaceDetector>>,
    pub store: Option<Arc<dyn ObjectStore>>,
    pub shutdown: ShutdownSignal,
}

impl WorkerContext {
    pub async fn new(config: WorkerConfig, shutdown: ShutdownSignal) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;

        let detector = match &config.faces.url {
            Some(url) => {
                info!("Face detection via {}", url);
                Some(Arc::new(HttpFaceDetector::new(
                    client.clone(),
                    url,
                    config.faces.min_confidence,
                    Duration::from_secs(config.faces.timeout_secs),
                )) as Arc<dyn FaceDetector>)
            }
            None => {
                info!("FACE_DETECTOR_URL not set, face detection disabled");
                None
            }
        };
        let store = match &config.storage.bucket {
            Some(bucket) => Some(Arc::new(
                S3Store::new(bucket.clone(), config.storage.region.clone()).await,
            ) as Arc<dyn ObjectStore>),
            None => {
                info!("S3_BUCKET_NAME not set, uploads disabled");
                None
            }
        };

        Ok(Self {
            config,
            client,
            detector,
            store,
            shutdown,
        })
    }
}

#[derive(Parser, Debug)]
struct CommandLineFlags {
    #[arg(long = "config", short)]
    pub config_path: Option<PathBuf>,
    /// Run the job in this file instead of polling the job platform.
    #[arg(long)]
    pub test_input: Option<PathBuf>,
}

/// Resolves on SIGINT or SIGTERM.
async fn termination_requested() -> std::io::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = terminate.recv() => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let mut config = WorkerConfig::load(args.config_path.as_deref())
        .context("failed to initialize config")?;
    if let Some(path) = args.test_input {
        config.platform.test_mode = true;
        config.platform.test_input_path = path;
    }
    config.validate()?;
    info!(
        "Engine {} at {}, test mode {}",
        config.engine.program, config.engine.api_url, config.platform.test_mode
    );

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::task::spawn(async move {
            match termination_requested().await {
                Ok(()) => warn!("Termination requested, shutting down after the current step"),
                Err(e) => error!("Failed to listen for signals: {}", e),
            }
            shutdown.trigger();
        });
    }

    let context = WorkerContext::new(config, shutdown).await?;
    let platform = context.config.platform.clone();
    let mut supervisor = Supervisor::new(context.clone());
    let result = if platform.test_mode {
        let mut source = LocalJobSource::new(platform.test_input_path);
        supervisor.run(&mut source).await
    } else {
        // validate() has checked both URLs are present.
        let mut source = HttpJobSource::new(
            context.client.clone(),
            platform.job_get_url.unwrap_or_default(),
            platform.job_post_url.unwrap_or_default(),
            platform.api_key,
            Duration::from_millis(platform.poll_interval_ms),
        );
        supervisor.run(&mut source).await
    };

    info!("Supervisor stopped in state {:?}", supervisor.state());
    match result {
        Ok(()) => {
            info!("Worker finished");
            Ok(())
        }
        Err(WorkerError::Interrupted) => {
            info!("Worker interrupted before a job arrived");
            Ok(())
        }
        Err(e) => {
            if !e.is_fatal() {
                warn!("Unexpected error outside a job: {}", e);
            }
            Err(anyhow::Error::new(e).context("worker failed"))
        }
    }
}
