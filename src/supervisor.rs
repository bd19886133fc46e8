// Worker lifecycle: start the engine, wait for it, run exactly one job, tear it down.
//
// One job per process. Restarting the engine costs startup time, but it's the only way
// to be sure its GPU memory is released before the platform reuses the container.

use log::{info, warn};

use crate::{
    engine::EngineProcess,
    error::WorkerError,
    handler::JobHandler,
    job::JobSource,
    probe::ReadinessProber,
    WorkerContext,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    WaitingForEngine,
    Ready,
    Processing,
    ShuttingDown,
    Stopped,
}

pub struct Supervisor {
    context: WorkerContext,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(context: WorkerContext) -> Self {
        Self {
            context,
            state: SupervisorState::Starting,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn enter(&mut self, state: SupervisorState) {
        info!("Supervisor: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs the whole lifecycle. The engine is stopped on every path out of here.
    pub async fn run<S: JobSource>(&mut self, source: &mut S) -> Result<(), WorkerError> {
        let engine_config = self.context.config.engine.clone();
        self.enter(SupervisorState::Starting);
        let mut engine = match EngineProcess::spawn(&engine_config) {
            Ok(engine) => engine,
            Err(e) => {
                self.enter(SupervisorState::Stopped);
                return Err(e);
            }
        };

        self.enter(SupervisorState::WaitingForEngine);
        info!("Waiting for engine (pid {:?}) at {}", engine.id(), engine_config.health_url());
        let prober = ReadinessProber::new(
            self.context.client.clone(),
            engine_config.probe_interval(),
            engine_config.probe_request_timeout(),
        );
        let health_url = engine_config.health_url();
        let ready = tokio::select! {
            ready = prober.wait_until_ready(&health_url, engine_config.max_wait(), &self.context.shutdown) => ready.map(|_| ()),
            status = engine.exited() => Err(match status {
                Ok(status) => WorkerError::StartupFailure(format!("engine exited before becoming ready: {}", status)),
                Err(e) => WorkerError::Io(e),
            }),
        };

        let result = match ready {
            Ok(()) => self.serve_one(source).await,
            Err(e) => Err(e),
        };

        self.enter(SupervisorState::ShuttingDown);
        if let Err(e) = engine.shutdown(engine_config.shutdown_grace()).await {
            warn!("Engine shutdown failed: {}", e);
        }
        self.enter(SupervisorState::Stopped);
        result
    }

    async fn serve_one<S: JobSource>(&mut self, source: &mut S) -> Result<(), WorkerError> {
        self.enter(SupervisorState::Ready);
        let shutdown = self.context.shutdown.clone();
        let job = tokio::select! {
            job = source.next_job() => job?,
            _ = shutdown.wait() => return Err(WorkerError::Interrupted),
        };
        let Some(job) = job else {
            info!("No job to process");
            return Ok(());
        };

        self.enter(SupervisorState::Processing);
        let handler = JobHandler::new(&self.context);
        let output = handler.handle(&job).await;
        let delivered = source.complete(&job, output).await;
        // One job per process, whatever happened to it.
        shutdown.trigger();
        delivered
    }
}
