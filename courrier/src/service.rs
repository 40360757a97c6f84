//! Service lifecycle: ordered startup and unconditional, ordered shutdown.
//!
//! ```text
//! startup:  build registry -> start every worker -> open intakes
//! shutdown: close intakes -> stop every worker -> join every worker
//! ```
//!
//! [`RunningService::serve`] opens the intakes (the HTTP RPC listener and the optional AMQP
//! consumer) only once [`startup`] has returned, that is once every worker
//! is running.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::amqp::AmqpIntake;
use crate::config::Config;
use crate::registry::{Registry, RegistryError};
use crate::relay::Relay;
use crate::router::MailRouter;
use crate::web::{app, AppState};
use crate::worker::{Worker, WorkerError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Registry built and every worker running.
pub struct RunningService {
    registry: Arc<Registry>,
    router: MailRouter,
}

/// Build the registry and start every worker.
///
/// If a worker fails to start, those already started are stopped and
/// joined before the error is returned.
pub async fn startup(config: &Config, relay: Arc<dyn Relay>) -> Result<RunningService, StartupError> {
    let registry = Registry::build(&config.mailboxes, relay, config.worker.flush_interval()).await?;
    let registry = Arc::new(registry);

    let mut started = Vec::with_capacity(registry.len());
    for worker in registry.workers() {
        if let Err(e) = worker.start() {
            error!(mailbox = %worker.name(), error = %e, "worker_start_failed");
            stop_and_join(&started).await;
            return Err(e.into());
        }
        started.push(Arc::clone(worker));
    }

    info!(mailboxes = registry.len(), "service_started");

    Ok(RunningService {
        router: MailRouter::new(Arc::clone(&registry)),
        registry,
    })
}

async fn stop_and_join(workers: &[Arc<Worker>]) {
    for worker in workers {
        worker.stop();
    }
    for worker in workers {
        worker.join().await;
    }
}

impl RunningService {
    pub fn router(&self) -> MailRouter {
        self.router.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Open the intakes and serve until `shutdown` resolves or an intake
    /// ends, then shut every worker down.
    ///
    /// Teardown of the workers happens however the intakes end: normally, with
    /// an error, or by panicking.
    pub async fn serve<F>(self, config: &Config, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let result = serve_intakes(config, self.router(), shutdown).await;
        if let Err(e) = &result {
            error!(error = %format!("{e:#}"), "intake_failed");
        }

        self.shutdown().await;
        result
    }

    /// Stop every worker, then wait for all of them.
    ///
    /// Workers are all signalled first so they wind down in parallel.
    pub async fn shutdown(self) {
        info!("service_shutting_down");
        let workers: Vec<_> = self.registry.workers().cloned().collect();
        stop_and_join(&workers).await;
        info!("service_shutdown_complete");
    }
}

/// Run the whole service until `shutdown` resolves.
pub async fn run<F>(config: Config, relay: Arc<dyn Relay>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let service = startup(&config, relay).await.context("Startup failed")?;
    service.serve(&config, shutdown).await
}

async fn serve_intakes<F>(config: &Config, router: MailRouter, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();

    let listener = TcpListener::bind(config.rpc.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.rpc.bind))?;
    info!(address = %config.rpc.bind, "rpc_listening");

    let amqp = match &config.amqp {
        Some(amqp) => Some(AmqpIntake::connect(amqp).await?),
        None => None,
    };

    let mut intakes: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    let http_cancel = cancel.clone();
    let http_app = app(AppState::new(router.clone()));
    intakes.push((
        "rpc",
        tokio::spawn(async move {
            axum::serve(listener, http_app)
                .with_graceful_shutdown(async move { http_cancel.cancelled().await })
                .await
                .context("Server error")
        }),
    ));

    if let Some(amqp) = amqp {
        intakes.push(("amqp", tokio::spawn(amqp.run(router, cancel.clone()))));
    }

    // Any intake ending on its own also triggers shutdown of the others.
    let watchers: Vec<_> = intakes
        .into_iter()
        .map(|(name, handle)| {
            let cancel = cancel.clone();
            async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("{name} intake panicked: {e}")),
                };
                cancel.cancel();
                result.with_context(|| format!("{name} intake failed"))
            }
        })
        .collect();

    let shutdown_cancel = cancel.clone();
    let signal = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown => info!("shutdown_requested"),
            _ = shutdown_cancel.cancelled() => {}
        }
        shutdown_cancel.cancel();
    });

    let results = futures::future::join_all(watchers).await;
    signal.abort();

    info!("intakes_closed");
    results.into_iter().collect::<Result<Vec<_>>>().map(|_| ())
}
