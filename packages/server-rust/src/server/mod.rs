//! Process lifecycle: binds transports, collects every actor into one run
//! group, runs it, then closes modules in reverse registration order.

pub mod grpc;
pub mod http;
pub mod shutdown;
pub mod signal;

use std::net::SocketAddr;
use std::sync::Arc;

use keel_core::{Config, ConfigError, Dispatcher, Event, RunGroup, SharedDispatcher};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cron::Scheduler;
use crate::module::ModuleRegistry;

pub use grpc::GrpcServer;
pub use http::{build_router, HttpConfig};
pub use shutdown::{HealthState, ShutdownController};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("bind {transport} on {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cron provider: {0}")]
    Cron(#[source] anyhow::Error),
    #[error(transparent)]
    Run(anyhow::Error),
}

/// Fired just before the HTTP server starts accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnHttpServerStart {
    pub addr: SocketAddr,
}

/// Fired after the HTTP server returned, whatever the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnHttpServerShutdown {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnGrpcServerStart {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnGrpcServerShutdown {
    pub addr: SocketAddr,
}

/// A bare port such as `":8080"` binds every interface.
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

async fn bind(transport: &'static str, addr: &str) -> Result<TcpListener, ServeError> {
    let target = bind_addr(addr);
    let listener = TcpListener::bind(&target).await.map_err(|source| ServeError::Bind {
        transport,
        addr: target.clone(),
        source,
    })?;
    if let Ok(local) = listener.local_addr() {
        info!(transport, %local, "listener bound");
    }
    Ok(listener)
}

async fn fire(dispatcher: &SharedDispatcher, event: Event) {
    if let Err(e) = dispatcher.dispatch(event).await {
        warn!(error = %e, "lifecycle listener failed");
    }
}

/// A run group ready to start, with the addresses actually bound.
pub struct Prepared {
    pub group: RunGroup,
    pub http_addr: Option<SocketAddr>,
    pub grpc_addr: Option<SocketAddr>,
    /// Cancel once the group has stopped and modules are closed; ends the
    /// second-signal watch.
    pub drained: CancellationToken,
}

/// Builder for the `serve` command.
pub struct Lifecycle {
    config: Arc<Config>,
    modules: ModuleRegistry,
    dispatcher: SharedDispatcher,
    grpc: Option<Box<dyn GrpcServer>>,
    scheduler: Scheduler,
    shutdown: Arc<ShutdownController>,
    parent: CancellationToken,
}

impl Lifecycle {
    #[must_use]
    pub fn new(config: Arc<Config>, modules: ModuleRegistry, dispatcher: SharedDispatcher) -> Self {
        Self {
            config,
            modules,
            dispatcher,
            grpc: None,
            scheduler: Scheduler::new(),
            shutdown: Arc::new(ShutdownController::new()),
            parent: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_grpc(mut self, server: Box<dyn GrpcServer>) -> Self {
        self.grpc = Some(server);
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Cancelling `parent` stops the process like a signal does.
    #[must_use]
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = parent;
        self
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the enabled transports and assembles the run group.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Bind`] when a listener cannot be bound and
    /// [`ServeError::Cron`] when a module's job spec is rejected.
    pub async fn prepare(self) -> Result<Prepared, ServeError> {
        let mut group = RunGroup::new();
        let http_config = HttpConfig::from_config(&self.config)?;

        let http_addr = if http_config.disable {
            None
        } else {
            let listener = bind("http", &http_config.addr).await?;
            let addr = listener.local_addr().map_err(|source| ServeError::Bind {
                transport: "http",
                addr: http_config.addr.clone(),
                source,
            })?;
            let router = build_router(&self.modules, &self.shutdown, &http_config);
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = Arc::clone(&self.shutdown);
            let drain = http_config.drain_timeout;
            group.add_cancellable("http", move |token| async move {
                fire(&dispatcher, Event::new(OnHttpServerStart { addr })).await;
                shutdown.set_ready();
                let draining = Arc::clone(&shutdown);
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        token.cancelled().await;
                        draining.begin_drain();
                    })
                    .await;
                shutdown.begin_drain();
                if !shutdown.wait_for_drain(drain).await {
                    warn!("http drain timed out with requests in flight");
                }
                fire(&dispatcher, Event::new(OnHttpServerShutdown { addr })).await;
                info!(%addr, "http server stopped");
                result.map_err(anyhow::Error::from)
            });
            Some(addr)
        };

        let grpc_addr = match (self.config.bool("grpc.disable"), self.grpc) {
            (true, _) => None,
            (false, None) => {
                warn!("grpc enabled but no server provided, skipping");
                None
            }
            (false, Some(mut server)) => {
                let addr_cfg = self.config.string("grpc.addr").unwrap_or_else(|| ":9090".to_string());
                let listener = bind("grpc", &addr_cfg).await?;
                let addr = listener.local_addr().map_err(|source| ServeError::Bind {
                    transport: "grpc",
                    addr: addr_cfg.clone(),
                    source,
                })?;
                for provider in self.modules.grpc_providers() {
                    provider.provide_grpc(server.as_mut());
                }
                let server: Arc<dyn GrpcServer> = Arc::from(server);
                let stopper = Arc::clone(&server);
                let dispatcher = Arc::clone(&self.dispatcher);
                group.add(
                    "grpc",
                    async move {
                        fire(&dispatcher, Event::new(OnGrpcServerStart { addr })).await;
                        let result = server.serve(listener).await;
                        fire(&dispatcher, Event::new(OnGrpcServerShutdown { addr })).await;
                        info!(%addr, "grpc server stopped");
                        result
                    },
                    move |_| stopper.graceful_stop(),
                );
                Some(addr)
            }
        };

        if !self.config.bool("cron.disable") {
            for provider in self.modules.cron_providers() {
                provider.provide_cron(&self.scheduler).map_err(ServeError::Cron)?;
            }
            let scheduler = self.scheduler;
            group.add_cancellable("cron", move |token| async move { scheduler.run(token).await });
        }

        for provider in self.modules.run_group_providers() {
            provider.provide_run_group(&mut group);
        }

        let parent = self.parent;
        let drained = CancellationToken::new();
        let watched = drained.clone();
        group.add_cancellable("signal", move |token| signal::watch(parent, token, watched));

        Ok(Prepared {
            group,
            http_addr,
            grpc_addr,
            drained,
        })
    }

    /// Runs the process until a signal, a parent cancellation or the first
    /// actor exit, then closes every module.
    ///
    /// # Errors
    ///
    /// Returns bind and provider errors from [`Lifecycle::prepare`], or the
    /// error of the actor that ended the group.
    pub async fn serve(self) -> Result<(), ServeError> {
        let modules = self.modules.clone();
        let prepared = self.prepare().await?;
        info!(actors = ?prepared.group.names(), "starting run group");

        let result = prepared.group.run().await;
        match &result {
            Ok(()) => info!("run group exited"),
            Err(e) => warn!(error = %e, "run group exited with error"),
        }
        if let Err(e) = modules.close_all().await {
            warn!(error = %e, "closing modules failed");
        }
        prepared.drained.cancel();
        result.map_err(ServeError::Run)
    }
}
