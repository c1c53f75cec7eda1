//! Modules and the capabilities the lifecycle server discovers on them.
//!
//! A module is any value registered with the container that describes
//! itself through [`Module::capabilities`]. The lifecycle server never
//! downcasts; it matches on the [`Capability`] tags instead.

pub mod command;

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use keel_core::{Config, ConfigError, RunGroup};
use parking_lot::RwLock;
use serde_json::Value;

use crate::cron::Scheduler;
use crate::migration::{Migration, Seed};
use crate::server::grpc::GrpcServer;

pub use command::{CommandHandler, CommandSet};

// ---------------------------------------------------------------------------
// Module trait
// ---------------------------------------------------------------------------

/// A registered value that exposes zero or more capabilities.
pub trait Module: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Capability descriptors, usually `Capability::X(self.clone())` for
    /// every provider trait the type implements.
    fn capabilities(self: Arc<Self>) -> Vec<Capability>;
}

/// Tagged capability descriptor.
#[derive(Clone)]
pub enum Capability {
    Http(Arc<dyn HttpProvider>),
    Grpc(Arc<dyn GrpcProvider>),
    Cron(Arc<dyn CronProvider>),
    Command(Arc<dyn CommandProvider>),
    RunGroup(Arc<dyn RunGroupProvider>),
    Closer(Arc<dyn CloserProvider>),
    Migration(Arc<dyn MigrationProvider>),
    Seed(Arc<dyn SeedProvider>),
    Config(Arc<dyn ConfigProvider>),
}

impl Capability {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Grpc(_) => "grpc",
            Self::Cron(_) => "cron",
            Self::Command(_) => "command",
            Self::RunGroup(_) => "run_group",
            Self::Closer(_) => "closer",
            Self::Migration(_) => "migration",
            Self::Seed(_) => "seed",
            Self::Config(_) => "config",
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

// ---------------------------------------------------------------------------
// Provider traits
// ---------------------------------------------------------------------------

/// Mounts routes on the shared HTTP router.
pub trait HttpProvider: Send + Sync {
    fn provide_http(&self, router: Router) -> Router;
}

/// Registers services on the opaque gRPC server.
pub trait GrpcProvider: Send + Sync {
    fn provide_grpc(&self, server: &mut dyn GrpcServer);
}

/// Adds jobs to the cron scheduler.
pub trait CronProvider: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if a job spec does not parse.
    fn provide_cron(&self, scheduler: &Scheduler) -> anyhow::Result<()>;
}

/// Adds subcommands to the root command.
pub trait CommandProvider: Send + Sync {
    fn provide_command(&self, commands: &mut CommandSet);
}

/// Adds long-running actors to the process run group.
pub trait RunGroupProvider: Send + Sync {
    fn provide_run_group(&self, group: &mut RunGroup);
}

/// Releases resources after the run group has exited.
#[async_trait]
pub trait CloserProvider: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

/// Contributes ordered schema migrations.
pub trait MigrationProvider: Send + Sync {
    fn provide_migration(&self) -> Vec<Migration>;
}

/// Contributes seed scripts.
pub trait SeedProvider: Send + Sync {
    fn provide_seed(&self) -> Vec<Seed>;
}

/// Default configuration fragment exported by a module.
#[derive(Debug, Clone)]
pub struct ConfigFragment {
    /// Module that owns the fragment.
    pub owner: String,
    /// Default values, nested from the document root.
    pub data: Value,
    /// Human-readable description, written as a comment in YAML output.
    pub comment: String,
}

/// Exports default configuration and validates the loaded document.
pub trait ConfigProvider: Send + Sync {
    fn config_fragments(&self) -> Vec<ConfigFragment>;

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the document is unusable.
    fn validate(&self, _config: &Config) -> Result<(), ConfigError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

/// Append-only list of modules in registration order.
///
/// Cloning shares the underlying list.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Arc<RwLock<Vec<Arc<dyn Module>>>>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: Arc<dyn Module>) {
        tracing::debug!(module = module.name(), "module registered");
        self.modules.write().push(module);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    /// Snapshot of the modules in registration order.
    #[must_use]
    pub fn modules(&self) -> Vec<Arc<dyn Module>> {
        self.modules.read().clone()
    }

    /// Every capability, walking modules forward.
    #[must_use]
    pub fn capabilities(&self) -> Vec<Capability> {
        self.modules()
            .into_iter()
            .flat_map(|m| m.capabilities())
            .collect()
    }

    #[must_use]
    pub fn http_providers(&self) -> Vec<Arc<dyn HttpProvider>> {
        self.filter(|c| match c {
            Capability::Http(p) => Some(p),
            _ => None,
        })
    }

    #[must_use]
    pub fn grpc_providers(&self) -> Vec<Arc<dyn GrpcProvider>> {
        self.filter(|c| match c {
            Capability::Grpc(p) => Some(p),
            _ => None,
        })
    }

    #[must_use]
    pub fn cron_providers(&self) -> Vec<Arc<dyn CronProvider>> {
        self.filter(|c| match c {
            Capability::Cron(p) => Some(p),
            _ => None,
        })
    }

    #[must_use]
    pub fn command_providers(&self) -> Vec<Arc<dyn CommandProvider>> {
        self.filter(|c| match c {
            Capability::Command(p) => Some(p),
            _ => None,
        })
    }

    #[must_use]
    pub fn run_group_providers(&self) -> Vec<Arc<dyn RunGroupProvider>> {
        self.filter(|c| match c {
            Capability::RunGroup(p) => Some(p),
            _ => None,
        })
    }

    #[must_use]
    pub fn migration_providers(&self) -> Vec<Arc<dyn MigrationProvider>> {
        self.filter(|c| match c {
            Capability::Migration(p) => Some(p),
            _ => None,
        })
    }

    #[must_use]
    pub fn seed_providers(&self) -> Vec<Arc<dyn SeedProvider>> {
        self.filter(|c| match c {
            Capability::Seed(p) => Some(p),
            _ => None,
        })
    }

    #[must_use]
    pub fn config_providers(&self) -> Vec<Arc<dyn ConfigProvider>> {
        self.filter(|c| match c {
            Capability::Config(p) => Some(p),
            _ => None,
        })
    }

    /// Closers in reverse registration order.
    #[must_use]
    pub fn closers(&self) -> Vec<Arc<dyn CloserProvider>> {
        let mut closers = self.filter(|c| match c {
            Capability::Closer(p) => Some(p),
            _ => None,
        });
        closers.reverse();
        closers
    }

    /// Runs every closer in reverse registration order.
    ///
    /// Failures are logged and do not stop later closers.
    ///
    /// # Errors
    ///
    /// Returns the first closer error after all have run.
    pub async fn close_all(&self) -> anyhow::Result<()> {
        let mut first = None;
        for closer in self.closers() {
            if let Err(e) = closer.close().await {
                tracing::warn!(error = %e, "module closer failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn filter<T>(&self, pick: impl Fn(Capability) -> Option<T>) -> Vec<T> {
        self.capabilities().into_iter().filter_map(pick).collect()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .modules
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        f.debug_struct("ModuleRegistry").field("modules", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
