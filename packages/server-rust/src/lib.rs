//! Keel: a service container with a lifecycle server, cron scheduler,
//! persistent event queue and saga coordinator.
//!
//! Values are wired through the [`container::Container`]; those that expose
//! capabilities become [`module::Module`]s, which the lifecycle server in
//! [`server`] turns into HTTP routes, cron jobs, run-group actors and
//! closers. [`app::App`] is the command-line entry point.

pub mod app;
pub mod container;
pub mod cron;
pub mod logging;
pub mod migration;
pub mod module;
pub mod queue;
pub mod saga;
pub mod server;

pub use app::App;
pub use container::{Container, ContainerError, Group, Inject, Optional, Produce};
pub use cron::Scheduler;
pub use module::{Capability, Module, ModuleRegistry};
pub use queue::{QueueDispatcher, QueueFactory, QueueModule};
pub use saga::{SagaRegistry, Step, TxContext};
pub use server::{Lifecycle, ServeError};
