//! Distributed sagas: journaled forward steps with compensations.

pub mod log;
pub mod module;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod registry;
pub mod store;

pub use log::{LogType, SagaLog};
pub use module::SagaModule;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSagaStore;
pub use registry::{rollback_topic, RollbackRequest, SagaError, SagaRegistry, Step, StepHandle, Transaction, TxContext};
pub use store::{MemorySagaStore, SagaStore};
