//! Persistent, retrying event queue.

pub mod backoff;
pub mod dispatcher;
pub mod driver;
pub mod memory;
pub mod message;
pub mod module;
#[cfg(feature = "redis")]
pub mod redis_driver;

pub use backoff::BackoffPolicy;
pub use dispatcher::{QueueDispatcher, QueueLengthReport, QueueOptions};
pub use driver::Driver;
pub use memory::MemoryDriver;
pub use message::{Channel, PersistedEvent, QueueError, QueueInfo};
pub use module::{QueueFactory, QueueModule};
#[cfg(feature = "redis")]
pub use redis_driver::RedisDriver;
