//! Cron scheduler, schedule parsing, middleware and offset persistence.

pub mod middleware;
pub mod offset;
pub mod schedule;
pub mod scheduler;

pub use offset::{MemoryOffsetStore, OffsetStore};
#[cfg(feature = "redis")]
pub use offset::RedisOffsetStore;
pub use schedule::{CronSchedule, Every, Schedule, ScheduleError, ScheduleParser, StandardParser};
pub use scheduler::{
    Descriptor, JobContext, JobFn, JobId, JobInfo, Middleware, OffsetBinding, Scheduler,
    SchedulerBuilder,
};
