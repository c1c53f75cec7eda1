//! Keel core runtime primitives: clock, codec, typed event bus, run group,
//! named-instance factory, and layered configuration.

pub mod clock;
pub mod codec;
pub mod config;
pub mod duration;
pub mod events;
pub mod factory;
pub mod group;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, TokioClock};
pub use codec::CodecError;
pub use config::{Config, ConfigError, OnReload};
pub use duration::{parse_duration, ParseDurationError};
pub use events::{Dispatcher, Event, EventBus, Listener, SharedDispatcher, Topic};
pub use factory::{Factory, Made};
pub use group::RunGroup;

