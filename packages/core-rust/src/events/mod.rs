//! Typed publish/subscribe used for lifecycle hooks, queue replay and saga
//! rollback signaling.

pub mod bus;
pub mod event;

pub use bus::{listener_fn, Dispatcher, EventBus, FnListener, Listener, SharedDispatcher};
pub use event::{topic_of, Decoder, Encoder, Event, Payload, Persistence, Topic};
