//! Event envelope and topic descriptors.
//!
//! An [`Event`] pairs a topic string with a type-erased payload. The topic
//! defaults to the payload's type name, so most code never spells topics
//! out. Events built with [`Event::persistent`] additionally carry an
//! encoder and delivery options; a queue dispatcher diverts those into a
//! driver instead of running listeners inline.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CodecError};

/// Type-erased event payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Serializes a payload into bytes.
pub type Encoder = Arc<dyn Fn() -> Result<Vec<u8>, CodecError> + Send + Sync>;

/// Rebuilds a payload from bytes.
pub type Decoder = Arc<dyn Fn(&[u8]) -> Result<Payload, CodecError> + Send + Sync>;

/// Returns the topic name used for payloads of type `T`.
#[must_use]
pub fn topic_of<T: ?Sized>() -> &'static str {
    type_name::<T>()
}

/// Delivery options for an event that should go through a persistent queue.
#[derive(Clone)]
pub struct Persistence {
    encoder: Encoder,
    /// Delay before the event becomes visible to consumers.
    pub defer: Duration,
    /// Per-attempt handling deadline; the queue default applies when `None`.
    pub handle_timeout: Option<Duration>,
    /// Maximum attempts before the event is moved to the failed channel.
    pub max_attempts: Option<u32>,
    /// Caller-chosen identifier; a random one is generated when `None`.
    pub unique_id: Option<String>,
}

impl Persistence {
    /// Serializes the carried payload.
    ///
    /// # Errors
    ///
    /// Returns the codec error if the payload cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        (self.encoder)()
    }
}

impl fmt::Debug for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("defer", &self.defer)
            .field("handle_timeout", &self.handle_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("unique_id", &self.unique_id)
            .finish_non_exhaustive()
    }
}

/// A topic-addressed, type-erased event.
#[derive(Clone)]
pub struct Event {
    topic: String,
    payload: Payload,
    persistence: Option<Persistence>,
    cancel: Option<CancellationToken>,
}

impl Event {
    /// Creates an event whose topic is the type name of `data`.
    pub fn new<T: Any + Send + Sync>(data: T) -> Self {
        Self::named(topic_of::<T>(), data)
    }

    /// Creates an event with an explicit topic.
    pub fn named<T: Any + Send + Sync>(topic: impl Into<String>, data: T) -> Self {
        Self {
            topic: topic.into(),
            payload: Arc::new(data),
            persistence: None,
            cancel: None,
        }
    }

    /// Rebuilds an event from an already type-erased payload.
    #[must_use]
    pub fn from_payload(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            persistence: None,
            cancel: None,
        }
    }

    /// Creates an event marked for persistent delivery.
    pub fn persistent<T>(data: T) -> Self
    where
        T: Serialize + Any + Send + Sync,
    {
        let data = Arc::new(data);
        let for_encoder = Arc::clone(&data);
        Self {
            topic: topic_of::<T>().to_string(),
            payload: data,
            persistence: Some(Persistence {
                encoder: Arc::new(move || codec::encode(for_encoder.as_ref())),
                defer: Duration::ZERO,
                handle_timeout: None,
                max_attempts: None,
                unique_id: None,
            }),
            cancel: None,
        }
    }

    /// Delays persistent delivery. No effect on transient events.
    #[must_use]
    pub fn deferred(mut self, delay: Duration) -> Self {
        if let Some(p) = self.persistence.as_mut() {
            p.defer = delay;
        }
        self
    }

    /// Overrides the per-attempt handling deadline. No effect on transient events.
    #[must_use]
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        if let Some(p) = self.persistence.as_mut() {
            p.handle_timeout = Some(timeout);
        }
        self
    }

    /// Overrides the attempt budget. No effect on transient events.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        if let Some(p) = self.persistence.as_mut() {
            p.max_attempts = Some(attempts.max(1));
        }
        self
    }

    /// Sets the identifier stored with the persisted envelope.
    #[must_use]
    pub fn with_unique_id(mut self, id: impl Into<String>) -> Self {
        if let Some(p) = self.persistence.as_mut() {
            p.unique_id = Some(id.into());
        }
        self
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Borrows the payload as `T`, if it has that type.
    #[must_use]
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Returns a clone of the type-erased payload.
    #[must_use]
    pub fn payload(&self) -> Payload {
        Arc::clone(&self.payload)
    }

    #[must_use]
    pub fn persistence(&self) -> Option<&Persistence> {
        self.persistence.as_ref()
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Attaches a token the dispatcher cancels when the handler should give
    /// up, e.g. at a queue's handling deadline or on shutdown.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Token cancelled when the handler should stop. `None` for events
    /// dispatched inline, which run for as long as their caller waits.
    #[must_use]
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("topic", &self.topic)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

/// A topic a listener handles, optionally with a decoder for its payload.
///
/// Queue consumers need the decoder to turn stored bytes back into the
/// payload type the listener expects.
#[derive(Clone)]
pub struct Topic {
    name: String,
    decoder: Option<Decoder>,
}

impl Topic {
    /// Topic for payloads of type `T`, without a decoder.
    #[must_use]
    pub fn of<T: Any + Send + Sync>() -> Self {
        Self::named(topic_of::<T>())
    }

    /// Topic for payloads of type `T` that can be rebuilt from bytes.
    #[must_use]
    pub fn decodable<T>() -> Self
    where
        T: DeserializeOwned + Any + Send + Sync,
    {
        Self::named_decodable::<T>(topic_of::<T>())
    }

    /// Topic with an explicit name and no decoder.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decoder: None,
        }
    }

    /// Topic with an explicit name whose payload decodes as `T`.
    #[must_use]
    pub fn named_decodable<T>(name: impl Into<String>) -> Self
    where
        T: DeserializeOwned + Any + Send + Sync,
    {
        Self {
            name: name.into(),
            decoder: Some(Arc::new(|bytes: &[u8]| {
                let value: T = codec::decode(bytes)?;
                Ok(Arc::new(value) as Payload)
            })),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn decoder(&self) -> Option<&Decoder> {
        self.decoder.as_ref()
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("decodable", &self.decoder.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserCreated {
        id: u32,
    }

    #[test]
    fn topic_defaults_to_type_name() {
        let event = Event::new(UserCreated { id: 1 });
        assert_eq!(event.topic(), topic_of::<UserCreated>());
        assert_eq!(event.data::<UserCreated>(), Some(&UserCreated { id: 1 }));
        assert!(event.data::<String>().is_none());
        assert!(!event.is_persistent());
    }

    #[test]
    fn persistent_event_encodes_payload() {
        let event = Event::persistent(UserCreated { id: 9 })
            .deferred(Duration::from_secs(3))
            .with_max_attempts(0)
            .with_unique_id("u-9");
        let p = event.persistence().unwrap();
        assert_eq!(p.defer, Duration::from_secs(3));
        assert_eq!(p.max_attempts, Some(1));
        assert_eq!(p.unique_id.as_deref(), Some("u-9"));

        let bytes = p.encode().unwrap();
        let topic = Topic::decodable::<UserCreated>();
        let payload = (topic.decoder().unwrap())(&bytes).unwrap();
        assert_eq!(payload.downcast_ref::<UserCreated>(), Some(&UserCreated { id: 9 }));
    }

    #[test]
    fn options_ignored_on_transient_events() {
        let event = Event::new(UserCreated { id: 2 }).deferred(Duration::from_secs(1));
        assert!(event.persistence().is_none());
    }
}
