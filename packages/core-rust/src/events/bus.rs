//! Synchronous in-process event bus.
//!
//! Listeners run one after another on the dispatching task, in
//! registration order. The first listener error stops the dispatch and is
//! returned to the caller.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::event::{Decoder, Event, Topic};

/// Callback interested in one or more topics.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Topics this listener handles.
    fn listen(&self) -> Vec<Topic>;

    /// Handles one event.
    async fn process(&self, event: &Event) -> anyhow::Result<()>;
}

/// Something events can be dispatched through and listeners attached to.
///
/// Implemented by [`EventBus`] and by decorators such as the persistent
/// queue dispatcher, which is why consumers hold `Arc<dyn Dispatcher>`.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Delivers an event to every listener subscribed to its topic.
    async fn dispatch(&self, event: Event) -> anyhow::Result<()>;

    /// Registers a listener.
    fn subscribe(&self, listener: Arc<dyn Listener>);

    /// Decoder registered by some subscriber for `topic`, used to rebuild
    /// payloads that were stored as bytes.
    fn decoder(&self, _topic: &str) -> Option<Decoder> {
        None
    }
}

/// Shared dispatcher handle.
pub type SharedDispatcher = Arc<dyn Dispatcher>;

struct Subscription {
    topics: Vec<Topic>,
    listener: Arc<dyn Listener>,
}

/// Default synchronous bus.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    fn matching(&self, topic: &str) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.topics.iter().any(|t| t.name() == topic))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Dispatcher for EventBus {
    async fn dispatch(&self, event: Event) -> anyhow::Result<()> {
        for sub in self.matching(event.topic()) {
            sub.listener.process(&event).await?;
        }
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn Listener>) {
        let topics = listener.listen();
        self.subscriptions
            .write()
            .push(Arc::new(Subscription { topics, listener }));
    }

    fn decoder(&self, topic: &str) -> Option<Decoder> {
        self.subscriptions
            .read()
            .iter()
            .flat_map(|s| s.topics.iter())
            .filter(|t| t.name() == topic)
            .find_map(|t| t.decoder().cloned())
    }
}

/// Listener backed by an async closure.
pub struct FnListener<F> {
    topics: Vec<Topic>,
    handler: F,
}

#[async_trait]
impl<F, Fut> Listener for FnListener<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn listen(&self) -> Vec<Topic> {
        self.topics.clone()
    }

    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        (self.handler)(event.clone()).await
    }
}

/// Wraps an async closure as a listener for the given topics.
pub fn listener_fn<F, Fut>(topics: Vec<Topic>, handler: F) -> Arc<dyn Listener>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnListener { topics, handler })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    struct Ping(u32);

    #[derive(Debug, Clone)]
    struct Pong;

    fn recorder(tag: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Listener> {
        listener_fn(vec![Topic::of::<Ping>()], move |event| {
            let log = Arc::clone(&log);
            async move {
                let ping = event.data::<Ping>().map_or(0, |p| p.0);
                log.lock().push(format!("{tag}:{ping}"));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn listeners_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.subscribe(recorder("a", log.clone()));
        bus.subscribe(recorder("b", log.clone()));

        bus.dispatch(Event::new(Ping(1))).await.unwrap();
        assert_eq!(*log.lock(), vec!["a:1", "b:1"]);
    }

    #[tokio::test]
    async fn unrelated_topics_are_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.subscribe(recorder("a", log.clone()));

        bus.dispatch(Event::new(Pong)).await.unwrap();
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn first_error_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let bus = EventBus::new();
        bus.subscribe(listener_fn(vec![Topic::of::<Ping>()], |_| async {
            anyhow::bail!("boom")
        }));
        let counted = Arc::clone(&calls);
        bus.subscribe(listener_fn(vec![Topic::of::<Ping>()], move |_| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        let err = bus.dispatch(Event::new(Ping(2))).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn named_topics_route_by_string() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        let sink = log.clone();
        bus.subscribe(listener_fn(vec![Topic::named("custom")], move |e| {
            let sink = sink.clone();
            async move {
                sink.lock().push(e.topic().to_string());
                Ok(())
            }
        }));
        bus.dispatch(Event::named("custom", 5u8)).await.unwrap();
        assert_eq!(*log.lock(), vec!["custom"]);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn decoder_comes_from_any_subscriber() {
        let bus = EventBus::new();
        bus.subscribe(listener_fn(vec![Topic::named("pong")], |_| async { Ok(()) }));
        assert!(bus.decoder("pong").is_none());

        bus.subscribe(listener_fn(vec![Topic::named_decodable::<u32>("pong")], |_| async { Ok(()) }));
        let decoder = bus.decoder("pong").unwrap();
        let payload = decoder(&crate::codec::encode(&7u32).unwrap()).unwrap();
        assert_eq!(payload.downcast_ref::<u32>(), Some(&7));
        assert!(bus.decoder("other").is_none());
    }
}
