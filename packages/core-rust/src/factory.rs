//! Named-instance factory with caching and parallel cleanup.
//!
//! Configuration-driven subsystems (database pools, queue dispatchers,
//! broker clients) are built on first use by name and shared afterwards.
//! Each cached instance carries its own closer; [`Factory::close`] runs all
//! of them concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::OnReload;
use crate::events::{listener_fn, Listener, Topic};

/// Async cleanup for one instance.
pub type Closer = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A freshly built instance and how to dispose of it.
pub struct Made<C> {
    pub conn: C,
    pub closer: Option<Closer>,
}

impl<C> Made<C> {
    /// Instance that needs no cleanup.
    pub fn new(conn: C) -> Self {
        Self { conn, closer: None }
    }

    /// Attaches an async closer.
    #[must_use]
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closer = Some(Box::new(move || closer().boxed()));
        self
    }
}

type Constructor<C> = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Made<C>>> + Send + Sync>;

/// Lazily builds and caches instances of `C` keyed by name.
pub struct Factory<C> {
    kind: String,
    constructor: Constructor<C>,
    cache: Mutex<HashMap<String, Made<C>>>,
}

impl<C> Factory<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Creates a factory. `kind` labels log lines (`"queue"`, `"database"`).
    pub fn new<F, Fut>(kind: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Made<C>>> + Send + 'static,
    {
        Self {
            kind: kind.into(),
            constructor: Arc::new(move |name| constructor(name).boxed()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached instance for `name`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns the constructor's error; nothing is cached in that case.
    pub async fn make(&self, name: &str) -> anyhow::Result<C> {
        let mut cache = self.cache.lock().await;
        if let Some(made) = cache.get(name) {
            return Ok(made.conn.clone());
        }
        let made = (self.constructor)(name.to_string()).await?;
        let conn = made.conn.clone();
        cache.insert(name.to_string(), made);
        debug!(kind = %self.kind, name, "factory instance created");
        Ok(conn)
    }

    /// Names currently cached.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Evicts and closes one instance. No-op if `name` is not cached.
    ///
    /// # Errors
    ///
    /// Returns the closer's error.
    pub async fn close_one(&self, name: &str) -> anyhow::Result<()> {
        let removed = self.cache.lock().await.remove(name);
        match removed.and_then(|m| m.closer) {
            Some(closer) => {
                info!(kind = %self.kind, name, "closing factory instance");
                closer().await
            }
            None => Ok(()),
        }
    }

    /// Closes every cached instance in parallel and empties the cache.
    ///
    /// # Errors
    ///
    /// Returns the first closer error after all closers have finished.
    pub async fn close(&self) -> anyhow::Result<()> {
        let drained: Vec<(String, Made<C>)> = self.cache.lock().await.drain().collect();
        let closing = drained.into_iter().filter_map(|(name, made)| {
            made.closer.map(|closer| async move {
                let result = closer().await;
                if let Err(e) = &result {
                    warn!(name = %name, error = %e, "factory closer failed");
                }
                result
            })
        });
        join_all(closing)
            .await
            .into_iter()
            .find(Result::is_err)
            .unwrap_or(Ok(()))
    }

    /// Listener that evicts instances whose config under `prefix.<name>`
    /// changed on reload. The next [`make`](Self::make) rebuilds them.
    pub fn reload_listener(self: &Arc<Self>, prefix: &str) -> Arc<dyn Listener> {
        let factory = Arc::clone(self);
        let prefix = prefix.to_string();
        listener_fn(vec![Topic::of::<OnReload>()], move |event| {
            let factory = Arc::clone(&factory);
            let prefix = prefix.clone();
            async move {
                let Some(reload) = event.data::<OnReload>() else {
                    return Ok(());
                };
                for name in factory.names().await {
                    if reload.changed(&format!("{prefix}.{name}")) {
                        factory.close_one(&name).await?;
                    }
                }
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::events::{Dispatcher, Event, EventBus};

    fn counting_factory(built: Arc<AtomicU32>, closed: Arc<AtomicU32>) -> Arc<Factory<String>> {
        Arc::new(Factory::new("test", move |name: String| {
            let built = built.clone();
            let closed = closed.clone();
            async move {
                let n = built.fetch_add(1, Ordering::SeqCst);
                Ok(Made::new(format!("{name}#{n}")).with_closer(move || async move {
                    closed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            }
        }))
    }

    #[tokio::test]
    async fn make_caches_by_name() {
        let built = Arc::new(AtomicU32::new(0));
        let factory = counting_factory(built.clone(), Arc::new(AtomicU32::new(0)));
        assert_eq!(factory.make("a").await.unwrap(), "a#0");
        assert_eq!(factory.make("a").await.unwrap(), "a#0");
        assert_eq!(factory.make("b").await.unwrap(), "b#1");
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(factory.names().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn close_runs_every_closer() {
        let closed = Arc::new(AtomicU32::new(0));
        let factory = counting_factory(Arc::new(AtomicU32::new(0)), closed.clone());
        factory.make("a").await.unwrap();
        factory.make("b").await.unwrap();
        factory.close().await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(factory.names().await.is_empty());
    }

    #[tokio::test]
    async fn close_one_evicts_and_rebuilds() {
        let closed = Arc::new(AtomicU32::new(0));
        let factory = counting_factory(Arc::new(AtomicU32::new(0)), closed.clone());
        factory.make("a").await.unwrap();
        factory.close_one("a").await.unwrap();
        factory.close_one("a").await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.make("a").await.unwrap(), "a#1");
    }

    #[tokio::test]
    async fn failed_constructor_caches_nothing() {
        let factory: Factory<u8> = Factory::new("test", |_| async { anyhow::bail!("no dsn") });
        assert!(factory.make("x").await.is_err());
        assert!(factory.names().await.is_empty());
    }

    #[tokio::test]
    async fn reload_closes_only_changed_entries() {
        let closed = Arc::new(AtomicU32::new(0));
        let factory = counting_factory(Arc::new(AtomicU32::new(0)), closed.clone());
        factory.make("a").await.unwrap();
        factory.make("b").await.unwrap();

        let bus = EventBus::new();
        bus.subscribe(factory.reload_listener("database"));
        bus.dispatch(Event::new(OnReload {
            previous: Arc::new(json!({"database": {"a": {"dsn": "x"}, "b": {"dsn": "y"}}})),
            current: Arc::new(json!({"database": {"a": {"dsn": "z"}, "b": {"dsn": "y"}}})),
        }))
        .await
        .unwrap();

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.names().await, vec!["b"]);
    }
}
