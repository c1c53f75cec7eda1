//! Config-driven queue wiring.
//!
//! [`QueueFactory`] builds one [`QueueDispatcher`] per `queue.<name>`
//! section, each wrapping the application bus. A config reload that touches
//! a section retires its dispatcher; the consumer and monitor actors then
//! continue on the rebuilt one. [`QueueModule`] contributes a consumer and a monitor actor per
//! configured queue, the `queue reload|flush` commands, default config and
//! a closer.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Arg, ArgMatches, Command};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use dashmap::DashMap;
use keel_core::{Config, ConfigError, Factory, Listener, Made, RunGroup, SharedDispatcher};
use serde_json::json;
use tracing::info;

use super::dispatcher::{QueueDispatcher, QueueOptions};
use super::driver::Driver;
use super::memory::MemoryDriver;
use super::message::Channel;
use crate::module::{
    Capability, CloserProvider, CommandProvider, CommandSet, ConfigFragment, ConfigProvider, Module,
    RunGroupProvider,
};

type DriverMaker = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Arc<dyn Driver>>> + Send + Sync>;

/// Builds and caches queue dispatchers by name.
pub struct QueueFactory {
    config: Arc<Config>,
    dispatchers: Arc<Factory<Arc<QueueDispatcher>>>,
}

impl QueueFactory {
    /// Factory whose drivers come from `queue.<name>.driver`
    /// (`memory`, or `redis` with the `redis` feature). Every dispatcher
    /// wraps `bus`.
    ///
    /// Memory drivers are kept per queue name, so a dispatcher rebuilt after
    /// a reload still sees the events stored before it.
    #[must_use]
    pub fn from_config(config: Arc<Config>, bus: SharedDispatcher) -> Self {
        let for_driver = Arc::clone(&config);
        let memory: Arc<DashMap<String, Arc<MemoryDriver>>> = Arc::new(DashMap::new());
        Self::with_driver(config, bus, move |name| {
            let config = Arc::clone(&for_driver);
            let memory = Arc::clone(&memory);
            async move { driver_from_config(&config, &name, &memory).await }
        })
    }

    /// Factory with a caller-supplied driver constructor.
    pub fn with_driver<F, Fut>(config: Arc<Config>, bus: SharedDispatcher, make_driver: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Driver>>> + Send + 'static,
    {
        let make_driver: DriverMaker = Arc::new(move |name| make_driver(name).boxed());
        let for_ctor = Arc::clone(&config);
        let dispatchers = Factory::new("queue", move |name: String| {
            let config = Arc::clone(&for_ctor);
            let make_driver = Arc::clone(&make_driver);
            let bus = Arc::clone(&bus);
            async move {
                let options = QueueOptions::from_config(&config, &name)?;
                let driver = make_driver(name.clone()).await?;
                let dispatcher = Arc::new(QueueDispatcher::new(name, driver, bus, options));
                let retiring = Arc::clone(&dispatcher);
                Ok(Made::new(dispatcher).with_closer(move || async move {
                    retiring.retire();
                    Ok(())
                }))
            }
        });
        Self {
            config,
            dispatchers: Arc::new(dispatchers),
        }
    }

    /// Returns the dispatcher for `name`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns the driver or config error for that queue.
    pub async fn make(&self, name: &str) -> anyhow::Result<Arc<QueueDispatcher>> {
        self.dispatchers.make(name).await
    }

    /// Queue names configured under `queue`.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        configured_queues(&self.config)
    }

    /// Listener that drops dispatchers whose `queue.<name>` section changed.
    #[must_use]
    pub fn reload_listener(&self) -> Arc<dyn Listener> {
        self.dispatchers.reload_listener("queue")
    }

    /// # Errors
    ///
    /// Returns the first closer error.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.dispatchers.close().await
    }
}

fn configured_queues(config: &Config) -> Vec<String> {
    match config.value("queue") {
        Some(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

async fn driver_from_config(
    config: &Config,
    name: &str,
    memory: &DashMap<String, Arc<MemoryDriver>>,
) -> anyhow::Result<Arc<dyn Driver>> {
    let kind = config
        .string(&format!("queue.{name}.driver"))
        .unwrap_or_else(|| "memory".to_string());
    match kind.as_str() {
        "memory" => {
            let driver: Arc<dyn Driver> = Arc::<MemoryDriver>::clone(memory.entry(name.to_string()).or_default().value());
            Ok(driver)
        }
        #[cfg(feature = "redis")]
        "redis" => {
            let url = config
                .string(&format!("queue.{name}.redisUrl"))
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
            let driver =
                super::redis_driver::RedisDriver::connect(&url, &config.app_name(), &config.env(), name).await?;
            Ok(Arc::new(driver))
        }
        other => Err(ConfigError::Invalid(format!("queue {name}: unsupported driver {other:?}")).into()),
    }
}

// ---------------------------------------------------------------------------
// QueueModule
// ---------------------------------------------------------------------------

/// Module exposing every configured queue to the lifecycle server.
pub struct QueueModule {
    factory: Arc<QueueFactory>,
}

impl QueueModule {
    #[must_use]
    pub fn new(factory: Arc<QueueFactory>) -> Self {
        Self { factory }
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<QueueFactory> {
        &self.factory
    }
}

impl Module for QueueModule {
    fn name(&self) -> &str {
        "queue"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![
            Capability::RunGroup(self.clone()),
            Capability::Command(self.clone()),
            Capability::Config(self.clone()),
            Capability::Closer(self),
        ]
    }
}

impl RunGroupProvider for QueueModule {
    fn provide_run_group(&self, group: &mut RunGroup) {
        for name in self.factory.names() {
            let factory = Arc::clone(&self.factory);
            let queue = name.clone();
            group.add_cancellable(format!("queue-consumer:{name}"), move |token| async move {
                while !token.is_cancelled() {
                    factory.make(&queue).await?.consume(token.clone()).await?;
                }
                Ok(())
            });

            let factory = Arc::clone(&self.factory);
            let queue = name.clone();
            group.add_cancellable(format!("queue-monitor:{name}"), move |token| async move {
                while !token.is_cancelled() {
                    factory.make(&queue).await?.monitor(token.clone()).await?;
                }
                Ok(())
            });
        }
    }
}

impl CommandProvider for QueueModule {
    fn provide_command(&self, commands: &mut CommandSet) {
        let channel_args = |action: &'static str| {
            Command::new(action)
                .arg(Arg::new("queue").long("queue").default_value("default"))
                .arg(
                    Arg::new("channels")
                        .long("channels")
                        .value_delimiter(',')
                        .default_values(["failed", "timeout"]),
                )
        };
        let command = Command::new("queue")
            .about("Operate on persistent queue channels")
            .subcommand_required(true)
            .subcommand(channel_args("reload").about("Move failed or timed out events back to waiting"))
            .subcommand(channel_args("flush").about("Delete channels"));

        let factory = Arc::clone(&self.factory);
        commands.add(command, move |matches| {
            let factory = Arc::clone(&factory);
            async move { run_queue_command(&factory, &matches).await }
        });
    }
}

async fn run_queue_command(factory: &QueueFactory, matches: &ArgMatches) -> anyhow::Result<()> {
    let (action, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow::anyhow!("queue: missing subcommand"))?;
    let queue = sub
        .get_one::<String>("queue")
        .map_or("default", String::as_str);
    let channels = sub
        .get_many::<String>("channels")
        .into_iter()
        .flatten()
        .map(|c| c.parse::<Channel>())
        .collect::<Result<Vec<_>, _>>()?;

    let driver = Arc::clone(factory.make(queue).await?.driver());
    for channel in channels {
        match action {
            "reload" => {
                let moved = driver.reload(channel).await?;
                info!(queue, %channel, moved, "queue channel reloaded");
            }
            "flush" => {
                driver.flush(channel).await?;
                info!(queue, %channel, "queue channel flushed");
            }
            other => anyhow::bail!("queue: unknown action {other}"),
        }
    }
    Ok(())
}

impl ConfigProvider for QueueModule {
    fn config_fragments(&self) -> Vec<ConfigFragment> {
        vec![ConfigFragment {
            owner: "queue".to_string(),
            data: json!({
                "queue": {
                    "default": {
                        "driver": "memory",
                        "parallelism": 1,
                        "checkQueueLengthIntervalSecond": 0
                    }
                }
            }),
            comment: "Persistent queues, one section per queue name".to_string(),
        }]
    }

    fn validate(&self, config: &Config) -> Result<(), ConfigError> {
        for name in configured_queues(config) {
            QueueOptions::from_config(config, &name)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CloserProvider for QueueModule {
    async fn close(&self) -> anyhow::Result<()> {
        self.factory.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use keel_core::events::listener_fn;
    use keel_core::{Event, EventBus, OnReload, Topic};
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::queue::message::QueueInfo;
    use keel_core::Dispatcher;

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick(u32);

    fn config() -> Arc<Config> {
        Arc::new(Config::from_value(json!({
            "queue": {"default": {"parallelism": 2}, "bulk": {"parallelism": 0}}
        })))
    }

    fn bus() -> SharedDispatcher {
        Arc::new(EventBus::new())
    }

    fn counting(calls: &Arc<AtomicU32>) -> Arc<dyn Listener> {
        let calls = Arc::clone(calls);
        listener_fn(vec![Topic::decodable::<Tick>()], move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn wait_for(calls: &AtomicU32, expected: u32) {
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn reload_of(section: serde_json::Value) -> Event {
        Event::new(OnReload {
            previous: Arc::new(json!({"queue": {"default": {"parallelism": 2}}})),
            current: Arc::new(json!({"queue": {"default": section}})),
        })
    }

    #[tokio::test]
    async fn factory_caches_dispatchers_per_name() {
        let factory = QueueFactory::from_config(config(), bus());
        let a = factory.make("default").await.unwrap();
        let b = factory.make("default").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.options().parallelism, 2);
        let mut names = factory.names();
        names.sort();
        assert_eq!(names, vec!["bulk", "default"]);
    }

    #[tokio::test]
    async fn unsupported_driver_is_config_error() {
        let config = Arc::new(Config::from_value(json!({"queue": {"x": {"driver": "carrier-pigeon"}}})));
        let factory = QueueFactory::from_config(config, bus());
        assert!(factory.make("x").await.is_err());
    }

    #[test]
    fn module_adds_two_actors_per_queue() {
        let module = Arc::new(QueueModule::new(Arc::new(QueueFactory::from_config(config(), bus()))));
        let mut group = RunGroup::new();
        module.provide_run_group(&mut group);
        assert_eq!(group.len(), 4);
        assert!(group.names().iter().any(|n| n == "queue-consumer:bulk"));
    }

    #[tokio::test]
    async fn reload_command_moves_failed_events() {
        let factory = Arc::new(QueueFactory::from_config(config(), bus()));
        let module = QueueModule::new(Arc::clone(&factory));
        let queue = factory.make("default").await.unwrap();
        queue.dispatch(Event::persistent(Tick(1))).await.unwrap();
        let driver = Arc::clone(queue.driver());
        let popped = driver.pop().await.unwrap().unwrap();
        driver.fail(&popped).await.unwrap();

        let mut commands = CommandSet::new();
        module.provide_command(&mut commands);
        commands
            .run(Command::new("app"), ["app", "queue", "reload", "--channels", "failed"])
            .await
            .unwrap();
        assert_eq!(
            driver.info().await.unwrap(),
            QueueInfo {
                waiting: 1,
                ..QueueInfo::default()
            }
        );
    }

    #[tokio::test]
    async fn queued_event_reaches_listener_on_the_app_bus() {
        let bus = bus();
        let calls = Arc::new(AtomicU32::new(0));
        bus.subscribe(counting(&calls));
        let factory = QueueFactory::from_config(config(), Arc::clone(&bus));
        let queue = factory.make("default").await.unwrap();

        queue.dispatch(Event::new(Tick(1))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        queue.dispatch(Event::persistent(Tick(2))).await.unwrap();
        let token = CancellationToken::new();
        let consumer = tokio::spawn(Arc::clone(&queue).consume(token.clone()));
        wait_for(&calls, 2).await;
        token.cancel();
        consumer.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn consumer_follows_the_dispatcher_rebuilt_on_reload() {
        let bus = bus();
        let calls = Arc::new(AtomicU32::new(0));
        bus.subscribe(counting(&calls));
        let factory = Arc::new(QueueFactory::from_config(config(), Arc::clone(&bus)));
        bus.subscribe(factory.reload_listener());
        let module = Arc::new(QueueModule::new(Arc::clone(&factory)));
        let mut group = RunGroup::new();
        module.provide_run_group(&mut group);
        let token = CancellationToken::new();
        let stop = token.clone();
        group.add(
            "stop",
            async move {
                stop.cancelled().await;
                Ok(())
            },
            |_| {},
        );
        let running = tokio::spawn(group.run());

        let before = factory.make("default").await.unwrap();
        before.dispatch(Event::persistent(Tick(1))).await.unwrap();
        wait_for(&calls, 1).await;

        bus.dispatch(reload_of(json!({"parallelism": 1}))).await.unwrap();
        assert!(before.is_retired());
        let after = factory.make("default").await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.options().parallelism, 2);

        after.dispatch(Event::persistent(Tick(2))).await.unwrap();
        wait_for(&calls, 2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(after.driver().info().await.unwrap(), QueueInfo::default());

        token.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn memory_driver_survives_a_rebuild() {
        let bus = bus();
        let factory = Arc::new(QueueFactory::from_config(config(), Arc::clone(&bus)));
        bus.subscribe(factory.reload_listener());
        let before = factory.make("default").await.unwrap();
        before.dispatch(Event::persistent(Tick(1))).await.unwrap();

        bus.dispatch(reload_of(json!({"parallelism": 4}))).await.unwrap();
        let after = factory.make("default").await.unwrap();
        assert!(Arc::ptr_eq(before.driver(), after.driver()));
        assert_eq!(after.driver().info().await.unwrap().waiting, 1);
    }
}
