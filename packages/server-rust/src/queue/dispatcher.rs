//! Persistent event dispatcher.
//!
//! [`QueueDispatcher`] decorates the application's event bus. Persistent
//! events are encoded and pushed to the driver; everything else goes
//! straight to the bus. [`QueueDispatcher::consume`] pops stored events,
//! decodes them with the decoder some bus subscriber registered for the
//! topic and replays them through the bus, acking, retrying or failing each
//! one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use keel_core::events::Decoder;
use keel_core::group::panic_message;
use keel_core::{Config, ConfigError, Dispatcher, Event, Listener, SharedDispatcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::driver::Driver;
use super::message::{Channel, PersistedEvent, QueueError, QueueInfo};

/// Per-queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Number of workers. Zero starts none.
    pub parallelism: usize,
    /// Default handling deadline per attempt.
    pub handle_timeout: Duration,
    /// Default attempt budget.
    pub max_attempts: u32,
    /// Length check period for [`QueueDispatcher::monitor`]; zero disables it.
    pub check_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            handle_timeout: Duration::from_secs(600),
            max_attempts: 1,
            check_interval: Duration::ZERO,
        }
    }
}

impl QueueOptions {
    /// Reads `queue.<name>.*`, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a present value has the wrong type.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let key = |field: &str| format!("queue.{name}.{field}");
        let parallelism = match config.int(&key("parallelism")) {
            Some(n) => usize::try_from(n).map_err(|_| ConfigError::Type {
                key: key("parallelism"),
                message: "must not be negative".to_string(),
            })?,
            None => defaults.parallelism,
        };
        let check_secs = config.int(&key("checkQueueLengthIntervalSecond")).unwrap_or(0);
        Ok(Self {
            parallelism,
            handle_timeout: config.duration_or(&key("handleTimeout"), defaults.handle_timeout)?,
            max_attempts: config
                .int(&key("maxAttempts"))
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_attempts)
                .max(1),
            check_interval: Duration::from_secs(u64::try_from(check_secs).unwrap_or(0)),
        })
    }
}

/// Dispatched on the inner bus when Failed or Timeout is non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLengthReport {
    pub queue: String,
    pub info: QueueInfo,
}

/// Dispatcher that routes persistent events through a queue driver.
pub struct QueueDispatcher {
    name: String,
    driver: Arc<dyn Driver>,
    inner: SharedDispatcher,
    options: QueueOptions,
    retired: CancellationToken,
}

impl QueueDispatcher {
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
        inner: SharedDispatcher,
        options: QueueOptions,
    ) -> Self {
        Self {
            name: name.into(),
            driver,
            inner,
            options,
            retired: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    #[must_use]
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Stops [`consume`](Self::consume) and [`monitor`](Self::monitor) on
    /// this instance. Called when the factory replaces it after a reload.
    pub fn retire(&self) {
        self.retired.cancel();
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    async fn stopped(&self, token: &CancellationToken) {
        tokio::select! {
            () = token.cancelled() => {}
            () = self.retired.cancelled() => {}
        }
    }

    /// Runs the producer and workers until `token` is cancelled or the
    /// dispatcher is retired.
    ///
    /// Stopping ends popping at once. An event popped but not yet handed to
    /// a worker is released back to Waiting. Workers finish the events they
    /// already hold before this returns; their listeners see the delivery
    /// token cancelled when `token` is.
    ///
    /// # Errors
    ///
    /// Never fails today; driver errors are logged and retried.
    pub async fn consume(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel::<PersistedEvent>(self.options.parallelism.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = TaskTracker::new();
        for _ in 0..self.options.parallelism {
            let this = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            let token = token.clone();
            workers.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(msg) = next else { break };
                    this.handle(msg, &token).await;
                }
            });
        }
        workers.close();
        info!(queue = %self.name, parallelism = self.options.parallelism, "queue consumer started");

        loop {
            let popped = tokio::select! {
                () = self.stopped(&token) => break,
                popped = self.driver.pop() => popped,
            };
            match popped {
                Ok(Some(msg)) => {
                    let held = msg.clone();
                    let sent = tokio::select! {
                        () = self.stopped(&token) => false,
                        sent = tx.send(msg) => sent.is_ok(),
                    };
                    if !sent {
                        self.release(&held).await;
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "queue pop failed");
                    tokio::select! {
                        () = self.stopped(&token) => break,
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        drop(tx);
        info!(queue = %self.name, "queue consumer stopping, draining workers");
        workers.wait().await;
        Ok(())
    }

    /// Periodically records channel lengths and reports non-empty Failed or
    /// Timeout channels. Idles until stopped when the interval is zero.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches other run-group actors.
    pub async fn monitor(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        if self.options.check_interval.is_zero() {
            self.stopped(&token).await;
            return Ok(());
        }
        let mut ticker = tokio::time::interval(self.options.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.stopped(&token) => return Ok(()),
                _ = ticker.tick() => self.report().await,
            }
        }
    }

    async fn report(&self) {
        let info = match self.driver.info().await {
            Ok(info) => info,
            Err(e) => {
                warn!(queue = %self.name, error = %e, "queue info failed");
                return;
            }
        };
        for channel in Channel::ALL {
            #[allow(clippy::cast_precision_loss)]
            let count = info.count(channel) as f64;
            metrics::gauge!("queue_length", "queue" => self.name.clone(), "channel" => channel.as_str())
                .set(count);
        }
        if info.failed > 0 || info.timeout > 0 {
            warn!(queue = %self.name, failed = info.failed, timeout = info.timeout, "queue has stuck events");
            let report = QueueLengthReport {
                queue: self.name.clone(),
                info,
            };
            if let Err(e) = self.inner.dispatch(Event::new(report)).await {
                warn!(queue = %self.name, error = %e, "queue length report listener failed");
            }
        }
    }

    async fn release(&self, msg: &PersistedEvent) {
        match self.driver.release(msg).await {
            Ok(()) => debug!(queue = %self.name, unique_id = %msg.unique_id, "undelivered event released"),
            Err(e) => warn!(queue = %self.name, unique_id = %msg.unique_id, error = %e, "releasing undelivered event failed"),
        }
    }

    async fn handle(&self, msg: PersistedEvent, token: &CancellationToken) {
        let delivered = self.deliver(&msg, token).await;
        let bookkeeping = match &delivered {
            Ok(()) => self.driver.ack(&msg).await.map(|()| "acked"),
            Err(e) if msg.can_retry() => {
                warn!(queue = %self.name, key = %msg.key, attempt = msg.attempts, error = %e, "queued event failed, retrying");
                self.driver.retry(&msg).await.map(|()| "retried")
            }
            Err(e) => {
                error!(queue = %self.name, key = %msg.key, attempt = msg.attempts, error = %e, "queued event exhausted its attempts");
                self.driver.fail(&msg).await.map(|()| "failed")
            }
        };
        match bookkeeping {
            Ok(outcome) => {
                debug!(queue = %self.name, unique_id = %msg.unique_id, outcome, "queued event handled");
                metrics::counter!("queue_events_total", "queue" => self.name.clone(), "outcome" => outcome)
                    .increment(1);
            }
            Err(e) => error!(queue = %self.name, unique_id = %msg.unique_id, error = %e, "queue bookkeeping failed"),
        }
    }

    /// Replays `msg` on the inner bus. Listeners get a token that is
    /// cancelled at the handling deadline or when `token` is; at the
    /// deadline the handler is also dropped.
    async fn deliver(&self, msg: &PersistedEvent, token: &CancellationToken) -> anyhow::Result<()> {
        let decoder = self
            .inner
            .decoder(&msg.key)
            .ok_or_else(|| QueueError::NoDecoder(msg.key.clone()))?;
        let payload = decoder(&msg.value)?;
        let cancel = token.child_token();
        let event = Event::from_payload(msg.key.clone(), payload).with_cancellation(cancel.clone());

        let dispatch = AssertUnwindSafe(self.inner.dispatch(event)).catch_unwind();
        let outcome = tokio::time::timeout(msg.handle_timeout, dispatch).await;
        cancel.cancel();
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(anyhow::anyhow!(
                "listener panicked: {}",
                panic_message(panic.as_ref())
            )),
            Err(_) => Err(anyhow::anyhow!(
                "handling {} exceeded {:?}",
                msg.key,
                msg.handle_timeout
            )),
        }
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn dispatch(&self, event: Event) -> anyhow::Result<()> {
        let Some(persistence) = event.persistence() else {
            return self.inner.dispatch(event).await;
        };
        let msg = PersistedEvent {
            unique_id: persistence
                .unique_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            key: event.topic().to_string(),
            value: persistence.encode()?,
            handle_timeout: persistence.handle_timeout.unwrap_or(self.options.handle_timeout),
            backoff: Duration::ZERO,
            attempts: 1,
            max_attempts: persistence.max_attempts.unwrap_or(self.options.max_attempts).max(1),
        };
        self.driver.push(&msg, persistence.defer).await?;
        debug!(queue = %self.name, key = %msg.key, unique_id = %msg.unique_id, "event queued");
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn Listener>) {
        self.inner.subscribe(listener);
    }

    fn decoder(&self, topic: &str) -> Option<Decoder> {
        self.inner.decoder(topic)
    }
}
