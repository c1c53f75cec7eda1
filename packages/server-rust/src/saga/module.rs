//! Saga recovery as a run-group actor.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{Config, ConfigError, RunGroup};
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::SagaRegistry;
use crate::module::{Capability, ConfigFragment, ConfigProvider, Module, RunGroupProvider};

pub const DEFAULT_RECOVER_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically compensates orphaned transactions.
pub struct SagaModule {
    registry: Arc<SagaRegistry>,
    interval: Duration,
}

impl SagaModule {
    #[must_use]
    pub fn new(registry: Arc<SagaRegistry>) -> Self {
        Self {
            registry,
            interval: DEFAULT_RECOVER_INTERVAL,
        }
    }

    /// Module whose recovery interval comes from `sagas.recoverInterval`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a malformed or zero interval.
    pub fn from_config(registry: Arc<SagaRegistry>, config: &Config) -> Result<Self, ConfigError> {
        let interval = recover_interval(config)?;
        Ok(Self { registry, interval })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SagaRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

fn recover_interval(config: &Config) -> Result<Duration, ConfigError> {
    let interval = config.duration_or("sagas.recoverInterval", DEFAULT_RECOVER_INTERVAL)?;
    if interval.is_zero() {
        return Err(ConfigError::Invalid("sagas.recoverInterval must be positive".into()));
    }
    Ok(interval)
}

/// Runs [`SagaRegistry::recover`] every `interval` until cancelled.
///
/// # Errors
///
/// Never fails; recovery errors are logged and retried on the next tick.
pub async fn recovery_loop(registry: Arc<SagaRegistry>, interval: Duration, token: CancellationToken) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(?interval, "saga recovery started");
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => match registry.recover().await {
                Ok(0) => debug!("saga recovery: nothing to do"),
                Ok(n) => info!(recovered = n, "saga recovery pass finished"),
                Err(e) => warn!(error = %e, "saga recovery pass failed"),
            },
        }
    }
    info!("saga recovery stopped");
    Ok(())
}

impl Module for SagaModule {
    fn name(&self) -> &str {
        "sagas"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![Capability::RunGroup(self.clone()), Capability::Config(self)]
    }
}

impl RunGroupProvider for SagaModule {
    fn provide_run_group(&self, group: &mut RunGroup) {
        let registry = Arc::clone(&self.registry);
        let interval = self.interval;
        group.add_cancellable("saga-recovery", move |token| recovery_loop(registry, interval, token));
    }
}

impl ConfigProvider for SagaModule {
    fn config_fragments(&self) -> Vec<ConfigFragment> {
        vec![ConfigFragment {
            owner: "sagas".to_string(),
            data: json!({"sagas": {"sagaTimeout": "600s", "recoverInterval": "60s"}}),
            comment: "Saga coordinator: orphan age and recovery cadence".to_string(),
        }]
    }

    fn validate(&self, config: &Config) -> Result<(), ConfigError> {
        config.duration_or("sagas.sagaTimeout", super::registry::DEFAULT_SAGA_TIMEOUT)?;
        recover_interval(config).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::saga::log::SagaLog;
    use crate::saga::registry::Step;
    use crate::saga::store::{MemorySagaStore, SagaStore};

    #[test]
    fn interval_from_config() {
        let registry = Arc::new(SagaRegistry::new(Arc::new(MemorySagaStore::new())));
        let config = Config::from_value(json!({"sagas": {"recoverInterval": "5s"}}));
        let module = SagaModule::from_config(Arc::clone(&registry), &config).unwrap();
        assert_eq!(module.interval(), Duration::from_secs(5));

        let zero = Config::from_value(json!({"sagas": {"recoverInterval": "0s"}}));
        assert!(SagaModule::from_config(registry, &zero).is_err());
    }

    #[tokio::test]
    async fn loop_recovers_then_stops_on_cancel() {
        let store = Arc::new(MemorySagaStore::new());
        let registry = Arc::new(SagaRegistry::new(store.clone()).with_timeout(Duration::from_secs(1)));
        let undone = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&undone);
        registry.add_step(Step::new(
            "noop",
            |_ctx, _n: u8| async { Ok(()) },
            move |_ctx, _n: u8| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));
        let old = Utc::now() - TimeDelta::minutes(5);
        store.log(&SagaLog::session("orphan", old)).await.unwrap();
        let param = keel_core::codec::encode(&7u8).unwrap();
        store.log(&SagaLog::step("orphan", "noop", param, old)).await.unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(recovery_loop(registry, Duration::from_millis(20), token.clone()));
        tokio::time::timeout(Duration::from_secs(2), async {
            while undone.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(undone.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn contributes_one_actor() {
        let module = SagaModule::new(Arc::new(SagaRegistry::new(Arc::new(MemorySagaStore::new()))));
        let mut group = RunGroup::new();
        module.provide_run_group(&mut group);
        assert_eq!(group.names(), vec!["saga-recovery".to_string()]);
    }
}
