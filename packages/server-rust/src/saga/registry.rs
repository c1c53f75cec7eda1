//! Saga coordinator.
//!
//! A [`SagaRegistry`] owns the step table. [`SagaRegistry::start_tx`] opens a
//! transaction by writing a Session log; every [`StepHandle::call`] inside it
//! writes a Do log, remembers a rollback request and runs the forward action.
//! Rolling back dispatches `onRollback(<step>)` events on a bus private to the
//! transaction, whose listeners write Undo logs and run the compensations.
//! [`SagaRegistry::recover`] replays the same compensations for transactions a
//! crashed process left behind.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use keel_core::clock::{self, SharedClock};
use keel_core::codec;
use keel_core::events::listener_fn;
use keel_core::{Config, ConfigError, Dispatcher, Event, EventBus, Topic};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::log::{SagaLog, RECOVERED, ROLLED_BACK};
use super::store::SagaStore;

/// Default age after which an uncommitted transaction counts as orphaned.
pub const DEFAULT_SAGA_TIMEOUT: Duration = Duration::from_secs(600);

type StepFn<P> = Arc<dyn Fn(TxContext, P) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type ParamEncoder<P> = Arc<dyn Fn(&P) -> anyhow::Result<Vec<u8>> + Send + Sync>;
type ParamDecoder<P> = Arc<dyn Fn(&[u8]) -> anyhow::Result<P> + Send + Sync>;
type UndoFn = Arc<dyn Fn(TxContext, Vec<u8>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error(transparent)]
    Store(#[from] anyhow::Error),
    #[error("saga {correlation_id}: {} compensation(s) failed", .errors.len())]
    Rollback {
        correlation_id: String,
        errors: Vec<anyhow::Error>,
    },
}

/// Name of the event that compensates `step`.
#[must_use]
pub fn rollback_topic(step: &str) -> String {
    format!("onRollback({step})")
}

/// Payload of a rollback event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub correlation_id: String,
    pub step_name: String,
    pub param: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A forward action and its compensation over a parameter of type `P`.
pub struct Step<P> {
    name: String,
    run: StepFn<P>,
    undo: StepFn<P>,
    encode: ParamEncoder<P>,
    decode: ParamDecoder<P>,
}

impl<P> Step<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Step whose parameter is stored through the canonical codec.
    ///
    /// `undo` may run more than once for the same parameter and must
    /// tolerate that.
    pub fn new<D, DFut, U, UFut>(name: impl Into<String>, run: D, undo: U) -> Self
    where
        D: Fn(TxContext, P) -> DFut + Send + Sync + 'static,
        DFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        U: Fn(TxContext, P) -> UFut + Send + Sync + 'static,
        UFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |ctx: TxContext, param: P| run(ctx, param).boxed()),
            undo: Arc::new(move |ctx: TxContext, param: P| undo(ctx, param).boxed()),
            encode: Arc::new(|param: &P| codec::encode(param).map_err(anyhow::Error::from)),
            decode: Arc::new(|bytes: &[u8]| codec::decode(bytes).map_err(anyhow::Error::from)),
        }
    }
}

impl<P: Send + Sync + 'static> Step<P> {
    /// Replaces how the parameter is written to and read from the log.
    #[must_use]
    pub fn with_codec<E, D>(mut self, encode: E, decode: D) -> Self
    where
        E: Fn(&P) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> anyhow::Result<P> + Send + Sync + 'static,
    {
        self.encode = Arc::new(encode);
        self.decode = Arc::new(decode);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn erase(&self) -> Arc<Compensation> {
        let undo = Arc::clone(&self.undo);
        let decode = Arc::clone(&self.decode);
        Arc::new(Compensation {
            name: self.name.clone(),
            undo: Arc::new(move |ctx: TxContext, bytes: Vec<u8>| {
                let undo = Arc::clone(&undo);
                let param = decode(&bytes);
                async move { undo(ctx, param?).await }.boxed()
            }),
        })
    }
}

/// Type-erased compensation of a registered step.
struct Compensation {
    name: String,
    undo: UndoFn,
}

impl Compensation {
    /// Writes an Undo log, runs the compensation and acknowledges the log.
    async fn run(&self, store: &dyn SagaStore, clock: &SharedClock, request: &RollbackRequest) -> anyhow::Result<()> {
        let log = SagaLog::undo(&request.correlation_id, &self.name, request.param.clone(), clock.now());
        store.log(&log).await?;
        let ctx = TxContext::detached(request.correlation_id.clone());
        let result = (self.undo)(ctx, request.param.clone()).await;
        store
            .ack(&log.id, result.as_ref().err().map(|e| format!("{e:#}")))
            .await?;
        result
    }

    fn listener(self: &Arc<Self>, store: &Arc<dyn SagaStore>, clock: &SharedClock) -> Arc<dyn keel_core::Listener> {
        let this = Arc::clone(self);
        let store = Arc::clone(store);
        let clock = Arc::clone(clock);
        listener_fn(vec![Topic::named(rollback_topic(&self.name))], move |event: Event| {
            let this = Arc::clone(&this);
            let store = Arc::clone(&store);
            let clock = Arc::clone(&clock);
            async move {
                let request = event
                    .data::<RollbackRequest>()
                    .ok_or_else(|| anyhow::anyhow!("rollback event without a request payload"))?;
                this.run(store.as_ref(), &clock, request).await
            }
        })
    }
}

/// Invokes a registered step inside a transaction.
pub struct StepHandle<P> {
    step: Arc<Step<P>>,
    compensation: Arc<Compensation>,
    store: Arc<dyn SagaStore>,
    clock: SharedClock,
}

impl<P> Clone for StepHandle<P> {
    fn clone(&self) -> Self {
        Self {
            step: Arc::clone(&self.step),
            compensation: Arc::clone(&self.compensation),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<P: Send + Sync + 'static> StepHandle<P> {
    /// Runs the forward action for `param`.
    ///
    /// The Do log and the pending rollback are recorded before the action
    /// runs, so a failing action is still compensated on rollback.
    ///
    /// # Errors
    ///
    /// Returns the action's own error, or a store or codec error.
    pub async fn call(&self, ctx: &TxContext, param: P) -> anyhow::Result<()> {
        let bytes = (self.step.encode)(&param)?;
        let log = SagaLog::step(&ctx.correlation_id, &self.step.name, bytes.clone(), self.clock.now());
        self.store.log(&log).await?;

        if let Some(tx) = &ctx.tx {
            tx.record(
                &self.compensation,
                RollbackRequest {
                    correlation_id: ctx.correlation_id.clone(),
                    step_name: self.step.name.clone(),
                    param: bytes,
                },
            );
        }

        let result = (self.step.run)(ctx.clone(), param).await;
        self.store
            .ack(&log.id, result.as_ref().err().map(|e| format!("{e:#}")))
            .await?;
        result
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Carries the correlation id, and the open transaction if there is one.
#[derive(Clone)]
pub struct TxContext {
    correlation_id: String,
    tx: Option<Arc<Transaction>>,
}

impl TxContext {
    /// Context for a compensation running outside any live transaction.
    #[must_use]
    pub fn detached(correlation_id: String) -> Self {
        Self { correlation_id, tx: None }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    #[must_use]
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.tx.as_ref()
    }
}

impl std::fmt::Debug for TxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxContext")
            .field("correlation_id", &self.correlation_id)
            .field("in_tx", &self.tx.is_some())
            .finish()
    }
}

/// An open saga transaction.
pub struct Transaction {
    correlation_id: String,
    session_id: String,
    store: Arc<dyn SagaStore>,
    clock: SharedClock,
    bus: EventBus,
    installed: Mutex<HashSet<String>>,
    pending: Mutex<Vec<RollbackRequest>>,
    done: AtomicBool,
}

impl Transaction {
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn record(&self, compensation: &Arc<Compensation>, request: RollbackRequest) {
        if self.is_done() {
            return;
        }
        if self.installed.lock().insert(compensation.name.clone()) {
            self.bus.subscribe(compensation.listener(&self.store, &self.clock));
        }
        self.pending.lock().push(request);
    }

    /// Acknowledges the Session log, which forgets the transaction.
    /// Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn commit(&self) -> Result<(), SagaError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.ack(&self.session_id, None).await?;
        debug!(correlation_id = %self.correlation_id, "saga committed");
        Ok(())
    }

    /// Compensates every recorded step, newest first.
    ///
    /// Each failure is collected and the remaining compensations still run.
    /// When all succeed the Session log is marked rolled back; otherwise it
    /// stays open for [`SagaRegistry::recover`]. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Rollback`] holding every compensation error.
    pub async fn rollback(&self) -> Result<(), SagaError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut errors = Vec::new();
        for request in pending.into_iter().rev() {
            let step = request.step_name.clone();
            if let Err(e) = self.bus.dispatch(Event::named(rollback_topic(&step), request)).await {
                warn!(correlation_id = %self.correlation_id, step = %step, error = %e, "saga compensation failed");
                errors.push(e);
            }
        }

        if errors.is_empty() {
            self.store.ack(&self.session_id, Some(ROLLED_BACK.to_string())).await?;
            info!(correlation_id = %self.correlation_id, "saga rolled back");
            Ok(())
        } else {
            Err(SagaError::Rollback {
                correlation_id: self.correlation_id.clone(),
                errors,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// SagaRegistry
// ---------------------------------------------------------------------------

/// Step table plus the store that journals every transaction.
pub struct SagaRegistry {
    store: Arc<dyn SagaStore>,
    clock: SharedClock,
    timeout: Duration,
    steps: RwLock<HashMap<String, Arc<Compensation>>>,
}

impl SagaRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self {
            store,
            clock: clock::system(),
            timeout: DEFAULT_SAGA_TIMEOUT,
            steps: RwLock::new(HashMap::new()),
        }
    }

    /// Registry whose orphan timeout comes from `sagas.sagaTimeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the timeout is malformed.
    pub fn from_config(store: Arc<dyn SagaStore>, config: &Config) -> Result<Self, ConfigError> {
        let timeout = config.duration_or("sagas.sagaTimeout", DEFAULT_SAGA_TIMEOUT)?;
        Ok(Self::new(store).with_timeout(timeout))
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    /// Names of the registered steps, sorted.
    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Registers `step` and returns the handle that invokes it.
    ///
    /// Registering a second step under the same name replaces the first
    /// for recovery purposes.
    pub fn add_step<P: Send + Sync + 'static>(&self, step: Step<P>) -> StepHandle<P> {
        let compensation = step.erase();
        if self
            .steps
            .write()
            .insert(step.name.clone(), Arc::clone(&compensation))
            .is_some()
        {
            warn!(step = %step.name, "saga step registered twice");
        }
        StepHandle {
            step: Arc::new(step),
            compensation,
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }

    /// Opens a transaction by writing its Session log.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn start_tx(&self) -> Result<(Arc<Transaction>, TxContext), SagaError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let session = SagaLog::session(&correlation_id, self.clock.now());
        self.store.log(&session).await?;

        let tx = Arc::new(Transaction {
            correlation_id: correlation_id.clone(),
            session_id: session.id,
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            bus: EventBus::new(),
            installed: Mutex::new(HashSet::new()),
            pending: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        });
        let ctx = TxContext {
            correlation_id,
            tx: Some(Arc::clone(&tx)),
        };
        Ok((tx, ctx))
    }

    /// Compensates transactions left open for longer than the saga timeout.
    ///
    /// Returns how many transactions were fully compensated. A transaction
    /// with a failing or unknown step is logged and left for the next pass.
    ///
    /// # Errors
    ///
    /// Returns store errors; compensation errors are only logged.
    pub async fn recover(&self) -> Result<usize, SagaError> {
        let now = self.clock.now();
        let horizon = TimeDelta::from_std(self.timeout)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(now);
        let sessions = self.store.uncommitted_sagas(horizon).await?;
        if sessions.is_empty() {
            return Ok(0);
        }

        let steps: HashMap<String, Arc<Compensation>> = self.steps.read().clone();
        let bus = EventBus::new();
        for compensation in steps.values() {
            bus.subscribe(compensation.listener(&self.store, &self.clock));
        }

        let mut recovered = 0;
        for session in sessions {
            let cid = &session.correlation_id;
            let mut clean = true;
            for log in self.store.unacknowledged_steps(cid).await? {
                if !steps.contains_key(&log.step_name) {
                    warn!(correlation_id = %cid, step = %log.step_name, "saga recovery: unknown step");
                    clean = false;
                    continue;
                }
                let request = RollbackRequest {
                    correlation_id: cid.clone(),
                    step_name: log.step_name.clone(),
                    param: log.step_param,
                };
                if let Err(e) = bus.dispatch(Event::named(rollback_topic(&log.step_name), request)).await {
                    warn!(correlation_id = %cid, step = %log.step_name, error = %e, "saga recovery: compensation failed");
                    clean = false;
                }
            }
            if clean {
                self.store.ack(&session.id, Some(RECOVERED.to_string())).await?;
                info!(correlation_id = %cid, "saga recovered");
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicU32};

    use chrono::Utc;

    use super::*;
    use crate::saga::log::LogType;
    use crate::saga::store::MemorySagaStore;

    fn counter_step(name: &str, value: &Arc<AtomicI64>, fail_forward: bool) -> Step<i64> {
        let up = Arc::clone(value);
        let down = Arc::clone(value);
        Step::new(
            name,
            move |_ctx, by: i64| {
                let up = Arc::clone(&up);
                async move {
                    up.fetch_add(by, Ordering::SeqCst);
                    if fail_forward {
                        anyhow::bail!("forward failed");
                    }
                    Ok(())
                }
            },
            move |_ctx, by: i64| {
                let down = Arc::clone(&down);
                async move {
                    down.fetch_sub(by, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
    }

    #[tokio::test]
    async fn rollback_compensates_failed_step_too() {
        let store = Arc::new(MemorySagaStore::new());
        let registry = SagaRegistry::new(store.clone());
        let value = Arc::new(AtomicI64::new(0));
        let a = registry.add_step(counter_step("a", &value, false));
        let b = registry.add_step(counter_step("b", &value, true));

        let (tx, ctx) = registry.start_tx().await.unwrap();
        a.call(&ctx, 1).await.unwrap();
        assert!(b.call(&ctx, 1).await.is_err());
        assert_eq!(value.load(Ordering::SeqCst), 2);

        tx.rollback().await.unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 0);

        let logs = store.all();
        let undos = logs.iter().filter(|l| l.log_type == LogType::Undo).count();
        assert_eq!(undos, 2);
        let session = logs.iter().find(|l| l.log_type == LogType::Session).unwrap();
        assert_eq!(session.step_error.as_deref(), Some(ROLLED_BACK));
    }

    #[tokio::test]
    async fn recovery_undoes_orphaned_step_once() {
        let store = Arc::new(MemorySagaStore::new());
        let registry = SagaRegistry::new(store.clone()).with_timeout(Duration::from_secs(60));
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let (seen_in, calls_in) = (Arc::clone(&seen), Arc::clone(&calls));
        registry.add_step(Step::new(
            "reserve",
            |_ctx, _sku: String| async { Ok(()) },
            move |_ctx, sku: String| {
                let seen = Arc::clone(&seen_in);
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    seen.lock().push(sku);
                    Ok(())
                }
            },
        ));

        let long_ago = Utc::now() - TimeDelta::hours(1);
        store.log(&SagaLog::session("crashed", long_ago)).await.unwrap();
        let param = codec::encode(&"sku-42".to_string()).unwrap();
        store.log(&SagaLog::step("crashed", "reserve", param, long_ago)).await.unwrap();

        assert_eq!(registry.recover().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), vec!["sku-42".to_string()]);

        assert_eq!(registry.recover().await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_ignores_recent_transactions() {
        let store = Arc::new(MemorySagaStore::new());
        let registry = SagaRegistry::new(store.clone());
        let (_tx, _ctx) = registry.start_tx().await.unwrap();
        assert_eq!(registry.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_transaction_commit_and_rollback() {
        let store = Arc::new(MemorySagaStore::new());
        let registry = SagaRegistry::new(store.clone());

        let (tx, _) = registry.start_tx().await.unwrap();
        tx.commit().await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.all().is_empty());

        let (tx, _) = registry.start_tx().await.unwrap();
        tx.rollback().await.unwrap();
        let logs = store.all();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].finished_at.is_some());
        assert_eq!(logs[0].step_error.as_deref(), Some(ROLLED_BACK));
        assert!(store.uncommitted_sagas(Utc::now()).await.unwrap().is_empty());
        assert_eq!(registry.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rollback_after_commit_does_nothing() {
        let store = Arc::new(MemorySagaStore::new());
        let registry = SagaRegistry::new(store.clone());
        let value = Arc::new(AtomicI64::new(0));
        let a = registry.add_step(counter_step("a", &value, false));

        let (tx, ctx) = registry.start_tx().await.unwrap();
        a.call(&ctx, 5).await.unwrap();
        tx.commit().await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 5);
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn failed_compensation_keeps_session_open() {
        let store = Arc::new(MemorySagaStore::new());
        let registry = SagaRegistry::new(store.clone());
        let step = registry.add_step(Step::new(
            "charge",
            |_ctx, _cents: u64| async { Ok(()) },
            |_ctx, _cents: u64| async { Err(anyhow::anyhow!("gateway down")) },
        ));

        let (tx, ctx) = registry.start_tx().await.unwrap();
        step.call(&ctx, 100).await.unwrap();
        match tx.rollback().await {
            Err(SagaError::Rollback { errors, .. }) => assert_eq!(errors.len(), 1),
            other => panic!("expected rollback error, got {other:?}"),
        }
        let open = store.uncommitted_sagas(Utc::now()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].correlation_id, ctx.correlation_id());
    }

    #[tokio::test]
    async fn custom_codec_round_trips_through_log() {
        let store = Arc::new(MemorySagaStore::new());
        let registry = SagaRegistry::new(store.clone());
        let undone = Arc::new(Mutex::new(None));
        let undone_in = Arc::clone(&undone);
        let step = registry.add_step(
            Step::new(
                "label",
                |_ctx, _s: String| async { Ok(()) },
                move |_ctx, s: String| {
                    let undone = Arc::clone(&undone_in);
                    async move {
                        *undone.lock() = Some(s);
                        Ok(())
                    }
                },
            )
            .with_codec(
                |s: &String| Ok(s.as_bytes().to_vec()),
                |b: &[u8]| Ok(String::from_utf8(b.to_vec())?),
            ),
        );

        let (tx, ctx) = registry.start_tx().await.unwrap();
        step.call(&ctx, "plain".to_string()).await.unwrap();
        let do_log = store.all().into_iter().find(|l| l.log_type == LogType::Do).unwrap();
        assert_eq!(do_log.step_param, b"plain".to_vec());
        tx.rollback().await.unwrap();
        assert_eq!(undone.lock().as_deref(), Some("plain"));
    }
}
