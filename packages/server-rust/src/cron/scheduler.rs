//! Heap-driven job scheduler.
//!
//! Descriptors live in a binary heap ordered by their next fire time. The
//! run loop sleeps until the earliest fire time, pops every descriptor that
//! is due, reschedules it and spawns its run function on a task tracker.
//! `add` and `remove` wake the loop so it can recompute its sleep.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use keel_core::clock::{self, SharedClock};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::offset::OffsetStore;
use super::schedule::{Schedule, ScheduleError, ScheduleParser, StandardParser};

/// Monotonic job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-erased job body.
pub type JobFn = Arc<dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Rewrites a descriptor, usually by wrapping its run function.
pub type Middleware = Arc<dyn Fn(&mut Descriptor) + Send + Sync>;

/// Values handed to every job invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Child of the scheduler's base token. Stopping the run loop does not
    /// cancel it.
    pub token: CancellationToken,
    pub id: JobId,
    pub name: String,
    pub spec: String,
    /// Fire time of the previous invocation; `None` on the first run.
    pub prev: Option<DateTime<FixedOffset>>,
    /// Fire time of the following invocation; `None` if there is none.
    pub next: Option<DateTime<FixedOffset>>,
    /// Fire time of this invocation.
    pub scheduled: DateTime<FixedOffset>,
}

/// Where a persistence-enabled job stores its next fire time.
#[derive(Clone)]
pub struct OffsetBinding {
    pub store: Arc<dyn OffsetStore>,
    pub prefix: String,
}

impl OffsetBinding {
    #[must_use]
    pub fn key(&self, job: &str) -> String {
        format!("{}:{job}", self.prefix)
    }
}

/// A scheduled job.
pub struct Descriptor {
    pub id: JobId,
    pub name: String,
    pub spec: String,
    pub schedule: Arc<dyn Schedule>,
    pub run: JobFn,
    pub next: Option<DateTime<FixedOffset>>,
    pub prev: Option<DateTime<FixedOffset>>,
    pub offset: Option<OffsetBinding>,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("next", &self.next)
            .field("prev", &self.prev)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub spec: String,
    pub next: Option<DateTime<FixedOffset>>,
    pub prev: Option<DateTime<FixedOffset>>,
}

// ---------------------------------------------------------------------------
// Heap entry
// ---------------------------------------------------------------------------

/// Max-heap wrapper: the earliest `next` compares greatest, descriptors that
/// never fire again compare least, ties go to the lower id.
struct Entry(Descriptor);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_next = match (self.0.next, other.0.next) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        by_next.then_with(|| other.0.id.cmp(&self.0.id))
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Inner {
    heap: Mutex<BinaryHeap<Entry>>,
    next_id: AtomicU64,
    wake: Notify,
    clock: SharedClock,
    location: FixedOffset,
    parser: Arc<dyn ScheduleParser>,
    middleware: Vec<Middleware>,
    base: CancellationToken,
}

/// Cron scheduler. Cloning shares the same heap.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("location", &self.inner.location)
            .field("jobs", &self.inner.heap.lock().len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Current time in the scheduler's location.
    #[must_use]
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.inner.clock.now().with_timezone(&self.inner.location)
    }

    #[must_use]
    pub fn location(&self) -> FixedOffset {
        self.inner.location
    }

    /// Schedules `run` under `spec` with no per-job middleware.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when `spec` does not parse.
    pub fn add<F, Fut>(&self, spec: &str, run: F) -> Result<JobId, ScheduleError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_with(spec, run, Vec::new())
    }

    /// Schedules `run` under `spec`.
    ///
    /// Per-job middleware is applied right to left, so the first entry ends
    /// up as the outermost wrapper. Global middleware then wraps the result
    /// the same way.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when `spec` does not parse.
    pub fn add_with<F, Fut>(
        &self,
        spec: &str,
        run: F,
        middleware: impl IntoIterator<Item = Middleware>,
    ) -> Result<JobId, ScheduleError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let schedule = self.inner.parser.parse(spec)?;
        let id = JobId(self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed) + 1);
        let run: JobFn = Arc::new(move |ctx| run(ctx).boxed());

        let mut descriptor = Descriptor {
            id,
            name: format!("job-{id}"),
            spec: spec.to_string(),
            schedule,
            run,
            next: None,
            prev: None,
            offset: None,
        };
        let per_job: Vec<Middleware> = middleware.into_iter().collect();
        for m in per_job.iter().rev() {
            m(&mut descriptor);
        }
        for m in self.inner.middleware.iter().rev() {
            m(&mut descriptor);
        }
        descriptor.next = descriptor.schedule.next(self.now());

        debug!(job = %descriptor.name, id = %id, spec, next = ?descriptor.next, "cron job added");
        self.inner.heap.lock().push(Entry(descriptor));
        self.inner.wake.notify_waiters();
        Ok(id)
    }

    /// Unschedules a job. Unknown ids are ignored.
    pub fn remove(&self, id: JobId) {
        let removed = {
            let mut heap = self.inner.heap.lock();
            let before = heap.len();
            heap.retain(|e| e.0.id != id);
            before != heap.len()
        };
        if removed {
            debug!(id = %id, "cron job removed");
            self.inner.wake.notify_waiters();
        }
    }

    /// Snapshot of every scheduled job, earliest first.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobInfo> {
        let heap = self.inner.heap.lock();
        let mut entries: Vec<&Entry> = heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|e| JobInfo {
                id: e.0.id,
                name: e.0.name.clone(),
                spec: e.0.spec.clone(),
                next: e.0.next,
                prev: e.0.prev,
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.heap.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.heap.lock().is_empty()
    }

    /// Runs the scheduling loop until `token` is cancelled, then waits for
    /// every spawned job to finish.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches other run-group actors.
    pub async fn run(&self, token: CancellationToken) -> anyhow::Result<()> {
        let tracker = TaskTracker::new();
        self.prepare(&tracker).await;
        info!(jobs = self.len(), "cron scheduler started");

        loop {
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = self.time_until_next();
            tokio::select! {
                () = token.cancelled() => break,
                () = &mut notified => {}
                () = sleep_or_pending(wait) => {
                    let now = self.now();
                    self.fire_due(now, &tracker);
                }
            }
        }

        tracker.close();
        info!(running = tracker.len(), "cron scheduler stopping, waiting for jobs");
        tracker.wait().await;
        Ok(())
    }

    /// Recomputes every `next` from the current time and fires a catch-up run
    /// for persistent jobs whose stored fire time has already passed.
    async fn prepare(&self, tracker: &TaskTracker) {
        let now = self.now();
        let mut bindings = Vec::new();
        {
            let mut heap = self.inner.heap.lock();
            let mut entries = std::mem::take(&mut *heap).into_vec();
            for entry in &mut entries {
                entry.0.next = entry.0.schedule.next(now);
                if let Some(binding) = &entry.0.offset {
                    bindings.push((entry.0.id, binding.clone(), entry.0.name.clone()));
                }
            }
            *heap = BinaryHeap::from(entries);
        }

        for (id, binding, name) in bindings {
            let key = binding.key(&name);
            let stored = match binding.store.get(&key).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(job = %name, key, error = %e, "reading cron offset failed");
                    continue;
                }
            };
            let Some(missed) = stored.map(|t| t.with_timezone(&self.inner.location)) else {
                continue;
            };
            if missed > now {
                continue;
            }
            let job = {
                let mut heap = self.inner.heap.lock();
                let mut entries = std::mem::take(&mut *heap).into_vec();
                let job = entries.iter_mut().find(|e| e.0.id == id).map(|e| {
                    let previous = e.0.prev.replace(missed);
                    self.context_for(&e.0, missed, previous)
                });
                *heap = BinaryHeap::from(entries);
                job
            };
            if let Some((run, ctx)) = job {
                info!(job = %name, missed = %missed, "catching up missed cron run");
                spawn_job(tracker, run, ctx);
            }
        }
    }

    fn time_until_next(&self) -> Option<Duration> {
        let next = self.inner.heap.lock().peek().and_then(|e| e.0.next)?;
        let gap = next.signed_duration_since(self.now());
        Some(gap.to_std().unwrap_or(Duration::ZERO))
    }

    /// Pops and reschedules every descriptor due at or before `at`.
    fn fire_due(&self, at: DateTime<FixedOffset>, tracker: &TaskTracker) {
        let mut due = Vec::new();
        {
            let mut heap = self.inner.heap.lock();
            let mut popped = Vec::new();
            while heap.peek().is_some_and(|e| e.0.next.is_some_and(|n| n <= at)) {
                let Some(Entry(mut d)) = heap.pop() else { break };
                let fired = d.next.unwrap_or(at);
                let previous = d.prev.replace(fired);
                d.next = d.schedule.next(at);
                due.push(self.context_for(&d, fired, previous));
                popped.push(Entry(d));
            }
            heap.extend(popped);
        }
        for (run, ctx) in due {
            debug!(job = %ctx.name, scheduled = %ctx.scheduled, "firing cron job");
            spawn_job(tracker, run, ctx);
        }
    }

    fn context_for(
        &self,
        d: &Descriptor,
        scheduled: DateTime<FixedOffset>,
        prev: Option<DateTime<FixedOffset>>,
    ) -> (JobFn, JobContext) {
        let ctx = JobContext {
            token: self.inner.base.child_token(),
            id: d.id,
            name: d.name.clone(),
            spec: d.spec.clone(),
            prev,
            next: d.next,
            scheduled,
        };
        (Arc::clone(&d.run), ctx)
    }
}

fn spawn_job(tracker: &TaskTracker, run: JobFn, ctx: JobContext) {
    tracker.spawn(async move {
        let name = ctx.name.clone();
        if let Err(e) = run(ctx).await {
            debug!(job = %name, error = %e, "cron job returned error");
        }
    });
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures a [`Scheduler`].
pub struct SchedulerBuilder {
    clock: SharedClock,
    location: FixedOffset,
    parser: Arc<dyn ScheduleParser>,
    middleware: Vec<Middleware>,
    base: CancellationToken,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            clock: clock::system(),
            location: Utc.fix(),
            parser: Arc::new(StandardParser),
            middleware: Vec::new(),
            base: CancellationToken::new(),
        }
    }
}

impl SchedulerBuilder {
    /// Overrides the time source; tests pass a virtual clock.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn location(mut self, location: FixedOffset) -> Self {
        self.location = location;
        self
    }

    #[must_use]
    pub fn parser(mut self, parser: Arc<dyn ScheduleParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Adds a middleware applied to every job.
    #[must_use]
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Token every job context derives from. Jobs are cancelled only when
    /// this token is.
    #[must_use]
    pub fn base_token(mut self, token: CancellationToken) -> Self {
        self.base = token;
        self
    }

    #[must_use]
    pub fn build(self) -> Scheduler {
        Scheduler {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                next_id: AtomicU64::new(0),
                wake: Notify::new(),
                clock: self.clock,
                location: self.location,
                parser: self.parser,
                middleware: self.middleware,
                base: self.base,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use chrono::TimeZone;
    use keel_core::TokioClock;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cron::middleware;
    use crate::cron::offset::MemoryOffsetStore;

    /// Fires exactly once, at a fixed instant.
    struct Once(DateTime<FixedOffset>);

    impl Schedule for Once {
        fn next(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
            (after < self.0).then_some(self.0)
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn scheduler_at(start: DateTime<Utc>) -> Scheduler {
        Scheduler::builder()
            .clock(Arc::new(TokioClock::starting_at(start)))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_in_heap_order() {
        let scheduler = scheduler_at(start());
        let counter = Arc::new(AtomicU32::new(0));
        let origin = start().fixed_offset();

        // Added out of order on purpose.
        for step in [3u32, 1, 2] {
            let counter = Arc::clone(&counter);
            let at = origin + chrono::Duration::milliseconds(i64::from(step));
            scheduler
                .add_with(
                    "@every 1h",
                    move |_| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter
                                .compare_exchange(step - 1, step, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
                                .map_err(|seen| anyhow::anyhow!("job {step} ran after {seen}"))?;
                            Ok(())
                        }
                    },
                    [middleware::replace_schedule(Arc::new(Once(at)))],
                )
                .unwrap();
        }

        let token = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };
        tokio::time::sleep(Duration::from_millis(4)).await;
        token.cancel();
        runner.await.unwrap().unwrap();

        assert_eq!(counter.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_add_wakes_the_loop() {
        let scheduler = scheduler_at(start());
        let token = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler
            .add("@every 1s", move |ctx| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(ctx.scheduled);
                    Ok(())
                }
            })
            .unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("job did not fire within 2s")
            .unwrap();
        assert_eq!(fired, (start() + chrono::Duration::seconds(1)).fixed_offset());

        token.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scheduler_blocks_until_cancelled() {
        let scheduler = scheduler_at(start());
        let token = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!runner.is_finished());
        token.cancel();
        runner.await.unwrap().unwrap();
    }

    #[test]
    fn ids_are_monotonic_and_names_default() {
        let scheduler = Scheduler::new();
        let a = scheduler.add("@hourly", |_| async { Ok(()) }).unwrap();
        let b = scheduler.add("@daily", |_| async { Ok(()) }).unwrap();
        assert!(b > a);
        let names: Vec<String> = scheduler.jobs().into_iter().map(|j| j.name).collect();
        assert!(names.contains(&format!("job-{a}")));
        assert!(names.contains(&format!("job-{b}")));
    }

    #[test]
    fn invalid_spec_is_rejected() {
        let scheduler = Scheduler::new();
        assert!(scheduler.add("not a spec", |_| async { Ok(()) }).is_err());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn remove_twice_is_same_as_once() {
        let scheduler = Scheduler::new();
        let a = scheduler.add("@hourly", |_| async { Ok(()) }).unwrap();
        let b = scheduler.add("@hourly", |_| async { Ok(()) }).unwrap();
        scheduler.remove(a);
        scheduler.remove(a);
        let ids: Vec<JobId> = scheduler.jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![b]);
    }

    #[test]
    fn jobs_that_never_fire_sink_to_the_bottom() {
        let scheduler = scheduler_at(start());
        let past = start().fixed_offset() - chrono::Duration::seconds(1);
        let never = scheduler
            .add_with("@hourly", |_| async { Ok(()) }, [middleware::replace_schedule(Arc::new(Once(past)))])
            .unwrap();
        let hourly = scheduler.add("@hourly", |_| async { Ok(()) }).unwrap();
        let jobs = scheduler.jobs();
        assert_eq!(jobs[0].id, hourly);
        assert_eq!(jobs[1].id, never);
        assert_eq!(jobs[1].next, None);
    }

    #[tokio::test(start_paused = true)]
    async fn context_carries_prev_and_next() {
        let scheduler = scheduler_at(start());
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler
            .add("@every 1s", move |ctx| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((ctx.prev, ctx.scheduled, ctx.next));
                    Ok(())
                }
            })
            .unwrap();
        let token = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        let origin = start().fixed_offset();
        let sec = |n| origin + chrono::Duration::seconds(n);
        let (prev, at, next) = rx.recv().await.unwrap();
        assert_eq!((prev, at, next), (None, sec(1), Some(sec(2))));
        let (prev, at, next) = rx.recv().await.unwrap();
        assert_eq!((prev, at, next), (Some(sec(1)), sec(2), Some(sec(3))));

        token.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_loop_does_not_cancel_jobs() {
        let scheduler = scheduler_at(start());
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler
            .add("@every 1s", move |ctx| {
                let tx = tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let _ = tx.send(ctx.token.is_cancelled());
                    Ok(())
                }
            })
            .unwrap();
        let token = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };
        tokio::time::sleep(Duration::from_millis(1100)).await;
        token.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_persistent_run_is_caught_up() {
        let store = Arc::new(MemoryOffsetStore::new());
        let missed = start() - chrono::Duration::minutes(5);
        store.set("jobs:report", Some(missed)).await.unwrap();

        let scheduler = scheduler_at(start());
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler
            .add_with(
                "@hourly",
                move |ctx| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(ctx.scheduled);
                        Ok(())
                    }
                },
                [
                    middleware::name("report"),
                    middleware::persistence(store.clone(), "jobs"),
                ],
            )
            .unwrap();

        let token = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, missed.fixed_offset());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stored = store.get("jobs:report").await.unwrap();
        assert_eq!(stored, Some(start() + chrono::Duration::hours(1)));

        token.cancel();
        runner.await.unwrap().unwrap();
    }
}
