//! Descriptor middleware.
//!
//! Each constructor returns a [`Middleware`] for [`Scheduler::add_with`] or
//! [`SchedulerBuilder::middleware`]. Wrappers read the job name from the
//! [`JobContext`] at call time, so the order relative to [`name`] does not
//! matter.
//!
//! [`Scheduler::add_with`]: super::Scheduler::add_with
//! [`SchedulerBuilder::middleware`]: super::SchedulerBuilder::middleware

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use keel_core::group::panic_message;
use tracing::{error, info, info_span, warn, Instrument};

use super::offset::OffsetStore;
use super::schedule::Schedule;
use super::scheduler::{Descriptor, JobContext, JobFn, Middleware, OffsetBinding};

/// Replaces `descriptor.run` with `wrapper(inner, ctx)`.
fn wrap<W, Fut>(descriptor: &mut Descriptor, wrapper: W)
where
    W: Fn(JobFn, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let inner = Arc::clone(&descriptor.run);
    descriptor.run = Arc::new(move |ctx| wrapper(Arc::clone(&inner), ctx).boxed());
}

/// Sets the job name.
#[must_use]
pub fn name(name: impl Into<String>) -> Middleware {
    let name = name.into();
    Arc::new(move |d: &mut Descriptor| d.name.clone_from(&name))
}

/// Swaps the parsed schedule for another one.
#[must_use]
pub fn replace_schedule(schedule: Arc<dyn Schedule>) -> Middleware {
    Arc::new(move |d: &mut Descriptor| d.schedule = Arc::clone(&schedule))
}

/// Logs start, completion with duration, and failure.
#[must_use]
pub fn logging() -> Middleware {
    Arc::new(|d: &mut Descriptor| {
        wrap(d, |inner, ctx| async move {
            let job = ctx.name.clone();
            info!(job = %job, scheduled = %ctx.scheduled, "cron job started");
            let started = Instant::now();
            let result = inner(ctx).await;
            let elapsed = started.elapsed();
            match &result {
                Ok(()) => info!(job = %job, ?elapsed, "cron job finished"),
                Err(e) => warn!(job = %job, ?elapsed, error = %e, "cron job failed"),
            }
            result
        });
    })
}

/// Records `cron_job_duration_seconds` and `cron_job_failures_total`.
#[must_use]
pub fn metrics() -> Middleware {
    Arc::new(|d: &mut Descriptor| {
        wrap(d, |inner, ctx| async move {
            let job = ctx.name.clone();
            let started = Instant::now();
            let result = inner(ctx).await;
            metrics::histogram!("cron_job_duration_seconds", "job" => job.clone())
                .record(started.elapsed().as_secs_f64());
            if result.is_err() {
                metrics::counter!("cron_job_failures_total", "job" => job).increment(1);
            }
            result
        });
    })
}

/// Runs the job inside a `Job: <name>` span tagged with its schedule.
#[must_use]
pub fn tracing() -> Middleware {
    Arc::new(|d: &mut Descriptor| {
        wrap(d, |inner, ctx| async move {
            let span = info_span!(
                "cron_job",
                otel.name = %format!("Job: {}", ctx.name),
                job.schedule = %ctx.spec,
                error = tracing::field::Empty,
            );
            let result = inner(ctx).instrument(span.clone()).await;
            if let Err(e) = &result {
                span.record("error", tracing::field::display(e));
            }
            result
        });
    })
}

/// Turns a panic in the job into an error.
#[must_use]
pub fn recover() -> Middleware {
    Arc::new(|d: &mut Descriptor| {
        wrap(d, |inner, ctx| async move {
            let job = ctx.name.clone();
            match AssertUnwindSafe(inner(ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    let backtrace = std::backtrace::Backtrace::force_capture();
                    error!(job = %job, panic = %msg, %backtrace, "cron job panicked");
                    Err(anyhow::anyhow!("cron job {job} panicked: {msg}"))
                }
            }
        });
    })
}

/// Drops an invocation while the previous one is still running.
#[must_use]
pub fn skip_if_overlap() -> Middleware {
    Arc::new(|d: &mut Descriptor| {
        let running = Arc::new(tokio::sync::Mutex::new(()));
        wrap(d, move |inner, ctx| {
            let running = Arc::clone(&running);
            async move {
                let Ok(_guard) = running.try_lock_owned() else {
                    info!(job = %ctx.name, "previous run still active, skipping");
                    return Ok(());
                };
                inner(ctx).await
            }
        });
    })
}

/// Makes an invocation wait for the previous one to finish.
#[must_use]
pub fn delay_if_overlap() -> Middleware {
    Arc::new(|d: &mut Descriptor| {
        let running = Arc::new(tokio::sync::Mutex::new(()));
        wrap(d, move |inner, ctx| {
            let running = Arc::clone(&running);
            async move {
                let _guard = running.lock_owned().await;
                inner(ctx).await
            }
        });
    })
}

/// Cancels the job's token once its next fire time arrives.
#[must_use]
pub fn timeout_if_overlap() -> Middleware {
    Arc::new(|d: &mut Descriptor| {
        wrap(d, |inner, mut ctx| async move {
            let Some(budget) = ctx
                .next
                .and_then(|next| next.signed_duration_since(ctx.scheduled).to_std().ok())
            else {
                return inner(ctx).await;
            };
            let child = ctx.token.child_token();
            ctx.token = child.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                child.cancel();
            });
            let result = inner(ctx).await;
            timer.abort();
            result
        });
    })
}

/// Stores the next fire time after every run, and enables a catch-up run at
/// scheduler start when the stored time has already passed.
///
/// The store key is `<prefix>:<job name>`.
#[must_use]
pub fn persistence(store: Arc<dyn OffsetStore>, prefix: impl Into<String>) -> Middleware {
    let binding = OffsetBinding {
        store,
        prefix: prefix.into(),
    };
    Arc::new(move |d: &mut Descriptor| {
        d.offset = Some(binding.clone());
        let binding = binding.clone();
        wrap(d, move |inner, ctx| {
            let binding = binding.clone();
            async move {
                let key = binding.key(&ctx.name);
                let next = ctx.next.map(|t| t.to_utc());
                let result = inner(ctx).await;
                if let Err(e) = binding.store.set(&key, next).await {
                    warn!(key, error = %e, "writing cron offset failed");
                }
                result
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::{DateTime, FixedOffset, TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cron::offset::MemoryOffsetStore;
    use crate::cron::scheduler::JobId;
    use crate::cron::schedule::{ScheduleParser, StandardParser};

    fn at(secs: i64) -> DateTime<FixedOffset> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap().fixed_offset()
    }

    fn descriptor<F, Fut>(run: F) -> Descriptor
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Descriptor {
            id: JobId(1),
            name: "job-1".into(),
            spec: "@every 1s".into(),
            schedule: StandardParser.parse("@every 1s").unwrap(),
            run: Arc::new(move |ctx| run(ctx).boxed()),
            next: None,
            prev: None,
            offset: None,
        }
    }

    fn context(d: &Descriptor, next: Option<DateTime<FixedOffset>>) -> JobContext {
        JobContext {
            token: CancellationToken::new(),
            id: d.id,
            name: d.name.clone(),
            spec: d.spec.clone(),
            prev: None,
            next,
            scheduled: at(0),
        }
    }

    #[test]
    fn name_sets_descriptor_name() {
        let mut d = descriptor(|_| async { Ok(()) });
        name("nightly")(&mut d);
        assert_eq!(d.name, "nightly");
    }

    #[tokio::test]
    async fn recover_turns_panic_into_error() {
        fn boom() -> anyhow::Result<()> {
            panic!("boom")
        }
        let mut d = descriptor(|_| async { boom() });
        recover()(&mut d);
        let ctx = context(&d, None);
        let err = (d.run)(ctx).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn skip_if_overlap_drops_concurrent_run() {
        let runs = Arc::new(AtomicU32::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let counted = Arc::clone(&runs);
        let mut d = descriptor(move |_| {
            let counted = Arc::clone(&counted);
            let mut release = release_rx.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                let _ = release.wait_for(|r| *r).await;
                Ok(())
            }
        });
        skip_if_overlap()(&mut d);

        let first = tokio::spawn((d.run)(context(&d, None)));
        tokio::task::yield_now().await;
        while runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        (d.run)(context(&d, None)).await.unwrap();
        release_tx.send(true).unwrap();
        first.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delay_if_overlap_serializes_runs() {
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let mut d = descriptor(move |_| {
            let (a, p) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        delay_if_overlap()(&mut d);
        let one = tokio::spawn((d.run)(context(&d, None)));
        let two = tokio::spawn((d.run)(context(&d, None)));
        one.await.unwrap().unwrap();
        two.await.unwrap().unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_if_overlap_cancels_at_next_fire() {
        let mut d = descriptor(|ctx: JobContext| async move {
            tokio::select! {
                () = ctx.token.cancelled() => Err(anyhow::anyhow!("cancelled")),
                () = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
            }
        });
        timeout_if_overlap()(&mut d);
        let started = tokio::time::Instant::now();
        let result = (d.run)(context(&d, Some(at(2)))).await;
        assert!(result.is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn persistence_writes_next_fire_time() {
        let store = Arc::new(MemoryOffsetStore::new());
        let mut d = descriptor(|_| async { Err(anyhow::anyhow!("fails anyway")) });
        persistence(store.clone(), "cron")(&mut d);
        assert!(d.offset.is_some());
        let _ = (d.run)(context(&d, Some(at(60)))).await;
        assert_eq!(store.get("cron:job-1").await.unwrap(), Some(at(60).to_utc()));
    }

    #[tokio::test]
    async fn metrics_and_logging_pass_results_through() {
        let mut d = descriptor(|_| async { Err(anyhow::anyhow!("nope")) });
        logging()(&mut d);
        metrics()(&mut d);
        tracing()(&mut d);
        assert!((d.run)(context(&d, None)).await.is_err());
    }
}
