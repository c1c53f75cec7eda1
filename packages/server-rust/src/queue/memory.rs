//! In-process driver for tests and single-node development.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use keel_core::clock::{self, SharedClock};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::backoff::BackoffPolicy;
use super::driver::{ensure_reloadable, Driver};
use super::message::{Channel, PersistedEvent, QueueError, QueueInfo};

#[derive(Default)]
struct State {
    /// Pushed at the front, popped from the back.
    waiting: VecDeque<PersistedEvent>,
    delayed: BTreeMap<(DateTime<Utc>, u64), PersistedEvent>,
    reserved: HashMap<String, (DateTime<Utc>, PersistedEvent)>,
    failed: VecDeque<PersistedEvent>,
    timeout: VecDeque<PersistedEvent>,
    seq: u64,
}

impl State {
    fn delay(&mut self, visible_at: DateTime<Utc>, msg: PersistedEvent) {
        self.seq += 1;
        self.delayed.insert((visible_at, self.seq), msg);
    }

    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let msg = entry.remove();
            self.waiting.push_front(msg);
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .reserved
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((_, msg)) = self.reserved.remove(&id) {
                tracing::warn!(unique_id = %id, key = %msg.key, "reserved event timed out");
                self.timeout.push_front(msg);
            }
        }
    }

    fn until_next_delayed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let (at, _) = self.delayed.keys().next()?;
        Some(at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Driver that keeps every channel in memory.
pub struct MemoryDriver {
    state: Mutex<State>,
    ready: Notify,
    clock: SharedClock,
    poll_timeout: Duration,
    backoff: BackoffPolicy,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            clock: clock::system(),
            poll_timeout: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn after(&self, delay: Duration) -> DateTime<Utc> {
        self.clock.now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn push(&self, msg: &PersistedEvent, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if delay.is_zero() {
                state.waiting.push_front(msg.clone());
            } else {
                let at = self.after(delay);
                state.delay(at, msg.clone());
            }
        }
        self.ready.notify_waiters();
        Ok(())
    }

    async fn pop(&self) -> Result<Option<PersistedEvent>, QueueError> {
        let give_up = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_delayed = {
                let mut state = self.state.lock();
                let now = self.clock.now();
                state.promote(now);
                state.sweep(now);
                if let Some(msg) = state.waiting.pop_back() {
                    let deadline = now + TimeDelta::from_std(msg.handle_timeout).unwrap_or(TimeDelta::MAX);
                    state.reserved.insert(msg.unique_id.clone(), (deadline, msg.clone()));
                    return Ok(Some(msg));
                }
                state.until_next_delayed(now)
            };

            let remaining = give_up.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let wait = next_delayed.map_or(remaining, |d| d.max(Duration::from_millis(1)).min(remaining));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, msg: &PersistedEvent) -> Result<(), QueueError> {
        self.state.lock().reserved.remove(&msg.unique_id);
        Ok(())
    }

    async fn fail(&self, msg: &PersistedEvent) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.reserved.remove(&msg.unique_id);
        state.failed.push_front(msg.clone());
        Ok(())
    }

    async fn retry(&self, msg: &PersistedEvent) -> Result<(), QueueError> {
        let backoff = self.backoff.delay(msg.attempts);
        let mut next = msg.clone();
        next.attempts += 1;
        next.backoff = backoff;
        {
            let mut state = self.state.lock();
            state.reserved.remove(&msg.unique_id);
            let at = self.after(backoff);
            state.delay(at, next);
        }
        self.ready.notify_waiters();
        Ok(())
    }

    async fn release(&self, msg: &PersistedEvent) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if let Some((_, held)) = state.reserved.remove(&msg.unique_id) {
                state.waiting.push_back(held);
            }
        }
        self.ready.notify_waiters();
        Ok(())
    }

    async fn reload(&self, channel: Channel) -> Result<u64, QueueError> {
        ensure_reloadable(channel)?;
        let moved = {
            let mut state = self.state.lock();
            let mut source = match channel {
                Channel::Failed => std::mem::take(&mut state.failed),
                _ => std::mem::take(&mut state.timeout),
            };
            let moved = source.len() as u64;
            while let Some(msg) = source.pop_back() {
                state.waiting.push_front(msg);
            }
            moved
        };
        self.ready.notify_waiters();
        Ok(moved)
    }

    async fn flush(&self, channel: Channel) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        match channel {
            Channel::Waiting => state.waiting.clear(),
            Channel::Delayed => state.delayed.clear(),
            Channel::Reserved => state.reserved.clear(),
            Channel::Failed => state.failed.clear(),
            Channel::Timeout => state.timeout.clear(),
        }
        Ok(())
    }

    async fn info(&self) -> Result<QueueInfo, QueueError> {
        let state = self.state.lock();
        Ok(QueueInfo {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            reserved: state.reserved.len() as u64,
            failed: state.failed.len() as u64,
            timeout: state.timeout.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_core::TokioClock;

    use super::*;

    fn msg(id: &str) -> PersistedEvent {
        PersistedEvent {
            unique_id: id.to_string(),
            key: "topic".to_string(),
            value: vec![1, 2, 3],
            handle_timeout: Duration::from_secs(5),
            backoff: Duration::ZERO,
            attempts: 1,
            max_attempts: 3,
        }
    }

    fn driver() -> MemoryDriver {
        MemoryDriver::new()
            .with_clock(Arc::new(TokioClock::default()))
            .with_poll_timeout(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_is_fifo() {
        let d = driver();
        d.push(&msg("a"), Duration::ZERO).await.unwrap();
        d.push(&msg("b"), Duration::ZERO).await.unwrap();
        assert_eq!(d.pop().await.unwrap().unwrap().unique_id, "a");
        assert_eq!(d.pop().await.unwrap().unwrap().unique_id, "b");
        assert_eq!(d.info().await.unwrap().reserved, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pop_times_out() {
        let d = driver();
        let started = tokio::time::Instant::now();
        assert!(d.pop().await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_entries_become_visible() {
        let d = driver();
        d.push(&msg("later"), Duration::from_millis(300)).await.unwrap();
        assert_eq!(d.info().await.unwrap().delayed, 1);
        let popped = d.pop().await.unwrap().unwrap();
        assert_eq!(popped.unique_id, "later");
        assert_eq!(d.info().await.unwrap().delayed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_pop_wakes_on_push() {
        let d = Arc::new(driver().with_poll_timeout(Duration::from_secs(30)));
        let popper = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        d.push(&msg("x"), Duration::ZERO).await.unwrap();
        let popped = popper.await.unwrap().unwrap().unwrap();
        assert_eq!(popped.unique_id, "x");
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_entry_times_out_and_reloads() {
        let d = driver();
        d.push(&msg("m"), Duration::ZERO).await.unwrap();
        let first = d.pop().await.unwrap().unwrap();

        tokio::time::sleep(first.handle_timeout + Duration::from_millis(1)).await;
        assert!(d.pop().await.unwrap().is_none());
        let info = d.info().await.unwrap();
        assert_eq!((info.reserved, info.timeout), (0, 1));

        assert_eq!(d.reload(Channel::Timeout).await.unwrap(), 1);
        let again = d.pop().await.unwrap().unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_moves_to_delayed_with_backoff() {
        let d = driver();
        d.push(&msg("r"), Duration::ZERO).await.unwrap();
        let popped = d.pop().await.unwrap().unwrap();
        d.retry(&popped).await.unwrap();
        let info = d.info().await.unwrap();
        assert_eq!((info.reserved, info.delayed), (0, 1));

        let again = d.pop().await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(again.backoff, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn released_entry_is_popped_before_newer_ones() {
        let d = driver();
        d.push(&msg("a"), Duration::ZERO).await.unwrap();
        d.push(&msg("b"), Duration::ZERO).await.unwrap();
        let first = d.pop().await.unwrap().unwrap();
        d.release(&first).await.unwrap();
        let info = d.info().await.unwrap();
        assert_eq!((info.waiting, info.reserved), (2, 0));
        assert_eq!(d.pop().await.unwrap().unwrap(), first);

        d.release(&msg("ghost")).await.unwrap();
        assert_eq!(d.info().await.unwrap().waiting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_of_unknown_message_is_noop() {
        let d = driver();
        d.ack(&msg("ghost")).await.unwrap();
        assert_eq!(d.info().await.unwrap(), QueueInfo::default());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_then_flush() {
        let d = driver();
        d.push(&msg("f"), Duration::ZERO).await.unwrap();
        let popped = d.pop().await.unwrap().unwrap();
        d.fail(&popped).await.unwrap();
        assert_eq!(d.info().await.unwrap().failed, 1);
        assert!(d.reload(Channel::Waiting).await.is_err());
        d.flush(Channel::Failed).await.unwrap();
        assert_eq!(d.info().await.unwrap().failed, 0);
    }
}
