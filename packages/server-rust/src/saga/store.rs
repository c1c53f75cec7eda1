//! Saga log persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::clock::{self, SharedClock};
use parking_lot::Mutex;

use super::log::{LogType, SagaLog};

/// Durable record of saga progress.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Appends a log entry.
    async fn log(&self, log: &SagaLog) -> anyhow::Result<()>;

    /// Marks an entry finished with an optional error.
    ///
    /// Acknowledging a Session entry without an error commits the saga: the
    /// store may forget every entry of that correlation id.
    async fn ack(&self, log_id: &str, error: Option<String>) -> anyhow::Result<()>;

    /// Do entries of `correlation_id` that no successful Undo entry
    /// compensates yet, in log order.
    async fn unacknowledged_steps(&self, correlation_id: &str) -> anyhow::Result<Vec<SagaLog>>;

    /// Unfinished Session entries started at or before `older_than`.
    async fn uncommitted_sagas(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<SagaLog>>;
}

/// Pairs each successful Undo with one Do of the same step and parameter,
/// returning the Do entries left over.
pub(crate) fn uncompensated(logs: &[SagaLog]) -> Vec<SagaLog> {
    let mut undone: Vec<&SagaLog> = logs
        .iter()
        .filter(|l| l.log_type == LogType::Undo && l.succeeded())
        .collect();
    let mut pending = Vec::new();
    for log in logs.iter().filter(|l| l.log_type == LogType::Do) {
        let matched = undone
            .iter()
            .position(|u| u.step_name == log.step_name && u.step_param == log.step_param);
        match matched {
            Some(idx) => {
                undone.swap_remove(idx);
            }
            None => pending.push(log.clone()),
        }
    }
    pending
}

/// Process-local saga store.
pub struct MemorySagaStore {
    logs: Mutex<Vec<SagaLog>>,
    clock: SharedClock,
}

impl Default for MemorySagaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySagaStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(Vec::new()),
            clock: clock::system(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Every stored entry, in log order.
    #[must_use]
    pub fn all(&self) -> Vec<SagaLog> {
        self.logs.lock().clone()
    }
}

#[async_trait]
impl SagaStore for MemorySagaStore {
    async fn log(&self, log: &SagaLog) -> anyhow::Result<()> {
        self.logs.lock().push(log.clone());
        Ok(())
    }

    async fn ack(&self, log_id: &str, error: Option<String>) -> anyhow::Result<()> {
        let now = self.clock.now();
        let mut logs = self.logs.lock();
        let Some(entry) = logs.iter_mut().find(|l| l.id == log_id) else {
            return Ok(());
        };
        entry.finished_at = Some(now);
        entry.step_error = error;
        if entry.log_type == LogType::Session && entry.step_error.is_none() {
            let committed = entry.correlation_id.clone();
            logs.retain(|l| l.correlation_id != committed);
        }
        Ok(())
    }

    async fn unacknowledged_steps(&self, correlation_id: &str) -> anyhow::Result<Vec<SagaLog>> {
        let logs: Vec<SagaLog> = self
            .logs
            .lock()
            .iter()
            .filter(|l| l.correlation_id == correlation_id)
            .cloned()
            .collect();
        Ok(uncompensated(&logs))
    }

    async fn uncommitted_sagas(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<SagaLog>> {
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|l| l.log_type == LogType::Session && l.finished_at.is_none() && l.started_at <= older_than)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn committing_a_session_forgets_the_saga() {
        let store = MemorySagaStore::new();
        let session = SagaLog::session("c1", t(0));
        store.log(&session).await.unwrap();
        store.log(&SagaLog::step("c1", "a", vec![1], t(1))).await.unwrap();
        store.log(&SagaLog::session("c2", t(0))).await.unwrap();
        store.ack(&session.id, None).await.unwrap();
        let left: Vec<String> = store.all().into_iter().map(|l| l.correlation_id).collect();
        assert_eq!(left, vec!["c2"]);
    }

    #[tokio::test]
    async fn session_acked_with_error_is_kept_but_not_uncommitted() {
        let store = MemorySagaStore::new();
        let session = SagaLog::session("c1", t(0));
        store.log(&session).await.unwrap();
        store.ack(&session.id, Some("rolled back".into())).await.unwrap();
        assert_eq!(store.all().len(), 1);
        assert!(store.uncommitted_sagas(t(100)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncommitted_respects_age() {
        let store = MemorySagaStore::new();
        store.log(&SagaLog::session("old", t(0))).await.unwrap();
        store.log(&SagaLog::session("new", t(50))).await.unwrap();
        let found = store.uncommitted_sagas(t(10)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].correlation_id, "old");
    }

    #[test]
    fn successful_undo_compensates_one_do() {
        let a1 = SagaLog::step("c", "a", vec![1], t(0));
        let a2 = SagaLog::step("c", "a", vec![1], t(1));
        let b = SagaLog::step("c", "b", vec![2], t(2));
        let mut undo = SagaLog::undo("c", "a", vec![1], t(3));
        undo.finished_at = Some(t(4));
        let mut failed_undo = SagaLog::undo("c", "b", vec![2], t(3));
        failed_undo.finished_at = Some(t(4));
        failed_undo.step_error = Some("boom".into());

        let left = uncompensated(&[a1, a2.clone(), b.clone(), undo, failed_undo]);
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].step_name, a2.step_name);
        assert_eq!(left[1].id, b.id);
    }
}
