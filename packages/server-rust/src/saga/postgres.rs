//! Postgres-backed saga store, enabled by the `postgres` feature.
//!
//! Rows live in `<schema>.saga_logs`, created on first use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::clock::{self, SharedClock};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;

use super::log::{LogType, SagaLog};
use super::store::{uncompensated, SagaStore};

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty() && schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Saga store over a shared `PgPool`.
pub struct PostgresSagaStore {
    pool: PgPool,
    schema: String,
    clock: SharedClock,
    schema_ready: OnceCell<()>,
}

impl PostgresSagaStore {
    /// Store with a lazily connecting pool.
    ///
    /// # Errors
    ///
    /// Returns an error if `database_url` cannot be parsed.
    pub fn connect_lazy(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect_lazy(database_url)?;
        Ok(Self::with_pool(pool))
    }

    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            clock: clock::system(),
            schema_ready: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn table(&self) -> String {
        format!("{}.saga_logs", self.schema)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                anyhow::ensure!(
                    is_valid_schema_ident(&self.schema),
                    "invalid saga schema name {:?}",
                    self.schema
                );
                let ddl = format!(
                    "CREATE SCHEMA IF NOT EXISTS {schema};
                     CREATE TABLE IF NOT EXISTS {table} (
                        id TEXT PRIMARY KEY,
                        correlation_id TEXT NOT NULL,
                        started_at TIMESTAMPTZ NOT NULL,
                        finished_at TIMESTAMPTZ NULL,
                        log_type SMALLINT NOT NULL,
                        step_name TEXT NOT NULL,
                        step_param BYTEA NOT NULL,
                        step_error TEXT NULL
                     );
                     CREATE INDEX IF NOT EXISTS saga_logs_correlation_idx ON {table} (correlation_id);",
                    schema = self.schema,
                    table = self.table(),
                );
                sqlx::raw_sql(&ddl).execute(&self.pool).await?;
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

fn row_to_log(row: &PgRow) -> anyhow::Result<SagaLog> {
    let code: i16 = row.try_get("log_type")?;
    Ok(SagaLog {
        id: row.try_get("id")?,
        correlation_id: row.try_get("correlation_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        log_type: LogType::from_code(code).ok_or_else(|| anyhow::anyhow!("unknown saga log type {code}"))?,
        step_name: row.try_get("step_name")?,
        step_param: row.try_get("step_param")?,
        step_error: row.try_get("step_error")?,
    })
}

const COLUMNS: &str = "id, correlation_id, started_at, finished_at, log_type, step_name, step_param, step_error";

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn log(&self, log: &SagaLog) -> anyhow::Result<()> {
        self.ensure_schema().await?;
        let sql = format!(
            "INSERT INTO {} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.table()
        );
        sqlx::query(&sql)
            .bind(&log.id)
            .bind(&log.correlation_id)
            .bind(log.started_at)
            .bind(log.finished_at)
            .bind(log.log_type.code())
            .bind(&log.step_name)
            .bind(&log.step_param)
            .bind(&log.step_error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ack(&self, log_id: &str, error: Option<String>) -> anyhow::Result<()> {
        self.ensure_schema().await?;
        let table = self.table();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE {table} SET finished_at = $2, step_error = $3 WHERE id = $1 RETURNING correlation_id, log_type"
        ))
        .bind(log_id)
        .bind(self.clock.now())
        .bind(&error)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = row {
            let code: i16 = row.try_get("log_type")?;
            if code == LogType::Session.code() && error.is_none() {
                let correlation_id: String = row.try_get("correlation_id")?;
                sqlx::query(&format!("DELETE FROM {table} WHERE correlation_id = $1"))
                    .bind(correlation_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn unacknowledged_steps(&self, correlation_id: &str) -> anyhow::Result<Vec<SagaLog>> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE correlation_id = $1 AND log_type IN ($2, $3) ORDER BY started_at, id",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(correlation_id)
            .bind(LogType::Do.code())
            .bind(LogType::Undo.code())
            .fetch_all(&self.pool)
            .await?;
        let logs = rows.iter().map(row_to_log).collect::<anyhow::Result<Vec<_>>>()?;
        Ok(uncompensated(&logs))
    }

    async fn uncommitted_sagas(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<SagaLog>> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE log_type = $1 AND finished_at IS NULL AND started_at <= $2 ORDER BY started_at",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(LogType::Session.code())
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_log).collect()
    }
}
