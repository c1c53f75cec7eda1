//! Ordered schema migrations and seed scripts contributed by modules.
//!
//! A [`Migrator`] runs against one connection name at a time. Applied ids
//! are remembered in a [`MigrationLedger`]; the in-memory ledger is the
//! default and applications backed by a database supply their own.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::info;

use crate::module::ModuleRegistry;

type ScriptFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn script<F, Fut>(f: F) -> ScriptFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// One reversible schema change. Ids sort lexically, so date prefixes
/// such as `2024_01_31_create_users` order naturally.
#[derive(Clone)]
pub struct Migration {
    pub id: String,
    pub connection: String,
    up: ScriptFn,
    down: ScriptFn,
}

impl Migration {
    pub fn new<U, UFut, D, DFut>(id: impl Into<String>, connection: impl Into<String>, up: U, down: D) -> Self
    where
        U: Fn() -> UFut + Send + Sync + 'static,
        UFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        D: Fn() -> DFut + Send + Sync + 'static,
        DFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            connection: connection.into(),
            up: script(up),
            down: script(down),
        }
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// A data script run on demand.
#[derive(Clone)]
pub struct Seed {
    pub name: String,
    pub connection: String,
    run: ScriptFn,
}

impl Seed {
    pub fn new<F, Fut>(name: impl Into<String>, connection: impl Into<String>, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            connection: connection.into(),
            run: script(run),
        }
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seed")
            .field("name", &self.name)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Records which migrations have been applied.
#[async_trait]
pub trait MigrationLedger: Send + Sync {
    async fn applied(&self, connection: &str) -> anyhow::Result<BTreeSet<String>>;
    async fn record(&self, connection: &str, id: &str) -> anyhow::Result<()>;
    async fn forget(&self, connection: &str, id: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryLedger {
    applied: Mutex<BTreeSet<(String, String)>>,
}

#[async_trait]
impl MigrationLedger for MemoryLedger {
    async fn applied(&self, connection: &str) -> anyhow::Result<BTreeSet<String>> {
        Ok(self
            .applied
            .lock()
            .iter()
            .filter(|(c, _)| c == connection)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn record(&self, connection: &str, id: &str) -> anyhow::Result<()> {
        self.applied.lock().insert((connection.to_string(), id.to_string()));
        Ok(())
    }

    async fn forget(&self, connection: &str, id: &str) -> anyhow::Result<()> {
        self.applied.lock().remove(&(connection.to_string(), id.to_string()));
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("refusing to run against {env} without --force")]
    ProductionGuard { env: String },
    #[error("migration {0} is not applied on this connection")]
    NotApplied(String),
    #[error("{stage} {id}: {source}")]
    Script {
        stage: &'static str,
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Ledger(#[from] anyhow::Error),
}

/// Runs migrations and seeds collected from the module registry.
pub struct Migrator {
    migrations: Vec<Migration>,
    seeds: Vec<Seed>,
    ledger: Arc<dyn MigrationLedger>,
    production: bool,
    env: String,
}

impl Migrator {
    #[must_use]
    pub fn new(migrations: Vec<Migration>, seeds: Vec<Seed>) -> Self {
        Self {
            migrations,
            seeds,
            ledger: Arc::new(MemoryLedger::default()),
            production: false,
            env: "local".to_string(),
        }
    }

    /// Collects every module's migrations and seeds.
    #[must_use]
    pub fn from_modules(modules: &ModuleRegistry) -> Self {
        let migrations = modules
            .migration_providers()
            .iter()
            .flat_map(|p| p.provide_migration())
            .collect();
        let seeds = modules
            .seed_providers()
            .iter()
            .flat_map(|p| p.provide_seed())
            .collect();
        Self::new(migrations, seeds)
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn MigrationLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Marks the environment; `production` and `prod` require `force`.
    #[must_use]
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self.production = matches!(self.env.as_str(), "production" | "prod");
        self
    }

    fn guard(&self, force: bool) -> Result<(), MigrationError> {
        if self.production && !force {
            return Err(MigrationError::ProductionGuard { env: self.env.clone() });
        }
        Ok(())
    }

    fn for_connection(&self, connection: &str) -> Vec<&Migration> {
        let mut selected: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.connection == connection)
            .collect();
        selected.sort_by(|a, b| a.id.cmp(&b.id));
        selected
    }

    /// Applies pending migrations in id order; returns the applied ids.
    ///
    /// # Errors
    ///
    /// Stops at the first failing migration.
    pub async fn migrate(&self, connection: &str, force: bool) -> Result<Vec<String>, MigrationError> {
        self.guard(force)?;
        let applied = self.ledger.applied(connection).await?;
        let mut done = Vec::new();
        for migration in self.for_connection(connection) {
            if applied.contains(&migration.id) {
                continue;
            }
            (migration.up)().await.map_err(|source| MigrationError::Script {
                stage: "migrate",
                id: migration.id.clone(),
                source,
            })?;
            self.ledger.record(connection, &migration.id).await?;
            info!(connection, id = %migration.id, "migration applied");
            done.push(migration.id.clone());
        }
        Ok(done)
    }

    /// Reverts applied migrations from the newest back to and including
    /// `target`; returns the reverted ids.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::NotApplied`] if `target` is not applied,
    /// otherwise stops at the first failing `down`.
    pub async fn rollback(&self, connection: &str, target: &str, force: bool) -> Result<Vec<String>, MigrationError> {
        self.guard(force)?;
        let applied = self.ledger.applied(connection).await?;
        if !applied.contains(target) {
            return Err(MigrationError::NotApplied(target.to_string()));
        }
        let mut done = Vec::new();
        for migration in self.for_connection(connection).into_iter().rev() {
            if migration.id.as_str() < target {
                break;
            }
            if !applied.contains(&migration.id) {
                continue;
            }
            (migration.down)().await.map_err(|source| MigrationError::Script {
                stage: "rollback",
                id: migration.id.clone(),
                source,
            })?;
            self.ledger.forget(connection, &migration.id).await?;
            info!(connection, id = %migration.id, "migration rolled back");
            done.push(migration.id.clone());
        }
        Ok(done)
    }

    /// Runs every seed for `connection` in registration order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing seed.
    pub async fn seed(&self, connection: &str, force: bool) -> Result<usize, MigrationError> {
        self.guard(force)?;
        let mut count = 0;
        for seed in self.seeds.iter().filter(|s| s.connection == connection) {
            (seed.run)().await.map_err(|source| MigrationError::Script {
                stage: "seed",
                id: seed.name.clone(),
                source,
            })?;
            info!(connection, seed = %seed.name, "seed finished");
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(id: &str, log: &Arc<Mutex<Vec<String>>>) -> Migration {
        let (up_log, down_log) = (Arc::clone(log), Arc::clone(log));
        let (up_id, down_id) = (format!("up:{id}"), format!("down:{id}"));
        Migration::new(
            id,
            "default",
            move || {
                let (log, tag) = (Arc::clone(&up_log), up_id.clone());
                async move {
                    log.lock().push(tag);
                    Ok(())
                }
            },
            move || {
                let (log, tag) = (Arc::clone(&down_log), down_id.clone());
                async move {
                    log.lock().push(tag);
                    Ok(())
                }
            },
        )
    }

    #[tokio::test]
    async fn migrate_runs_pending_in_id_order_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let migrator = Migrator::new(
            vec![recording("002_b", &log), recording("001_a", &log)],
            Vec::new(),
        );
        assert_eq!(migrator.migrate("default", false).await.unwrap(), vec!["001_a", "002_b"]);
        assert!(migrator.migrate("default", false).await.unwrap().is_empty());
        assert_eq!(*log.lock(), vec!["up:001_a", "up:002_b"]);
        assert!(migrator.migrate("other", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_reverts_down_to_target() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let migrator = Migrator::new(
            vec![recording("001", &log), recording("002", &log), recording("003", &log)],
            Vec::new(),
        );
        migrator.migrate("default", false).await.unwrap();
        log.lock().clear();

        assert_eq!(migrator.rollback("default", "002", false).await.unwrap(), vec!["003", "002"]);
        assert_eq!(*log.lock(), vec!["down:003", "down:002"]);
        assert!(matches!(
            migrator.rollback("default", "003", false).await,
            Err(MigrationError::NotApplied(_))
        ));
    }

    #[tokio::test]
    async fn production_requires_force() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let migrator = Migrator::new(vec![recording("001", &log)], Vec::new()).with_env("prod");
        assert!(matches!(
            migrator.migrate("default", false).await,
            Err(MigrationError::ProductionGuard { .. })
        ));
        assert_eq!(migrator.migrate("default", true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_seed_is_named() {
        let migrator = Migrator::new(
            Vec::new(),
            vec![
                Seed::new("ok", "default", || async { Ok(()) }),
                Seed::new("broken", "default", || async { Err(anyhow::anyhow!("no rows")) }),
            ],
        );
        match migrator.seed("default", false).await {
            Err(MigrationError::Script { stage, id, .. }) => {
                assert_eq!(stage, "seed");
                assert_eq!(id, "broken");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
