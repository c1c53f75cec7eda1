//! Command-line bootstrap.
//!
//! [`App`] turns a populated [`Container`] into a process: it builds the
//! module registry, installs logging, and dispatches to `serve`,
//! `config init|verify`, `database migrate|seed` or any module command.
//!
//! The container must supply an `Arc<Config>`. An `Arc<dyn Dispatcher>`,
//! an `Arc<dyn MigrationLedger>` and a [`Scheduler`] are used when supplied.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use keel_core::config::{defaults, fill_missing, merge};
use keel_core::{Config, ConfigError, EventBus, RunGroup, SharedDispatcher};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::container::{Container, ContainerError};
use crate::cron::Scheduler;
use crate::logging::{self, LogConfig};
use crate::migration::{MigrationLedger, Migrator};
use crate::module::{Capability, CommandSet, ConfigFragment, ConfigProvider, Module, ModuleRegistry, RunGroupProvider};
use crate::server::{GrpcServer, Lifecycle};

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// Reloads file-backed configuration when it changes on disk.
pub struct ConfigWatchModule {
    config: Arc<Config>,
    dispatcher: SharedDispatcher,
}

impl ConfigWatchModule {
    #[must_use]
    pub fn new(config: Arc<Config>, dispatcher: SharedDispatcher) -> Self {
        Self { config, dispatcher }
    }
}

impl Module for ConfigWatchModule {
    fn name(&self) -> &str {
        "config"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![Capability::RunGroup(self.clone()), Capability::Config(self)]
    }
}

impl RunGroupProvider for ConfigWatchModule {
    fn provide_run_group(&self, group: &mut RunGroup) {
        let config = Arc::clone(&self.config);
        let dispatcher = Arc::clone(&self.dispatcher);
        let interval = self
            .config
            .duration_or("config.watchInterval", DEFAULT_WATCH_INTERVAL)
            .unwrap_or(DEFAULT_WATCH_INTERVAL)
            .max(Duration::from_millis(100));
        group.add_cancellable("config-watch", move |token| config.watch(dispatcher, interval, token));
    }
}

impl ConfigProvider for ConfigWatchModule {
    fn config_fragments(&self) -> Vec<ConfigFragment> {
        vec![ConfigFragment {
            owner: "core".to_string(),
            data: defaults(),
            comment: "Application name, environment, transports, logging and sagas".to_string(),
        }]
    }

    fn validate(&self, config: &Config) -> Result<(), ConfigError> {
        LogConfig::from_config(config)?;
        config.duration_or("config.watchInterval", DEFAULT_WATCH_INTERVAL)?;
        Ok(())
    }
}

/// Output style of `config init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStyle {
    Yaml,
    Json,
}

impl ConfigStyle {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Merges every fragment into the file at `path`, keeping keys the file
/// already has.
///
/// # Errors
///
/// Returns read, parse or write failures.
pub fn init_config_file(path: &Path, style: ConfigStyle, fragments: &[ConfigFragment]) -> anyhow::Result<()> {
    let mut union = Value::Object(serde_json::Map::new());
    for fragment in fragments {
        merge(&mut union, fragment.data.clone());
    }

    let mut document = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match ConfigStyle::for_path(path) {
                ConfigStyle::Json => serde_json::from_str(&raw)?,
                ConfigStyle::Yaml => serde_yaml::from_str(&raw)?,
            }
        }
    } else {
        Value::Object(serde_json::Map::new())
    };
    fill_missing(&mut document, &union);

    let rendered = match style {
        ConfigStyle::Json => serde_json::to_string_pretty(&document)? + "\n",
        ConfigStyle::Yaml => {
            let mut out = String::new();
            for fragment in fragments {
                out.push_str(&format!("# {}: {}\n", fragment.owner, fragment.comment));
            }
            out + &serde_yaml::to_string(&document)?
        }
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, rendered)?;
    Ok(())
}

/// Runs every validator against `config`, stopping at the first failure.
///
/// # Errors
///
/// Returns the failing validator's error.
pub fn verify_config(modules: &ModuleRegistry, config: &Config) -> Result<(), ConfigError> {
    for provider in modules.config_providers() {
        provider.validate(config)?;
    }
    Ok(())
}

/// Process entry point built on a container.
pub struct App {
    name: String,
    container: Container,
    grpc: Option<Box<dyn GrpcServer>>,
}

impl App {
    #[must_use]
    pub fn new(name: impl Into<String>, container: Container) -> Self {
        Self {
            name: name.into(),
            container,
            grpc: None,
        }
    }

    #[must_use]
    pub fn with_grpc(mut self, server: Box<dyn GrpcServer>) -> Self {
        self.grpc = Some(server);
        self
    }

    /// Builds modules and the command table.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError`] if the config or a module cannot be built.
    pub fn commands(self) -> Result<(Command, CommandSet), ContainerError> {
        let config: Arc<Config> = self.container.resolve()?;
        let dispatcher: SharedDispatcher = self
            .container
            .resolve()
            .unwrap_or_else(|_| Arc::new(EventBus::new()));
        let ledger: Option<Arc<dyn MigrationLedger>> = self.container.resolve().ok();
        let scheduler: Option<Scheduler> = self.container.resolve().ok();

        self.container
            .add_module(Arc::new(ConfigWatchModule::new(Arc::clone(&config), Arc::clone(&dispatcher))));
        self.container.build_modules()?;
        let modules = self.container.modules();

        let mut commands = CommandSet::new();
        let grpc = Arc::new(Mutex::new(self.grpc));
        {
            let (config, modules, dispatcher) = (Arc::clone(&config), modules.clone(), Arc::clone(&dispatcher));
            commands.add(Command::new("serve").about("Run the composed process"), move |_| {
                let mut lifecycle = Lifecycle::new(Arc::clone(&config), modules.clone(), Arc::clone(&dispatcher));
                if let Some(server) = grpc.lock().take() {
                    lifecycle = lifecycle.with_grpc(server);
                }
                if let Some(scheduler) = scheduler.clone() {
                    lifecycle = lifecycle.with_scheduler(scheduler);
                }
                async move { Ok(lifecycle.serve().await?) }
            });
        }
        {
            let (config, modules) = (Arc::clone(&config), modules.clone());
            commands.add(config_command(), move |matches| {
                let (config, modules) = (Arc::clone(&config), modules.clone());
                async move { run_config_command(&modules, &config, &matches) }
            });
        }
        {
            let (config, modules) = (Arc::clone(&config), modules.clone());
            commands.add(database_command(), move |matches| {
                let mut migrator = Migrator::from_modules(&modules).with_env(config.env());
                if let Some(ledger) = &ledger {
                    migrator = migrator.with_ledger(Arc::clone(ledger));
                }
                async move { run_database_command(&migrator, &matches).await }
            });
        }
        for provider in modules.command_providers() {
            provider.provide_command(&mut commands);
        }

        let root = Command::new(self.name).subcommand_required(true);
        Ok((root, commands))
    }

    /// Parses `args` and runs the selected command.
    ///
    /// # Errors
    ///
    /// Returns bootstrap, argument or command errors.
    pub async fn run<I, T>(self, args: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config: Arc<Config> = self.container.resolve()?;
        logging::init(&LogConfig::from_config(&config)?);
        let (root, commands) = self.commands()?;
        commands.run(root, args).await
    }
}

fn config_command() -> Command {
    Command::new("config")
        .about("Inspect and scaffold configuration")
        .subcommand_required(true)
        .subcommand(
            Command::new("init")
                .about("Write every module's default configuration")
                .arg(Arg::new("output").long("output").default_value("config/config.yaml"))
                .arg(
                    Arg::new("style")
                        .long("style")
                        .value_parser(["yaml", "json"]),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Run every module's validator")
                .arg(Arg::new("target").long("target")),
        )
}

fn run_config_command(modules: &ModuleRegistry, config: &Config, matches: &ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("init", sub)) => {
            let output = PathBuf::from(
                sub.get_one::<String>("output")
                    .map_or("config/config.yaml", String::as_str),
            );
            let style = match sub.get_one::<String>("style").map(String::as_str) {
                Some("json") => ConfigStyle::Json,
                Some(_) => ConfigStyle::Yaml,
                None => ConfigStyle::for_path(&output),
            };
            let fragments: Vec<ConfigFragment> = modules
                .config_providers()
                .iter()
                .flat_map(|p| p.config_fragments())
                .collect();
            init_config_file(&output, style, &fragments)?;
            info!(path = %output.display(), "configuration written");
            Ok(())
        }
        Some(("verify", sub)) => {
            match sub.get_one::<String>("target") {
                Some(target) => verify_config(modules, &Config::builder().file(target).build()?)?,
                None => verify_config(modules, config)?,
            }
            info!("configuration verified");
            Ok(())
        }
        _ => anyhow::bail!("config: missing subcommand"),
    }
}

fn database_command() -> Command {
    let force = Arg::new("force")
        .long("force")
        .action(ArgAction::SetTrue)
        .help("Required in production");
    let connection = Arg::new("connection").default_value("default");
    Command::new("database")
        .about("Run migrations and seeds")
        .subcommand_required(true)
        .subcommand(
            Command::new("migrate")
                .arg(connection.clone())
                .arg(force.clone())
                .arg(Arg::new("rollback").long("rollback").value_name("ID")),
        )
        .subcommand(Command::new("seed").arg(connection).arg(force))
}

async fn run_database_command(migrator: &Migrator, matches: &ArgMatches) -> anyhow::Result<()> {
    let (action, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow::anyhow!("database: missing subcommand"))?;
    let connection = sub
        .get_one::<String>("connection")
        .map_or("default", String::as_str);
    let force = sub.get_flag("force");
    match action {
        "migrate" => match sub.get_one::<String>("rollback") {
            Some(target) => {
                let reverted = migrator.rollback(connection, target, force).await?;
                info!(connection, ?reverted, "rollback finished");
            }
            None => {
                let applied = migrator.migrate(connection, force).await?;
                info!(connection, ?applied, "migrations finished");
            }
        },
        "seed" => {
            let count = migrator.seed(connection, force).await?;
            info!(connection, count, "seeding finished");
        }
        other => anyhow::bail!("database: unknown action {other}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::migration::Migration;
    use crate::module::MigrationProvider;

    struct Schema {
        applied: Arc<AtomicU32>,
    }

    impl Module for Schema {
        fn name(&self) -> &str {
            "schema"
        }

        fn capabilities(self: Arc<Self>) -> Vec<Capability> {
            vec![Capability::Migration(self)]
        }
    }

    impl MigrationProvider for Schema {
        fn provide_migration(&self) -> Vec<Migration> {
            let applied = Arc::clone(&self.applied);
            vec![Migration::new(
                "001_init",
                "default",
                move || {
                    let applied = Arc::clone(&applied);
                    async move {
                        applied.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                || async { Ok(()) },
            )]
        }
    }

    fn container(value: Value) -> Container {
        let container = Container::new();
        container.supply(Arc::new(Config::from_value(value)));
        container
    }

    #[tokio::test]
    async fn database_migrate_runs_module_migrations() {
        let applied = Arc::new(AtomicU32::new(0));
        let c = container(json!({"log": {"level": "none"}}));
        c.add_module(Arc::new(Schema { applied: Arc::clone(&applied) }));
        App::new("app", c).run(["app", "database", "migrate"]).await.unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn production_migrate_needs_force() {
        let applied = Arc::new(AtomicU32::new(0));
        let c = container(json!({"env": "production", "log": {"level": "none"}}));
        c.add_module(Arc::new(Schema { applied: Arc::clone(&applied) }));
        assert!(App::new("app", c).run(["app", "database", "migrate"]).await.is_err());
        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn config_init_keeps_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "http:\n  addr: \":9999\"\n").unwrap();

        let c = container(json!({"log": {"level": "none"}}));
        App::new("app", c)
            .run(["app", "config", "init", "--output", path.to_str().unwrap()])
            .await
            .unwrap();

        let written: Value = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["http"]["addr"], ":9999");
        assert_eq!(written["grpc"]["addr"], ":9090");
        assert_eq!(written["sagas"]["recoverInterval"], "60s");
    }

    #[tokio::test]
    async fn config_verify_reports_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"log": {"level": "chatty"}}"#).unwrap();

        let c = container(json!({"log": {"level": "none"}}));
        let result = App::new("app", c)
            .run(["app", "config", "verify", "--target", path.to_str().unwrap()])
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn command_table_lists_builtins() {
        let c = container(json!({}));
        let (_, commands) = App::new("app", c).commands().unwrap();
        assert_eq!(commands.names(), vec!["serve", "config", "database"]);
    }
}
