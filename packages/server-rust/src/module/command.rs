//! Subcommands contributed by modules.

use std::future::Future;
use std::sync::Arc;

use clap::{ArgMatches, Command};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

/// Async handler invoked with the matches of its own subcommand.
pub type CommandHandler = Arc<dyn Fn(ArgMatches) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Collected top-level subcommands and their handlers.
#[derive(Default)]
pub struct CommandSet {
    entries: Vec<(Command, CommandHandler)>,
}

impl CommandSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subcommand. A later entry with the same name replaces an
    /// earlier one.
    pub fn add<F, Fut>(&mut self, command: Command, handler: F)
    where
        F: Fn(ArgMatches) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = command.get_name().to_string();
        self.entries.retain(|(c, _)| c.get_name() != name);
        let handler: CommandHandler = Arc::new(move |m| handler(m).boxed());
        self.entries.push((command, handler));
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(c, _)| c.get_name()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attaches every collected subcommand to `root`.
    #[must_use]
    pub fn attach(&self, mut root: Command) -> Command {
        for (command, _) in &self.entries {
            root = root.subcommand(command.clone());
        }
        root
    }

    /// Looks up the handler for a subcommand name.
    #[must_use]
    pub fn handler(&self, name: &str) -> Option<CommandHandler> {
        self.entries
            .iter()
            .find(|(c, _)| c.get_name() == name)
            .map(|(_, h)| Arc::clone(h))
    }

    /// Parses `args` against `root` plus the collected subcommands and runs
    /// the matching handler.
    ///
    /// # Errors
    ///
    /// Returns clap's error for bad arguments, an error when no subcommand
    /// was given, or the handler's error.
    pub async fn run<I, T>(&self, root: Command, args: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = self.attach(root).try_get_matches_from(args)?;
        let (name, sub) = matches
            .subcommand()
            .ok_or_else(|| anyhow::anyhow!("no command given"))?;
        let handler = self
            .handler(name)
            .ok_or_else(|| anyhow::anyhow!("unknown command {name}"))?;
        handler(sub.clone()).await
    }
}
