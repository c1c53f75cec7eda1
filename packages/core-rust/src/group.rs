//! Run group: N concurrent actors, first exit interrupts all.
//!
//! Each actor is a `(run, interrupt)` pair. [`RunGroup::run`] starts every
//! `run` future on its own task and waits for the first one to finish. The
//! result of that actor becomes the group's result; every actor's
//! `interrupt` is then called with it and the group waits for the remaining
//! actors to return. A clean `Ok(())` exit terminates the group just like
//! an error does, which is how signal watchers and context-cancellation
//! actors stop a process.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interrupt callback. Receives the error of the actor that ended the group,
/// or `None` if it exited cleanly.
pub type Interrupt = Box<dyn FnOnce(Option<&anyhow::Error>) + Send>;

struct Actor {
    name: String,
    run: BoxFuture<'static, anyhow::Result<()>>,
    interrupt: Interrupt,
}

/// Coordinator for a set of long-running actors.
#[derive(Default)]
pub struct RunGroup {
    actors: Vec<Actor>,
}

impl RunGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an actor pair.
    pub fn add<F, I>(&mut self, name: impl Into<String>, run: F, interrupt: I)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
        I: FnOnce(Option<&anyhow::Error>) + Send + 'static,
    {
        self.actors.push(Actor {
            name: name.into(),
            run: Box::pin(run),
            interrupt: Box::new(interrupt),
        });
    }

    /// Registers an actor whose interrupt cancels a token handed to `run`.
    pub fn add_cancellable<F, Fut>(&mut self, name: impl Into<String>, run: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let fut = run(token.clone());
        self.add(name, fut, move |_| token.cancel());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Names of the registered actors, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.actors.iter().map(|a| a.name.clone()).collect()
    }

    /// Runs every actor and returns the exit result of the first to finish.
    ///
    /// A panicking actor is reported as an error naming the actor. An empty
    /// group returns `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the first actor's error.
    pub async fn run(self) -> anyhow::Result<()> {
        if self.actors.is_empty() {
            return Ok(());
        }

        let mut names = Vec::with_capacity(self.actors.len());
        let mut interrupts = Vec::with_capacity(self.actors.len());
        let mut tasks = JoinSet::new();

        for (idx, actor) in self.actors.into_iter().enumerate() {
            names.push(actor.name);
            interrupts.push(actor.interrupt);
            let run = actor.run;
            tasks.spawn(async move { (idx, AssertUnwindSafe(run).catch_unwind().await) });
        }

        let first = match tasks.join_next().await {
            Some(joined) => flatten(joined, &names),
            None => return Ok(()),
        };
        let (first_name, first_result) = first;
        match &first_result {
            Ok(()) => info!(actor = %first_name, "actor exited, interrupting run group"),
            Err(e) => warn!(actor = %first_name, error = %e, "actor failed, interrupting run group"),
        }

        for interrupt in interrupts {
            interrupt(first_result.as_ref().err());
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, result) = flatten(joined, &names);
            match result {
                Ok(()) => debug!(actor = %name, "actor stopped"),
                Err(e) => debug!(actor = %name, error = %e, "actor stopped with error"),
            }
        }

        first_result
    }
}

type Joined = Result<(usize, std::thread::Result<anyhow::Result<()>>), tokio::task::JoinError>;

fn flatten(joined: Joined, names: &[String]) -> (String, anyhow::Result<()>) {
    match joined {
        Ok((idx, Ok(result))) => (names[idx].clone(), result),
        Ok((idx, Err(panic))) => {
            let msg = panic_message(panic.as_ref());
            error!(actor = %names[idx], panic = %msg, "actor panicked");
            (
                names[idx].clone(),
                Err(anyhow::anyhow!("actor {} panicked: {msg}", names[idx])),
            )
        }
        Err(join_err) => (
            "<unknown>".to_string(),
            Err(anyhow::anyhow!("actor task failed: {join_err}")),
        ),
    }
}

/// Extracts a readable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
