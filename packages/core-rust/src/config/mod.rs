//! Layered configuration.
//!
//! A [`Config`] is a stack of `(Provider, Parser)` layers. The first layer
//! has the highest precedence; built-in defaults sit below every layer.
//! Layers are deep-merged into a single JSON value held in an [`ArcSwap`],
//! so readers never block and a reload swaps the whole snapshot at once.
//!
//! Keys are addressed with dotted paths (`"queue.default.parallelism"`).

pub mod provider;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::duration::parse_duration;
use crate::events::{Dispatcher, Event};

pub use provider::{BytesProvider, EnvProvider, FileProvider, Parser, Provider, Source};

/// Configuration errors. Fatal when raised during bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {origin}: {source}")]
    Read {
        origin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("missing required key {0}")]
    Missing(String),
    #[error("key {key}: {message}")]
    Type { key: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Emitted on the event bus after a successful reload.
#[derive(Debug, Clone)]
pub struct OnReload {
    pub previous: Arc<Value>,
    pub current: Arc<Value>,
}

impl OnReload {
    /// Whether the value at `path` differs between the two snapshots.
    #[must_use]
    pub fn changed(&self, path: &str) -> bool {
        lookup(&self.previous, path) != lookup(&self.current, path)
    }
}

/// Built-in defaults shared by every application.
#[must_use]
pub fn defaults() -> Value {
    json!({
        "name": "app",
        "env": "local",
        "http": { "addr": ":8080", "disable": false },
        "grpc": { "addr": ":9090", "disable": false },
        "cron": { "disable": false },
        "log": { "level": "info", "format": "logfmt" },
        "sagas": { "sagaTimeout": "600s", "recoverInterval": "60s" },
    })
}

struct Layer {
    provider: Box<dyn Provider>,
    parser: Parser,
}

/// Read-mostly layered configuration.
pub struct Config {
    layers: Vec<Layer>,
    snapshot: ArcSwap<Value>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let origins: Vec<String> = self.layers.iter().map(|l| l.provider.describe()).collect();
        f.debug_struct("Config").field("layers", &origins).finish()
    }
}

/// Collects layers before the first load.
#[derive(Default)]
pub struct ConfigBuilder {
    layers: Vec<Layer>,
}

impl ConfigBuilder {
    /// Appends a layer with lower precedence than those already added.
    #[must_use]
    pub fn layer(mut self, provider: impl Provider + 'static, parser: Parser) -> Self {
        self.layers.push(Layer {
            provider: Box::new(provider),
            parser,
        });
        self
    }

    /// Appends a file layer, choosing the parser from its extension.
    #[must_use]
    pub fn file(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let parser = Parser::for_path(&path);
        self.layer(FileProvider::new(path), parser)
    }

    /// Appends an environment layer.
    #[must_use]
    pub fn env(self, prefix: &str) -> Self {
        self.layer(EnvProvider::new(prefix), Parser::None)
    }

    /// Loads every layer.
    ///
    /// # Errors
    ///
    /// Returns the first read or parse failure.
    pub fn build(self) -> Result<Config, ConfigError> {
        let value = load_layers(&self.layers)?;
        Ok(Config {
            layers: self.layers,
            snapshot: ArcSwap::from_pointee(value),
        })
    }
}

fn load_layers(layers: &[Layer]) -> Result<Value, ConfigError> {
    let mut merged = defaults();
    for layer in layers.iter().rev() {
        let origin = layer.provider.describe();
        let value = layer.parser.parse(layer.provider.load()?, &origin)?;
        debug!(origin = %origin, "loaded configuration layer");
        merge(&mut merged, value);
    }
    Ok(merged)
}

impl Config {
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Config backed by a fixed value merged over the defaults.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let mut merged = defaults();
        merge(&mut merged, value);
        Self {
            layers: Vec::new(),
            snapshot: ArcSwap::from_pointee(merged),
        }
    }

    /// Current merged document.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Value> {
        self.snapshot.load_full()
    }

    /// Whether a key is present.
    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        lookup(&self.snapshot.load(), path).is_some()
    }

    /// Raw value at `path`.
    #[must_use]
    pub fn value(&self, path: &str) -> Option<Value> {
        lookup(&self.snapshot.load(), path).cloned()
    }

    /// Deserializes the value at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if absent, [`ConfigError::Type`] if it does
    /// not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConfigError> {
        let value = self
            .value(path)
            .ok_or_else(|| ConfigError::Missing(path.to_string()))?;
        serde_json::from_value(value).map_err(|e| ConfigError::Type {
            key: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Deserializes the value at `path`, or `T::default()` if absent.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Type`] if present but malformed.
    pub fn get_or_default<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T, ConfigError> {
        match self.get(path) {
            Err(ConfigError::Missing(_)) => Ok(T::default()),
            other => other,
        }
    }

    /// Deserializes the whole document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Type`] if the document does not fit `T`.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(self.snapshot.load().as_ref().clone()).map_err(|e| {
            ConfigError::Type {
                key: "<root>".to_string(),
                message: e.to_string(),
            }
        })
    }

    #[must_use]
    pub fn string(&self, path: &str) -> Option<String> {
        match self.value(path)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Boolean at `path`; absent or unparsable values read as `false`.
    #[must_use]
    pub fn bool(&self, path: &str) -> bool {
        match self.value(path) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            _ => false,
        }
    }

    #[must_use]
    pub fn int(&self, path: &str) -> Option<i64> {
        match self.value(path)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn float(&self, path: &str) -> Option<f64> {
        match self.value(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Duration at `path`: `"1h30m"`, `"500ms"` or integer seconds.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Type`] if the value is present but not a duration.
    pub fn duration(&self, path: &str) -> Result<Option<Duration>, ConfigError> {
        let type_err = |message: String| ConfigError::Type {
            key: path.to_string(),
            message,
        };
        match self.value(path) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|s| Some(Duration::from_secs(s)))
                .ok_or_else(|| type_err(format!("{n} is not a whole number of seconds"))),
            Some(Value::String(s)) => parse_duration(&s)
                .map(Some)
                .map_err(|e| type_err(e.to_string())),
            Some(other) => Err(type_err(format!("{other} is not a duration"))),
        }
    }

    /// Like [`duration`](Self::duration) with a fallback for absent keys.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Type`] if the value is present but not a duration.
    pub fn duration_or(&self, path: &str, fallback: Duration) -> Result<Duration, ConfigError> {
        Ok(self.duration(path)?.unwrap_or(fallback))
    }

    /// Application name used to namespace shared resources.
    #[must_use]
    pub fn app_name(&self) -> String {
        self.string("name").unwrap_or_else(|| "app".to_string())
    }

    /// Deployment environment (`local`, `staging`, `production`, ...).
    #[must_use]
    pub fn env(&self) -> String {
        self.string("env").unwrap_or_else(|| "local".to_string())
    }

    /// Whether the environment names a production deployment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self.env().as_str(), "production" | "prod")
    }

    /// Paths of file-backed layers.
    #[must_use]
    pub fn files(&self) -> Vec<PathBuf> {
        self.layers
            .iter()
            .filter_map(|l| l.provider.path().map(std::path::Path::to_path_buf))
            .collect()
    }

    /// Re-reads every layer, swaps the snapshot and dispatches [`OnReload`].
    ///
    /// The previous snapshot stays in effect if any layer fails to load.
    ///
    /// # Errors
    ///
    /// Returns the load error, or the first listener error.
    pub async fn reload(&self, dispatcher: &dyn Dispatcher) -> anyhow::Result<()> {
        let next = Arc::new(load_layers(&self.layers)?);
        let previous = self.snapshot.swap(Arc::clone(&next));
        info!(layers = self.layers.len(), "configuration reloaded");
        dispatcher
            .dispatch(Event::new(OnReload {
                previous,
                current: next,
            }))
            .await
    }

    /// Polls file layers every `interval` and reloads when any mtime moves.
    ///
    /// Returns `Ok(())` once `token` is cancelled. Reload failures are
    /// logged and the old snapshot kept.
    ///
    /// # Errors
    ///
    /// Never fails on its own; the signature fits run-group actors.
    pub async fn watch(
        self: Arc<Self>,
        dispatcher: Arc<dyn Dispatcher>,
        interval: Duration,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let files = self.files();
        if files.is_empty() {
            debug!("no file layers to watch");
            token.cancelled().await;
            return Ok(());
        }
        let mut seen = mtimes(&files);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let now = mtimes(&files);
                    if now == seen {
                        continue;
                    }
                    seen = now;
                    if let Err(e) = self.reload(dispatcher.as_ref()).await {
                        warn!(error = %e, "configuration reload failed");
                    }
                }
            }
        }
    }
}

fn mtimes(files: &[PathBuf]) -> Vec<Option<SystemTime>> {
    files
        .iter()
        .map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn find_key<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a String> {
    if let Some((k, _)) = map.get_key_value(key) {
        return Some(k);
    }
    map.keys().find(|k| k.eq_ignore_ascii_case(key))
}

/// Looks up a dotted path, matching keys case-insensitively as a fallback.
#[must_use]
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut cursor = root;
    for seg in path.split('.') {
        let Value::Object(map) = cursor else {
            return None;
        };
        let key = find_key(map, seg)?;
        cursor = map.get(key)?;
    }
    Some(cursor)
}

/// Deep-merges `overlay` into `base`; scalars and arrays in `overlay` win.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let existing = find_key(base_map, &key).cloned();
                match existing.and_then(|k| base_map.get_mut(&k)) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Adds keys from `defaults` that `target` lacks, never overwriting.
pub fn fill_missing(target: &mut Value, defaults: &Value) {
    match (target, defaults) {
        (Value::Object(t), Value::Object(d)) => {
            for (key, value) in d {
                match find_key(t, key).cloned().and_then(|k| t.get_mut(&k)) {
                    Some(slot) => fill_missing(slot, value),
                    None => {
                        t.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, d) if target.is_null() => *target = d.clone(),
        _ => {}
    }
}
