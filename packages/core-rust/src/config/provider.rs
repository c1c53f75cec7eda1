//! Configuration sources and the parsers that turn them into values.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::ConfigError;

/// Raw output of a [`Provider`].
#[derive(Debug, Clone)]
pub enum Source {
    /// Unparsed document bytes.
    Bytes(Vec<u8>),
    /// Already-structured value.
    Value(Value),
}

/// Where a configuration layer comes from.
pub trait Provider: Send + Sync {
    /// Reads the current content of the source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the source cannot be read.
    fn load(&self) -> Result<Source, ConfigError>;

    /// File backing this provider, if any. Used by the watch loop.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Short description used in errors and logs.
    fn describe(&self) -> String;
}

/// Document format of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parser {
    Json,
    Yaml,
    /// The provider yields a structured value; no parsing happens.
    None,
}

impl Parser {
    /// Picks a parser from a file extension, defaulting to YAML.
    #[must_use]
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }

    /// Converts provider output into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the document is malformed or the
    /// source kind does not match the parser.
    pub fn parse(self, source: Source, origin: &str) -> Result<Value, ConfigError> {
        let parse_err = |message: String| ConfigError::Parse {
            origin: origin.to_string(),
            message,
        };
        match (self, source) {
            (_, Source::Value(v)) => Ok(v),
            (Self::Json, Source::Bytes(b)) => {
                if b.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Value::Object(Map::new()));
                }
                serde_json::from_slice(&b).map_err(|e| parse_err(e.to_string()))
            }
            (Self::Yaml, Source::Bytes(b)) => {
                if b.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Value::Object(Map::new()));
                }
                serde_yaml::from_slice::<Value>(&b).map_err(|e| parse_err(e.to_string()))
            }
            (Self::None, Source::Bytes(_)) => {
                Err(parse_err("raw bytes need a json or yaml parser".to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FileProvider
// ---------------------------------------------------------------------------

/// Reads a document from disk on every load.
#[derive(Debug, Clone)]
pub struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Provider for FileProvider {
    fn load(&self) -> Result<Source, ConfigError> {
        std::fs::read(&self.path)
            .map(Source::Bytes)
            .map_err(|source| ConfigError::Read {
                origin: self.describe(),
                source,
            })
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// BytesProvider
// ---------------------------------------------------------------------------

/// In-memory document, mostly for tests and embedded defaults.
#[derive(Clone)]
pub struct BytesProvider {
    bytes: Vec<u8>,
}

impl BytesProvider {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl fmt::Debug for BytesProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesProvider")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Provider for BytesProvider {
    fn load(&self) -> Result<Source, ConfigError> {
        Ok(Source::Bytes(self.bytes.clone()))
    }

    fn describe(&self) -> String {
        "bytes".to_string()
    }
}

// ---------------------------------------------------------------------------
// EnvProvider
// ---------------------------------------------------------------------------

/// Environment variables under a prefix.
///
/// `APP_HTTP__ADDR=:80` with prefix `APP_` becomes `{"http": {"addr": ":80"}}`.
/// Segments are lowercased; lookups and merges match keys case-insensitively
/// so `APP_QUEUE__DEFAULT__PARALLELISM` lands on `queue.default.parallelism`.
/// Values stay strings and are coerced by the typed accessors.
#[derive(Debug, Clone)]
pub struct EnvProvider {
    prefix: String,
    vars: Option<BTreeMap<String, String>>,
}

impl EnvProvider {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            vars: None,
        }
    }

    /// Uses a fixed variable set instead of the process environment.
    #[must_use]
    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }
}

impl Provider for EnvProvider {
    fn load(&self) -> Result<Source, ConfigError> {
        let vars: Vec<(String, String)> = match &self.vars {
            Some(v) => v.clone().into_iter().collect(),
            None => std::env::vars().collect(),
        };
        let mut root = Value::Object(Map::new());
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let segments: Vec<String> = rest
                .split("__")
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .collect();
            if segments.is_empty() {
                continue;
            }
            insert_path(&mut root, &segments, Value::String(value));
        }
        Ok(Source::Value(root))
    }

    fn describe(&self) -> String {
        format!("env:{}*", self.prefix)
    }
}

fn insert_path(root: &mut Value, segments: &[String], value: Value) {
    let mut cursor = root;
    for (i, seg) in segments.iter().enumerate() {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        if i + 1 == segments.len() {
            map.insert(seg.clone(), value);
            return;
        }
        cursor = map
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
