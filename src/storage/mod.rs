//! Storage backends for scraped records.
//!
//! Every backend speaks [`Record`]s (flat-ish JSON objects) and implements the
//! same four operations. Writes of an empty batch are logged and skipped.

mod csv;
mod json;
mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub use self::csv::CsvStorage;
pub use self::json::JsonStorage;
pub use self::sqlite::SqliteStorage;

/// One scraped row.
pub type Record = Map<String, Value>;

/// Table used by table-based backends when none is named.
pub const DEFAULT_TABLE: &str = "scraped_data";

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// SQLite database file.
    Sqlite,
    /// JSON array file.
    Json,
    /// CSV file with header row.
    Csv,
}

impl StorageKind {
    /// All kinds, in the order tools advertise them.
    pub const ALL: [StorageKind; 3] = [StorageKind::Sqlite, StorageKind::Json, StorageKind::Csv];

    /// Lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Sqlite => "sqlite",
            StorageKind::Json => "json",
            StorageKind::Csv => "csv",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" | "db" => Ok(StorageKind::Sqlite),
            "json" => Ok(StorageKind::Json),
            "csv" => Ok(StorageKind::Csv),
            other => Err(Error::InvalidParams(format!(
                "unsupported storage type: {} (expected sqlite, json or csv)",
                other
            ))),
        }
    }
}

/// Where a batch goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    /// File path.
    pub path: PathBuf,
    /// Table name; ignored by file-per-dataset backends.
    pub table: String,
}

impl StorageTarget {
    /// Target at `path` using [`DEFAULT_TABLE`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Override the table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }
}

/// A storage format.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which format this is.
    fn kind(&self) -> StorageKind;

    /// Replace whatever is stored at `target` with `records`.
    /// Returns how many records were written.
    async fn save(&self, records: &[Record], target: &StorageTarget) -> Result<usize>;

    /// Read every record stored at `target`.
    async fn load(&self, target: &StorageTarget) -> Result<Vec<Record>>;

    /// Add `records` after whatever is stored at `target`.
    async fn append(&self, records: &[Record], target: &StorageTarget) -> Result<usize>;

    /// Whether anything is stored at `path`.
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

/// Backends keyed by kind.
#[derive(Clone)]
pub struct StorageRegistry {
    backends: HashMap<StorageKind, Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    /// Registry with the JSON, CSV and SQLite backends.
    pub fn new() -> Self {
        let mut registry = Self {
            backends: HashMap::new(),
        };
        registry.register(Arc::new(JsonStorage::new()));
        registry.register(Arc::new(CsvStorage::new()));
        registry.register(Arc::new(SqliteStorage::new()));
        registry
    }

    /// Add or replace a backend.
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// Backend for `kind`.
    pub fn get(&self, kind: StorageKind) -> Result<Arc<dyn StorageBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("no backend registered for {}", kind)))
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the parent directory of `path` if needed.
pub(crate) async fn prepare_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidParams("storage path is empty".into()));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "invalid storage path");
            Error::Io(e)
        })?;
    }
    Ok(())
}

/// Flatten a value for a single text cell: nested values become JSON text.
pub(crate) fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Reverse of [`cell_text`] for formats that only store strings.
pub(crate) fn decode_cell(text: &str, nested_only: bool) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Array(_) | Value::Object(_))) => value,
        Ok(value) if !nested_only && !value.is_string() => value,
        _ => Value::String(text.to_string()),
    }
}

/// Keys across `records` in first-seen order.
pub(crate) fn column_union(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}
