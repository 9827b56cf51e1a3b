//! JSON array files.

use serde_json::Value;

use super::{prepare_path, Record, StorageBackend, StorageKind, StorageTarget};
use crate::error::{Error, Result};

/// Above this many records files are written one compact record per line.
const COMPACT_THRESHOLD: usize = 10_000;

/// Stores records as a single JSON array.
#[derive(Debug, Default)]
pub struct JsonStorage;

impl JsonStorage {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }

    fn render(records: &[Record]) -> Result<String> {
        if records.len() <= COMPACT_THRESHOLD {
            return Ok(serde_json::to_string_pretty(records)?);
        }
        tracing::info!(count = records.len(), "large dataset, writing compact JSON");
        let mut out = String::from("[\n");
        for (i, record) in records.iter().enumerate() {
            out.push_str(&serde_json::to_string(record)?);
            if i + 1 < records.len() {
                out.push(',');
            }
            out.push('\n');
        }
        out.push(']');
        Ok(out)
    }

    async fn write_all(&self, records: &[Record], target: &StorageTarget) -> Result<()> {
        prepare_path(&target.path).await?;
        tokio::fs::write(&target.path, Self::render(records)?).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for JsonStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Json
    }

    async fn save(&self, records: &[Record], target: &StorageTarget) -> Result<usize> {
        if records.is_empty() {
            tracing::warn!(path = %target.path.display(), "no data to save");
            return Ok(0);
        }
        self.write_all(records, target).await?;
        tracing::info!(path = %target.path.display(), count = records.len(), "saved JSON");
        Ok(records.len())
    }

    async fn load(&self, target: &StorageTarget) -> Result<Vec<Record>> {
        let bytes = tokio::fs::read(&target.path).await?;
        let value: Value = serde_json::from_slice(&bytes)?;
        let Value::Array(items) = value else {
            return Err(Error::Storage(format!(
                "{} does not hold a JSON array",
                target.path.display()
            )));
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record),
                other => Err(Error::Storage(format!("expected JSON object, found {}", other))),
            })
            .collect()
    }

    async fn append(&self, records: &[Record], target: &StorageTarget) -> Result<usize> {
        if records.is_empty() {
            tracing::warn!(path = %target.path.display(), "no data to append");
            return Ok(0);
        }
        if !self.exists(&target.path).await {
            return self.save(records, target).await;
        }
        let mut combined = self.load(target).await?;
        combined.extend_from_slice(records);
        self.write_all(&combined, target).await?;
        tracing::info!(path = %target.path.display(), count = records.len(), "appended JSON");
        Ok(records.len())
    }
}
