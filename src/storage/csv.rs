//! CSV files with a header row.

use std::fs::OpenOptions;
use std::path::Path;

use ::csv::{QuoteStyle, ReaderBuilder, WriterBuilder};

use super::{
    cell_text, column_union, decode_cell, prepare_path, Record, StorageBackend, StorageKind,
    StorageTarget,
};
use crate::error::Result;

/// Stores records as CSV; nested values are written as JSON text.
#[derive(Debug, Default)]
pub struct CsvStorage;

impl CsvStorage {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

fn write_rows(path: &Path, columns: &[String], records: &[Record], header: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(!header)
        .truncate(header)
        .open(path)?;
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::NonNumeric)
        .from_writer(file);

    if header {
        writer.write_record(columns)?;
    }
    for record in records {
        let row: Vec<String> = columns
            .iter()
            .map(|col| record.get(col).and_then(cell_text).unwrap_or_default())
            .collect();
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = ReaderBuilder::new().flexible(true).from_path(path)?;
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

fn read_rows(path: &Path) -> Result<Vec<Record>> {
    let mut reader = ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(key, field)| (key.to_string(), decode_cell(field, false)))
            .collect();
        records.push(record);
    }
    Ok(records)
}

#[async_trait::async_trait]
impl StorageBackend for CsvStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Csv
    }

    async fn save(&self, records: &[Record], target: &StorageTarget) -> Result<usize> {
        if records.is_empty() {
            tracing::warn!(path = %target.path.display(), "no data to save");
            return Ok(0);
        }
        prepare_path(&target.path).await?;

        let path = target.path.clone();
        let records = records.to_vec();
        let count = records.len();
        tokio::task::spawn_blocking(move || {
            let columns = column_union(&records);
            write_rows(&path, &columns, &records, true)
        })
        .await??;

        tracing::info!(path = %target.path.display(), count, "saved CSV");
        Ok(count)
    }

    async fn load(&self, target: &StorageTarget) -> Result<Vec<Record>> {
        let path = target.path.clone();
        tokio::task::spawn_blocking(move || read_rows(&path)).await?
    }

    async fn append(&self, records: &[Record], target: &StorageTarget) -> Result<usize> {
        if records.is_empty() {
            tracing::warn!(path = %target.path.display(), "no data to append");
            return Ok(0);
        }
        if !self.exists(&target.path).await {
            return self.save(records, target).await;
        }

        let path = target.path.clone();
        let records = records.to_vec();
        let count = records.len();
        tokio::task::spawn_blocking(move || {
            let columns = read_header(&path)?;
            let dropped: Vec<String> = column_union(&records)
                .into_iter()
                .filter(|c| !columns.contains(c))
                .collect();
            if !dropped.is_empty() {
                tracing::warn!(path = %path.display(), ?dropped, "columns not in CSV header were dropped");
            }
            write_rows(&path, &columns, &records, false)
        })
        .await??;

        tracing::info!(path = %target.path.display(), count, "appended CSV");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn records(values: Vec<Value>) -> Vec<Record> {
        values.into_iter().map(|v| v.as_object().cloned().unwrap()).collect()
    }

    #[tokio::test]
    async fn save_quotes_text_and_decodes_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let target = StorageTarget::new(dir.path().join("events.csv"));
        let store = CsvStorage::new();
        let rows = records(vec![
            json!({"title": "Test Event 1", "price": 100, "tags": ["a", "b"]}),
            json!({"title": "Test Event 2", "price": 200.5, "tags": []}),
        ]);

        store.save(&rows, &target).await.unwrap();
        let text = tokio::fs::read_to_string(&target.path).await.unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(r#""price","tags","title""#));
        assert_eq!(lines.next(), Some(r#"100,"[""a"",""b""]","Test Event 1""#));

        let loaded = store.load(&target).await.unwrap();
        assert_eq!(loaded[0]["price"], json!(100));
        assert_eq!(loaded[0]["tags"], json!(["a", "b"]));
        assert_eq!(loaded[1]["price"], json!(200.5));
        assert_eq!(loaded[1]["title"], json!("Test Event 2"));
    }

    #[tokio::test]
    async fn append_reuses_existing_header() {
        let dir = tempfile::tempdir().unwrap();
        let target = StorageTarget::new(dir.path().join("out.csv"));
        let store = CsvStorage::new();

        store
            .append(&records(vec![json!({"a": "x", "b": "y"})]), &target)
            .await
            .unwrap();
        store
            .append(&records(vec![json!({"b": "z", "c": "dropped"})]), &target)
            .await
            .unwrap();

        let loaded = store.load(&target).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1]["a"], json!(""));
        assert_eq!(loaded[1]["b"], json!("z"));
        assert!(loaded[1].get("c").is_none());
    }

    #[tokio::test]
    async fn missing_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let target = StorageTarget::new(dir.path().join("missing.csv"));
        assert!(CsvStorage::new().load(&target).await.is_err());
    }
}
