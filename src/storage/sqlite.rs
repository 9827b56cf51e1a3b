//! SQLite tables with an inferred schema.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{Number, Value};

use super::{
    column_union, decode_cell, prepare_path, Record, StorageBackend, StorageKind, StorageTarget,
};
use crate::error::{Error, Result};

/// Primary key column added to every table.
const ID_COLUMN: &str = "id";

/// Column for `id` values that are not integers.
const ID_TEXT_COLUMN: &str = "id_value";

type ConnectionCache = Arc<Mutex<HashMap<PathBuf, Connection>>>;

/// Stores records in a table, one column per key.
///
/// Connections are opened once per database file and reused.
#[derive(Default)]
pub struct SqliteStorage {
    connections: ConnectionCache,
}

impl SqliteStorage {
    /// Create the backend with an empty connection cache.
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_connection<T, F>(&self, path: &Path, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let cache = Arc::clone(&self.connections);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut cache = cache
                .lock()
                .map_err(|_| Error::Internal("sqlite connection cache poisoned".into()))?;
            if !cache.contains_key(&path) {
                let conn = Connection::open(&path)?;
                conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA case_sensitive_like = ON;")?;
                tracing::debug!(path = %path.display(), "opened sqlite database");
                cache.insert(path.clone(), conn);
            }
            let conn = cache
                .get_mut(&path)
                .ok_or_else(|| Error::Internal("sqlite connection vanished".into()))?;
            op(conn)
        })
        .await?
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn validate_table(table: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(Error::InvalidParams("table name must not be empty".into()));
    }
    Ok(())
}

fn column_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "INTEGER",
        Value::Number(n) if n.is_i64() || n.is_u64() => "INTEGER",
        Value::Number(_) => "REAL",
        _ => "TEXT",
    }
}

/// A record key and the table column it is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnSpec {
    key: String,
    column: String,
    ty: &'static str,
}

/// How a batch of records maps onto table columns.
#[derive(Debug, Default)]
struct ColumnPlan {
    columns: Vec<ColumnSpec>,
    /// Key whose integer values go into the primary key.
    id_key: Option<String>,
}

/// Map record keys to columns. SQLite compares column names without regard
/// to ASCII case, so keys that only differ in case are rejected. An `id` key
/// (any case) fills the primary key when every value is an integer and
/// otherwise lands in [`ID_TEXT_COLUMN`]. A column's type comes from its
/// first non-null value.
fn plan_columns(records: &[Record]) -> Result<ColumnPlan> {
    let mut plan = ColumnPlan::default();
    let mut taken: Vec<(String, String)> = Vec::new();

    for key in column_union(records) {
        let mut values = records.iter().filter_map(|r| r.get(&key)).filter(|v| !v.is_null());
        let (column, ty) = if key.eq_ignore_ascii_case(ID_COLUMN) {
            if values.all(|v| v.is_i64()) {
                (ID_COLUMN.to_string(), "INTEGER")
            } else {
                (ID_TEXT_COLUMN.to_string(), "TEXT")
            }
        } else {
            let ty = values.next().map(column_type).unwrap_or("TEXT");
            (key.clone(), ty)
        };

        if let Some((other, _)) = taken.iter().find(|(_, c)| c.eq_ignore_ascii_case(&column)) {
            return Err(Error::InvalidParams(format!(
                "keys {:?} and {:?} both map to sqlite column {:?}; column names ignore case",
                other, key, column
            )));
        }
        taken.push((key.clone(), column.clone()));

        if column == ID_COLUMN {
            plan.id_key = Some(key);
        } else {
            plan.columns.push(ColumnSpec { key, column, ty });
        }
    }
    Ok(plan)
}

fn create_table(conn: &Connection, table: &str, columns: &[ColumnSpec]) -> Result<()> {
    let mut defs = vec![format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(ID_COLUMN))];
    defs.extend(columns.iter().map(|c| format!("{} {}", quote_ident(&c.column), c.ty)));
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        defs.join(", ")
    ))?;
    Ok(())
}

fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn to_sql(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(nested) => SqlValue::Text(nested.to_string()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(text) => decode_cell(&text, true),
        SqlValue::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}

fn insert_records(
    conn: &mut Connection,
    table: &str,
    records: &[Record],
    replace: bool,
) -> Result<usize> {
    let mut plan = plan_columns(records)?;
    let tx = conn.transaction()?;

    if replace {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
    }
    create_table(&tx, table, &plan.columns)?;

    let present = existing_columns(&tx, table)?;
    for spec in &mut plan.columns {
        match present.iter().find(|p| p.eq_ignore_ascii_case(&spec.column)) {
            Some(existing) => spec.column = existing.clone(),
            None => {
                tracing::debug!(table, column = %spec.column, "adding column");
                tx.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(&spec.column),
                    spec.ty
                ))?;
            }
        }
    }

    let mut bindings: Vec<(&str, &str)> = plan
        .columns
        .iter()
        .map(|c| (c.key.as_str(), c.column.as_str()))
        .collect();
    if let Some(key) = &plan.id_key {
        bindings.push((key.as_str(), ID_COLUMN));
    }
    let sql = if bindings.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
    } else {
        let placeholders: Vec<String> = (1..=bindings.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            bindings.iter().map(|(_, c)| quote_ident(c)).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        )
    };

    {
        let mut stmt = tx.prepare(&sql)?;
        for record in records {
            let params: Vec<SqlValue> = bindings.iter().map(|(key, _)| to_sql(record.get(*key))).collect();
            stmt.execute(rusqlite::params_from_iter(params.iter()))?;
        }
    }
    tx.commit()?;
    Ok(records.len())
}

fn select_all(conn: &Connection, table: &str) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(table)))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt.query_map([], |row| {
        let mut record = Record::new();
        for (i, name) in names.iter().enumerate() {
            let value: SqlValue = row.get(i)?;
            record.insert(name.clone(), from_sql(value));
        }
        Ok(record)
    })?;
    let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

impl SqliteStorage {
    async fn write(&self, records: &[Record], target: &StorageTarget, replace: bool) -> Result<usize> {
        let verb = if replace { "save" } else { "append" };
        if records.is_empty() {
            tracing::warn!(path = %target.path.display(), "no data to {}", verb);
            return Ok(0);
        }
        validate_table(&target.table)?;
        prepare_path(&target.path).await?;

        let table = target.table.clone();
        let records = records.to_vec();
        let count = self
            .with_connection(&target.path, move |conn| {
                insert_records(conn, &table, &records, replace)
            })
            .await?;
        tracing::info!(
            path = %target.path.display(),
            table = %target.table,
            count,
            "{} to SQLite complete",
            verb
        );
        Ok(count)
    }
}

#[async_trait::async_trait]
impl StorageBackend for SqliteStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Sqlite
    }

    async fn save(&self, records: &[Record], target: &StorageTarget) -> Result<usize> {
        self.write(records, target, true).await
    }

    async fn load(&self, target: &StorageTarget) -> Result<Vec<Record>> {
        validate_table(&target.table)?;
        if !self.exists(&target.path).await {
            return Err(Error::Storage(format!(
                "database {} does not exist",
                target.path.display()
            )));
        }
        let table = target.table.clone();
        self.with_connection(&target.path, move |conn| select_all(conn, &table))
            .await
    }

    async fn append(&self, records: &[Record], target: &StorageTarget) -> Result<usize> {
        self.write(records, target, false).await
    }
}
