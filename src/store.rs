//! Relational store boundary.
//!
//! `SqlStore` executes compiled queries over sqlx's `Any` driver with one
//! pool per connection string, cached for the process lifetime. `MemoryStore`
//! applies the same compiled predicates to in-memory rows and is the test
//! double.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};
use tokio::sync::Mutex;
use tracing::debug;

use crate::compile::CompiledQuery;
use crate::error::Error;
use crate::types::{StoreRow, TagSet};

static DRIVERS: Lazy<()> = Lazy::new(sqlx::any::install_default_drivers);

/// Executes one compiled selector query and returns canonical rows.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<StoreRow>, Error>;
}

/// One connection pool per DSN, created lazily and never evicted.
#[derive(Default)]
pub struct PoolCache {
    pools: Mutex<HashMap<String, AnyPool>>,
}

impl PoolCache {
    pub fn new() -> Self {
        PoolCache::default()
    }

    /// Check-then-insert runs under the lock, so concurrent callers never
    /// open a duplicate pool for the same DSN.
    pub async fn get(&self, dsn: &str) -> Result<AnyPool, Error> {
        Lazy::force(&DRIVERS);
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(dsn) {
            return Ok(pool.clone());
        }
        let pool = AnyPoolOptions::new().max_connections(5).connect(dsn).await?;
        debug!(%dsn, "opened connection pool");
        pools.insert(dsn.to_string(), pool.clone());
        Ok(pool)
    }
}

/// SQL-backed store over postgres or sqlite.
#[derive(Default)]
pub struct SqlStore {
    pools: PoolCache,
}

impl SqlStore {
    pub fn new() -> Self {
        SqlStore::default()
    }
}

#[async_trait]
impl MetricStore for SqlStore {
    async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<StoreRow>, Error> {
        let pool = self.pools.get(&query.dsn).await?;
        let rows = sqlx::query(&query.sql).fetch_all(&pool).await?;
        rows.iter().map(|row| decode_row(row, query)).collect()
    }
}

fn decode_row(row: &AnyRow, query: &CompiledQuery) -> Result<StoreRow, Error> {
    let mut timestamp = None;
    let mut value = None;
    let mut tags = TagSet::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        if name == query.timestamp_column || name == "timestamp" {
            timestamp = Some(decode_timestamp(row, idx, name)?);
        } else if name == query.value_column || name == "value" {
            value = Some(decode_value(row, idx, name)?);
        } else if let Some(tag) = decode_tag(row, idx) {
            tags.insert(name.to_string(), tag);
        }
    }
    let timestamp = timestamp.ok_or_else(|| {
        Error::Evaluation(format!(
            "result has no {:?} column for table {:?}",
            query.timestamp_column, query.table_name
        ))
    })?;
    let value = value.ok_or_else(|| {
        Error::Evaluation(format!(
            "result has no {:?} column for table {:?}",
            query.value_column, query.table_name
        ))
    })?;
    Ok(StoreRow {
        timestamp,
        value,
        tags,
    })
}

/// Integer seconds, a float, or a textual timestamp chrono can parse.
fn decode_timestamp(row: &AnyRow, idx: usize, name: &str) -> Result<i64, Error> {
    if let Ok(t) = row.try_get::<i64, _>(idx) {
        return Ok(t);
    }
    if let Ok(t) = row.try_get::<f64, _>(idx) {
        return Ok(t as i64);
    }
    let text: String = row.try_get(idx)?;
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(&text) {
        return Ok(parsed.timestamp());
    }
    if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S") {
        return Ok(parsed.and_utc().timestamp());
    }
    Err(Error::Evaluation(format!(
        "cannot interpret {text:?} in column {name:?} as a timestamp"
    )))
}

fn decode_value(row: &AnyRow, idx: usize, name: &str) -> Result<f64, Error> {
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(v as f64);
    }
    Err(Error::Evaluation(format!(
        "column {name:?} is not numeric"
    )))
}

fn decode_tag(row: &AnyRow, idx: usize) -> Option<String> {
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return Some(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return Some(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return Some(v.to_string());
    }
    None
}

/// In-memory tables keyed by name; honors the compiled window and label
/// predicates.
#[derive(Default)]
pub struct MemoryStore {
    tables: StdMutex<HashMap<String, Vec<StoreRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn insert(&self, table: &str, row: StoreRow) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn insert_all(&self, table: &str, rows: impl IntoIterator<Item = StoreRow>) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.entry(table.to_string()).or_default().extend(rows);
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<StoreRow>, Error> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rows) = tables.get(&query.table_name) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<StoreRow> = rows
            .iter()
            .filter(|row| {
                row.timestamp >= query.window.start && row.timestamp <= query.window.end
            })
            .filter(|row| {
                query.predicates.iter().all(|p| {
                    p.matches(row.tags.get(&p.column).map(String::as_str).unwrap_or(""))
                })
            })
            .cloned()
            .collect();
        out.sort_by_key(|row| row.timestamp);
        Ok(out)
    }
}
