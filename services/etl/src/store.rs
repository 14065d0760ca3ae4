//! Target store collaborators
//!
//! `upsert` is atomic per call and nothing more: there is no cross-call
//! transaction. Rows in one call must share a column set and may not
//! repeat a conflict key. A null field means "not known in this run" and
//! never replaces a stored value.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use collector::sources::validate_identifier;

use crate::error::StoreError;
use crate::load::Row;

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert rows whose conflict key is new, otherwise overwrite the
    /// non-key fields that carry a value
    async fn upsert(&self, table: &str, rows: &[Row], conflict_keys: &[String]) -> Result<(), StoreError>;
}

/// Identity of a row under `conflict_keys`, comparable across rows
pub fn conflict_key(row: &Row, conflict_keys: &[String]) -> String {
    let values: Vec<&JsonValue> = conflict_keys
        .iter()
        .map(|k| row.get(k).unwrap_or(&JsonValue::Null))
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}

/// Column set shared by every row, in first-row order
///
/// A conflict key may appear once per batch; Postgres cannot update the
/// same row twice in one statement.
fn batch_columns(rows: &[Row], conflict_keys: &[String]) -> Result<Vec<String>, StoreError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    for key in conflict_keys {
        if !first.contains_key(key) {
            return Err(StoreError::MissingConflictKey(key.clone()));
        }
    }
    for row in &rows[1..] {
        if row.len() != first.len() || !first.keys().all(|k| row.contains_key(k)) {
            return Err(StoreError::Heterogeneous);
        }
    }
    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows {
        let key = conflict_key(row, conflict_keys);
        if !seen.insert(key.clone()) {
            return Err(StoreError::DuplicateConflictKey(key));
        }
    }
    Ok(first.keys().cloned().collect())
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(db_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(db_url)
            .await?;
        Ok(Self::new(pool))
    }
}

fn quote(identifier: &str) -> Result<String, StoreError> {
    validate_identifier(identifier)?;
    Ok(format!("\"{}\"", identifier))
}

/// Single-statement upsert reading the batch from a jsonb array in `$1`
///
/// Non-key columns fall back to the stored value when the incoming one is null.
pub fn upsert_sql(table: &str, columns: &[String], conflict_keys: &[String]) -> Result<String, StoreError> {
    let table = quote(table)?;
    let column_list = columns.iter().map(|c| quote(c)).collect::<Result<Vec<_>, _>>()?.join(", ");
    let key_list = conflict_keys
        .iter()
        .map(|k| quote(k))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let updates = columns
        .iter()
        .filter(|c| !conflict_keys.contains(*c))
        .map(|c| quote(c).map(|q| format!("{q} = COALESCE(EXCLUDED.{q}, {table}.{q})")))
        .collect::<Result<Vec<_>, _>>()?;

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT ({key_list}) {action}"
    ))
}

#[async_trait]
impl TargetStore for PgStore {
    async fn upsert(&self, table: &str, rows: &[Row], conflict_keys: &[String]) -> Result<(), StoreError> {
        let columns = batch_columns(rows, conflict_keys)?;
        if columns.is_empty() {
            return Ok(());
        }
        let sql = upsert_sql(table, &columns, conflict_keys)?;
        let payload = JsonValue::Array(rows.iter().cloned().map(JsonValue::Object).collect());

        sqlx::query(&sql).bind(payload).execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local store with upsert semantics and injectable failures
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, BTreeMap<String, Row>>>,
    calls: Mutex<Vec<(String, usize)>>,
    failures: Mutex<HashSet<(String, usize)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the n-th (0-based) upsert call made against `table`
    pub fn fail_call(&self, table: &str, call: usize) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert((table.to_string(), call));
        }
    }

    /// Rows currently held for `table`, ordered by conflict key
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .map(|t| t.get(table).map(|rows| rows.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables
            .lock()
            .map(|t| t.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Batch sizes of every upsert call made against `table`, failed ones included
    pub fn calls(&self, table: &str) -> Vec<usize> {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|(t, _)| t == table).map(|(_, n)| *n).collect())
            .unwrap_or_default()
    }

}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn upsert(&self, table: &str, rows: &[Row], conflict_keys: &[String]) -> Result<(), StoreError> {
        let call = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| StoreError::Rejected("store lock poisoned".to_string()))?;
            let call = calls.iter().filter(|(t, _)| t == table).count();
            calls.push((table.to_string(), rows.len()));
            call
        };

        let should_fail = self
            .failures
            .lock()
            .map(|f| f.contains(&(table.to_string(), call)))
            .unwrap_or(false);
        if should_fail {
            return Err(StoreError::Rejected(format!("injected failure on call {call}")));
        }

        validate_identifier(table)?;
        batch_columns(rows, conflict_keys)?;

        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::Rejected("store lock poisoned".to_string()))?;
        let target = tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = conflict_key(row, conflict_keys);
            match target.get_mut(&key) {
                Some(existing) => existing.extend(
                    row.iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(k, v)| (k.clone(), v.clone())),
                ),
                None => {
                    target.insert(key, row.clone());
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // -------------------------------------------------------------------------
    // SQL TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_upsert_sql_updates_non_key_columns() {
        let sql = upsert_sql(
            "zhvi_monthly",
            &keys(&["date", "value", "zip"]),
            &keys(&["zip", "date"]),
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"zhvi_monthly\" (\"date\", \"value\", \"zip\") \
             SELECT \"date\", \"value\", \"zip\" FROM jsonb_populate_recordset(NULL::\"zhvi_monthly\", $1) \
             ON CONFLICT (\"zip\", \"date\") \
             DO UPDATE SET \"value\" = COALESCE(EXCLUDED.\"value\", \"zhvi_monthly\".\"value\")"
        );
    }

    #[test]
    fn test_upsert_sql_key_only_does_nothing() {
        let sql = upsert_sql("zip_codes", &keys(&["zip"]), &keys(&["zip"])).unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"zip\") DO NOTHING"));
    }

    #[test]
    fn test_upsert_sql_rejects_bad_identifier() {
        let err = upsert_sql("t; drop table x", &keys(&["zip"]), &keys(&["zip"])).unwrap_err();
        assert!(matches!(err, StoreError::Identifier(_)));
    }

    #[test]
    fn test_batch_columns_validation() {
        let a = row(json!({"zip": "1", "date": "2024-01-01", "value": 1}));
        let b = row(json!({"zip": "2", "date": "2024-01-01"}));
        assert!(matches!(
            batch_columns(&[a.clone(), b], &keys(&["zip", "date"])),
            Err(StoreError::Heterogeneous)
        ));
        assert!(matches!(
            batch_columns(&[a.clone()], &keys(&["region"])),
            Err(StoreError::MissingConflictKey(k)) if k == "region"
        ));
        assert_eq!(batch_columns(&[a.clone()], &keys(&["zip"])).unwrap().len(), 3);

        let c = row(json!({"zip": "1", "date": "2024-01-01", "value": 2}));
        assert!(matches!(
            batch_columns(&[a, c], &keys(&["zip", "date"])),
            Err(StoreError::DuplicateConflictKey(_))
        ));
        assert!(batch_columns(&[], &keys(&["zip"])).unwrap().is_empty());
    }

    // -------------------------------------------------------------------------
    // MEMORY STORE TESTS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_memory_store_insert_then_update() {
        let store = MemoryStore::new();
        let conflict = keys(&["zip", "date"]);

        store
            .upsert("zhvi_monthly", &[row(json!({"zip": "1", "date": "2024-01-01", "value": 10}))], &conflict)
            .await
            .unwrap();
        store
            .upsert(
                "zhvi_monthly",
                &[
                    row(json!({"zip": "1", "date": "2024-01-01", "value": 11})),
                    row(json!({"zip": "1", "date": "2024-02-01", "value": 12})),
                ],
                &conflict,
            )
            .await
            .unwrap();

        let rows = store.rows("zhvi_monthly");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["value"], json!(11));
        assert_eq!(store.calls("zhvi_monthly"), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_memory_store_injected_failure_is_atomic() {
        let store = MemoryStore::new();
        store.fail_call("t", 0);
        let err = store
            .upsert("t", &[row(json!({"zip": "1"}))], &keys(&["zip"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.len("t"), 0);

        store.upsert("t", &[row(json!({"zip": "1"}))], &keys(&["zip"])).await.unwrap();
        assert_eq!(store.len("t"), 1);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_heterogeneous_batch() {
        let store = MemoryStore::new();
        let err = store
            .upsert(
                "t",
                &[row(json!({"zip": "1", "a": 1})), row(json!({"zip": "2", "b": 1}))],
                &keys(&["zip"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Heterogeneous));
        assert_eq!(store.len("t"), 0);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_repeated_conflict_key() {
        let store = MemoryStore::new();
        let conflict = keys(&["zip", "date"]);
        let err = store
            .upsert(
                "zhvi_monthly_city",
                &[
                    row(json!({"zip": "Springfield", "date": "2024-01-31", "state": "IL", "value": 200000})),
                    row(json!({"zip": "Springfield", "date": "2024-01-31", "state": "MA", "value": 300000})),
                ],
                &conflict,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateConflictKey(_)));
        assert_eq!(store.len("zhvi_monthly_city"), 0);
    }

    #[tokio::test]
    async fn test_memory_store_null_keeps_stored_value() {
        let store = MemoryStore::new();
        let conflict = keys(&["zip", "date"]);

        store
            .upsert(
                "market_metrics",
                &[row(json!({"zip": "1", "date": "2024-01-31", "sales": 10, "dom": null}))],
                &conflict,
            )
            .await
            .unwrap();
        store
            .upsert(
                "market_metrics",
                &[row(json!({"zip": "1", "date": "2024-01-31", "sales": null, "dom": 45}))],
                &conflict,
            )
            .await
            .unwrap();

        assert_eq!(
            JsonValue::Object(store.rows("market_metrics")[0].clone()),
            json!({"zip": "1", "date": "2024-01-31", "sales": 10, "dom": 45})
        );
    }
}
