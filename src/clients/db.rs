//! Tenant data store client used by QUERY nodes and DB-update handlers.
//!
//! The store is a SQLite database reached through an r2d2 pool; every call
//! runs on the blocking thread pool.
//!
//! # Environment Variables
//!
//! - `EDUFLOW_DB_POOL_SIZE`: Number of connections in the pool (default: 4)
//! - `EDUFLOW_DB_POOL_TIMEOUT_SECS`: Connection acquisition timeout (default: 30)

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

const DEFAULT_POOL_SIZE: u32 = 4;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Column to update on a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTarget {
    pub table: String,
    pub column: String,
    pub id_column: String,
}

/// Narrow data-store contract the engine depends on.
#[async_trait]
pub trait DbClient: Send + Sync {
    /// Run a read-only query; each row becomes a JSON object keyed by column name.
    async fn query(&self, sql: &str, params: &[Value], max_rows: usize) -> Result<Vec<Value>>;

    /// Set one column on the row whose id column equals `entity_id`.
    /// Returns whether a row was changed.
    async fn update_field(&self, target: &FieldTarget, entity_id: &Value, value: &Value)
        -> Result<bool>;
}

/// [`DbClient`] backed by a pooled SQLite database.
#[derive(Clone)]
pub struct SqliteDbClient {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteDbClient {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA busy_timeout = 5000;
                PRAGMA foreign_keys = ON;
                "#,
            )
        });

        let pool = Pool::builder()
            .max_size(env_or("EDUFLOW_DB_POOL_SIZE", DEFAULT_POOL_SIZE))
            .connection_timeout(Duration::from_secs(env_or(
                "EDUFLOW_DB_POOL_TIMEOUT_SECS",
                DEFAULT_TIMEOUT_SECS,
            )))
            .build(manager)
            .map_err(|e| Error::Storage(format!("Failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Run `f` with a pooled connection on the blocking thread pool.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| Error::Storage(format!("Failed to acquire connection: {}", e)))?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("Task failed: {}", e)))?
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[async_trait]
impl DbClient for SqliteDbClient {
    async fn query(&self, sql: &str, params: &[Value], max_rows: usize) -> Result<Vec<Value>> {
        let head = sql.trim_start().to_ascii_lowercase();
        if !(head.starts_with("select") || head.starts_with("with")) {
            return Err(Error::Validation(
                "Only SELECT or WITH queries are allowed".to_string(),
            ));
        }

        let sql = sql.to_string();
        let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        debug!(sql = %sql, params = params.len(), "Running data query");

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            if !stmt.readonly() {
                return Err(Error::Validation(
                    "Query must not modify data".to_string(),
                ));
            }
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                if out.len() >= max_rows {
                    break;
                }
                let mut record = Map::with_capacity(columns.len());
                for (idx, name) in columns.iter().enumerate() {
                    record.insert(name.clone(), from_value_ref(row.get_ref(idx)?));
                }
                out.push(Value::Object(record));
            }
            Ok(out)
        })
        .await
    }

    async fn update_field(
        &self,
        target: &FieldTarget,
        entity_id: &Value,
        value: &Value,
    ) -> Result<bool> {
        for ident in [&target.table, &target.column, &target.id_column] {
            check_identifier(ident)?;
        }

        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            target.table, target.column, target.id_column
        );
        let value = to_sql_value(value);
        let id = to_sql_value(entity_id);

        self.with_connection(move |conn| {
            let changed = conn.execute(&sql, rusqlite::params![value, id])?;
            Ok(changed > 0)
        })
        .await
    }
}

fn check_identifier(ident: &str) -> Result<()> {
    let valid = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid SQL identifier: {}", ident)))
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> (tempfile::TempDir, SqliteDbClient) {
        let dir = tempfile::tempdir().unwrap();
        let client = SqliteDbClient::open(&dir.path().join("data.db")).unwrap();
        client
            .with_connection(|conn| {
                conn.execute_batch(
                    r#"
                    CREATE TABLE enrollment_policy_mappings (
                        id TEXT PRIMARY KEY,
                        remaining_days INTEGER NOT NULL,
                        is_weekend INTEGER NOT NULL,
                        payload BLOB
                    );
                    INSERT INTO enrollment_policy_mappings VALUES ('m1', 3, 0, x'0102');
                    INSERT INTO enrollment_policy_mappings VALUES ('m2', 0, 1, NULL);
                    "#,
                )?;
                Ok(())
            })
            .await
            .unwrap();
        (dir, client)
    }

    #[tokio::test]
    async fn test_query_maps_rows_to_objects() {
        let (_dir, client) = seeded().await;
        let rows = client
            .query(
                "SELECT id, remaining_days, payload FROM enrollment_policy_mappings WHERE remaining_days > ?1 ORDER BY id",
                &[json!(0)],
                100,
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "m1");
        assert_eq!(rows[0]["remaining_days"], 3);
        assert_eq!(rows[0]["payload"], "AQI=");
    }

    #[tokio::test]
    async fn test_query_respects_max_rows() {
        let (_dir, client) = seeded().await;
        let rows = client
            .query("SELECT id FROM enrollment_policy_mappings", &[], 1)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_query_rejects_writes() {
        let (_dir, client) = seeded().await;
        let err = client
            .query("DELETE FROM enrollment_policy_mappings", &[], 10)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_update_field() {
        let (_dir, client) = seeded().await;
        let target = FieldTarget {
            table: "enrollment_policy_mappings".into(),
            column: "remaining_days".into(),
            id_column: "id".into(),
        };

        assert!(client.update_field(&target, &json!("m1"), &json!(2)).await.unwrap());
        assert!(!client.update_field(&target, &json!("nope"), &json!(2)).await.unwrap());

        let rows = client
            .query(
                "SELECT remaining_days FROM enrollment_policy_mappings WHERE id = 'm1'",
                &[],
                1,
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["remaining_days"], 2);
    }

    #[tokio::test]
    async fn test_update_field_rejects_bad_identifiers() {
        let (_dir, client) = seeded().await;
        let target = FieldTarget {
            table: "mappings; DROP TABLE x".into(),
            column: "remaining_days".into(),
            id_column: "id".into(),
        };
        assert!(client
            .update_field(&target, &json!("m1"), &json!(1))
            .await
            .is_err());
    }
}
