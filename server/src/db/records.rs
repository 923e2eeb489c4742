//! Database operations for the module_records table.

use pos_sync_engine::{Record, RecordKey};
use sqlx::{PgPool, Row};

use super::{DurableError, DurableStore, TableScope};

/// A stored row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub record_key: String,
    pub payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            record_key: row.try_get("record_key")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl StoredRecord {
    /// Convert the stored payload back into a record.
    fn into_record(self, table: &str) -> Result<Record, DurableError> {
        match self.payload {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(DurableError::Corrupt {
                table: table.to_string(),
                key: self.record_key,
            }),
        }
    }
}

/// PostgreSQL-backed durable store.
#[derive(Debug, Clone)]
pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn updated_at_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl DurableStore for PgDurableStore {
    async fn list(&self, scope: TableScope<'_>) -> Result<Vec<Record>, DurableError> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT record_key, payload
            FROM module_records
            WHERE table_name = $1 AND branch_id = $2 AND module_id = $3
            ORDER BY id
            "#,
        )
        .bind(scope.table)
        .bind(scope.branch_id)
        .bind(scope.module_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_record(scope.table))
            .collect()
    }

    async fn get(&self, scope: TableScope<'_>, key: &str) -> Result<Option<Record>, DurableError> {
        let row = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT record_key, payload
            FROM module_records
            WHERE table_name = $1 AND branch_id = $2 AND module_id = $3 AND record_key = $4
            "#,
        )
        .bind(scope.table)
        .bind(scope.branch_id)
        .bind(scope.module_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row.into_record(scope.table)).transpose()
    }

    async fn put(&self, scope: TableScope<'_>, key: &str, record: &Record) -> Result<(), DurableError> {
        sqlx::query(
            r#"
            INSERT INTO module_records (table_name, branch_id, module_id, record_key, payload, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (table_name, branch_id, module_id, record_key) DO UPDATE SET
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(scope.table)
        .bind(scope.branch_id)
        .bind(scope.module_id)
        .bind(key)
        .bind(sqlx::types::Json(record))
        .bind(updated_at_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, scope: TableScope<'_>, key: &str) -> Result<bool, DurableError> {
        let result = sqlx::query(
            r#"
            DELETE FROM module_records
            WHERE table_name = $1 AND branch_id = $2 AND module_id = $3 AND record_key = $4
            "#,
        )
        .bind(scope.table)
        .bind(scope.branch_id)
        .bind(scope.module_id)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn truncate(&self, scope: TableScope<'_>) -> Result<u64, DurableError> {
        let result = sqlx::query(
            r#"
            DELETE FROM module_records
            WHERE table_name = $1 AND branch_id = $2 AND module_id = $3
            "#,
        )
        .bind(scope.table)
        .bind(scope.branch_id)
        .bind(scope.module_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn replace(
        &self,
        scope: TableScope<'_>,
        rows: &[(RecordKey, Record)],
    ) -> Result<(), DurableError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM module_records
            WHERE table_name = $1 AND branch_id = $2 AND module_id = $3
            "#,
        )
        .bind(scope.table)
        .bind(scope.branch_id)
        .bind(scope.module_id)
        .execute(&mut *tx)
        .await?;

        let updated_at = updated_at_millis();
        for (key, record) in rows {
            sqlx::query(
                r#"
                INSERT INTO module_records (table_name, branch_id, module_id, record_key, payload, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(scope.table)
            .bind(scope.branch_id)
            .bind(scope.module_id)
            .bind(key)
            .bind(sqlx::types::Json(record))
            .bind(updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
