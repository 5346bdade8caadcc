//! Schedule-row driver.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use symphony::{ScheduleRow, ScheduleStore, ScheduleType, StoreError};

use crate::backend_error;

const SCHEDULE_COLUMNS: &str = "id, message_type, transport, body, headers, schedule_type, \
     schedule_config, timezone, next_run_at, last_run_at, run_count, max_runs, enabled, \
     created_at, updated_at";

/// Wire form of a `messenger_schedules` row.
#[derive(Debug, FromRow)]
struct PgScheduleRow {
    id: Uuid,
    message_type: String,
    transport: Option<String>,
    body: serde_json::Value,
    headers: Option<serde_json::Value>,
    schedule_type: String,
    schedule_config: serde_json::Value,
    timezone: String,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    run_count: i32,
    max_runs: Option<i32>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PgScheduleRow {
    fn into_row(self) -> Result<ScheduleRow, StoreError> {
        Ok(ScheduleRow {
            id: self.id,
            message_type: self.message_type,
            transport: self.transport,
            body: self.body,
            headers: self.headers.unwrap_or(serde_json::Value::Null),
            schedule_type: ScheduleType::parse(&self.schedule_type)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            schedule_config: self.schedule_config,
            timezone: self.timezone,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            run_count: u32::try_from(self.run_count)
                .map_err(|_| StoreError::Serialization(format!("run_count {}", self.run_count)))?,
            max_runs: self
                .max_runs
                .map(|m| {
                    u32::try_from(m)
                        .map_err(|_| StoreError::Serialization(format!("max_runs {m}")))
                })
                .transpose()?,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// [`ScheduleStore`] over PostgreSQL.
pub struct PostgresScheduleStore {
    pool: PgPool,
}

impl PostgresScheduleStore {
    /// Driver over an existing pool. Run [`crate::MIGRATOR`] first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn insert(&self, row: ScheduleRow) -> Result<Uuid, StoreError> {
        let headers = match &row.headers {
            serde_json::Value::Null => None,
            other => Some(other.clone()),
        };

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO messenger_schedules (
                id, message_type, transport, body, headers, schedule_type,
                schedule_config, timezone, next_run_at, last_run_at,
                run_count, max_runs, enabled, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id
            "#,
        )
        .bind(row.id)
        .bind(&row.message_type)
        .bind(&row.transport)
        .bind(&row.body)
        .bind(headers)
        .bind(row.schedule_type.as_str())
        .bind(&row.schedule_config)
        .bind(&row.timezone)
        .bind(row.next_run_at)
        .bind(row.last_run_at)
        .bind(row.run_count as i32)
        .bind(row.max_runs.map(|m| m as i32))
        .bind(row.enabled)
        .bind(row.created_at)
        .bind(row.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(id)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleRow>, StoreError> {
        let rows = sqlx::query_as::<_, PgScheduleRow>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM messenger_schedules
            WHERE enabled = TRUE
              AND next_run_at IS NOT NULL
              AND next_run_at <= $1
            ORDER BY next_run_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        rows.into_iter().map(PgScheduleRow::into_row).collect()
    }

    async fn update(&self, row: &ScheduleRow) -> Result<(), StoreError> {
        let headers = match &row.headers {
            serde_json::Value::Null => None,
            other => Some(other.clone()),
        };

        let result = sqlx::query(
            r#"
            UPDATE messenger_schedules SET
                message_type = $2,
                transport = $3,
                body = $4,
                headers = $5,
                schedule_type = $6,
                schedule_config = $7,
                timezone = $8,
                next_run_at = $9,
                last_run_at = $10,
                run_count = $11,
                max_runs = $12,
                enabled = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.message_type)
        .bind(&row.transport)
        .bind(&row.body)
        .bind(headers)
        .bind(row.schedule_type.as_str())
        .bind(&row.schedule_config)
        .bind(&row.timezone)
        .bind(row.next_run_at)
        .bind(row.last_run_at)
        .bind(row.run_count as i32)
        .bind(row.max_runs.map(|m| m as i32))
        .bind(row.enabled)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!(
                "schedule {} does not exist",
                row.id
            )));
        }
        Ok(())
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messenger_schedules
            SET enabled = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduleRow>, StoreError> {
        let row = sqlx::query_as::<_, PgScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM messenger_schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;
        row.map(PgScheduleRow::into_row).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messenger_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(result.rows_affected() > 0)
    }
}
