//! Message-row driver.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use symphony::{EnvelopeState, InsertOutcome, MessageRow, MessageStore, StoreError};

use crate::backend_error;

const MESSAGE_COLUMNS: &str = "id, type, transport, queue, priority, body, headers, \
     idempotency_key, available_at, scheduled_at, created_at, leased_until, leased_by, \
     retry_count, max_retries, reclaim_count, last_error, error_class, state";

/// Wire form of a `messenger_messages` row.
#[derive(Debug, FromRow)]
struct PgMessageRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    message_type: String,
    transport: String,
    queue: String,
    priority: i16,
    body: serde_json::Value,
    headers: Option<serde_json::Value>,
    idempotency_key: Option<String>,
    available_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    leased_by: Option<String>,
    retry_count: i32,
    max_retries: i32,
    reclaim_count: i32,
    last_error: Option<String>,
    error_class: Option<String>,
    state: String,
}

impl PgMessageRow {
    fn into_row(self) -> Result<MessageRow, StoreError> {
        Ok(MessageRow {
            id: self.id,
            message_type: self.message_type,
            transport: self.transport,
            queue: self.queue,
            priority: u8::try_from(self.priority)
                .map_err(|_| StoreError::Serialization(format!("priority {}", self.priority)))?,
            body: self.body,
            headers: self.headers.unwrap_or(serde_json::Value::Null),
            idempotency_key: self.idempotency_key,
            available_at: self.available_at,
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            leased_until: self.leased_until,
            leased_by: self.leased_by,
            retry_count: to_count(self.retry_count)?,
            max_retries: to_count(self.max_retries)?,
            reclaim_count: to_count(self.reclaim_count)?,
            last_error: self.last_error,
            error_class: self.error_class,
            state: EnvelopeState::parse(&self.state)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        })
    }
}

fn to_count(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Serialization(format!("negative count {value}")))
}

/// [`MessageStore`] over PostgreSQL.
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    /// Driver over an existing pool. Run [`crate::MIGRATOR`] first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn live_id_for_key(
        &self,
        message_type: &str,
        key: &str,
        exclude: Option<Uuid>,
    ) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM messenger_messages
            WHERE type = $1
              AND idempotency_key = $2
              AND state IN ('pending', 'in_flight')
              AND ($3::uuid IS NULL OR id <> $3)
            LIMIT 1
            "#,
        )
        .bind(message_type)
        .bind(key)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(id)
    }
}

#[async_trait::async_trait]
impl MessageStore for PostgresMessageStore {
    async fn insert(&self, row: MessageRow) -> Result<InsertOutcome, StoreError> {
        if let Some(key) = &row.idempotency_key {
            if let Some(existing) = self
                .live_id_for_key(&row.message_type, key, Some(row.id))
                .await?
            {
                return Ok(InsertOutcome::Duplicate(existing));
            }
        }

        let headers = match &row.headers {
            serde_json::Value::Null => None,
            other => Some(other.clone()),
        };

        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO messenger_messages (
                id, type, transport, queue, priority, body, headers,
                idempotency_key, available_at, scheduled_at, created_at,
                retry_count, max_retries, reclaim_count, last_error, error_class, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 'pending')
            ON CONFLICT (id) DO UPDATE SET
                priority = EXCLUDED.priority,
                body = EXCLUDED.body,
                headers = EXCLUDED.headers,
                available_at = EXCLUDED.available_at,
                retry_count = EXCLUDED.retry_count,
                max_retries = EXCLUDED.max_retries,
                reclaim_count = EXCLUDED.reclaim_count,
                last_error = EXCLUDED.last_error,
                error_class = EXCLUDED.error_class,
                state = 'pending',
                leased_until = NULL,
                leased_by = NULL
            WHERE messenger_messages.state IN ('pending', 'in_flight')
            RETURNING id
            "#,
        )
        .bind(row.id)
        .bind(&row.message_type)
        .bind(&row.transport)
        .bind(&row.queue)
        .bind(i16::from(row.priority))
        .bind(&row.body)
        .bind(headers)
        .bind(&row.idempotency_key)
        .bind(row.available_at)
        .bind(row.scheduled_at)
        .bind(row.created_at)
        .bind(row.retry_count as i32)
        .bind(row.max_retries as i32)
        .bind(row.reclaim_count as i32)
        .bind(&row.last_error)
        .bind(&row.error_class)
        .fetch_optional(&self.pool)
        .await;

        match inserted {
            // No row back: the id exists on a terminal row, which is
            // write-once.
            Ok(None) => Ok(InsertOutcome::Duplicate(row.id)),
            Ok(Some(id)) => Ok(InsertOutcome::Created(id)),
            Err(err) => {
                // Race backstop: a concurrent insert won the unique
                // (type, idempotency_key) index.
                let unique_race = err
                    .as_database_error()
                    .and_then(|db| db.constraint())
                    .map_or(false, |c| c == "uq_messenger_messages_type_idem");
                if unique_race {
                    if let Some(key) = &row.idempotency_key {
                        if let Some(existing) =
                            self.live_id_for_key(&row.message_type, key, Some(row.id)).await?
                        {
                            tracing::debug!(
                                message_id = %existing,
                                idempotency_key = %key,
                                "concurrent insert collapsed onto existing envelope"
                            );
                            return Ok(InsertOutcome::Duplicate(existing));
                        }
                    }
                }
                Err(backend_error(err))
            }
        }
    }

    async fn lease(
        &self,
        queue: Option<&str>,
        worker_id: &str,
        limit: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let leased_until = now + chrono::Duration::milliseconds(lease_duration.as_millis() as i64);

        let rows = sqlx::query_as::<_, PgMessageRow>(&format!(
            r#"
            WITH next_messages AS (
                SELECT id, state
                FROM messenger_messages
                WHERE ($1::text IS NULL OR queue = $1)
                  AND (
                      (state = 'pending' AND available_at <= $2)
                      OR (state = 'in_flight' AND leased_until < $2)
                  )
                ORDER BY priority DESC, available_at ASC, created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE messenger_messages m
            SET state = 'in_flight',
                leased_until = $4,
                leased_by = $5,
                reclaim_count = m.reclaim_count
                    + CASE WHEN n.state = 'in_flight' THEN 1 ELSE 0 END
            FROM next_messages n
            WHERE m.id = n.id
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(now)
        .bind(limit as i64)
        .bind(leased_until)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        let mut leased = rows
            .into_iter()
            .map(PgMessageRow::into_row)
            .collect::<Result<Vec<_>, _>>()?;
        // UPDATE..RETURNING does not preserve the CTE order.
        leased.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.available_at.cmp(&b.available_at))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(leased)
    }

    async fn mark_acked(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE messenger_messages
            SET state = 'acked', leased_until = NULL, leased_by = NULL
            WHERE id = $1 AND state IN ('pending', 'in_flight')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        error: &str,
        error_class: &str,
        retry_count: u32,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE messenger_messages
            SET state = 'dead',
                last_error = $2,
                error_class = $3,
                retry_count = $4,
                leased_until = NULL,
                leased_by = NULL
            WHERE id = $1 AND state IN ('pending', 'in_flight')
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(error_class)
        .bind(retry_count as i32)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messenger_messages
            SET state = 'pending',
                leased_until = NULL,
                leased_by = NULL,
                reclaim_count = reclaim_count + 1
            WHERE state = 'in_flight' AND leased_until < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(result.rows_affected())
    }

    async fn extend_lease(&self, id: Uuid, leased_until: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE messenger_messages
            SET leased_until = $2
            WHERE id = $1 AND state = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(leased_until)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(())
    }

    async fn depth(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM messenger_messages
            WHERE ($1::text IS NULL OR queue = $1)
              AND (
                  state = 'pending'
                  OR (state = 'in_flight' AND leased_until >= $2)
              )
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(count as u64)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MessageRow>, StoreError> {
        let row = sqlx::query_as::<_, PgMessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messenger_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;
        row.map(PgMessageRow::into_row).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        message_type: &str,
        key: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        self.live_id_for_key(message_type, key, None).await
    }

    async fn redispatch_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messenger_messages
            SET state = 'pending',
                retry_count = 0,
                available_at = $2,
                leased_until = NULL,
                leased_by = NULL
            WHERE id = $1 AND state = 'dead'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg_row(state: &str, priority: i16) -> PgMessageRow {
        PgMessageRow {
            id: Uuid::new_v4(),
            message_type: "Work".to_string(),
            transport: "durable".to_string(),
            queue: "default".to_string(),
            priority,
            body: serde_json::json!({ "k": "a" }),
            headers: None,
            idempotency_key: None,
            available_at: Utc::now(),
            scheduled_at: None,
            created_at: Utc::now(),
            leased_until: None,
            leased_by: None,
            retry_count: 1,
            max_retries: 3,
            reclaim_count: 0,
            last_error: Some("timeout".to_string()),
            error_class: Some("HandlerError".to_string()),
            state: state.to_string(),
        }
    }

    #[test]
    fn wire_row_converts_to_the_core_model() {
        let row = pg_row("pending", 7).into_row().unwrap();
        assert_eq!(row.state, EnvelopeState::Pending);
        assert_eq!(row.priority, 7);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.headers, serde_json::Value::Null);
    }

    #[test]
    fn corrupt_state_or_counts_fail_as_serialization_errors() {
        assert!(matches!(
            pg_row("zombie", 5).into_row(),
            Err(StoreError::Serialization(_))
        ));

        let mut negative = pg_row("pending", 5);
        negative.retry_count = -1;
        assert!(matches!(
            negative.into_row(),
            Err(StoreError::Serialization(_))
        ));
    }
}
