//! In-memory store drivers.
//!
//! Reference implementations of [`MessageStore`] and [`ScheduleStore`] over
//! process memory. They back the test suite and small single-process
//! deployments; the lease/state machine is identical to the PostgreSQL
//! drivers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::{
    InsertOutcome, MessageRow, MessageStore, ScheduleRow, ScheduleStore, StoreError,
};
use crate::message::EnvelopeState;

/// Message rows in a process-local map.
#[derive(Default)]
pub struct InMemoryMessageStore {
    rows: Mutex<HashMap<Uuid, MessageRow>>,
}

impl InMemoryMessageStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows, test and inspection helper.
    pub fn rows(&self) -> Vec<MessageRow> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, MessageRow>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, row: MessageRow) -> Result<InsertOutcome, StoreError> {
        let mut rows = self.lock();

        if let Some(key) = &row.idempotency_key {
            let duplicate = rows.values().find(|r| {
                r.id != row.id
                    && !r.state.is_terminal()
                    && r.message_type == row.message_type
                    && r.idempotency_key.as_deref() == Some(key)
            });
            if let Some(existing) = duplicate {
                return Ok(InsertOutcome::Duplicate(existing.id));
            }
        }

        if let Some(existing) = rows.get(&row.id) {
            if existing.state.is_terminal() {
                // Terminal rows are write-once.
                return Ok(InsertOutcome::Duplicate(existing.id));
            }
        }

        let id = row.id;
        rows.insert(id, row);
        Ok(InsertOutcome::Created(id))
    }

    async fn lease(
        &self,
        queue: Option<&str>,
        worker_id: &str,
        limit: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let mut rows = self.lock();

        let mut leasable: Vec<Uuid> = rows
            .values()
            .filter(|r| queue.map_or(true, |q| r.queue == q))
            .filter(|r| match r.state {
                EnvelopeState::Pending => r.available_at <= now,
                EnvelopeState::InFlight => r.leased_until.map_or(true, |until| until < now),
                _ => false,
            })
            .map(|r| r.id)
            .collect();

        leasable.sort_by(|a, b| {
            let ra = &rows[a];
            let rb = &rows[b];
            rb.priority
                .cmp(&ra.priority)
                .then(ra.available_at.cmp(&rb.available_at))
                .then(ra.created_at.cmp(&rb.created_at))
        });
        leasable.truncate(limit);

        let leased_until = now + chrono::Duration::milliseconds(lease_duration.as_millis() as i64);
        let mut leased = Vec::with_capacity(leasable.len());
        for id in leasable {
            if let Some(row) = rows.get_mut(&id) {
                if row.state == EnvelopeState::InFlight {
                    // Expired lease taken over: a reclamation, not a retry.
                    row.reclaim_count += 1;
                }
                row.state = EnvelopeState::InFlight;
                row.leased_until = Some(leased_until);
                row.leased_by = Some(worker_id.to_string());
                leased.push(row.clone());
            }
        }
        Ok(leased)
    }

    async fn mark_acked(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.lock();
        if let Some(row) = rows.get_mut(&id) {
            if !row.state.is_terminal() {
                row.state = EnvelopeState::Acked;
                row.leased_until = None;
                row.leased_by = None;
            }
        }
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
        let mut rows = self.lock();
        if let Some(row) = rows.get_mut(&id) {
            if !row.state.is_terminal() {
                row.state = EnvelopeState::Dead;
                row.last_error = Some(error.to_string());
                row.error_class = Some(error_class.to_string());
                row.retry_count = retry_count;
                row.leased_until = None;
                row.leased_by = None;
            }
        }
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.lock();
        let mut reclaimed = 0;
        for row in rows.values_mut() {
            if row.state == EnvelopeState::InFlight
                && row.leased_until.map_or(false, |until| until < now)
            {
                row.state = EnvelopeState::Pending;
                row.leased_until = None;
                row.leased_by = None;
                row.reclaim_count += 1;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn extend_lease(&self, id: Uuid, leased_until: DateTime<Utc>) -> Result<(), StoreError> {
        let mut rows = self.lock();
        if let Some(row) = rows.get_mut(&id) {
            if row.state == EnvelopeState::InFlight {
                row.leased_until = Some(leased_until);
            }
        }
        Ok(())
    }

    async fn depth(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let rows = self.lock();
        let count = rows
            .values()
            .filter(|r| queue.map_or(true, |q| r.queue == q))
            .filter(|r| match r.state {
                EnvelopeState::Pending => true,
                EnvelopeState::InFlight => r.leased_until.map_or(false, |until| until >= now),
                _ => false,
            })
            .count();
        Ok(count as u64)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MessageRow>, StoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        message_type: &str,
        key: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let rows = self.lock();
        Ok(rows
            .values()
            .find(|r| {
                !r.state.is_terminal()
                    && r.message_type == message_type
                    && r.idempotency_key.as_deref() == Some(key)
            })
            .map(|r| r.id))
    }

    async fn redispatch_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut rows = self.lock();
        match rows.get_mut(&id) {
            Some(row) if row.state == EnvelopeState::Dead => {
                row.state = EnvelopeState::Pending;
                row.retry_count = 0;
                row.available_at = now;
                row.leased_until = None;
                row.leased_by = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Schedule rows in a process-local map.
#[derive(Default)]
pub struct InMemoryScheduleStore {
    rows: Mutex<HashMap<Uuid, ScheduleRow>>,
}

impl InMemoryScheduleStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ScheduleRow>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn insert(&self, row: ScheduleRow) -> Result<Uuid, StoreError> {
        let id = row.id;
        self.lock().insert(id, row);
        Ok(id)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleRow>, StoreError> {
        let rows = self.lock();
        let mut due: Vec<ScheduleRow> = rows
            .values()
            .filter(|r| r.enabled && r.next_run_at.map_or(false, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn update(&self, row: &ScheduleRow) -> Result<(), StoreError> {
        let mut rows = self.lock();
        if !rows.contains_key(&row.id) {
            return Err(StoreError::Backend(format!(
                "schedule {} does not exist",
                row.id
            )));
        }
        rows.insert(row.id, row.clone());
        Ok(())
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let mut rows = self.lock();
        match rows.get_mut(&id) {
            Some(row) => {
                row.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduleRow>, StoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock().remove(&id).is_some())
    }
}
