use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{Event, EventKind, EventLog};
use crate::errors::HubError;
use crate::store::{DbHandle, EventRow};

/// `EventLog` persisted in the job database, so history survives restarts.
#[derive(Clone)]
pub struct SqliteEventLog {
    db: DbHandle,
}

impl SqliteEventLog {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn into_events(job_id: i64, rows: Vec<EventRow>) -> Vec<Event> {
    rows.into_iter()
        .filter_map(|row| {
            let kind = match row.kind.parse::<EventKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::warn!(job_id, seq = row.seq, error = %e, "Skipping stored event");
                    return None;
                }
            };
            let data = serde_json::from_str(&row.data).unwrap_or(Value::Null);
            Some(Event {
                id: row.seq,
                kind,
                data,
            })
        })
        .collect()
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, job_id: i64, kind: EventKind, data: Value) -> Result<Event, HubError> {
        let encoded = serde_json::to_string(&data)?;
        let seq = self
            .db
            .call(move |db| db.append_event(job_id, kind.as_str(), &encoded, now_secs()))
            .await
            .map_err(HubError::Store)?;
        Ok(Event {
            id: seq,
            kind,
            data,
        })
    }

    async fn read_after(&self, job_id: i64, after: u64) -> Result<Vec<Event>, HubError> {
        let rows = self
            .db
            .call(move |db| db.events_after(job_id, after, now_secs()))
            .await
            .map_err(HubError::Store)?;
        Ok(into_events(job_id, rows))
    }

    async fn count(&self, job_id: i64) -> Result<u64, HubError> {
        self.db
            .call(move |db| db.count_events(job_id, now_secs()))
            .await
            .map_err(HubError::Store)
    }

    async fn page(&self, job_id: i64, offset: u64, limit: u64) -> Result<Vec<Event>, HubError> {
        let rows = self
            .db
            .call(move |db| db.events_page(job_id, offset, limit, now_secs()))
            .await
            .map_err(HubError::Store)?;
        Ok(into_events(job_id, rows))
    }

    async fn set_expiry(&self, job_id: i64, ttl: Duration) -> Result<(), HubError> {
        let expires_at = now_secs() + ttl.as_secs() as i64;
        self.db
            .call(move |db| db.set_stream_expiry(job_id, expires_at))
            .await
            .map_err(HubError::Store)
    }

    async fn purge_expired(&self) -> Result<usize, HubError> {
        self.db
            .call(|db| db.purge_expired_streams(now_secs()))
            .await
            .map_err(HubError::Store)
    }
}
