use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{Event, EventKind};
use crate::errors::HubError;

/// Durable, append-only event storage keyed by job ID.
///
/// The log assigns event IDs: the first event of a stream gets 1 and each
/// append adds exactly 1. Streams with a passed expiry read as empty and are
/// removed by `purge_expired`; appending to one starts a fresh stream at 1.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, job_id: i64, kind: EventKind, data: Value) -> Result<Event, HubError>;

    /// Events with an ID greater than `after`, in order.
    async fn read_after(&self, job_id: i64, after: u64) -> Result<Vec<Event>, HubError>;

    async fn count(&self, job_id: i64) -> Result<u64, HubError>;

    /// `limit` events starting at zero-based position `offset`.
    async fn page(&self, job_id: i64, offset: u64, limit: u64) -> Result<Vec<Event>, HubError>;

    async fn set_expiry(&self, job_id: i64, ttl: Duration) -> Result<(), HubError>;

    /// Remove expired streams, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, HubError>;
}

#[derive(Default)]
struct Stream {
    events: Vec<Event>,
    expires_at: Option<Instant>,
}

impl Stream {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local `EventLog`, for tests and single-node deployments that do
/// not need history across restarts.
#[derive(Default)]
pub struct MemoryEventLog {
    streams: Mutex<HashMap<i64, Stream>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` over the stream's events; missing or expired streams are empty.
    async fn with_events<R, F>(&self, job_id: i64, f: F) -> R
    where
        F: FnOnce(&[Event]) -> R,
    {
        let streams = self.streams.lock().await;
        match streams.get(&job_id) {
            Some(stream) if !stream.is_expired(Instant::now()) => f(&stream.events),
            _ => f(&[]),
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, job_id: i64, kind: EventKind, data: Value) -> Result<Event, HubError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.entry(job_id).or_default();
        if stream.is_expired(Instant::now()) {
            *stream = Stream::default();
        }
        let event = Event {
            id: stream.events.len() as u64 + 1,
            kind,
            data,
        };
        stream.events.push(event.clone());
        Ok(event)
    }

    async fn read_after(&self, job_id: i64, after: u64) -> Result<Vec<Event>, HubError> {
        Ok(self
            .with_events(job_id, |events| {
                let start = (after as usize).min(events.len());
                events[start..].to_vec()
            })
            .await)
    }

    async fn count(&self, job_id: i64) -> Result<u64, HubError> {
        Ok(self.with_events(job_id, |events| events.len() as u64).await)
    }

    async fn page(&self, job_id: i64, offset: u64, limit: u64) -> Result<Vec<Event>, HubError> {
        Ok(self
            .with_events(job_id, |events| {
                events
                    .iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn set_expiry(&self, job_id: i64, ttl: Duration) -> Result<(), HubError> {
        let mut streams = self.streams.lock().await;
        streams.entry(job_id).or_default().expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, HubError> {
        let mut streams = self.streams.lock().await;
        let now = Instant::now();
        let before = streams.len();
        streams.retain(|_, stream| !stream.is_expired(now));
        Ok(before - streams.len())
    }
}
