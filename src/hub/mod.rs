//! Per-job event streams.
//!
//! Two independent pieces sit behind [`EventHub`]:
//! - an [`EventLog`]: durable, append-only, offset-addressable, with a TTL
//! - a [`Fanout`]: live, lossy, per-subscriber bounded channels
//!
//! `broadcast` appends first (which assigns the event ID) and then fans the
//! stored event out, both under that job's publish lock, so every live
//! subscriber observes a job's events in ID order. Different jobs publish
//! independently. Subscribers that fall behind are closed as lagged and
//! recover the rest through `replay_from`.

pub mod fanout;
pub mod log;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::HubError;

pub use fanout::{Fanout, Subscription};
pub use log::{EventLog, MemoryEventLog};
pub use sqlite::SqliteEventLog;

/// Live channel slots per subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Job status change.
    Status,
    /// Informational message.
    Log,
    /// Updated progress counters.
    Progress,
    /// One parsed line of tool output.
    Output,
    /// A fatal error; always followed by `Done`.
    TaskError,
    /// Terminal event: nothing follows it.
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Log => "log",
            Self::Progress => "progress",
            Self::Output => "output",
            Self::TaskError => "task_error",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl FromStr for EventKind {
    type Err = String;

    /// Accepts the legacy `error` name for `task_error`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "log" => Ok(Self::Log),
            "progress" => Ok(Self::Progress),
            "output" => Ok(Self::Output),
            "task_error" | "error" => Ok(Self::TaskError),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid event kind: {}", s)),
        }
    }
}

/// One entry of a job's event stream. `id` is 1-based and gap-free per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub kind: EventKind,
    pub data: Value,
}

/// Durable log plus live fan-out.
pub struct EventHub {
    log: Arc<dyn EventLog>,
    fanout: Fanout,
    publish_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl EventHub {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            fanout: Fanout::new(SUBSCRIBER_CAPACITY),
            publish_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Hub over an in-memory log.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryEventLog::new()))
    }

    /// Append the event durably, then deliver it to current subscribers.
    /// Never waits on a subscriber.
    pub async fn broadcast(
        &self,
        job_id: i64,
        kind: EventKind,
        data: Value,
    ) -> Result<Event, HubError> {
        let lock = self.publish_lock(job_id);
        let _guard = lock.lock().await;
        let event = self.log.append(job_id, kind, data).await?;
        self.fanout.publish(job_id, &event);
        if kind.is_terminal() {
            self.release_publish_lock(job_id);
        }
        Ok(event)
    }

    fn publish_lock(&self, job_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        match self.publish_locks.lock() {
            Ok(mut locks) => locks.entry(job_id).or_default().clone(),
            // Poisoned map: a private lock still keeps this append well-formed.
            Err(_) => Arc::default(),
        }
    }

    fn release_publish_lock(&self, job_id: i64) {
        if let Ok(mut locks) = self.publish_locks.lock() {
            locks.remove(&job_id);
        }
    }

    pub fn subscribe(&self, job_id: i64) -> Subscription {
        self.fanout.subscribe(job_id)
    }

    pub fn subscriber_count(&self, job_id: i64) -> usize {
        self.fanout.subscriber_count(job_id)
    }

    /// Stored events with an ID greater than `after` (0 = from the start).
    pub async fn replay_from(&self, job_id: i64, after: u64) -> Result<Vec<Event>, HubError> {
        self.log.read_after(job_id, after).await
    }

    pub async fn set_expire(&self, job_id: i64, ttl: Duration) -> Result<(), HubError> {
        self.log.set_expiry(job_id, ttl).await
    }

    pub async fn total_events(&self, job_id: i64) -> Result<u64, HubError> {
        self.log.count(job_id).await
    }

    pub async fn events_page(
        &self,
        job_id: i64,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Event>, HubError> {
        self.log.page(job_id, offset, limit).await
    }

    pub async fn purge_expired(&self) -> Result<usize, HubError> {
        self.log.purge_expired().await
    }
}

/// Parse a `Last-Event-ID` header value. Anything unparseable means "from
/// the start".
pub fn parse_last_event_id(value: Option<&str>) -> u64 {
    value
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Run `purge_expired` every `interval` until `cancel` fires.
pub async fn run_purger(
    hub: Arc<EventHub>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match hub.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(streams = n, "Purged expired event streams"),
                    Err(e) => tracing::warn!(error = %e, "Failed to purge expired event streams"),
                }
            }
        }
    }
}
