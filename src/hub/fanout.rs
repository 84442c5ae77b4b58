use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::Event;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    lagged: Arc<AtomicBool>,
}

type Subscribers = HashMap<i64, Vec<Subscriber>>;

struct Shared {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl Shared {
    fn remove(&self, job_id: i64, sub_id: u64) {
        let Ok(mut map) = self.subscribers.lock() else {
            return;
        };
        if let Some(list) = map.get_mut(&job_id) {
            list.retain(|sub| sub.id != sub_id);
            if list.is_empty() {
                map.remove(&job_id);
            }
        }
    }
}

/// Live delivery of events to per-job subscribers.
///
/// Each subscriber owns a bounded channel. Publishing uses `try_send`: a full
/// channel drops the event for that subscriber only, and the subscriber is
/// closed and marked lagged so its reader knows to catch up from the log.
#[derive(Clone)]
pub struct Fanout {
    shared: Arc<Shared>,
    capacity: usize,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            capacity,
        }
    }

    pub fn subscribe(&self, job_id: i64) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let lagged = Arc::new(AtomicBool::new(false));
        let subscriber = Subscriber {
            id,
            tx,
            lagged: lagged.clone(),
        };
        match self.shared.subscribers.lock() {
            Ok(mut map) => map.entry(job_id).or_default().push(subscriber),
            Err(e) => tracing::error!(job_id, error = %e, "Subscriber map poisoned"),
        }
        Subscription {
            job_id,
            id,
            rx,
            lagged,
            shared: self.shared.clone(),
        }
    }

    pub fn publish(&self, job_id: i64, event: &Event) {
        let Ok(mut map) = self.shared.subscribers.lock() else {
            return;
        };
        let Some(list) = map.get_mut(&job_id) else {
            return;
        };
        list.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    job_id,
                    subscriber = sub.id,
                    event_id = event.id,
                    "Subscriber full, closing lagged subscriber"
                );
                sub.lagged.store(true, Ordering::SeqCst);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            map.remove(&job_id);
        }
    }

    pub fn subscriber_count(&self, job_id: i64) -> usize {
        self.shared
            .subscribers
            .lock()
            .map(|map| map.get(&job_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// A live listener on one job's events. Dropping it unsubscribes.
pub struct Subscription {
    job_id: i64,
    id: u64,
    rx: mpsc::Receiver<Event>,
    lagged: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Next live event; `None` once unsubscribed or lagged, and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// True when the publisher closed this subscription because its channel
    /// was full. Events after the last one received must be read from the log.
    pub fn lagged(&self) -> bool {
        self.lagged.load(Ordering::SeqCst)
    }

    /// Remove this listener and close its channel. Idempotent.
    pub fn unsubscribe(&self) {
        self.shared.remove(self.job_id, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
