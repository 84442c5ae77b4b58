//! Server-sent event feed for one job.
//!
//! A client resumes with `Last-Event-ID`: stored events after that ID are
//! replayed first, then live events follow. The live subscription is opened
//! before the replay is read, and live events at or below the last replayed
//! ID are dropped, so nothing is lost or repeated at the seam. A live feed
//! that skips an ID or is closed for lagging is topped up from the log.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::Stream;
use serde_json::json;
use tracing::{debug, warn};

use super::api::{ApiError, SharedState};
use crate::hub::{Event, EventKind, parse_last_event_id};

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

fn to_sse(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.kind.as_str())
        .data(event.data.to_string())
}

pub async fn stream_job(
    State(state): State<SharedState>,
    Path(job_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let job = state.service.get_job(job_id).await?;
    let after = parse_last_event_id(
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok()),
    );

    let hub = state.service.hub();
    let mut live = hub.subscribe(job_id);
    let replay = hub.replay_from(job_id, after).await?;
    debug!(job_id, after, replayed = replay.len(), "SSE client connected");

    let stream = async_stream::stream! {
        let mut last = after;
        for event in replay {
            last = event.id;
            yield Ok(to_sse(&event));
            if event.kind.is_terminal() {
                return;
            }
        }

        // Finished job whose stored stream is gone.
        if job.status.is_terminal() {
            let done = SseEvent::default()
                .event(EventKind::Done.as_str())
                .data(json!({"task_id": job_id, "status": job.status}).to_string());
            yield Ok(done);
            return;
        }

        loop {
            match live.recv().await {
                Some(event) if event.id <= last => continue,
                Some(event) if event.id == last + 1 => {
                    last = event.id;
                    yield Ok(to_sse(&event));
                    if event.kind.is_terminal() {
                        break;
                    }
                }
                None if !live.lagged() => break,
                // A gap, or the hub closed us for falling behind: read what
                // was missed from the log.
                gap => {
                    if gap.is_none() {
                        live = hub.subscribe(job_id);
                    }
                    let missed = match hub.replay_from(job_id, last).await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!(job_id, error = %e, "SSE catch-up replay failed");
                            break;
                        }
                    };
                    debug!(job_id, after = last, missed = missed.len(), "SSE client caught up from log");
                    let mut finished = false;
                    for event in missed {
                        last = event.id;
                        yield Ok(to_sse(&event));
                        if event.kind.is_terminal() {
                            finished = true;
                            break;
                        }
                    }
                    if finished {
                        break;
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("heartbeat"),
    ))
}
