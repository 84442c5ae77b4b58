//! HTTP surface over the job pipeline: trigger, inspect, cancel and stream
//! jobs.

pub mod api;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::codegen::CodegenService;
use crate::config::Config;
use crate::hub;
use crate::store::{DbHandle, JobDb};

pub use api::{AppState, SharedState};

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Open the database, start the pipeline and serve until Ctrl+C.
pub async fn start_server(config: Arc<Config>) -> Result<()> {
    let db = JobDb::new(&config.database.path).with_context(|| {
        format!(
            "Failed to open job database at {}",
            config.database.path.display()
        )
    })?;
    let service = Arc::new(
        CodegenService::from_config(config.clone(), DbHandle::new(db))
            .context("Failed to start codegen service")?,
    );

    let purger_cancel = CancellationToken::new();
    let purger = tokio::spawn(hub::run_purger(
        service.hub(),
        Duration::from_secs(config.codegen.purge_interval_secs.max(1)),
        purger_cancel.clone(),
    ));

    let app = build_router(Arc::new(AppState {
        service: service.clone(),
    }));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(
        %local_addr,
        workers = config.codegen.max_workers,
        "reqforge listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down; cancelling live jobs");
    purger_cancel.cancel();
    service.shutdown().await;
    if let Err(e) = purger.await {
        error!(error = %e, "Stream purger ended abnormally");
    }
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::models::{JobStatus, NewJob, target_branch_for};
    use crate::codegen::testing::{self, FakeVcs, ScriptedLauncher};
    use crate::codegen::{JobNotifier, TracingNotifier};
    use crate::hub::EventKind;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        service: Arc<CodegenService>,
        router: Router,
        _work: TempDir,
    }

    fn test_app(vcs: FakeVcs) -> TestApp {
        let work = TempDir::new().unwrap();
        let db = DbHandle::new(JobDb::new_in_memory().unwrap());
        let deps = testing::deps(
            &db,
            Arc::new(vcs),
            Arc::new(ScriptedLauncher::default()),
            testing::config(work.path()),
        );
        let notifier: Arc<dyn JobNotifier> = Arc::new(TracingNotifier);
        let service = Arc::new(CodegenService::new(deps, notifier));
        let router = build_router(Arc::new(AppState {
            service: service.clone(),
        }));
        TestApp {
            service,
            router,
            _work: work,
        }
    }

    impl TestApp {
        fn pending_job(&self, requirement_id: i64) -> i64 {
            self.service
                .db()
                .lock_sync()
                .unwrap()
                .create_job(&NewJob {
                    requirement_id,
                    repo_url: "https://git.example.com/app".into(),
                    source_branch: "main".into(),
                    target_branch: target_branch_for(requirement_id),
                    extra_context: None,
                })
                .unwrap()
                .id
        }

        async fn send(&self, req: Request<Body>) -> (StatusCode, Vec<u8>) {
            let resp = self.router.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            (status, bytes.to_vec())
        }

        async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let (status, body) = self.send(req).await;
            (status, serde_json::from_slice(&body).unwrap())
        }

        async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
            let req = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            let (status, body) = self.send(req).await;
            (status, serde_json::from_slice(&body).unwrap())
        }

        async fn stream(&self, job_id: i64, last_event_id: Option<&str>) -> String {
            let mut req = Request::builder().uri(format!("/api/jobs/{}/stream", job_id));
            if let Some(id) = last_event_id {
                req = req.header("last-event-id", id);
            }
            let (status, body) = self.send(req.body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::OK);
            String::from_utf8(body).unwrap()
        }
    }

    fn trigger_body(requirement_id: i64) -> Value {
        json!({
            "requirement": {"id": requirement_id, "title": "Add login", "description": "Email sign-in"},
            "repository": {"url": "https://git.example.com/app", "default_branch": "main"},
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(FakeVcs::default());
        let (status, body) = app.get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["live_jobs"], 0);
    }

    #[tokio::test]
    async fn test_trigger_then_read_job() {
        let app = test_app(FakeVcs::default());
        let (status, body) = app.post_json("/api/jobs", trigger_body(12)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["job"]["target_branch"], "code-master/req-12");
        assert!(body["queue_position"].is_number());

        let id = body["job"]["id"].as_i64().unwrap();
        let (status, job) = app.get_json(&format!("/api/jobs/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["id"], id);
    }

    #[tokio::test]
    async fn test_trigger_validation_error_is_400() {
        let app = test_app(FakeVcs::default());
        let mut body = trigger_body(1);
        body["repository"]["url"] = json!("");
        let (status, body) = app.post_json("/api/jobs", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("repository url"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let app = test_app(FakeVcs::default());
        let (status, body) = app.get_json("/api/jobs/404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Job 404 not found");

        let (status, _) = app.post_json("/api/jobs/404/cancel", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_pending_then_conflict() {
        let app = test_app(FakeVcs::default());
        let id = app.pending_job(2);

        let (status, job) = app.post_json(&format!("/api/jobs/{}/cancel", id), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "cancelled");

        let (status, _) = app.post_json(&format!("/api/jobs/{}/cancel", id), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_log_pagination() {
        let app = test_app(FakeVcs::default());
        let id = app.pending_job(3);
        let hub = app.service.hub();
        for i in 0..3 {
            hub.broadcast(id, EventKind::Log, json!({"message": i}))
                .await
                .unwrap();
        }

        let (status, page) = app
            .get_json(&format!("/api/jobs/{}/log?offset=1&limit=1", id))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total_events"], 3);
        assert_eq!(page["has_more"], true);
        assert_eq!(page["events"][0]["id"], 2);
        assert_eq!(page["events"][0]["kind"], "log");

        let (_, page) = app.get_json(&format!("/api/jobs/{}/log", id)).await;
        assert_eq!(page["limit"], 500);
        assert_eq!(page["has_more"], false);
        assert_eq!(page["events"].as_array().unwrap().len(), 3);

        let (_, page) = app
            .get_json(&format!("/api/jobs/{}/log?limit=5000", id))
            .await;
        assert_eq!(page["limit"], 1000);
    }

    #[tokio::test]
    async fn test_stream_resumes_after_last_event_id() {
        let app = test_app(FakeVcs::default());
        let id = app.pending_job(4);
        let hub = app.service.hub();
        hub.broadcast(id, EventKind::Status, json!({"status": "cloning"}))
            .await
            .unwrap();
        hub.broadcast(id, EventKind::Log, json!({"message": "hi"}))
            .await
            .unwrap();
        hub.broadcast(id, EventKind::Done, json!({"task_id": id, "status": "completed"}))
            .await
            .unwrap();

        let body = app.stream(id, Some("1")).await;
        assert!(!body.contains("id: 1\n"));
        assert!(body.contains("id: 2\n"));
        assert!(body.contains("event: done\n"));
        assert!(body.find("id: 2").unwrap() < body.find("id: 3").unwrap());

        let body = app.stream(id, Some("garbage")).await;
        assert!(body.contains("id: 1\n"));
    }

    #[tokio::test]
    async fn test_stream_synthesizes_done_for_expired_terminal_job() {
        let app = test_app(FakeVcs::default());
        let id = app.pending_job(5);
        app.service
            .db()
            .lock_sync()
            .unwrap()
            .cancel_job(id)
            .unwrap();

        let body = app.stream(id, None).await;
        assert!(body.contains("event: done\n"));
        assert!(body.contains(r#""status":"cancelled""#));
    }

    #[tokio::test]
    async fn test_stream_delivers_live_events_until_done() {
        let app = test_app(FakeVcs::default());
        let id = app.pending_job(6);
        let hub = app.service.hub();

        let reader = {
            let router = app.router.clone();
            tokio::spawn(async move {
                let req = Request::builder()
                    .uri(format!("/api/jobs/{}/stream", id))
                    .body(Body::empty())
                    .unwrap();
                let resp = router.oneshot(req).await.unwrap();
                resp.into_body().collect().await.unwrap().to_bytes()
            })
        };
        while hub.subscriber_count(id) == 0 {
            tokio::task::yield_now().await;
        }
        hub.broadcast(id, EventKind::Output, json!({"type": "text"}))
            .await
            .unwrap();
        hub.broadcast(id, EventKind::Done, json!({"task_id": id, "status": "failed"}))
            .await
            .unwrap();

        let body = String::from_utf8(reader.await.unwrap().to_vec()).unwrap();
        assert!(body.contains("event: output\n"));
        assert!(body.contains("event: done\n"));
    }

    #[tokio::test]
    async fn test_stream_recovers_events_dropped_for_slow_client() {
        let app = test_app(FakeVcs::default());
        let id = app.pending_job(8);
        let hub = app.service.hub();

        // The handler subscribes before the body is polled.
        let req = Request::builder()
            .uri(format!("/api/jobs/{}/stream", id))
            .body(Body::empty())
            .unwrap();
        let resp = app.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let total = crate::hub::SUBSCRIBER_CAPACITY + 44;
        for i in 0..total {
            hub.broadcast(id, EventKind::Output, json!({"i": i}))
                .await
                .unwrap();
        }
        hub.broadcast(id, EventKind::Done, json!({"task_id": id, "status": "completed"}))
            .await
            .unwrap();

        let bytes = tokio::time::timeout(Duration::from_secs(5), resp.into_body().collect())
            .await
            .expect("stream did not end after the terminal event")
            .unwrap()
            .to_bytes();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(body.matches("event: output\n").count(), total);
        assert_eq!(body.matches("event: done\n").count(), 1);
        let last_id = format!("id: {}\n", total + 1);
        assert!(body.find(&format!("id: {}\n", total)).unwrap() < body.find(&last_id).unwrap());
    }

    #[tokio::test]
    async fn test_requirement_jobs_and_diff() {
        let app = test_app(FakeVcs::default());
        let first = app.pending_job(7);
        let second = app.pending_job(7);

        let (status, page) = app
            .get_json("/api/requirements/7/jobs?page=1&page_size=1")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 2);
        assert_eq!(page["jobs"][0]["id"], second);

        let (status, diff) = app.get_json(&format!("/api/jobs/{}/diff", first)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(diff["files_changed"], 0);
        assert_eq!(
            app.service.get_job(first).await.unwrap().status,
            JobStatus::Pending
        );
    }
}
