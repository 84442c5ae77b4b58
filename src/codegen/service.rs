//! Orchestrating service for the job pipeline.
//!
//! Accepts trigger requests, persists the job, hands an executor to the
//! worker pool and keeps it in the [`JobRegistry`] while it is alive so it
//! can be cancelled. Also records manual submissions and notifies a
//! [`JobNotifier`] when a run ends.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::credentials;
use super::executor::{self, ExecutorDeps, JobContext, JobExecutor, JobOutcome, Workspace};
use super::models::{
    Job, JobStatus, ManualSubmitRequest, NewJob, Repository, Requirement, RequirementStatus,
    TriggerRequest, TriggerResponse, target_branch_for,
};
use super::pool::WorkerPool;
use super::process::TokioLauncher;
use super::prompt::HttpDocumentSource;
use super::registry::JobRegistry;
use crate::config::Config;
use crate::errors::CodegenError;
use crate::gitops::GitCli;
use crate::hub::{EventHub, EventKind, SqliteEventLog};
use crate::store::DbHandle;

/// Receives the final job after each run. Cancelled runs are not reported.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn job_completed(&self, job: &Job, requirement: &Requirement);
    async fn job_failed(&self, job: &Job, requirement: &Requirement);
}

/// Reports run outcomes to the log.
pub struct TracingNotifier;

#[async_trait]
impl JobNotifier for TracingNotifier {
    async fn job_completed(&self, job: &Job, requirement: &Requirement) {
        info!(
            job_id = job.id,
            requirement_id = requirement.id,
            title = %requirement.title,
            files_changed = job.diff_stat.files_changed,
            additions = job.diff_stat.additions,
            deletions = job.diff_stat.deletions,
            "Code generation completed"
        );
    }

    async fn job_failed(&self, job: &Job, requirement: &Requirement) {
        warn!(
            job_id = job.id,
            requirement_id = requirement.id,
            title = %requirement.title,
            error = job.error_message.as_deref().unwrap_or_default(),
            "Code generation failed"
        );
    }
}

/// One page of a requirement's jobs, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

pub struct CodegenService {
    deps: ExecutorDeps,
    pool: WorkerPool,
    registry: Arc<JobRegistry>,
    notifier: Arc<dyn JobNotifier>,
}

impl CodegenService {
    /// Must be called inside a tokio runtime; starts the worker pool.
    pub fn new(deps: ExecutorDeps, notifier: Arc<dyn JobNotifier>) -> Self {
        let codegen = &deps.config.codegen;
        let pool = WorkerPool::new(codegen.max_workers, codegen.queue_capacity);
        Self {
            deps,
            pool,
            registry: Arc::new(JobRegistry::new()),
            notifier,
        }
    }

    /// Wire the production collaborators: the git CLI, the tokio process
    /// launcher, HTTP document fetching and a SQLite-backed event hub.
    pub fn from_config(config: Arc<Config>, db: DbHandle) -> anyhow::Result<Self> {
        let codegen = &config.codegen;
        let vcs = GitCli::new(codegen.use_local_git, codegen.git_domain_mapping.clone());
        let docs = HttpDocumentSource::new().context("Failed to set up document fetching")?;
        let hub = EventHub::new(Arc::new(SqliteEventLog::new(db.clone())));
        let deps = ExecutorDeps {
            db,
            hub: Arc::new(hub),
            vcs: Arc::new(vcs),
            launcher: Arc::new(TokioLauncher),
            docs: Some(Arc::new(docs)),
            config,
        };
        Ok(Self::new(deps, Arc::new(TracingNotifier)))
    }

    pub fn hub(&self) -> Arc<EventHub> {
        self.deps.hub.clone()
    }

    pub fn db(&self) -> &DbHandle {
        &self.deps.db
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Create a job and queue it. Waits while the queue is full.
    pub async fn trigger(&self, req: TriggerRequest) -> Result<TriggerResponse, CodegenError> {
        validate(&req.requirement, &req.repository)?;

        let requirement_id = req.requirement.id;
        let new = NewJob {
            requirement_id,
            repo_url: req.repository.url.clone(),
            source_branch: source_branch(req.source_branch.as_deref(), &req.repository),
            target_branch: target_branch_for(requirement_id),
            extra_context: req.extra_context.clone().filter(|c| !c.trim().is_empty()),
        };
        let (job, previous) = self
            .deps
            .db
            .call(move |db| {
                let previous = db.get_requirement_status(requirement_id)?;
                let job = db.create_job(&new)?;
                db.set_requirement_status(requirement_id, RequirementStatus::Generating)?;
                Ok((job, previous))
            })
            .await
            .map_err(CodegenError::Database)?;

        let rollback_status = match previous {
            Some(status) if status != RequirementStatus::Generating => status,
            _ => RequirementStatus::Draft,
        };
        let job_id = job.id;
        let requirement = req.requirement.clone();
        let executor = Arc::new(JobExecutor::new(
            self.deps.clone(),
            JobContext {
                job: job.clone(),
                requirement: req.requirement,
                repository: req.repository,
                settings: req.settings,
                rollback_status,
            },
        ));
        let registration = self.registry.register(executor.clone());

        let db = self.deps.db.clone();
        let notifier = self.notifier.clone();
        let task = async move {
            let outcome = executor.run().await;
            drop(registration);
            notify(&db, notifier.as_ref(), job_id, &requirement, &outcome).await;
        };

        match self.pool.submit(task).await {
            Ok(queue_position) => {
                info!(job_id, requirement_id, queue_position, "Job queued");
                Ok(TriggerResponse {
                    job,
                    queue_position,
                })
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to queue job");
                let reason = e.to_string();
                let result = self
                    .deps
                    .db
                    .call(move |db| {
                        db.fail_job(job_id, &reason, None, 0.0)?;
                        db.set_requirement_status(requirement_id, rollback_status)
                    })
                    .await;
                if let Err(db_err) = result {
                    warn!(job_id, error = %db_err, "Failed to record rejected job");
                }
                Err(e.into())
            }
        }
    }

    /// Cancel a job. A job with a live executor is stopped through it; a
    /// `pending` job without one is marked `cancelled` directly.
    pub async fn cancel(&self, job_id: i64) -> Result<(), CodegenError> {
        if let Some(executor) = self.registry.get(job_id) {
            return executor.cancel().await;
        }

        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(CodegenError::AlreadyFinished { id: job_id });
        }

        let requirement_id = job.requirement_id;
        let cancelled = self
            .deps
            .db
            .call(move |db| {
                let cancelled = db.cancel_job(job_id)?;
                if cancelled
                    && db.get_requirement_status(requirement_id)?
                        == Some(RequirementStatus::Generating)
                {
                    db.set_requirement_status(requirement_id, RequirementStatus::Draft)?;
                }
                Ok(cancelled)
            })
            .await
            .map_err(CodegenError::Database)?;
        if !cancelled {
            return Err(CodegenError::AlreadyFinished { id: job_id });
        }

        info!(job_id, "Cancelled orphaned pending job");
        let hub = &self.deps.hub;
        hub.broadcast(
            job_id,
            EventKind::Done,
            json!({"task_id": job_id, "status": JobStatus::Cancelled}),
        )
        .await?;
        hub.set_expire(job_id, self.deps.config.codegen.retention())
            .await?;
        Ok(())
    }

    /// Record a change made outside the pipeline as a `completed` job. The
    /// diff is computed in the background; if that fails it stays empty.
    pub async fn manual_submit(&self, req: ManualSubmitRequest) -> Result<Job, CodegenError> {
        validate(&req.requirement, &req.repository)?;

        let requirement_id = req.requirement.id;
        let new = NewJob {
            requirement_id,
            repo_url: req.repository.url.clone(),
            source_branch: source_branch(req.source_branch.as_deref(), &req.repository),
            target_branch: target_branch_for(requirement_id),
            extra_context: None,
        };
        let commit_sha = extract_commit_sha(&req.commit_url);
        let prompt = match req.commit_message.trim() {
            "" => "Manual submission".to_string(),
            message => format!("Manual submission\n\n{}", message),
        };
        let job = self
            .deps
            .db
            .call(move |db| {
                let job = db.create_completed_job(&new, &prompt, commit_sha.as_deref())?;
                db.set_requirement_status(requirement_id, RequirementStatus::Generated)?;
                Ok(job)
            })
            .await
            .map_err(CodegenError::Database)?;
        info!(job_id = job.id, requirement_id, "Manual submission recorded");

        match credentials::resolve_token(
            req.settings.git_token.as_deref(),
            req.repository.encrypted_token.as_deref(),
            self.deps.config.encrypt.aes_key.as_deref(),
        ) {
            Ok(token) => {
                let deps = self.deps.clone();
                let (job, url) = (job.clone(), req.repository.url);
                tokio::spawn(async move { compute_manual_diff(&deps, &job, &url, &token).await });
            }
            Err(e) => warn!(job_id = job.id, error = %e, "Skipping diff for manual submission"),
        }
        Ok(job)
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Job, CodegenError> {
        self.deps
            .db
            .call(move |db| db.get_job(job_id))
            .await
            .map_err(CodegenError::Database)?
            .ok_or(CodegenError::JobNotFound { id: job_id })
    }

    /// Page numbers start at 1.
    pub async fn list_jobs(
        &self,
        requirement_id: i64,
        page: i64,
        page_size: i64,
    ) -> Result<JobPage, CodegenError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let offset = (page - 1) * page_size;
        let (jobs, total) = self
            .deps
            .db
            .call(move |db| db.list_jobs_for_requirement(requirement_id, offset, page_size))
            .await
            .map_err(CodegenError::Database)?;
        Ok(JobPage {
            jobs,
            total,
            page,
            page_size,
        })
    }

    /// Cancel every live job, then stop the pool.
    pub async fn shutdown(&self) {
        for job_id in self.registry.job_ids() {
            if let Some(executor) = self.registry.get(job_id)
                && let Err(e) = executor.cancel().await
            {
                debug!(job_id, error = %e, "Job ended before shutdown cancel");
            }
        }
        self.pool.shutdown().await;
    }
}

fn validate(requirement: &Requirement, repository: &Repository) -> Result<(), CodegenError> {
    if repository.url.trim().is_empty() {
        return Err(CodegenError::BadRequest(
            "repository url is required".into(),
        ));
    }
    if requirement.title.trim().is_empty() {
        return Err(CodegenError::BadRequest(
            "requirement title is required".into(),
        ));
    }
    Ok(())
}

fn source_branch(requested: Option<&str>, repository: &Repository) -> String {
    requested
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(&repository.default_branch)
        .to_string()
}

/// Commit SHA from a web commit URL such as `.../-/commit/<sha>`. A URL
/// without a `/commit/` segment is taken to be the SHA itself.
pub fn extract_commit_sha(commit_url: &str) -> Option<String> {
    let url = commit_url.trim();
    let sha = match url.rfind("/commit/") {
        Some(pos) => &url[pos + "/commit/".len()..],
        None => url,
    };
    let sha = sha.trim_matches('/');
    (!sha.is_empty()).then(|| sha.to_string())
}

async fn notify(
    db: &DbHandle,
    notifier: &dyn JobNotifier,
    job_id: i64,
    requirement: &Requirement,
    outcome: &JobOutcome,
) {
    if *outcome == JobOutcome::Cancelled {
        debug!(job_id, "Job cancelled; no notification");
        return;
    }
    let job = match db.call(move |db| db.get_job(job_id)).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(job_id, "Finished job vanished before notification");
            return;
        }
        Err(e) => {
            warn!(job_id, error = %e, "Failed to load job for notification");
            return;
        }
    };
    match job.status {
        JobStatus::Completed => notifier.job_completed(&job, requirement).await,
        JobStatus::Failed => notifier.job_failed(&job, requirement).await,
        _ => {}
    }
}

async fn compute_manual_diff(deps: &ExecutorDeps, job: &Job, repo_url: &str, token: &str) {
    let workspace = Workspace::new(
        deps.config
            .codegen
            .work_dir
            .join("manual")
            .join(job.id.to_string()),
    );
    if let Err(e) = workspace.prepare().await {
        warn!(job_id = job.id, error = %e, "Failed to prepare manual diff workspace");
        return;
    }
    let dir = workspace.path();
    let vcs = deps.vcs.as_ref();
    if let Err(e) = vcs
        .clone_branch(repo_url, token, &job.source_branch, dir)
        .await
    {
        debug!(job_id = job.id, error = %e, "Manual diff: clone failed");
        return;
    }
    if let Err(e) = vcs
        .fetch_and_checkout(dir, repo_url, token, &job.target_branch)
        .await
    {
        debug!(job_id = job.id, error = %e, "Manual diff: target branch unavailable");
        return;
    }

    let diff =
        executor::collect_diff(vcs, dir, &job.source_branch, &job.target_branch, job.id).await;
    let job_id = job.id;
    let files_changed = diff.files_changed;
    match deps
        .db
        .call(move |db| db.update_diff_stat(job_id, &diff))
        .await
    {
        Ok(()) => info!(job_id, files_changed, "Manual submission diff recorded"),
        Err(e) => warn!(job_id, error = %e, "Failed to store manual submission diff"),
    }
}
