//! Per-job phase state machine.
//!
//! A [`JobExecutor`] owns one job from `pending` to a terminal status:
//! prepare workspace, resolve credentials, clone, resume or create the target
//! branch, assemble the prompt, run the tool, commit, diff, push, finalize.
//! The whole run sits under one wall-clock deadline.
//!
//! Every path ends in exactly one terminal event. The run path and
//! [`JobExecutor::cancel`] race on a shared `finished` latch; whoever takes it
//! writes the terminal status and emits `done`, and nothing is published for
//! the job afterwards.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, error, info, warn};

use super::credentials;
use super::models::{
    DiffStat, Job, JobStatus, Repository, Requirement, RequirementStatus, UserSettings,
};
use super::process::{ProcessControl, SpawnedTool, ToolInvocation, ToolLauncher};
use super::prompt::{self, DocumentSource, PromptInput};
use crate::config::Config;
use crate::errors::{CodegenError, GitError};
use crate::gitops::remote::redact_url;
use crate::gitops::{CommitOutcome, VcsDriver};
use crate::hub::{EventHub, EventKind};
use crate::store::DbHandle;
use crate::stream::{self, ToolEvent};

/// Raw stdout lines kept for failure diagnostics.
const TAIL_LINES: usize = 20;
const MAX_STDERR_BYTES: usize = 4000;
const MAX_REASON_LINE_BYTES: usize = 200;

/// Shared collaborators, cloned into every executor.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub db: DbHandle,
    pub hub: Arc<EventHub>,
    pub vcs: Arc<dyn VcsDriver>,
    pub launcher: Arc<dyn ToolLauncher>,
    pub docs: Option<Arc<dyn DocumentSource>>,
    pub config: Arc<Config>,
}

/// What one job works on.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    pub requirement: Requirement,
    pub repository: Repository,
    pub settings: UserSettings,
    /// Requirement status restored when the job fails or is cancelled.
    pub rollback_status: RequirementStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Default, Serialize)]
struct Progress {
    files_read: u32,
    files_written: u32,
    files_edited: u32,
    turns_used: u32,
}

impl Progress {
    fn record(&mut self, tool: &str) {
        self.turns_used += 1;
        match tool {
            "Write" => self.files_written += 1,
            "Read" | "Glob" | "Grep" => self.files_read += 1,
            "Edit" => self.files_edited += 1,
            _ => {}
        }
    }
}

/// State accumulated across phases, readable after a timeout drops the run.
#[derive(Debug, Default)]
struct RunState {
    cost_usd: f64,
    committed: bool,
    commit_sha: Option<String>,
}

enum PhaseEnd {
    Completed(DiffStat),
    Cancelled,
}

enum ToolEnd {
    Finished,
    Cancelled,
}

/// Working directory removed on drop, whichever way the run ends.
pub(crate) struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Clear anything left by an earlier run and make sure the parent exists.
    pub(crate) async fn prepare(&self) -> std::io::Result<()> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.path).await?;
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_dir_all(&self.path)
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove workspace");
        }
    }
}

pub struct JobExecutor {
    deps: ExecutorDeps,
    ctx: JobContext,
    deadline: Duration,
    cancelled: AtomicBool,
    finished: tokio::sync::Mutex<bool>,
    process: Mutex<Option<Arc<dyn ProcessControl>>>,
}

impl JobExecutor {
    pub fn new(deps: ExecutorDeps, ctx: JobContext) -> Self {
        let deadline = deps.config.codegen.timeout();
        Self {
            deps,
            ctx,
            deadline,
            cancelled: AtomicBool::new(false),
            finished: tokio::sync::Mutex::new(false),
            process: Mutex::new(None),
        }
    }

    /// Override the wall-clock deadline for the whole run.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn job_id(&self) -> i64 {
        self.ctx.job.id
    }

    pub fn requirement_id(&self) -> i64 {
        self.ctx.requirement.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// PID of the running tool, if one is running.
    pub fn process_id(&self) -> Option<u32> {
        self.process
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|p| p.id()))
    }

    /// Drive the job to a terminal status.
    pub async fn run(&self) -> JobOutcome {
        let job_id = self.job_id();
        let workspace = Workspace::new(
            self.deps
                .config
                .codegen
                .work_dir
                .join("codegen")
                .join(job_id.to_string()),
        );
        let mut state = RunState::default();

        info!(job_id, "Job started");
        let result =
            tokio::time::timeout(self.deadline, self.run_phases(&workspace, &mut state)).await;

        let outcome = match result {
            Ok(Ok(PhaseEnd::Completed(diff))) => self.complete(&state, diff).await,
            Ok(Ok(PhaseEnd::Cancelled)) => JobOutcome::Cancelled,
            Ok(Err(reason)) => self.fail(&reason, &state).await,
            Err(_) => {
                if let Some(control) = self.take_process() {
                    control.force_kill();
                }
                let reason = format!(
                    "timed out after {} minutes",
                    self.deadline.as_secs().div_ceil(60)
                );
                self.log_event("error", "run", &reason, None).await;
                self.fail(&reason, &state).await
            }
        };
        drop(workspace);
        info!(job_id, outcome = ?outcome, "Job finished");
        outcome
    }

    /// Stop the job. Interrupts the tool if it is running, force-kills it
    /// after the grace period, and marks the job `cancelled`. Safe before the
    /// tool has started.
    pub async fn cancel(&self) -> Result<(), CodegenError> {
        let job_id = self.job_id();
        self.cancelled.store(true, Ordering::SeqCst);

        let control = self
            .process
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().cloned());
        if let Some(control) = control {
            self.stop_process(control);
        }

        let mut finished = self.finished.lock().await;
        if *finished {
            return Err(CodegenError::AlreadyFinished { id: job_id });
        }
        *finished = true;

        info!(job_id, "Cancelling job");
        let db_result = self.deps.db.call(move |db| db.cancel_job(job_id)).await;
        if let Err(e) = db_result {
            error!(job_id, error = %e, "Failed to persist cancellation");
        }
        self.rollback_requirement().await;
        self.publish(
            EventKind::Done,
            json!({"task_id": job_id, "status": JobStatus::Cancelled}),
        )
        .await;
        self.expire().await;
        Ok(())
    }

    async fn run_phases(&self, workspace: &Workspace, state: &mut RunState) -> Result<PhaseEnd, String> {
        let job = &self.ctx.job;
        let repo_url = &self.ctx.repository.url;
        let dir = workspace.path.as_path();

        if self.is_cancelled() {
            return Ok(PhaseEnd::Cancelled);
        }
        self.set_status(JobStatus::Cloning, "Cloning repository").await;

        workspace.prepare().await.map_err(|e| {
            error!(job_id = job.id, error = %e, "Workspace allocation failed");
            format!("workspace allocation failed: {}", e)
        })?;

        let token = credentials::resolve_token(
            self.ctx.settings.git_token.as_deref(),
            self.ctx.repository.encrypted_token.as_deref(),
            self.deps.config.encrypt.aes_key.as_deref(),
        )
        .map_err(|e| format!("credential resolution failed: {}", e))?;

        self.log_event(
            "info",
            "clone",
            "Cloning repository",
            Some(json!({
                "git_url": redact_url(repo_url),
                "branch": job.source_branch,
                "work_dir": dir.display().to_string(),
            })),
        )
        .await;
        self.deps
            .vcs
            .clone_branch(repo_url, &token, &job.source_branch, dir)
            .await
            .map_err(|e| self.git_failure("clone", e))?;
        self.log_event("info", "clone", "Repository cloned", None).await;

        let identity = &self.deps.config.identity;
        self.deps
            .vcs
            .configure_identity(dir, &identity.name, &identity.email)
            .await
            .map_err(|e| self.git_failure("identity", e))?;

        if self.is_cancelled() {
            return Ok(PhaseEnd::Cancelled);
        }
        self.checkout_target(dir, &token).await?;

        let (doc_content, fetched) =
            prompt::gather_docs(self.deps.docs.as_deref(), &self.ctx.requirement).await;
        if fetched > 0 {
            self.log_event(
                "info",
                "docs",
                &format!("Fetched {} linked documents", fetched),
                None,
            )
            .await;
        }
        let prompt = prompt::build_prompt(&PromptInput {
            analysis: self.ctx.repository.analysis.as_ref(),
            requirement: &self.ctx.requirement,
            doc_content: &doc_content,
            extra_context: job.extra_context.as_deref().unwrap_or_default(),
        });
        let job_id = job.id;
        let stored = prompt.clone();
        self.deps
            .db
            .call(move |db| db.save_prompt(job_id, &stored))
            .await
            .map_err(|e| format!("failed to persist prompt: {}", e))?;

        if self.is_cancelled() {
            return Ok(PhaseEnd::Cancelled);
        }
        if let ToolEnd::Cancelled = self.invoke_tool(dir, &prompt, state).await? {
            return Ok(PhaseEnd::Cancelled);
        }

        let message = format!(
            "feat: {}\n\nGenerated by reqforge (job #{})",
            self.ctx.requirement.title, job.id
        );
        match self
            .deps
            .vcs
            .commit_all(dir, &message)
            .await
            .map_err(|e| self.git_failure("commit", e))?
        {
            CommitOutcome::NothingToCommit => {
                self.log_event(
                    "info",
                    "push",
                    "No changes were produced; nothing to commit",
                    None,
                )
                .await;
                return Ok(PhaseEnd::Completed(DiffStat::default()));
            }
            CommitOutcome::Committed { sha } => {
                state.committed = true;
                state.commit_sha = sha;
                self.log_event(
                    "info",
                    "push",
                    "Changes committed",
                    Some(json!({"message": message, "commit_sha": state.commit_sha})),
                )
                .await;
            }
        }

        let diff = collect_diff(
            self.deps.vcs.as_ref(),
            dir,
            &job.source_branch,
            &job.target_branch,
            job.id,
        )
        .await;

        if self.is_cancelled() {
            return Ok(PhaseEnd::Cancelled);
        }
        self.log_event(
            "info",
            "push",
            "Pushing to remote",
            Some(json!({"branch": job.target_branch})),
        )
        .await;
        self.deps
            .vcs
            .push(dir, &job.target_branch, repo_url, &token)
            .await
            .map_err(|e| self.git_failure("push", e))?;
        self.log_event("info", "push", "Push complete", None).await;

        Ok(PhaseEnd::Completed(diff))
    }

    /// Continue on the remote target branch when it exists, otherwise branch
    /// off the source.
    async fn checkout_target(&self, dir: &Path, token: &str) -> Result<(), String> {
        let job = &self.ctx.job;
        let branch = json!({"branch": job.target_branch});
        match self
            .deps
            .vcs
            .fetch_and_checkout(dir, &self.ctx.repository.url, token, &job.target_branch)
            .await
        {
            Ok(()) => {
                self.log_event(
                    "info",
                    "clone",
                    "Resuming from existing remote branch",
                    Some(branch),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                debug!(job_id = job.id, error = %e, "Target branch not fetched");
                self.log_event(
                    "info",
                    "clone",
                    "Remote branch not found; creating it",
                    Some(branch),
                )
                .await;
                self.deps
                    .vcs
                    .create_branch(dir, &job.target_branch)
                    .await
                    .map_err(|e| self.git_failure("branch", e))
            }
        }
    }

    fn tool_invocation(&self, dir: &Path, prompt: &str) -> ToolInvocation {
        let codegen = &self.deps.config.codegen;
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--allowedTools".into(),
            codegen.allowed_tools.join(","),
            "--max-turns".into(),
            codegen.max_turns.to_string(),
        ];
        if let Some(model) = self.ctx.settings.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("--model".into());
            args.push(model.to_string());
        }

        let mut env = std::collections::HashMap::new();
        env.insert(
            "CLAUDE_CODE_MAX_TIMEOUT".to_string(),
            self.deadline.as_millis().to_string(),
        );
        if let Some(key) = self.ctx.settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            env.insert("ANTHROPIC_API_KEY".to_string(), key.to_string());
        }
        if let Some(url) = self.ctx.settings.base_url.as_deref().filter(|u| !u.is_empty()) {
            env.insert("ANTHROPIC_BASE_URL".to_string(), url.to_string());
        }

        ToolInvocation {
            program: codegen.tool_cmd.clone(),
            args,
            cwd: dir.to_path_buf(),
            env,
        }
    }

    async fn invoke_tool(
        &self,
        dir: &Path,
        prompt: &str,
        state: &mut RunState,
    ) -> Result<ToolEnd, String> {
        let job_id = self.job_id();
        let invocation = self.tool_invocation(dir, prompt);
        let tool_name = invocation.program.clone();

        self.set_status(JobStatus::Running, "").await;
        let mut shown_args = invocation.args.clone();
        shown_args[1] = format!("<prompt: {} bytes>", prompt.len());
        self.log_event(
            "info",
            "tool",
            "Launching code-generation tool",
            Some(json!({
                "command": tool_name,
                "args": shown_args,
                "work_dir": dir.display().to_string(),
                "timeout_min": self.deps.config.codegen.timeout_minutes,
            })),
        )
        .await;

        let SpawnedTool {
            stdout,
            mut stderr,
            control,
            exit,
        } = self
            .deps
            .launcher
            .launch(&invocation)
            .await
            .map_err(|e| {
                error!(job_id, tool = %tool_name, error = %e, "Tool failed to start");
                format!("{} failed to start: {}", tool_name, e)
            })?;
        self.attach_process(control.clone());

        let pid = control.id();
        info!(job_id, pid, "Tool started");
        self.emit(
            EventKind::Status,
            json!({
                "status": JobStatus::Running,
                "message": "Code-generation tool started",
                "pid": pid,
            }),
        )
        .await;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let max_turns = self.deps.config.codegen.max_turns;
        let mut lines = BufReader::new(stdout).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
        let mut progress = Progress::default();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(job_id, error = %e, "Failed to read tool output");
                    break;
                }
            };
            if self.is_cancelled() {
                break;
            }
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());

            let Some(event) = stream::parse_line(&line) else {
                continue;
            };
            self.emit(EventKind::Output, event.to_payload()).await;
            match &event {
                ToolEvent::ToolUse { tool, label, .. } => {
                    progress.record(tool);
                    let mut payload = json!(progress);
                    payload["max_turns"] = json!(max_turns);
                    payload["current_action"] = json!(format!("{} {}", tool, label).trim_end());
                    self.emit(EventKind::Progress, payload).await;
                }
                ToolEvent::Result { cost_usd, .. } => state.cost_usd = *cost_usd,
                _ => {}
            }
        }
        drop(lines);

        let exit = exit
            .await
            .unwrap_or_else(|_| Err(std::io::Error::other("tool supervisor went away")));
        self.take_process();
        let stderr = stderr_task.await.unwrap_or_default();

        if self.is_cancelled() {
            info!(job_id, "Tool stopped by cancellation");
            return Ok(ToolEnd::Cancelled);
        }

        let status = match exit {
            Ok(exit) if exit.success() => {
                self.log_event(
                    "info",
                    "tool",
                    "Code-generation tool finished",
                    Some(json!({"cost_usd": state.cost_usd})),
                )
                .await;
                return Ok(ToolEnd::Finished);
            }
            Ok(exit) => exit.to_string(),
            Err(e) => e.to_string(),
        };

        let stderr = stderr.trim();
        let mut detail = json!({"exit": status});
        if !stderr.is_empty() {
            detail["stderr"] = json!(truncate_diagnostic(stderr, MAX_STDERR_BYTES));
        }
        if !tail.is_empty() {
            detail["last_stdout_lines"] = json!(tail);
        }
        self.log_event("error", "tool", "Code-generation tool failed", Some(detail))
            .await;
        Err(failure_reason(&tool_name, &status, stderr))
    }

    async fn complete(&self, state: &RunState, diff: DiffStat) -> JobOutcome {
        let job_id = self.job_id();
        let mut finished = self.finished.lock().await;
        if *finished {
            return JobOutcome::Cancelled;
        }
        *finished = true;

        let sha = state.commit_sha.clone();
        let cost = state.cost_usd;
        let stored = diff.clone();
        let db_result = self
            .deps
            .db
            .call(move |db| db.complete_job(job_id, sha.as_deref(), &stored, cost))
            .await;
        if let Err(e) = db_result {
            error!(job_id, error = %e, "Failed to persist completion");
        }
        self.set_requirement(RequirementStatus::Generated).await;

        self.publish(
            EventKind::Status,
            json!({
                "status": JobStatus::Completed,
                "files_changed": diff.files_changed,
                "additions": diff.additions,
                "deletions": diff.deletions,
            }),
        )
        .await;
        self.publish(
            EventKind::Done,
            json!({"task_id": job_id, "status": JobStatus::Completed}),
        )
        .await;
        self.expire().await;
        JobOutcome::Completed
    }

    /// Single exit for every fatal error.
    async fn fail(&self, reason: &str, state: &RunState) -> JobOutcome {
        let job_id = self.job_id();
        let mut finished = self.finished.lock().await;
        if *finished {
            return JobOutcome::Cancelled;
        }
        *finished = true;
        error!(job_id, reason, "Job failed");

        let sha = state.commit_sha.clone();
        let cost = state.cost_usd;
        let message = reason.to_string();
        let db_result = self
            .deps
            .db
            .call(move |db| db.fail_job(job_id, &message, sha.as_deref(), cost))
            .await;
        if let Err(e) = db_result {
            error!(job_id, error = %e, "Failed to persist failure");
        }
        self.rollback_requirement().await;

        let mut payload = json!({"message": reason});
        if state.committed {
            payload["commit_sha"] = json!(state.commit_sha);
            payload["unpushed"] = json!(true);
        }
        self.publish(EventKind::TaskError, payload).await;
        self.publish(
            EventKind::Done,
            json!({"task_id": job_id, "status": JobStatus::Failed}),
        )
        .await;
        self.expire().await;
        JobOutcome::Failed(reason.to_string())
    }

    fn git_failure(&self, phase: &'static str, err: GitError) -> String {
        warn!(job_id = self.job_id(), phase, error = %err, "Git step failed");
        let reason = match phase {
            "clone" => "clone failed",
            "identity" => "configuring git identity failed",
            "branch" => "creating branch failed",
            "commit" => "git commit failed",
            "push" => "push failed",
            _ => "git failed",
        };
        format!("{}: {}", reason, err)
    }

    fn attach_process(&self, control: Arc<dyn ProcessControl>) {
        if let Ok(mut slot) = self.process.lock() {
            *slot = Some(control.clone());
        }
        // A cancel that ran before the slot was filled could not signal.
        if self.is_cancelled() {
            self.stop_process(control);
        }
    }

    fn take_process(&self) -> Option<Arc<dyn ProcessControl>> {
        self.process.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Interrupt now, force-kill after the grace period if still alive.
    fn stop_process(&self, control: Arc<dyn ProcessControl>) {
        let job_id = self.job_id();
        if let Err(e) = control.interrupt() {
            warn!(job_id, error = %e, "Failed to interrupt tool");
        }
        let grace = self.deps.config.codegen.kill_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !control.has_exited() {
                warn!(job_id, pid = control.id(), "Tool ignored interrupt; killing");
                control.force_kill();
            }
        });
    }

    async fn set_status(&self, status: JobStatus, message: &str) {
        let job_id = self.job_id();
        match self
            .deps
            .db
            .call(move |db| db.update_status(job_id, status))
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(job_id, %status, "Status not updated; job already finished"),
            Err(e) => warn!(job_id, %status, error = %e, "Failed to persist status"),
        }
        if !message.is_empty() {
            self.emit(
                EventKind::Status,
                json!({"status": status, "message": message}),
            )
            .await;
        }
    }

    async fn set_requirement(&self, status: RequirementStatus) {
        let requirement_id = self.requirement_id();
        let result = self
            .deps
            .db
            .call(move |db| db.set_requirement_status(requirement_id, status))
            .await;
        if let Err(e) = result {
            warn!(requirement_id, error = %e, "Failed to update requirement status");
        }
    }

    async fn rollback_requirement(&self) {
        self.set_requirement(self.ctx.rollback_status).await;
    }

    async fn expire(&self) {
        let retention = self.deps.config.codegen.retention();
        if let Err(e) = self.deps.hub.set_expire(self.job_id(), retention).await {
            warn!(job_id = self.job_id(), error = %e, "Failed to set stream expiry");
        }
    }

    async fn log_event(&self, level: &str, phase: &str, message: &str, detail: Option<Value>) {
        let mut data = json!({"level": level, "phase": phase, "message": message});
        if let Some(detail) = detail {
            data["detail"] = detail;
        }
        self.emit(EventKind::Log, data).await;
    }

    /// Publish unless the job already emitted its terminal event.
    async fn emit(&self, kind: EventKind, data: Value) {
        let finished = self.finished.lock().await;
        if !*finished {
            self.publish(kind, data).await;
        }
    }

    async fn publish(&self, kind: EventKind, data: Value) {
        if let Err(e) = self.deps.hub.broadcast(self.job_id(), kind, data).await {
            warn!(job_id = self.job_id(), kind = kind.as_str(), error = %e, "Failed to publish event");
        }
    }
}

/// Diff summary with per-file entries. Errors leave the affected parts
/// empty.
pub(crate) async fn collect_diff(
    vcs: &dyn VcsDriver,
    dir: &Path,
    base: &str,
    feature: &str,
    job_id: i64,
) -> DiffStat {
    let mut stat = vcs.diff_stat(dir, base, feature).await.unwrap_or_else(|e| {
        warn!(job_id, error = %e, "Failed to compute diff stat");
        DiffStat::default()
    });
    let mut files = vcs.diff_files(dir, base, feature).await.unwrap_or_else(|e| {
        warn!(job_id, error = %e, "Failed to list changed files");
        Vec::new()
    });
    for file in &mut files {
        match vcs.diff_content(dir, base, feature, &file.path).await {
            Ok(diff) => file.diff = diff,
            Err(e) => debug!(job_id, path = %file.path, error = %e, "No diff content"),
        }
    }
    stat.files = files;
    stat
}

/// Truncate to `max` bytes on a char boundary, marking the cut.
fn truncate_diagnostic(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}

/// Short failure reason: the first non-empty stderr line, else the exit status.
fn failure_reason(tool: &str, status: &str, stderr: &str) -> String {
    match stderr.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => format!(
            "{} failed: {}",
            tool,
            truncate_diagnostic(line, MAX_REASON_LINE_BYTES)
        ),
        None => format!("{} failed: {}", tool, status),
    }
}
