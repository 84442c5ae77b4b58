//! In-process stand-ins for git and the tool, shared by the codegen and
//! server tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, oneshot};

use super::executor::ExecutorDeps;
use super::models::{DiffFile, DiffStat, Repository, Requirement};
use super::process::{ProcessControl, SpawnedTool, ToolExit, ToolInvocation, ToolLauncher};
use crate::config::Config;
use crate::errors::GitError;
use crate::gitops::{CommitOutcome, VcsDriver};
use crate::hub::EventHub;
use crate::store::DbHandle;

pub const TOOL_USE_WRITE: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Write","input":{"file_path":"a.go","content":"package a"}}]}}"#;
pub const RESULT: &str =
    r#"{"type":"result","subtype":"success","total_cost_usd":0.12,"result":"done"}"#;

#[derive(Default)]
pub struct FakeVcs {
    pub calls: Mutex<Vec<String>>,
    pub fail_clone: bool,
    pub remote_branch_exists: bool,
    pub nothing_to_commit: bool,
    pub fail_push: bool,
}

impl FakeVcs {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == call)
    }
}

fn git_err(op: &'static str, message: &str) -> GitError {
    GitError::CommandFailed {
        op,
        message: message.to_string(),
    }
}

#[async_trait]
impl VcsDriver for FakeVcs {
    async fn clone_branch(&self, _: &str, _: &str, _: &str, dest: &Path) -> Result<(), GitError> {
        self.record("clone");
        if self.fail_clone {
            return Err(git_err("clone", "fatal: repository not found"));
        }
        tokio::fs::create_dir_all(dest).await.unwrap();
        Ok(())
    }

    async fn configure_identity(&self, _: &Path, _: &str, _: &str) -> Result<(), GitError> {
        self.record("identity");
        Ok(())
    }

    async fn fetch_and_checkout(&self, _: &Path, _: &str, _: &str, _: &str) -> Result<(), GitError> {
        self.record("fetch");
        if self.remote_branch_exists {
            Ok(())
        } else {
            Err(git_err("fetch", "couldn't find remote ref"))
        }
    }

    async fn create_branch(&self, _: &Path, _: &str) -> Result<(), GitError> {
        self.record("create_branch");
        Ok(())
    }

    async fn commit_all(&self, _: &Path, _: &str) -> Result<CommitOutcome, GitError> {
        self.record("commit");
        if self.nothing_to_commit {
            Ok(CommitOutcome::NothingToCommit)
        } else {
            Ok(CommitOutcome::Committed {
                sha: Some("abc123".into()),
            })
        }
    }

    async fn diff_stat(&self, _: &Path, _: &str, _: &str) -> Result<DiffStat, GitError> {
        Ok(DiffStat {
            files_changed: 1,
            additions: 3,
            deletions: 0,
            files: Vec::new(),
        })
    }

    async fn diff_files(&self, _: &Path, _: &str, _: &str) -> Result<Vec<DiffFile>, GitError> {
        Ok(vec![DiffFile {
            path: "a.go".into(),
            status: "added".into(),
            additions: 3,
            deletions: 0,
            diff: String::new(),
        }])
    }

    async fn diff_content(&self, _: &Path, _: &str, _: &str, _: &str) -> Result<String, GitError> {
        Ok("+package a".into())
    }

    async fn push(&self, _: &Path, _: &str, _: &str, _: &str) -> Result<(), GitError> {
        self.record("push");
        if self.fail_push {
            Err(git_err("push", "remote rejected"))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct FakeControl {
    pub interrupted: AtomicBool,
    pub killed: AtomicBool,
    exited: AtomicBool,
    stop: Notify,
}

impl ProcessControl for FakeControl {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn interrupt(&self) -> std::io::Result<()> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        Ok(())
    }

    fn force_kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Plays back scripted stdout/stderr. With `hang`, stdout stays open until
/// the process is interrupted or killed.
#[derive(Default)]
pub struct ScriptedLauncher {
    pub stdout: Vec<String>,
    pub stderr: String,
    pub exit_code: i32,
    pub hang: bool,
    pub launches: AtomicUsize,
    pub last_invocation: Mutex<Option<ToolInvocation>>,
    pub started: Notify,
    pub control: Mutex<Option<Arc<FakeControl>>>,
}

impl ScriptedLauncher {
    pub fn control(&self) -> Arc<FakeControl> {
        self.control.lock().unwrap().clone().unwrap()
    }
}

#[async_trait]
impl ToolLauncher for ScriptedLauncher {
    async fn launch(&self, invocation: &ToolInvocation) -> std::io::Result<SpawnedTool> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.last_invocation.lock().unwrap() = Some(invocation.clone());

        let (mut out_w, out_r) = tokio::io::duplex(64 * 1024);
        let (mut err_w, err_r) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let control = Arc::new(FakeControl::default());
        *self.control.lock().unwrap() = Some(control.clone());

        let lines = self.stdout.clone();
        let stderr = self.stderr.clone();
        let (hang, code) = (self.hang, self.exit_code);
        let ctl = control.clone();
        tokio::spawn(async move {
            for line in lines {
                let _ = out_w.write_all(format!("{}\n", line).as_bytes()).await;
            }
            let _ = err_w.write_all(stderr.as_bytes()).await;
            drop(err_w);
            let exit = if hang {
                ctl.stop.notified().await;
                ToolExit {
                    code: None,
                    signal: Some(2),
                }
            } else {
                ToolExit {
                    code: Some(code),
                    signal: None,
                }
            };
            drop(out_w);
            ctl.exited.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(Ok(exit));
        });
        self.started.notify_one();

        Ok(SpawnedTool {
            stdout: Box::pin(out_r),
            stderr: Box::pin(err_r),
            control,
            exit: exit_rx,
        })
    }
}

/// Config rooted at `work_dir` with no kill grace.
pub fn config(work_dir: &Path) -> Arc<Config> {
    let mut config = Config::default();
    config.codegen.work_dir = work_dir.to_path_buf();
    config.codegen.kill_grace_secs = 0;
    Arc::new(config)
}

pub fn deps(
    db: &DbHandle,
    vcs: Arc<FakeVcs>,
    launcher: Arc<ScriptedLauncher>,
    config: Arc<Config>,
) -> ExecutorDeps {
    ExecutorDeps {
        db: db.clone(),
        hub: Arc::new(EventHub::in_memory()),
        vcs,
        launcher,
        docs: None,
        config,
    }
}

pub fn requirement(id: i64) -> Requirement {
    Requirement {
        id,
        title: "Add login".into(),
        description: "Email sign-in".into(),
        doc_content: None,
        docs: Vec::new(),
    }
}

pub fn repository() -> Repository {
    Repository {
        url: "https://git.example.com/app".into(),
        default_branch: "main".into(),
        encrypted_token: None,
        analysis: None,
    }
}
