//! Version-control driver.
//!
//! Every operation shells out to the `git` binary with terminal prompting
//! disabled and credential helpers switched off for authenticated calls, so a
//! missing or bad token fails fast instead of hanging on a prompt. Tokens
//! travel only in the remote URL and are redacted from every error message.

pub mod diff;
pub mod remote;

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::DomainMapping;
use crate::errors::GitError;

pub use diff::{DiffFile, DiffStat, parse_numstat, parse_stat_summary};
pub use remote::{inject_token, redact, rewrite_host};

/// Result of staging and committing a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was staged; no commit was created.
    NothingToCommit,
    /// A commit was created. `sha` is `None` when it could not be read back.
    Committed { sha: Option<String> },
}

/// Operations the job pipeline needs from version control.
#[async_trait]
pub trait VcsDriver: Send + Sync {
    /// Shallow-clone `branch` of `url` into `dest`.
    async fn clone_branch(
        &self,
        url: &str,
        token: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<(), GitError>;

    async fn configure_identity(&self, repo: &Path, name: &str, email: &str)
    -> Result<(), GitError>;

    /// Fetch an existing remote `branch` and check it out locally under the
    /// same name. Fails when the branch does not exist on the remote.
    async fn fetch_and_checkout(
        &self,
        repo: &Path,
        url: &str,
        token: &str,
        branch: &str,
    ) -> Result<(), GitError>;

    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// Stage everything and commit it.
    async fn commit_all(&self, repo: &Path, message: &str) -> Result<CommitOutcome, GitError>;

    async fn diff_stat(&self, repo: &Path, base: &str, feature: &str)
    -> Result<DiffStat, GitError>;

    async fn diff_files(
        &self,
        repo: &Path,
        base: &str,
        feature: &str,
    ) -> Result<Vec<DiffFile>, GitError>;

    async fn diff_content(
        &self,
        repo: &Path,
        base: &str,
        feature: &str,
        path: &str,
    ) -> Result<String, GitError>;

    /// Push the checked-out `branch` to the remote.
    async fn push(&self, repo: &Path, branch: &str, url: &str, token: &str)
    -> Result<(), GitError>;
}

/// `VcsDriver` backed by the `git` command line.
#[derive(Debug, Clone, Default)]
pub struct GitCli {
    /// Push through `origin` with the ambient credentials instead of a token.
    pub use_local_git: bool,
    pub domain_mapping: Vec<DomainMapping>,
}

impl GitCli {
    pub fn new(use_local_git: bool, domain_mapping: Vec<DomainMapping>) -> Self {
        Self {
            use_local_git,
            domain_mapping,
        }
    }

    /// Run git and return stdout. On failure the combined output, redacted
    /// of `secret`, becomes the error message.
    async fn git(
        &self,
        op: &'static str,
        dir: Option<&Path>,
        args: &[&str],
        secret: &str,
    ) -> Result<String, GitError> {
        debug!(op, args = %redact(&args.join(" "), secret), "git");

        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|source| GitError::Spawn { op, source })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            let message = redact(combined.trim(), secret);
            return Err(GitError::CommandFailed {
                op,
                message: if message.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    message
                },
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Best-effort `fetch --unshallow`; shallow clones may be rejected on push.
    async fn unshallow(&self, repo: &Path, remote: &str, secret: &str) {
        let args = ["-c", "credential.helper=", "fetch", "--unshallow", remote];
        if let Err(e) = self.git("fetch --unshallow", Some(repo), &args, secret).await {
            debug!(error = %e, "unshallow skipped");
        }
    }
}

#[async_trait]
impl VcsDriver for GitCli {
    async fn clone_branch(
        &self,
        url: &str,
        token: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<(), GitError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GitError::CommandFailed {
                    op: "clone",
                    message: format!("create {}: {}", parent.display(), e),
                })?;
        }
        let auth_url = inject_token(url, token)?;
        let dest = dest.to_string_lossy();
        let args = [
            "-c",
            "credential.helper=",
            "clone",
            "--depth",
            "1",
            "--branch",
            branch,
            auth_url.as_str(),
            dest.as_ref(),
        ];
        self.git("clone", None, &args, token).await?;
        Ok(())
    }

    async fn configure_identity(
        &self,
        repo: &Path,
        name: &str,
        email: &str,
    ) -> Result<(), GitError> {
        self.git("config user.name", Some(repo), &["config", "user.name", name], "")
            .await?;
        self.git("config user.email", Some(repo), &["config", "user.email", email], "")
            .await?;
        Ok(())
    }

    async fn fetch_and_checkout(
        &self,
        repo: &Path,
        url: &str,
        token: &str,
        branch: &str,
    ) -> Result<(), GitError> {
        let auth_url = inject_token(url, token)?;
        let fetch = [
            "-c",
            "credential.helper=",
            "fetch",
            "--depth",
            "1",
            auth_url.as_str(),
            branch,
        ];
        self.git("fetch", Some(repo), &fetch, token).await?;
        self.git(
            "checkout",
            Some(repo),
            &["checkout", "-b", branch, "FETCH_HEAD"],
            token,
        )
        .await?;
        Ok(())
    }

    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.git("checkout -b", Some(repo), &["checkout", "-b", branch], "")
            .await?;
        Ok(())
    }

    async fn commit_all(&self, repo: &Path, message: &str) -> Result<CommitOutcome, GitError> {
        self.git("add", Some(repo), &["add", "-A"], "").await?;

        // `diff --cached --quiet` exits 0 when the index matches HEAD.
        let status = Command::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| GitError::Spawn {
                op: "diff --cached",
                source,
            })?;
        match status.code() {
            Some(0) => return Ok(CommitOutcome::NothingToCommit),
            Some(1) => {}
            _ => {
                return Err(GitError::CommandFailed {
                    op: "diff --cached",
                    message: format!("exited with {}", status),
                });
            }
        }

        self.git("commit", Some(repo), &["commit", "-m", message], "")
            .await?;

        let sha = match self.git("rev-parse", Some(repo), &["rev-parse", "HEAD"], "").await {
            Ok(out) => Some(out.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) => {
                debug!(error = %e, "commit created but HEAD could not be read");
                None
            }
        };
        Ok(CommitOutcome::Committed { sha })
    }

    async fn diff_stat(&self, repo: &Path, base: &str, feature: &str) -> Result<DiffStat, GitError> {
        let range = format!("{}..{}", base, feature);
        let out = self
            .git("diff --stat", Some(repo), &["diff", "--stat", &range], "")
            .await?;
        Ok(parse_stat_summary(&out))
    }

    async fn diff_files(
        &self,
        repo: &Path,
        base: &str,
        feature: &str,
    ) -> Result<Vec<DiffFile>, GitError> {
        let range = format!("{}..{}", base, feature);
        let out = self
            .git("diff --numstat", Some(repo), &["diff", "--numstat", &range], "")
            .await?;
        Ok(parse_numstat(&out))
    }

    async fn diff_content(
        &self,
        repo: &Path,
        base: &str,
        feature: &str,
        path: &str,
    ) -> Result<String, GitError> {
        let range = format!("{}..{}", base, feature);
        self.git("diff", Some(repo), &["diff", &range, "--", path], "")
            .await
    }

    async fn push(&self, repo: &Path, branch: &str, url: &str, token: &str) -> Result<(), GitError> {
        if self.use_local_git {
            info!(branch, "Pushing via origin with local credentials");
            self.unshallow(repo, "origin", "").await;
            self.git("push", Some(repo), &["push", "-u", "origin", branch], "")
                .await?;
            return Ok(());
        }

        if token.is_empty() {
            return Err(GitError::MissingToken);
        }
        let url = rewrite_host(url, &self.domain_mapping);
        let auth_url = inject_token(&url, token)?;
        info!(branch, remote = %remote::redact_url(&auth_url), "Pushing with token");

        self.unshallow(repo, &auth_url, token).await;
        let refspec = format!("HEAD:refs/heads/{}", branch);
        self.git(
            "push",
            Some(repo),
            &["-c", "credential.helper=", "push", auth_url.as_str(), refspec.as_str()],
            token,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    /// Bare remote with one commit on `main`, returned with its tempdir guard.
    fn seeded_remote() -> (tempfile::TempDir, std::path::PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let remote = root.path().join("remote.git");
        let seed = root.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        run(root.path(), &["init", "--bare", "-b", "main", remote.to_str().unwrap()]);
        run(&seed, &["init", "-b", "main"]);
        run(&seed, &["config", "user.name", "Seed"]);
        run(&seed, &["config", "user.email", "seed@example.com"]);
        std::fs::write(seed.join("README.md"), "hello\n").unwrap();
        run(&seed, &["add", "-A"]);
        run(&seed, &["commit", "-m", "init"]);
        run(&seed, &["push", remote.to_str().unwrap(), "main"]);
        (root, remote)
    }

    #[tokio::test]
    async fn test_clone_commit_diff_push_against_local_remote() -> anyhow::Result<()> {
        if !git_available() {
            return Ok(());
        }
        let (root, remote) = seeded_remote();
        let remote_url = format!("file://{}", remote.display());
        let work = root.path().join("work").join("1");
        let driver = GitCli::new(true, Vec::new());

        driver.clone_branch(&remote_url, "", "main", &work).await?;
        driver
            .configure_identity(&work, "CodeMaster Bot", "codemaster@bot.local")
            .await?;
        assert!(
            driver
                .fetch_and_checkout(&work, &remote_url, "", "feature/req-1")
                .await
                .is_err()
        );
        driver.create_branch(&work, "feature/req-1").await?;

        assert_eq!(
            driver.commit_all(&work, "noop").await?,
            CommitOutcome::NothingToCommit
        );

        std::fs::write(work.join("a.go"), "package a\n\nfunc A() {}\n")?;
        let outcome = driver.commit_all(&work, "feat: add a").await?;
        assert!(matches!(outcome, CommitOutcome::Committed { sha: Some(_) }));

        let stat = driver.diff_stat(&work, "main", "feature/req-1").await?;
        assert_eq!(stat.files_changed, 1);
        assert_eq!(stat.additions, 3);

        let files = driver.diff_files(&work, "main", "feature/req-1").await?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "a.go");
        assert_eq!(files[0].status, "added");

        let content = driver
            .diff_content(&work, "main", "feature/req-1", "a.go")
            .await?;
        assert!(content.contains("+func A() {}"));

        driver.push(&work, "feature/req-1", &remote_url, "").await?;

        let again = root.path().join("work").join("2");
        driver.clone_branch(&remote_url, "", "main", &again).await?;
        driver
            .fetch_and_checkout(&again, &remote_url, "", "feature/req-1")
            .await?;
        assert!(again.join("a.go").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_clone_failure_is_redacted() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let driver = GitCli::default();
        let err = driver
            .clone_branch(
                "http://127.0.0.1:9/missing/repo",
                "tok3n-value",
                "main",
                &dir.path().join("w"),
            )
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("git clone failed"));
        assert!(!message.contains("tok3n-value"));
    }

    #[tokio::test]
    async fn test_token_push_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let driver = GitCli::default();
        let err = driver
            .push(dir.path(), "b", "https://example.com/r.git", "")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::MissingToken));
    }
}
