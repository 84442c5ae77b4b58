use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use crate::gitops::{DiffFile, DiffStat};

/// Lifecycle of a job: `pending → cloning → running → {completed | failed | cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Cloning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    /// Terminal states allow nothing; `completed` is only reachable from `running`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Cloning)
                | (Cloning, Running)
                | (Running, Completed)
                | (Pending | Cloning | Running, Failed | Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "cloning" => Ok(Self::Cloning),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Status of the requirement a job works on. A job moves it to `generating`
/// while running, to `generated` on success, and back to its previous value
/// on failure or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Draft,
    Generating,
    Generated,
}

impl RequirementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Generating => "generating",
            Self::Generated => "generated",
        }
    }
}

impl FromStr for RequirementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "generating" => Ok(Self::Generating),
            "generated" => Ok(Self::Generated),
            _ => Err(format!("Invalid requirement status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub requirement_id: i64,
    pub repo_url: String,
    pub source_branch: String,
    pub target_branch: String,
    pub status: JobStatus,
    pub extra_context: Option<String>,
    pub prompt: Option<String>,
    pub error_message: Option<String>,
    pub commit_sha: Option<String>,
    pub diff_stat: DiffStat,
    pub cost_usd: f64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Fields supplied when a job row is created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub requirement_id: i64,
    pub repo_url: String,
    pub source_branch: String,
    pub target_branch: String,
    pub extra_context: Option<String>,
}

/// A reference document linked from a requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocLink {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Stored document text, used when no linked document can be fetched.
    #[serde(default)]
    pub doc_content: Option<String>,
    #[serde(default)]
    pub docs: Vec<DocLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files_count: u32,
}

/// Prior analysis of the target repository, folded into the prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoAnalysis {
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub directory_structure: Option<String>,
    #[serde(default)]
    pub naming: Option<String>,
    #[serde(default)]
    pub error_handling: Option<String>,
    #[serde(default)]
    pub test_framework: Option<String>,
    #[serde(default)]
    pub modules: Vec<ModuleInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub url: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Access token encrypted with the configured AES key.
    #[serde(default)]
    pub encrypted_token: Option<String>,
    #[serde(default)]
    pub analysis: Option<RepoAnalysis>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Per-requester preferences and credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub git_token: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl fmt::Debug for UserSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSettings")
            .field("git_token", &self.git_token.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub requirement: Requirement,
    pub repository: Repository,
    #[serde(default)]
    pub source_branch: Option<String>,
    #[serde(default)]
    pub extra_context: Option<String>,
    #[serde(default)]
    pub settings: UserSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub job: Job,
    pub queue_position: usize,
}

/// Record of a change made outside the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualSubmitRequest {
    pub requirement: Requirement,
    pub repository: Repository,
    #[serde(default)]
    pub source_branch: Option<String>,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub commit_url: String,
    #[serde(default)]
    pub settings: UserSettings,
}

/// Branch every job for `requirement_id` pushes to.
pub fn target_branch_for(requirement_id: i64) -> String {
    format!("code-master/req-{}", requirement_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Cloning,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Cloning));
        assert!(Cloning.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Cloning.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Cloning));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Cloning, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_job_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn test_user_settings_debug_hides_secrets() {
        let settings = UserSettings {
            git_token: Some("glpat-secret".into()),
            api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("glpat-secret"));
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn test_trigger_request_defaults() {
        let req: TriggerRequest = serde_json::from_value(serde_json::json!({
            "requirement": {"id": 42, "title": "Add login"},
            "repository": {"url": "https://git.example.com/app"}
        }))
        .unwrap();
        assert_eq!(req.repository.default_branch, "main");
        assert!(req.source_branch.is_none());
        assert_eq!(target_branch_for(req.requirement.id), "code-master/req-42");
    }
}
