//! Configuration for reqforge.
//!
//! Settings are layered: built-in defaults, then `reqforge.toml`, then
//! environment variables (a `.env` file in the working directory is loaded
//! first, so it counts as environment).
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [database]
//! path = ".reqforge/reqforge.db"
//!
//! [codegen]
//! max_workers = 2
//! queue_capacity = 100
//! max_turns = 50
//! timeout_minutes = 30
//! work_dir = "/tmp/reqforge"
//! use_local_git = false
//! tool_cmd = "claude"
//!
//! [[codegen.git_domain_mapping]]
//! from = "git.internal.example"
//! to = "git.example.com"
//!
//! [identity]
//! name = "CodeMaster Bot"
//! email = "codemaster@bot.local"
//!
//! [encrypt]
//! aes_key = "0123456789abcdef0123456789abcdef"
//!
//! [logging]
//! format = "json"
//! dir = "/var/log/reqforge"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".reqforge").join("reqforge.db")
}

/// Host rewrite applied to remote URLs before a token push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMapping {
    pub from: String,
    pub to: String,
}

/// Settings for the job pipeline itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodegenSection {
    /// Number of jobs executed concurrently.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Queued jobs beyond this block the submitter.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Wall-clock deadline for a whole job run.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Push with the ambient git credentials instead of an injected token.
    #[serde(default)]
    pub use_local_git: bool,
    #[serde(default = "default_tool_cmd")]
    pub tool_cmd: String,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
    #[serde(default)]
    pub git_domain_mapping: Vec<DomainMapping>,
}

impl Default for CodegenSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            max_turns: default_max_turns(),
            timeout_minutes: default_timeout_minutes(),
            work_dir: default_work_dir(),
            use_local_git: false,
            tool_cmd: default_tool_cmd(),
            allowed_tools: default_allowed_tools(),
            kill_grace_secs: default_kill_grace_secs(),
            retention_hours: default_retention_hours(),
            purge_interval_secs: default_purge_interval_secs(),
            git_domain_mapping: Vec::new(),
        }
    }
}

impl CodegenSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

fn default_max_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    crate::codegen::pool::DEFAULT_QUEUE_CAPACITY
}

fn default_max_turns() -> u32 {
    50
}

fn default_timeout_minutes() -> u64 {
    30
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("reqforge")
}

fn default_tool_cmd() -> String {
    "claude".to_string()
}

fn default_allowed_tools() -> Vec<String> {
    ["Read", "Write", "Edit", "Glob", "Grep", "Bash"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_kill_grace_secs() -> u64 {
    3
}

fn default_retention_hours() -> u64 {
    24
}

fn default_purge_interval_secs() -> u64 {
    300
}

/// Author identity used for generated commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySection {
    #[serde(default = "default_identity_name")]
    pub name: String,
    #[serde(default = "default_identity_email")]
    pub email: String,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            email: default_identity_email(),
        }
    }
}

fn default_identity_name() -> String {
    "CodeMaster Bot".to_string()
}

fn default_identity_email() -> String {
    "codemaster@bot.local".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptSection {
    /// AES-256 key used to decrypt stored repository tokens.
    #[serde(default)]
    pub aes_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Root of `reqforge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub codegen: CodegenSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub encrypt: EncryptSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse reqforge.toml")
    }

    /// Load the file if it exists, then apply environment overrides.
    pub fn load_layered(path: &Path) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();

        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("REQFORGE_AES_KEY") {
            self.encrypt.aes_key = Some(key);
        }
        if let Some(port) = lookup("REQFORGE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid REQFORGE_PORT: {}", port))?;
        }
        if let Some(path) = lookup("REQFORGE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("REQFORGE_WORK_DIR") {
            self.codegen.work_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = lookup("CLAUDE_CMD") {
            self.codegen.tool_cmd = cmd;
        }
        if let Some(workers) = lookup("REQFORGE_MAX_WORKERS") {
            self.codegen.max_workers = workers
                .parse()
                .with_context(|| format!("Invalid REQFORGE_MAX_WORKERS: {}", workers))?;
        }
        Ok(())
    }

    /// Return human-readable problems; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.codegen.max_workers == 0 {
            errors.push("codegen.max_workers must be at least 1".to_string());
        }
        if self.codegen.queue_capacity == 0 {
            errors.push("codegen.queue_capacity must be at least 1".to_string());
        }
        if self.codegen.timeout_minutes == 0 {
            errors.push("codegen.timeout_minutes must be at least 1".to_string());
        }
        if self.codegen.tool_cmd.trim().is_empty() {
            errors.push("codegen.tool_cmd must not be empty".to_string());
        }
        if let Some(key) = &self.encrypt.aes_key
            && key.len() != 32
        {
            errors.push(format!(
                "encrypt.aes_key must be 32 bytes, got {}",
                key.len()
            ));
        }
        errors
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.codegen.max_workers, 2);
        assert_eq!(config.codegen.queue_capacity, 100);
        assert_eq!(config.codegen.kill_grace(), Duration::from_secs(3));
        assert_eq!(config.codegen.retention(), Duration::from_secs(24 * 3600));
        assert_eq!(config.identity.name, "CodeMaster Bot");
        assert_eq!(config.codegen.allowed_tools.join(","), "Read,Write,Edit,Glob,Grep,Bash");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() -> Result<()> {
        let config = Config::parse(
            r#"
[codegen]
max_workers = 4
use_local_git = true

[[codegen.git_domain_mapping]]
from = "internal.example"
to = "public.example"
"#,
        )?;
        assert_eq!(config.codegen.max_workers, 4);
        assert!(config.codegen.use_local_git);
        assert_eq!(config.codegen.max_turns, 50);
        assert_eq!(
            config.codegen.git_domain_mapping,
            vec![DomainMapping {
                from: "internal.example".into(),
                to: "public.example".into()
            }]
        );
        assert_eq!(config.server.host, "127.0.0.1");
        Ok(())
    }

    #[test]
    fn test_env_overrides_file() -> Result<()> {
        let mut config = Config::parse("[server]\nport = 9000\n")?;
        config.apply_env(lookup_from(&[
            ("REQFORGE_PORT", "9100"),
            ("CLAUDE_CMD", "/usr/local/bin/claude"),
            ("REQFORGE_MAX_WORKERS", "8"),
        ]))?;
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.codegen.tool_cmd, "/usr/local/bin/claude");
        assert_eq!(config.codegen.max_workers, 8);
        Ok(())
    }

    #[test]
    fn test_invalid_env_number_is_error() {
        let mut config = Config::default();
        let result = config.apply_env(lookup_from(&[("REQFORGE_PORT", "not-a-port")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_reports_bad_values() {
        let mut config = Config::default();
        config.codegen.max_workers = 0;
        config.encrypt.aes_key = Some("short".into());
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("max_workers"));
        assert!(errors[1].contains("aes_key"));
    }

    #[test]
    fn test_load_layered_missing_file_uses_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::load_layered(&dir.path().join("absent.toml"))?;
        assert_eq!(config.codegen.timeout_minutes, 30);
        Ok(())
    }
}
