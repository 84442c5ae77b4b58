use serde::{Deserialize, Serialize};

/// One changed file between two branches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffFile {
    pub path: String,
    /// `added` or `modified`.
    pub status: String,
    pub additions: i64,
    pub deletions: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diff: String,
}

/// Summary of the changes a job produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffStat {
    pub files_changed: i64,
    pub additions: i64,
    pub deletions: i64,
    pub files: Vec<DiffFile>,
}

impl DiffStat {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0 && self.additions == 0 && self.deletions == 0
    }
}

/// Parse the summary line of `git diff --stat`, e.g.
/// ` 3 files changed, 10 insertions(+), 2 deletions(-)`.
/// Output without a summary line yields an all-zero stat.
pub fn parse_stat_summary(output: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for line in output.lines().map(str::trim) {
        if !(line.contains("file") && line.contains("changed")) {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some(first) = parts.first() {
            stat.files_changed = first.parse().unwrap_or(0);
        }
        for (i, part) in parts.iter().enumerate().skip(1) {
            if part.starts_with("insertion") {
                stat.additions = parts[i - 1].parse().unwrap_or(0);
            } else if part.starts_with("deletion") {
                stat.deletions = parts[i - 1].parse().unwrap_or(0);
            }
        }
    }
    stat
}

/// Parse `git diff --numstat` lines: `<added>\t<deleted>\t<path>`.
/// Binary files report `-` for both counts and are recorded as zero.
pub fn parse_numstat(output: &str) -> Vec<DiffFile> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, char::is_whitespace);
            let added = parts.next()?;
            let deleted = parts.next()?;
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }
            let additions: i64 = added.parse().unwrap_or(0);
            let deletions: i64 = deleted.parse().unwrap_or(0);
            let status = if deletions == 0 && additions > 0 {
                "added"
            } else {
                "modified"
            };
            Some(DiffFile {
                path: path.to_string(),
                status: status.to_string(),
                additions,
                deletions,
                diff: String::new(),
            })
        })
        .collect()
}
