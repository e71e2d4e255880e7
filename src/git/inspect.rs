use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::decision::RepoStatus;
use crate::git::runner::GitRunner;

/// Commits scanned when counting per-file churn.
const TOUCH_HISTORY_DEPTH: usize = 50;
/// Hotspot entries reported.
const MOST_TOUCHED_LIMIT: usize = 5;
/// Subject lines reported.
const RECENT_COMMIT_LIMIT: usize = 20;

/// Read-only survey of the workspace repository.
///
/// Every accessor degrades to an empty answer instead of failing; a
/// half-empty picture of the repository is still enough to decide on.
pub struct RepoInspector {
    git: GitRunner,
}

impl RepoInspector {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            git: GitRunner::new(workspace),
        }
    }

    pub async fn survey(&self) -> RepoStatus {
        if !self.is_repo().await {
            debug!(dir = %self.git.working_dir().display(), "not a git repository");
            return RepoStatus::default();
        }

        RepoStatus {
            branch: self.branch().await,
            dirty: self.dirty().await,
            ahead_behind: self.ahead_behind().await,
            recent_commits: self.recent_commits().await,
            most_touched: self.most_touched().await,
            test_file_ratio: self.test_file_ratio().await,
        }
    }

    async fn is_repo(&self) -> bool {
        match self.git.run(&["rev-parse", "--is-inside-work-tree"]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn branch(&self) -> String {
        match self
            .git
            .run_checked(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
        {
            Ok(stdout) => stdout.trim().to_string(),
            Err(e) => {
                debug!(error = %e, "cannot read current branch");
                String::new()
            }
        }
    }

    async fn dirty(&self) -> bool {
        match self.git.run_checked(&["status", "--porcelain"]).await {
            Ok(stdout) => !stdout.trim().is_empty(),
            Err(e) => {
                debug!(error = %e, "cannot read worktree status");
                false
            }
        }
    }

    /// Commits ahead of and behind the upstream branch. None when no
    /// upstream is configured, which is not worth a log line.
    async fn ahead_behind(&self) -> Option<(u32, u32)> {
        let stdout = self
            .git
            .run_checked(&["rev-list", "--left-right", "--count", "@{upstream}...HEAD"])
            .await
            .ok()?;
        parse_ahead_behind(&stdout)
    }

    /// Recent commit subjects, newest first. An unborn branch has none.
    async fn recent_commits(&self) -> Vec<String> {
        let limit = format!("-{}", RECENT_COMMIT_LIMIT);
        match self.git.run(&["log", &limit, "--pretty=format:%s"]).await {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Files ranked by how many recent commits touched them.
    async fn most_touched(&self) -> Vec<(String, u32)> {
        let limit = format!("-{}", TOUCH_HISTORY_DEPTH);
        match self
            .git
            .run(&["log", &limit, "--name-only", "--pretty=format:"])
            .await
        {
            Ok(output) if output.status.success() => {
                count_touches(&String::from_utf8_lossy(&output.stdout))
            }
            _ => Vec::new(),
        }
    }

    /// Share of tracked files that look like tests. None in an empty
    /// repository.
    async fn test_file_ratio(&self) -> Option<f64> {
        let stdout = match self.git.run_checked(&["ls-files"]).await {
            Ok(stdout) => stdout,
            Err(e) => {
                debug!(error = %e, "cannot list tracked files");
                return None;
            }
        };
        let files: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        if files.is_empty() {
            return None;
        }
        let tests = files.iter().filter(|f| is_test_path(f)).count();
        Some(tests as f64 / files.len() as f64)
    }
}

/// Parse `rev-list --left-right --count @{upstream}...HEAD` output,
/// which reads `<behind>\t<ahead>`.
fn parse_ahead_behind(output: &str) -> Option<(u32, u32)> {
    let mut parts = output.split_whitespace();
    let behind: u32 = parts.next()?.parse().ok()?;
    let ahead: u32 = parts.next()?.parse().ok()?;
    Some((ahead, behind))
}

/// Count path occurrences in `git log --name-only` output and rank
/// them, highest churn first, ties by path.
fn count_touches(log_output: &str) -> Vec<(String, u32)> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for line in log_output.lines() {
        let line = line.trim();
        if !line.is_empty() {
            *counts.entry(line).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, u32)> = counts
        .into_iter()
        .map(|(path, n)| (path.to_string(), n))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(MOST_TOUCHED_LIMIT);
    ranked
}

/// Language-agnostic test-file heuristic over a repo-relative path.
fn is_test_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    if lower
        .split('/')
        .any(|seg| seg == "tests" || seg == "test" || seg == "__tests__")
    {
        return true;
    }
    let file = lower.rsplit('/').next().unwrap_or(lower.as_str());
    file.starts_with("test_")
        || file.contains("_test.")
        || file.contains(".test.")
        || file.contains(".spec.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_test_path_heuristic() {
        assert!(is_test_path("tests/queue.rs"));
        assert!(is_test_path("src/Test/helpers.py"));
        assert!(is_test_path("web/__tests__/app.jsx"));
        assert!(is_test_path("src/test_parser.py"));
        assert!(is_test_path("src/parser_test.go"));
        assert!(is_test_path("src/app.test.ts"));
        assert!(is_test_path("src/app.spec.ts"));

        assert!(!is_test_path("src/parser.rs"));
        assert!(!is_test_path("src/testing_guide.md"));
        assert!(!is_test_path("contest/entry.rs"));
    }

    #[test]
    fn test_parse_ahead_behind() {
        assert_eq!(parse_ahead_behind("2\t5\n"), Some((5, 2)));
        assert_eq!(parse_ahead_behind("0\t0\n"), Some((0, 0)));
        assert_eq!(parse_ahead_behind(""), None);
        assert_eq!(parse_ahead_behind("nonsense"), None);
    }

    #[test]
    fn test_count_touches_ranks_by_churn() {
        let log = "src/lib.rs\nsrc/queue.rs\n\nsrc/lib.rs\n\nsrc/lib.rs\nsrc/agent.rs\n";
        let ranked = count_touches(log);
        assert_eq!(
            ranked,
            vec![
                (String::from("src/lib.rs"), 3),
                (String::from("src/agent.rs"), 1),
                (String::from("src/queue.rs"), 1),
            ]
        );
    }

    #[test]
    fn test_count_touches_truncates() {
        let log = "a\nb\nc\nd\ne\nf\ng\n";
        assert_eq!(count_touches(log).len(), MOST_TOUCHED_LIMIT);
    }

    async fn git(dir: &Path, args: &[&str]) {
        let status = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    async fn git_available() -> bool {
        tokio::process::Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_survey_outside_a_repository_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let status = RepoInspector::new(dir.path()).survey().await;
        assert!(status.branch.is_empty());
        assert!(!status.dirty);
        assert_eq!(status.ahead_behind, None);
        assert!(status.recent_commits.is_empty());
        assert!(status.most_touched.is_empty());
        assert_eq!(status.test_file_ratio, None);
    }

    #[tokio::test]
    async fn test_survey_reads_a_real_repository() {
        if !git_available().await {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        git(root, &["init", "-q"]).await;
        git(root, &["config", "user.email", "dev@example.com"]).await;
        git(root, &["config", "user.name", "Dev"]).await;
        git(root, &["config", "commit.gpgsign", "false"]).await;

        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("tests")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn answer() -> u32 { 42 }\n").unwrap();
        std::fs::write(root.join("tests/basic.rs"), "#[test]\nfn ok() {}\n").unwrap();
        git(root, &["add", "."]).await;
        git(root, &["commit", "-q", "-m", "initial layout"]).await;

        std::fs::write(root.join("src/lib.rs"), "pub fn answer() -> u32 { 41 }\n").unwrap();
        git(root, &["commit", "-q", "-am", "tune answer"]).await;

        let status = RepoInspector::new(root).survey().await;
        assert!(!status.branch.is_empty());
        assert!(!status.dirty);
        assert_eq!(status.ahead_behind, None, "no upstream configured");
        assert_eq!(status.recent_commits, vec!["tune answer", "initial layout"]);
        assert_eq!(status.most_touched[0], (String::from("src/lib.rs"), 2));
        let ratio = status.test_file_ratio.unwrap();
        assert!((ratio - 0.5).abs() < 1e-9, "ratio was {}", ratio);

        std::fs::write(root.join("scratch.txt"), "notes\n").unwrap();
        let status = RepoInspector::new(root).survey().await;
        assert!(status.dirty);
    }
}
