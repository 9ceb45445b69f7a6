//! Working-tree change collection for notifications.
//!
//! Diff against HEAD plus untracked files, with `git status --porcelain` as
//! the fallback for repositories where the diff fails (fresh repo with no
//! HEAD, detached worktree states). Any git trouble yields an empty list —
//! a notification without file changes beats no notification.

use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::channel::{GitChange, GitChangeStatus};
use crate::exec::run_with_timeout;

const GIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn collect_git_changes(cwd: &str) -> Vec<GitChange> {
    if cwd.is_empty() {
        return Vec::new();
    }

    match run_git(cwd, &["diff", "--name-status", "HEAD"]) {
        Some(diff) => {
            let mut changes = parse_name_status(&diff);
            if let Some(untracked) = run_git(cwd, &["ls-files", "--others", "--exclude-standard"]) {
                for file in untracked.lines().filter(|l| !l.is_empty()) {
                    changes.push(GitChange {
                        file: file.to_string(),
                        status: GitChangeStatus::Added,
                    });
                }
            }
            changes
        }
        None => match run_git(cwd, &["status", "--porcelain"]) {
            Some(porcelain) => parse_porcelain(&porcelain),
            None => Vec::new(),
        },
    }
}

fn run_git(cwd: &str, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(cwd);
    match run_with_timeout(cmd, GIT_TIMEOUT) {
        Ok(out) if out.success() => Some(out.stdout),
        Ok(out) => {
            debug!(cwd = cwd, stderr = %out.stderr.trim(), "git call failed");
            None
        }
        Err(e) => {
            debug!(cwd = cwd, error = %e, "git unavailable");
            None
        }
    }
}

fn parse_name_status(output: &str) -> Vec<GitChange> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let code = parts.next()?;
            let file = parts.next()?;
            if file.is_empty() {
                return None;
            }
            let status = if code.starts_with('A') {
                GitChangeStatus::Added
            } else if code.starts_with('D') {
                GitChangeStatus::Deleted
            } else if code.starts_with('R') {
                GitChangeStatus::Renamed
            } else {
                GitChangeStatus::Modified
            };
            Some(GitChange {
                file: file.to_string(),
                status,
            })
        })
        .collect()
}

fn parse_porcelain(output: &str) -> Vec<GitChange> {
    output
        .lines()
        .filter_map(|line| {
            if line.len() < 4 {
                return None;
            }
            let code = line[..2].trim();
            let file = line[3..].trim();
            if file.is_empty() {
                return None;
            }
            let status = match code {
                "??" | "A" => GitChangeStatus::Added,
                "D" => GitChangeStatus::Deleted,
                "R" => GitChangeStatus::Renamed,
                _ => GitChangeStatus::Modified,
            };
            Some(GitChange {
                file: file.to_string(),
                status,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_status_codes() {
        let changes = parse_name_status("M\tsrc/main.rs\nA\tsrc/new.rs\nD\tgone.rs\nR100\told.rs\n");
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].status, GitChangeStatus::Modified);
        assert_eq!(changes[1].status, GitChangeStatus::Added);
        assert_eq!(changes[2].status, GitChangeStatus::Deleted);
        assert_eq!(changes[3].status, GitChangeStatus::Renamed);
        assert_eq!(changes[3].file, "old.rs");
    }

    #[test]
    fn name_status_skips_malformed_lines() {
        assert!(parse_name_status("no-tab-here\n\n").is_empty());
    }

    #[test]
    fn parses_porcelain_codes() {
        let changes = parse_porcelain("?? new.rs\n M edited.rs\nD  gone.rs\n");
        assert_eq!(changes[0].status, GitChangeStatus::Added);
        assert_eq!(changes[1].status, GitChangeStatus::Modified);
        assert_eq!(changes[2].status, GitChangeStatus::Deleted);
    }

    #[test]
    fn empty_cwd_collects_nothing() {
        assert!(collect_git_changes("").is_empty());
    }

    #[test]
    fn non_repo_directory_collects_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(collect_git_changes(&tmp.path().to_string_lossy()).is_empty());
    }

    #[test]
    fn live_repo_reports_untracked_and_modified() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().to_string();
        let git = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(tmp.path())
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .output()
                .unwrap()
        };
        if !git(&["init"]).status.success() {
            return; // no git in this environment
        }
        std::fs::write(tmp.path().join("a.txt"), "one").unwrap();
        git(&["add", "a.txt"]);
        git(&["commit", "-m", "init"]);
        std::fs::write(tmp.path().join("a.txt"), "two").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "new").unwrap();

        let changes = collect_git_changes(&dir);
        assert!(changes.iter().any(|c| c.file == "a.txt" && c.status == GitChangeStatus::Modified));
        assert!(changes.iter().any(|c| c.file == "b.txt" && c.status == GitChangeStatus::Added));
    }
}
