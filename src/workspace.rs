//! Per-issue git workspaces.
//!
//! Each issue gets a dedicated worktree at
//! `workspaces/<host>/<owner>/<repo>/<issue>/` on branch `<N>-<slug>`,
//! carved out of a shared primary clone at
//! `workspaces/<host>/<owner>/<repo>/repo`. Operations on one issue are
//! serialized by a per-issue lock; ref and object-database mutations are
//! serialized globally to avoid index contention between worktrees.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::WorkspaceError;
use crate::ticket::IssueRef;

const SLUG_MAX_LEN: usize = 32;

/// Convert a title to a branch-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Branch name for an issue: `<number>-<slug>`.
pub fn branch_name(number: u64, title: &str) -> String {
    let slug = slugify(title, SLUG_MAX_LEN);
    if slug.is_empty() {
        number.to_string()
    } else {
        format!("{number}-{slug}")
    }
}

pub struct WorkspaceManager {
    root: PathBuf,
    /// Serializes all ref/object-database mutations across issues.
    git_lock: Mutex<()>,
    /// Serializes filesystem operations per issue.
    issue_locks: std::sync::Mutex<HashMap<IssueRef, Arc<Mutex<()>>>>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            git_lock: Mutex::new(()),
            issue_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn repo_dir(&self, key: &IssueRef) -> PathBuf {
        self.root
            .join(&key.host)
            .join(&key.owner)
            .join(&key.repo)
            .join("repo")
    }

    /// Canonical worktree path for an issue.
    pub fn worktree_path(&self, key: &IssueRef) -> PathBuf {
        self.root
            .join(&key.host)
            .join(&key.owner)
            .join(&key.repo)
            .join(key.number.to_string())
    }

    pub fn worktree_exists(&self, key: &IssueRef) -> bool {
        self.worktree_path(key).exists()
    }

    fn issue_lock(&self, key: &IssueRef) -> Arc<Mutex<()>> {
        let mut locks = self.issue_locks.lock().expect("issue lock map poisoned");
        locks.entry(key.clone()).or_default().clone()
    }

    /// Tracker-supplied name components become path segments; anything
    /// that could climb out of the workspaces root is rejected.
    fn validate_components(&self, key: &IssueRef) -> Result<(), WorkspaceError> {
        let safe = [&key.host, &key.owner, &key.repo].into_iter().all(|part| {
            let part = part.as_str();
            !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\', '\0'])
        });
        if safe {
            Ok(())
        } else {
            Err(WorkspaceError::PathEscape {
                path: self.worktree_path(key),
            })
        }
    }

    /// Ensure a worktree exists for the issue and return its path.
    ///
    /// Clones the repository on first use, reuses an existing local branch
    /// named `<N>-<slug>`, and otherwise branches from `base_branch` (the
    /// remote default branch when `None`). A no-op when the worktree is
    /// already on disk.
    pub async fn ensure_for_issue(
        &self,
        key: &IssueRef,
        title: &str,
        clone_url: &str,
        base_branch: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError> {
        self.validate_components(key)?;
        let lock = self.issue_lock(key);
        let _guard = lock.lock().await;

        let worktree = self.worktree_path(key);
        if worktree.exists() {
            debug!(issue = %key, "worktree already prepared");
            return Ok(worktree);
        }

        let repo = self.repo_dir(key);
        let _git = self.git_lock.lock().await;

        if !repo.exists() {
            let parent = repo.parent().expect("repo dir has a parent");
            std::fs::create_dir_all(parent).map_err(|source| WorkspaceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
            info!(issue = %key, url = clone_url, "cloning repository");
            run_git(parent, &["clone", clone_url, "repo"]).await?;
        } else {
            // Refresh refs so the worktree branches from the latest base.
            run_git(&repo, &["fetch", "origin", "--prune"]).await?;
        }

        let base = match base_branch {
            Some(base) => base.to_string(),
            None => default_branch(&repo).await?,
        };

        let branch = branch_name(key.number, title);
        let worktree_str = worktree.to_string_lossy();
        if branch_exists(&repo, &branch).await? {
            debug!(issue = %key, branch, "reusing existing branch");
            run_git(&repo, &["worktree", "add", &worktree_str, &branch]).await?;
        } else {
            let start = format!("origin/{base}");
            run_git(
                &repo,
                &["worktree", "add", "-b", &branch, &worktree_str, &start],
            )
            .await?;
        }
        info!(issue = %key, branch, path = %worktree.display(), "worktree created");
        Ok(worktree)
    }

    /// Remove the worktree and, when merged into `base` or when forced
    /// (reset), the local branch.
    pub async fn cleanup_for_issue(
        &self,
        key: &IssueRef,
        title: &str,
        force: bool,
    ) -> Result<(), WorkspaceError> {
        self.validate_components(key)?;
        let lock = self.issue_lock(key);
        let _guard = lock.lock().await;

        let worktree = self.worktree_path(key);
        let repo = self.repo_dir(key);
        let _git = self.git_lock.lock().await;

        if worktree.exists() {
            if repo.exists() {
                run_git(
                    &repo,
                    &["worktree", "remove", "--force", &worktree.to_string_lossy()],
                )
                .await?;
            } else {
                // Orphaned worktree without its primary clone; plain
                // directory removal is all that is left to do.
                std::fs::remove_dir_all(&worktree).map_err(|source| WorkspaceError::Io {
                    path: worktree.clone(),
                    source,
                })?;
            }
            info!(issue = %key, path = %worktree.display(), "worktree removed");
        }

        let branch = branch_name(key.number, title);
        if repo.exists() && branch_exists(&repo, &branch).await? {
            let delete_flag = if force { "-D" } else { "-d" };
            match run_git(&repo, &["branch", delete_flag, &branch]).await {
                Ok(_) => info!(issue = %key, branch, "branch deleted"),
                // An unmerged branch survives a non-forced cleanup.
                Err(WorkspaceError::Git { stderr, .. }) if !force => {
                    debug!(issue = %key, branch, stderr, "branch kept (not fully merged)");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Remote default branch of the clone, falling back to `main`.
async fn default_branch(repo: &Path) -> Result<String, WorkspaceError> {
    match run_git(repo, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"]).await {
        Ok(output) => Ok(output
            .trim()
            .strip_prefix("origin/")
            .unwrap_or(output.trim())
            .to_string()),
        Err(_) => Ok("main".to_string()),
    }
}

async fn branch_exists(repo: &Path, branch: &str) -> Result<bool, WorkspaceError> {
    let refname = format!("refs/heads/{branch}");
    Ok(run_git(repo, &["rev-parse", "--verify", "--quiet", &refname])
        .await
        .is_ok())
}

/// Run a git subcommand, returning stdout or the captured stderr on failure.
async fn run_git(cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| WorkspaceError::Io {
            path: cwd.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(WorkspaceError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("Fix: the thing!", 32), "fix-the-thing");
        assert_eq!(slugify("  multiple   spaces  ", 32), "multiple-spaces");
        assert_eq!(slugify("CamelCase Title", 32), "camelcase-title");
        assert_eq!(slugify("", 32), "");
    }

    #[test]
    fn slugify_respects_max_len_without_trailing_dash() {
        let slug = slugify("a very long issue title that keeps going and going", 32);
        assert!(slug.len() <= 32);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn branch_name_is_number_prefixed() {
        assert_eq!(branch_name(42, "Add login page"), "42-add-login-page");
        assert_eq!(branch_name(7, "!!!"), "7");
    }

    #[test]
    fn worktree_path_is_per_issue() {
        let mgr = WorkspaceManager::new(PathBuf::from("/tmp/ws"));
        let key = IssueRef::new("github.com", "acme", "web", 42);
        assert_eq!(
            mgr.worktree_path(&key),
            PathBuf::from("/tmp/ws/github.com/acme/web/42")
        );
        assert_eq!(
            mgr.repo_dir(&key),
            PathBuf::from("/tmp/ws/github.com/acme/web/repo")
        );
    }

    #[tokio::test]
    async fn path_escaping_components_are_rejected() {
        let mgr = WorkspaceManager::new(PathBuf::from("/tmp/ws"));
        for bad in [
            IssueRef::new("github.com", "..", "web", 1),
            IssueRef::new("github.com", "acme", "a/b", 1),
            IssueRef::new("", "acme", "web", 1),
        ] {
            let err = mgr
                .ensure_for_issue(&bad, "t", "unused", Some("main"))
                .await
                .unwrap_err();
            assert!(matches!(err, WorkspaceError::PathEscape { .. }), "{bad}");
            let err = mgr.cleanup_for_issue(&bad, "t", true).await.unwrap_err();
            assert!(matches!(err, WorkspaceError::PathEscape { .. }));
        }
    }

    /// End-to-end against a real local git repository.
    #[tokio::test]
    async fn worktree_round_trip_with_local_origin() {
        let origin_dir = tempfile::tempdir().unwrap();
        let origin = origin_dir.path();
        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
            vec!["commit", "--allow-empty", "-m", "init"],
        ] {
            run_git(origin, &args).await.unwrap();
        }

        let ws_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(ws_dir.path().to_path_buf());
        let key = IssueRef::new("github.com", "acme", "web", 5);
        let url = origin.to_string_lossy().to_string();

        let path = mgr
            .ensure_for_issue(&key, "Add search", &url, Some("main"))
            .await
            .unwrap();
        assert!(path.join(".git").exists());

        // Idempotent: second call is a no-op returning the same path.
        let again = mgr
            .ensure_for_issue(&key, "Add search", &url, Some("main"))
            .await
            .unwrap();
        assert_eq!(path, again);

        mgr.cleanup_for_issue(&key, "Add search", true).await.unwrap();
        assert!(!path.exists());
        let repo = mgr.repo_dir(&key);
        assert!(!branch_exists(&repo, "5-add-search").await.unwrap());
    }
}
