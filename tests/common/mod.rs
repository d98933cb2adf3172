//! Shared test fixtures: an in-memory ticket client and an engine
//! context wired to a stub executor script.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kiln::config::{Config, Credentials, StageModels};
use kiln::db::{DbHandle, KilnDb};
use kiln::engine::EngineCtx;
use kiln::errors::TicketError;
use kiln::executor::{ExecutorConfig, ExecutorRunner};
use kiln::labels::LabelSpec;
use kiln::ticket::{
    Comment, Issue, IssueRef, IssueState, PrState, PullRequest, Reaction, TicketClient,
};
use kiln::workspace::WorkspaceManager;

pub const BOARD_URL: &str = "https://github.com/orgs/acme/projects/1";
pub const ALLOWED: &str = "octocat";

#[derive(Default)]
pub struct FakeState {
    pub issues: Vec<Issue>,
    /// When set, board listing fails with an auth (fatal) error.
    pub fail_board_auth: bool,
    /// Fresh bodies as `get_body` sees them; pre-seeding a marked region
    /// here simulates the executor having edited the issue.
    pub bodies: HashMap<IssueRef, String>,
    pub comments: HashMap<IssueRef, Vec<Comment>>,
    /// Reactions recorded per comment id, in write order.
    pub reactions: BTreeMap<String, Vec<&'static str>>,
    pub posted_comments: Vec<(IssueRef, String)>,
    pub status_actors: HashMap<IssueRef, Option<String>>,
    pub label_actors: HashMap<(IssueRef, String), String>,
    pub prs: HashMap<IssueRef, Vec<PullRequest>>,
    pub closed_prs: Vec<u64>,
    pub deleted_branches: Vec<String>,
}

pub struct FakeTicketClient {
    pub state: Mutex<FakeState>,
}

impl FakeTicketClient {
    pub fn new(state: FakeState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn issue_mut<'a>(
        state: &'a mut FakeState,
        key: &IssueRef,
    ) -> Result<&'a mut Issue, TicketError> {
        state
            .issues
            .iter_mut()
            .find(|i| &i.key == key)
            .ok_or_else(|| TicketError::NotFound(format!("issue {key}")))
    }

    pub fn labels_of(&self, key: &IssueRef) -> BTreeSet<String> {
        self.with_state(|s| {
            s.issues
                .iter()
                .find(|i| &i.key == key)
                .map(|i| i.labels.clone())
                .unwrap_or_default()
        })
    }

    pub fn status_of(&self, key: &IssueRef) -> Option<String> {
        self.with_state(|s| {
            s.issues
                .iter()
                .find(|i| &i.key == key)
                .and_then(|i| i.status.clone())
        })
    }
}

#[async_trait]
impl TicketClient for FakeTicketClient {
    async fn list_board_items(&self, _board_url: &str) -> Result<Vec<Issue>, TicketError> {
        self.with_state(|s| {
            if s.fail_board_auth {
                return Err(TicketError::Auth("token revoked".to_string()));
            }
            Ok(s.issues.clone())
        })
    }

    async fn get_body(&self, key: &IssueRef) -> Result<String, TicketError> {
        self.with_state(|s| {
            s.bodies
                .get(key)
                .cloned()
                .ok_or_else(|| TicketError::NotFound(format!("body of {key}")))
        })
    }

    async fn update_body(&self, key: &IssueRef, body: &str) -> Result<(), TicketError> {
        self.with_state(|s| {
            s.bodies.insert(key.clone(), body.to_string());
            if let Ok(issue) = Self::issue_mut(s, key) {
                issue.body = body.to_string();
            }
            Ok(())
        })
    }

    async fn get_labels(&self, key: &IssueRef) -> Result<BTreeSet<String>, TicketError> {
        Ok(self.labels_of(key))
    }

    async fn add_label(&self, key: &IssueRef, label: &str) -> Result<(), TicketError> {
        self.with_state(|s| {
            let issue = Self::issue_mut(s, key)?;
            issue.labels.insert(label.to_string());
            // Invariant checked on every write: at most one running label
            // (`preparing` and `editing` included) at any observable
            // moment.
            let running = kiln::labels::RUNNING_LABELS
                .iter()
                .filter(|l| issue.labels.contains(**l))
                .count();
            assert!(
                running <= 1,
                "running label invariant violated on {key}: {:?}",
                issue.labels
            );
            Ok(())
        })
    }

    async fn remove_label(&self, key: &IssueRef, label: &str) -> Result<(), TicketError> {
        self.with_state(|s| {
            Self::issue_mut(s, key)?.labels.remove(label);
            Ok(())
        })
    }

    async fn ensure_repo_label(
        &self,
        _key: &IssueRef,
        _spec: &LabelSpec,
    ) -> Result<(), TicketError> {
        Ok(())
    }

    async fn move_status(&self, issue: &Issue, status: &str) -> Result<(), TicketError> {
        self.with_state(|s| {
            Self::issue_mut(s, &issue.key)?.status = Some(status.to_string());
            Ok(())
        })
    }

    async fn list_comments_since(
        &self,
        key: &IssueRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, TicketError> {
        Ok(self.with_state(|s| {
            s.comments
                .get(key)
                .map(|comments| {
                    comments
                        .iter()
                        .filter(|c| since.is_none_or(|t| c.created_at > t))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn post_comment(&self, key: &IssueRef, body: &str) -> Result<Comment, TicketError> {
        self.with_state(|s| {
            s.posted_comments.push((key.clone(), body.to_string()));
            Ok(Comment {
                id: format!("reply-{}", s.posted_comments.len()),
                author: "kiln".to_string(),
                body: body.to_string(),
                created_at: Utc::now(),
            })
        })
    }

    async fn add_reaction(
        &self,
        _key: &IssueRef,
        comment_id: &str,
        reaction: Reaction,
    ) -> Result<(), TicketError> {
        self.with_state(|s| {
            s.reactions
                .entry(comment_id.to_string())
                .or_default()
                .push(reaction.api_name());
            Ok(())
        })
    }

    async fn find_linked_prs(&self, key: &IssueRef) -> Result<Vec<PullRequest>, TicketError> {
        Ok(self.with_state(|s| s.prs.get(key).cloned().unwrap_or_default()))
    }

    async fn last_status_change_actor(
        &self,
        key: &IssueRef,
    ) -> Result<Option<String>, TicketError> {
        Ok(self.with_state(|s| s.status_actors.get(key).cloned().unwrap_or_default()))
    }

    async fn label_actor(
        &self,
        key: &IssueRef,
        label: &str,
    ) -> Result<Option<String>, TicketError> {
        Ok(self.with_state(|s| {
            s.label_actors
                .get(&(key.clone(), label.to_string()))
                .cloned()
        }))
    }

    async fn close_pr(&self, key: &IssueRef, number: u64) -> Result<(), TicketError> {
        self.with_state(|s| {
            s.closed_prs.push(number);
            if let Some(prs) = s.prs.get_mut(key)
                && let Some(pr) = prs.iter_mut().find(|pr| pr.number == number)
            {
                pr.state = PrState::Closed;
            }
            Ok(())
        })
    }

    async fn delete_remote_branch(
        &self,
        _key: &IssueRef,
        branch: &str,
    ) -> Result<(), TicketError> {
        self.with_state(|s| {
            s.deleted_branches.push(branch.to_string());
            Ok(())
        })
    }

    async fn verify_credentials(&self) -> Result<(), TicketError> {
        Ok(())
    }
}

pub fn issue_ref(number: u64) -> IssueRef {
    IssueRef::new("github.com", "acme", "web", number)
}

pub fn issue(number: u64, status: &str, labels: &[&str]) -> Issue {
    Issue {
        key: issue_ref(number),
        item_id: format!("ITEM_{number}"),
        board_url: BOARD_URL.to_string(),
        title: format!("Issue {number}"),
        body: String::new(),
        status: Some(status.to_string()),
        state: IssueState::Open,
        labels: labels.iter().map(|l| l.to_string()).collect(),
        author: ALLOWED.to_string(),
        comment_count: 0,
        updated_at: Utc::now(),
    }
}

pub fn comment(id: &str, author: &str, body: &str) -> Comment {
    Comment {
        id: id.to_string(),
        author: author.to_string(),
        body: body.to_string(),
        created_at: Utc::now(),
    }
}

/// Run a git command in a directory, panicking on failure.
pub fn git(cwd: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Write an executable stub executor script.
pub fn write_executor(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("executor.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A stub that drains stdin, reports a session id, and exits cleanly.
pub fn happy_executor(dir: &Path) -> PathBuf {
    write_executor(
        dir,
        r#"cat > /dev/null
echo '{"type":"system","session_id":"fake-session-1"}'
echo '{"type":"result","subtype":"success"}'"#,
    )
}

pub struct Harness {
    pub ctx: EngineCtx,
    pub tickets: Arc<FakeTicketClient>,
    _root: tempfile::TempDir,
}

impl Harness {
    pub fn new(state: FakeState, executor_cmd: &Path, max_concurrent: usize) -> Self {
        let root = tempfile::tempdir().unwrap();
        let kiln_dir = root.path().join(".kiln");
        let workspaces_dir = root.path().join("workspaces");
        std::fs::create_dir_all(&kiln_dir).unwrap();

        let config = Config {
            credentials: Credentials::GithubCom {
                token: "ghp_test".to_string(),
            },
            project_urls: vec![BOARD_URL.to_string()],
            allowed_username: ALLOWED.to_string(),
            team_usernames: vec!["teammate".to_string()],
            poll_interval: Duration::from_secs(30),
            watched_statuses: vec!["Research".into(), "Plan".into(), "Implement".into()],
            max_concurrent_workflows: max_concurrent,
            stage_models: StageModels::default(),
            executor_cmd: executor_cmd.to_string_lossy().to_string(),
            workspaces_dir: workspaces_dir.clone(),
            kiln_dir,
            workflow_timeout: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(20),
            shutdown_grace: Duration::from_secs(5),
            ghes_logs_mask: false,
            mcp_config: None,
        };

        let tickets = Arc::new(FakeTicketClient::new(state));
        let ctx = EngineCtx {
            config: Arc::new(config),
            db: DbHandle::new(KilnDb::new_in_memory().unwrap()),
            tickets: tickets.clone(),
            workspaces: Arc::new(WorkspaceManager::new(workspaces_dir)),
            executor: Arc::new(ExecutorRunner::new(ExecutorConfig {
                cmd: executor_cmd.to_string_lossy().to_string(),
                wall_timeout: Duration::from_secs(20),
                idle_timeout: Duration::from_secs(20),
            })),
        };
        Self {
            ctx,
            tickets,
            _root: root,
        }
    }

    /// Pre-create the worktree directory so workflows skip the git
    /// prepare phase and go straight to the executor.
    pub fn seed_worktree(&self, key: &IssueRef) -> PathBuf {
        let path = self.ctx.workspaces.worktree_path(key);
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}

/// Wait until the dispatcher has no in-flight actions.
pub async fn drain(dispatcher: &kiln::dispatcher::Dispatcher) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while dispatcher.active_count() > 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "dispatcher did not drain within 10s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
