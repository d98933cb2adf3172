//! Ticket-tracker data model and the client trait the engine runs against.
//!
//! The engine never talks HTTP itself: everything it knows about issues,
//! labels, comments and pull requests arrives through `TicketClient`.
//! Real implementation: `GithubClient`. Test double: the in-memory fake
//! under `tests/`.

mod github;

pub use github::GithubClient;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TicketError;
use crate::labels::LabelSpec;

/// Global identity of an issue: `(host, owner, repo, number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueRef {
    pub host: String,
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl IssueRef {
    pub fn new(host: &str, owner: &str, repo: &str, number: u64) -> Self {
        Self {
            host: host.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        }
    }

    /// `owner/repo`, the form REST endpoints take.
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Browser URL of the issue.
    pub fn html_url(&self) -> String {
        format!(
            "https://{}/{}/{}/issues/{}",
            self.host, self.owner, self.repo, self.number
        )
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.host, self.owner, self.repo, self.number
        )
    }
}

impl FromStr for IssueRef {
    type Err = String;

    /// Parse `host/owner/repo#N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, number) = s
            .rsplit_once('#')
            .ok_or_else(|| format!("missing '#<number>' in '{s}'"))?;
        let number: u64 = number
            .parse()
            .map_err(|_| format!("invalid issue number in '{s}'"))?;
        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [host, owner, repo] if !host.is_empty() && !owner.is_empty() && !repo.is_empty() => {
                Ok(Self::new(host, owner, repo, number))
            }
            _ => Err(format!("expected host/owner/repo#N, got '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
}

/// A board item as observed at poll time. Labels and body are the snapshot
/// the reconciler classifies against; the next tick picks up anything that
/// moved underneath it.
#[derive(Debug, Clone)]
pub struct Issue {
    pub key: IssueRef,
    /// Opaque board-item id, needed for column moves.
    pub item_id: String,
    /// URL of the project board this item was discovered on.
    pub board_url: String,
    pub title: String,
    pub body: String,
    /// Column name, `None` for items not yet placed on the board.
    pub status: Option<String>,
    pub state: IssueState,
    pub labels: BTreeSet<String>,
    pub author: String,
    pub comment_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn status_is(&self, status: &str) -> bool {
        self.status.as_deref() == Some(status)
    }

    pub fn is_closed(&self) -> bool {
        self.state == IssueState::Closed
    }
}

#[derive(Debug, Clone)]
pub struct Comment {
    /// Tracker node id; the dedup-ledger key and the reaction target.
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub state: PrState,
    pub is_draft: bool,
    pub head_branch: String,
}

/// Reactions the daemon writes on comments it processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Comment picked up for processing.
    Eyes,
    /// Processing succeeded.
    ThumbsUp,
    /// Processing failed.
    Confused,
}

impl Reaction {
    pub fn api_name(self) -> &'static str {
        match self {
            Self::Eyes => "eyes",
            Self::ThumbsUp => "+1",
            Self::Confused => "confused",
        }
    }
}

/// Capability set the engine requires from a tracker backend.
///
/// Implementations own retries for transient errors and error
/// classification; the engine treats every method as a single logical
/// operation.
#[async_trait]
pub trait TicketClient: Send + Sync {
    /// All items on a project board, restricted to open issues the daemon
    /// can observe, with labels, body, status and author resolved.
    async fn list_board_items(&self, board_url: &str) -> Result<Vec<Issue>, TicketError>;

    async fn get_body(&self, key: &IssueRef) -> Result<String, TicketError>;

    /// Replace the issue body. On a write conflict the implementation
    /// rereads and retries once before surfacing `Conflict`.
    async fn update_body(&self, key: &IssueRef, body: &str) -> Result<(), TicketError>;

    async fn get_labels(&self, key: &IssueRef) -> Result<BTreeSet<String>, TicketError>;

    async fn add_label(&self, key: &IssueRef, label: &str) -> Result<(), TicketError>;

    async fn remove_label(&self, key: &IssueRef, label: &str) -> Result<(), TicketError>;

    /// Create the label in the repository if it does not exist yet.
    async fn ensure_repo_label(&self, key: &IssueRef, spec: &LabelSpec)
    -> Result<(), TicketError>;

    /// Move a board item to another column.
    async fn move_status(&self, issue: &Issue, status: &str) -> Result<(), TicketError>;

    async fn list_comments_since(
        &self,
        key: &IssueRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, TicketError>;

    async fn post_comment(&self, key: &IssueRef, body: &str) -> Result<Comment, TicketError>;

    async fn add_reaction(
        &self,
        key: &IssueRef,
        comment_id: &str,
        reaction: Reaction,
    ) -> Result<(), TicketError>;

    /// Pull requests whose body links back to this issue (`Closes #N`).
    async fn find_linked_prs(&self, key: &IssueRef) -> Result<Vec<PullRequest>, TicketError>;

    /// Who last moved the issue into its current column, from the project
    /// activity log. `None` when the actor cannot be established — the
    /// authorization gate treats that as a denial.
    async fn last_status_change_actor(
        &self,
        key: &IssueRef,
    ) -> Result<Option<String>, TicketError>;

    /// Who applied the given label, if the activity log records it.
    async fn label_actor(
        &self,
        key: &IssueRef,
        label: &str,
    ) -> Result<Option<String>, TicketError>;

    async fn close_pr(&self, key: &IssueRef, number: u64) -> Result<(), TicketError>;

    async fn delete_remote_branch(&self, key: &IssueRef, branch: &str)
    -> Result<(), TicketError>;

    /// Startup check: token must carry the minimum required scopes and
    /// nothing broader.
    async fn verify_credentials(&self) -> Result<(), TicketError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_ref_display_and_parse_round_trip() {
        let key = IssueRef::new("github.com", "acme", "web", 42);
        assert_eq!(key.to_string(), "github.com/acme/web#42");
        assert_eq!("github.com/acme/web#42".parse::<IssueRef>().unwrap(), key);
        assert_eq!(key.repo_slug(), "acme/web");
        assert_eq!(key.html_url(), "https://github.com/acme/web/issues/42");
    }

    #[test]
    fn issue_ref_parse_rejects_malformed_input() {
        assert!("acme/web#42".parse::<IssueRef>().is_err());
        assert!("github.com/acme/web".parse::<IssueRef>().is_err());
        assert!("github.com/acme/web#abc".parse::<IssueRef>().is_err());
    }

    #[test]
    fn reaction_api_names() {
        assert_eq!(Reaction::Eyes.api_name(), "eyes");
        assert_eq!(Reaction::ThumbsUp.api_name(), "+1");
        assert_eq!(Reaction::Confused.api_name(), "confused");
    }
}
