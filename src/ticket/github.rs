//! GitHub implementation of `TicketClient`.
//!
//! REST for issues, labels, comments, reactions and pull requests;
//! GraphQL for project boards, column moves and the activity-log actor
//! queries. Works against github.com and GHES hosts — which one is a
//! configuration invariant, not runtime dispatch.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{Comment, Issue, IssueRef, IssueState, PrState, PullRequest, Reaction, TicketClient};
use crate::config::Credentials;
use crate::errors::TicketError;
use crate::labels::LabelSpec;

const RETRY_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));

/// Scopes a classic token must carry.
const REQUIRED_SCOPES: &[&str] = &["repo", "project"];
/// Scopes a classic token may carry. Anything outside this set means the
/// credential is broader than the daemon needs, which is a startup error.
const ALLOWED_SCOPES: &[&str] = &["repo", "project", "read:org"];

/// PR bodies that link back to an issue: `Closes #N` and friends.
static CLOSES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:close[sd]?|fix(?:es|ed)?|resolve[sd]?)\s+#(\d+)\b")
        .expect("valid regex")
});

/// `Status` single-select field metadata for one board, cached after the
/// first column move.
#[derive(Debug, Clone)]
struct BoardFieldInfo {
    project_id: String,
    field_id: String,
    options: HashMap<String, String>,
}

pub struct GithubClient {
    http: reqwest::Client,
    host: String,
    api_base: String,
    graphql_url: String,
    board_fields: RwLock<HashMap<String, BoardFieldInfo>>,
}

impl GithubClient {
    pub fn new(credentials: &Credentials) -> anyhow::Result<Self> {
        let host = credentials.host().to_string();
        let (api_base, graphql_url) = if credentials.is_enterprise() {
            (
                format!("https://{host}/api/v3"),
                format!("https://{host}/api/graphql"),
            )
        } else {
            (
                "https://api.github.com".to_string(),
                "https://api.github.com/graphql".to_string(),
            )
        };

        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            credentials.token()
        ))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            host,
            api_base,
            graphql_url,
            board_fields: RwLock::new(HashMap::new()),
        })
    }

    fn issue_url(&self, key: &IssueRef, suffix: &str) -> String {
        format!(
            "{}/repos/{}/issues/{}{}",
            self.api_base,
            key.repo_slug(),
            key.number,
            suffix
        )
    }

    /// Retry transient failures with doubling backoff; everything else is
    /// returned to the caller as classified.
    async fn with_retries<T, F, Fut>(&self, op: &str, f: F) -> Result<T, TicketError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, TicketError>>,
    {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    warn!(op, attempt, error = %e, "transient API error, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn rest<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<T, TicketError> {
        let response = request
            .send()
            .await
            .map_err(|e| TicketError::Transient(format!("{context}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, context));
        }
        response
            .json()
            .await
            .map_err(|e| TicketError::Other(anyhow::anyhow!("{context}: invalid response: {e}")))
    }

    /// REST call where only the status matters.
    async fn rest_unit(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<(), TicketError> {
        let response = request
            .send()
            .await
            .map_err(|e| TicketError::Transient(format!("{context}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, context));
        }
        Ok(())
    }

    async fn graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
        context: &str,
    ) -> Result<serde_json::Value, TicketError> {
        let response = self
            .http
            .post(&self.graphql_url)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| TicketError::Transient(format!("{context}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, context));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TicketError::Other(anyhow::anyhow!("{context}: invalid response: {e}")))?;
        if let Some(errors) = body.get("errors").and_then(|e| e.as_array())
            && !errors.is_empty()
        {
            let rendered = serde_json::to_string(errors).unwrap_or_default();
            if rendered.contains("NOT_FOUND") {
                return Err(TicketError::NotFound(format!("{context}: {rendered}")));
            }
            return Err(TicketError::Other(anyhow::anyhow!(
                "{context}: GraphQL errors: {rendered}"
            )));
        }
        Ok(body)
    }

    /// Resolve and cache the board's Status field metadata.
    async fn board_field_info(&self, board_url: &str) -> Result<BoardFieldInfo, TicketError> {
        if let Some(info) = self.board_fields.read().await.get(board_url) {
            return Ok(info.clone());
        }

        let board = BoardLocator::parse(board_url).ok_or_else(|| {
            TicketError::Other(anyhow::anyhow!("unrecognized project URL: {board_url}"))
        })?;
        let query = format!(
            r#"
            query($login: String!, $number: Int!) {{
              {}(login: $login) {{
                projectV2(number: $number) {{
                  id
                  field(name: "Status") {{
                    ... on ProjectV2SingleSelectField {{
                      id
                      options {{ id name }}
                    }}
                  }}
                }}
              }}
            }}"#,
            board.owner_kind
        );
        let data = self
            .graphql(
                &query,
                json!({ "login": board.login, "number": board.number }),
                "board metadata",
            )
            .await?;
        let project = &data["data"][board.owner_kind]["projectV2"];
        let field = &project["field"];
        let mut options = HashMap::new();
        if let Some(list) = field["options"].as_array() {
            for option in list {
                if let (Some(name), Some(id)) = (option["name"].as_str(), option["id"].as_str()) {
                    options.insert(name.to_string(), id.to_string());
                }
            }
        }
        let info = BoardFieldInfo {
            project_id: project["id"]
                .as_str()
                .ok_or_else(|| {
                    TicketError::Other(anyhow::anyhow!("board metadata missing project id"))
                })?
                .to_string(),
            field_id: field["id"]
                .as_str()
                .ok_or_else(|| {
                    TicketError::Other(anyhow::anyhow!("board has no Status field"))
                })?
                .to_string(),
            options,
        };
        self.board_fields
            .write()
            .await
            .insert(board_url.to_string(), info.clone());
        Ok(info)
    }

    async fn patch_body(&self, key: &IssueRef, body: &str) -> Result<(), TicketError> {
        self.rest_unit(
            self.http
                .patch(self.issue_url(key, ""))
                .json(&json!({ "body": body })),
            "update body",
        )
        .await
    }
}

#[async_trait]
impl TicketClient for GithubClient {
    async fn list_board_items(&self, board_url: &str) -> Result<Vec<Issue>, TicketError> {
        let board = BoardLocator::parse(board_url).ok_or_else(|| {
            TicketError::Other(anyhow::anyhow!("unrecognized project URL: {board_url}"))
        })?;
        let query = format!(
            r#"
            query($login: String!, $number: Int!, $cursor: String) {{
              {}(login: $login) {{
                projectV2(number: $number) {{
                  items(first: 100, after: $cursor) {{
                    pageInfo {{ hasNextPage endCursor }}
                    nodes {{
                      id
                      fieldValueByName(name: "Status") {{
                        ... on ProjectV2ItemFieldSingleSelectValue {{ name }}
                      }}
                      content {{
                        ... on Issue {{
                          number title body state updatedAt
                          author {{ login }}
                          comments {{ totalCount }}
                          labels(first: 50) {{ nodes {{ name }} }}
                          repository {{ name owner {{ login }} }}
                        }}
                      }}
                    }}
                  }}
                }}
              }}
            }}"#,
            board.owner_kind
        );

        self.with_retries("list board items", || async {
            let mut issues = Vec::new();
            let mut cursor: Option<String> = None;
            loop {
                let data = self
                    .graphql(
                        &query,
                        json!({ "login": board.login, "number": board.number, "cursor": cursor }),
                        "list board items",
                    )
                    .await?;
                let items = &data["data"][board.owner_kind]["projectV2"]["items"];
                for node in items["nodes"].as_array().into_iter().flatten() {
                    let content = &node["content"];
                    let Some(number) = content["number"].as_u64() else {
                        continue; // draft items and PRs are not schedulable
                    };
                    let owner = content["repository"]["owner"]["login"]
                        .as_str()
                        .unwrap_or_default();
                    let repo = content["repository"]["name"].as_str().unwrap_or_default();
                    if owner.is_empty() || repo.is_empty() {
                        continue;
                    }
                    issues.push(Issue {
                        key: IssueRef::new(&self.host, owner, repo, number),
                        item_id: node["id"].as_str().unwrap_or_default().to_string(),
                        board_url: board_url.to_string(),
                        title: content["title"].as_str().unwrap_or_default().to_string(),
                        body: content["body"].as_str().unwrap_or_default().to_string(),
                        status: node["fieldValueByName"]["name"]
                            .as_str()
                            .map(String::from),
                        state: if content["state"].as_str() == Some("CLOSED") {
                            IssueState::Closed
                        } else {
                            IssueState::Open
                        },
                        labels: content["labels"]["nodes"]
                            .as_array()
                            .into_iter()
                            .flatten()
                            .filter_map(|l| l["name"].as_str().map(String::from))
                            .collect(),
                        author: content["author"]["login"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        comment_count: content["comments"]["totalCount"].as_u64().unwrap_or(0),
                        updated_at: content["updatedAt"]
                            .as_str()
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_default(),
                    });
                }
                if items["pageInfo"]["hasNextPage"].as_bool() == Some(true) {
                    cursor = items["pageInfo"]["endCursor"].as_str().map(String::from);
                } else {
                    return Ok(issues);
                }
            }
        })
        .await
    }

    async fn get_body(&self, key: &IssueRef) -> Result<String, TicketError> {
        #[derive(Deserialize)]
        struct IssueBody {
            body: Option<String>,
        }
        self.with_retries("get body", || async {
            let issue: IssueBody = self
                .rest(self.http.get(self.issue_url(key, "")), "get body")
                .await?;
            Ok(issue.body.unwrap_or_default())
        })
        .await
    }

    async fn update_body(&self, key: &IssueRef, body: &str) -> Result<(), TicketError> {
        self.with_retries("update body", || async {
            match self.patch_body(key, body).await {
                // Conflicting concurrent edit: reread so our region write
                // lands on the latest revision, then retry once.
                Err(TicketError::Conflict(_)) => {
                    debug!(issue = %key, "body write conflict, rereading");
                    let _ = self.get_body(key).await?;
                    self.patch_body(key, body).await
                }
                other => other,
            }
        })
        .await
    }

    async fn get_labels(&self, key: &IssueRef) -> Result<BTreeSet<String>, TicketError> {
        #[derive(Deserialize)]
        struct Label {
            name: String,
        }
        self.with_retries("get labels", || async {
            let labels: Vec<Label> = self
                .rest(
                    self.http
                        .get(self.issue_url(key, "/labels"))
                        .query(&[("per_page", "100")]),
                    "get labels",
                )
                .await?;
            Ok(labels.into_iter().map(|l| l.name).collect())
        })
        .await
    }

    async fn add_label(&self, key: &IssueRef, label: &str) -> Result<(), TicketError> {
        self.with_retries("add label", || async {
            self.rest_unit(
                self.http
                    .post(self.issue_url(key, "/labels"))
                    .json(&json!({ "labels": [label] })),
                "add label",
            )
            .await
        })
        .await
    }

    async fn remove_label(&self, key: &IssueRef, label: &str) -> Result<(), TicketError> {
        self.with_retries("remove label", || async {
            match self
                .rest_unit(
                    self.http
                        .delete(self.issue_url(key, &format!("/labels/{label}"))),
                    "remove label",
                )
                .await
            {
                // Already absent: removal is idempotent.
                Err(TicketError::NotFound(_)) => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn ensure_repo_label(
        &self,
        key: &IssueRef,
        spec: &LabelSpec,
    ) -> Result<(), TicketError> {
        let url = format!(
            "{}/repos/{}/labels/{}",
            self.api_base,
            key.repo_slug(),
            spec.name
        );
        self.with_retries("ensure repo label", || async {
            match self.rest_unit(self.http.get(&url), "get repo label").await {
                Ok(()) => Ok(()),
                Err(TicketError::NotFound(_)) => {
                    self.rest_unit(
                        self.http
                            .post(format!("{}/repos/{}/labels", self.api_base, key.repo_slug()))
                            .json(&json!({
                                "name": spec.name,
                                "description": spec.description,
                                "color": spec.color,
                            })),
                        "create repo label",
                    )
                    .await
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn move_status(&self, issue: &Issue, status: &str) -> Result<(), TicketError> {
        let info = self.board_field_info(&issue.board_url).await?;
        let option_id = info.options.get(status).ok_or_else(|| {
            TicketError::Other(anyhow::anyhow!(
                "board has no '{status}' column (options: {:?})",
                info.options.keys().collect::<Vec<_>>()
            ))
        })?;
        let mutation = r#"
            mutation($project: ID!, $item: ID!, $field: ID!, $option: String!) {
              updateProjectV2ItemFieldValue(input: {
                projectId: $project, itemId: $item, fieldId: $field,
                value: { singleSelectOptionId: $option }
              }) { projectV2Item { id } }
            }"#;
        self.with_retries("move status", || async {
            self.graphql(
                mutation,
                json!({
                    "project": info.project_id,
                    "item": issue.item_id,
                    "field": info.field_id,
                    "option": option_id,
                }),
                "move status",
            )
            .await
            .map(|_| ())
        })
        .await
    }

    async fn list_comments_since(
        &self,
        key: &IssueRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, TicketError> {
        #[derive(Deserialize)]
        struct RestComment {
            id: u64,
            body: Option<String>,
            created_at: DateTime<Utc>,
            user: RestUser,
        }
        #[derive(Deserialize)]
        struct RestUser {
            login: String,
        }
        self.with_retries("list comments", || async {
            let mut request = self
                .http
                .get(self.issue_url(key, "/comments"))
                .query(&[("per_page", "100")]);
            if let Some(since) = since {
                request = request.query(&[("since", since.to_rfc3339())]);
            }
            let comments: Vec<RestComment> = self.rest(request, "list comments").await?;
            Ok(comments
                .into_iter()
                .map(|c| Comment {
                    id: c.id.to_string(),
                    author: c.user.login,
                    body: c.body.unwrap_or_default(),
                    created_at: c.created_at,
                })
                .collect())
        })
        .await
    }

    async fn post_comment(&self, key: &IssueRef, body: &str) -> Result<Comment, TicketError> {
        #[derive(Deserialize)]
        struct RestComment {
            id: u64,
            created_at: DateTime<Utc>,
            user: RestUser,
        }
        #[derive(Deserialize)]
        struct RestUser {
            login: String,
        }
        let posted: RestComment = self
            .with_retries("post comment", || async {
                self.rest(
                    self.http
                        .post(self.issue_url(key, "/comments"))
                        .json(&json!({ "body": body })),
                    "post comment",
                )
                .await
            })
            .await?;
        Ok(Comment {
            id: posted.id.to_string(),
            author: posted.user.login,
            body: body.to_string(),
            created_at: posted.created_at,
        })
    }

    async fn add_reaction(
        &self,
        key: &IssueRef,
        comment_id: &str,
        reaction: Reaction,
    ) -> Result<(), TicketError> {
        let url = format!(
            "{}/repos/{}/issues/comments/{}/reactions",
            self.api_base,
            key.repo_slug(),
            comment_id
        );
        self.with_retries("add reaction", || async {
            self.rest_unit(
                self.http
                    .post(&url)
                    .json(&json!({ "content": reaction.api_name() })),
                "add reaction",
            )
            .await
        })
        .await
    }

    async fn find_linked_prs(&self, key: &IssueRef) -> Result<Vec<PullRequest>, TicketError> {
        #[derive(Deserialize)]
        struct RestPr {
            number: u64,
            html_url: String,
            state: String,
            draft: Option<bool>,
            merged_at: Option<DateTime<Utc>>,
            body: Option<String>,
            head: RestHead,
        }
        #[derive(Deserialize)]
        struct RestHead {
            #[serde(rename = "ref")]
            branch: String,
        }
        self.with_retries("find linked PRs", || async {
            let prs: Vec<RestPr> = self
                .rest(
                    self.http
                        .get(format!("{}/repos/{}/pulls", self.api_base, key.repo_slug()))
                        .query(&[("state", "all"), ("per_page", "100")]),
                    "find linked PRs",
                )
                .await?;
            Ok(prs
                .into_iter()
                .filter(|pr| {
                    body_links_issue(pr.body.as_deref().unwrap_or_default(), key.number)
                })
                .map(|pr| PullRequest {
                    number: pr.number,
                    url: pr.html_url,
                    state: if pr.merged_at.is_some() {
                        PrState::Merged
                    } else if pr.state == "closed" {
                        PrState::Closed
                    } else {
                        PrState::Open
                    },
                    is_draft: pr.draft.unwrap_or(false),
                    head_branch: pr.head.branch,
                })
                .collect())
        })
        .await
    }

    async fn last_status_change_actor(
        &self,
        key: &IssueRef,
    ) -> Result<Option<String>, TicketError> {
        let query = r#"
            query($owner: String!, $repo: String!, $number: Int!) {
              repository(owner: $owner, name: $repo) {
                issue(number: $number) {
                  timelineItems(last: 50, itemTypes: [PROJECT_V2_ITEM_STATUS_CHANGED_EVENT]) {
                    nodes {
                      ... on ProjectV2ItemStatusChangedEvent {
                        actor { login }
                        createdAt
                      }
                    }
                  }
                }
              }
            }"#;
        self.with_retries("status actor", || async {
            let data = self
                .graphql(
                    query,
                    json!({ "owner": key.owner, "repo": key.repo, "number": key.number }),
                    "status actor",
                )
                .await?;
            let nodes = &data["data"]["repository"]["issue"]["timelineItems"]["nodes"];
            Ok(nodes
                .as_array()
                .and_then(|nodes| nodes.last())
                .and_then(|node| node["actor"]["login"].as_str())
                .map(String::from))
        })
        .await
    }

    async fn label_actor(
        &self,
        key: &IssueRef,
        label: &str,
    ) -> Result<Option<String>, TicketError> {
        let query = r#"
            query($owner: String!, $repo: String!, $number: Int!) {
              repository(owner: $owner, name: $repo) {
                issue(number: $number) {
                  timelineItems(last: 100, itemTypes: [LABELED_EVENT]) {
                    nodes {
                      ... on LabeledEvent {
                        actor { login }
                        label { name }
                      }
                    }
                  }
                }
              }
            }"#;
        self.with_retries("label actor", || async {
            let data = self
                .graphql(
                    query,
                    json!({ "owner": key.owner, "repo": key.repo, "number": key.number }),
                    "label actor",
                )
                .await?;
            let nodes = &data["data"]["repository"]["issue"]["timelineItems"]["nodes"];
            Ok(nodes
                .as_array()
                .into_iter()
                .flatten()
                .rev()
                .find(|node| node["label"]["name"].as_str() == Some(label))
                .and_then(|node| node["actor"]["login"].as_str())
                .map(String::from))
        })
        .await
    }

    async fn close_pr(&self, key: &IssueRef, number: u64) -> Result<(), TicketError> {
        self.with_retries("close PR", || async {
            self.rest_unit(
                self.http
                    .patch(format!(
                        "{}/repos/{}/pulls/{}",
                        self.api_base,
                        key.repo_slug(),
                        number
                    ))
                    .json(&json!({ "state": "closed" })),
                "close PR",
            )
            .await
        })
        .await
    }

    async fn delete_remote_branch(
        &self,
        key: &IssueRef,
        branch: &str,
    ) -> Result<(), TicketError> {
        let url = format!(
            "{}/repos/{}/git/refs/heads/{}",
            self.api_base,
            key.repo_slug(),
            branch
        );
        self.with_retries("delete branch", || async {
            match self.rest_unit(self.http.delete(&url), "delete branch").await {
                // Already gone: deletion is idempotent.
                Err(TicketError::NotFound(_)) => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn verify_credentials(&self) -> Result<(), TicketError> {
        let response = self
            .http
            .get(format!("{}/user", self.api_base))
            .send()
            .await
            .map_err(|e| TicketError::Transient(format!("verify credentials: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, "verify credentials"));
        }
        let scopes_header = response
            .headers()
            .get("x-oauth-scopes")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        match scopes_header {
            // Fine-grained tokens carry no scopes header; nothing to check.
            None => Ok(()),
            Some(scopes) => check_token_scopes(&scopes).map_err(TicketError::Auth),
        }
    }
}

/// Classic-token scope policy: every required scope present, no scope
/// outside the allowed set.
fn check_token_scopes(header: &str) -> Result<(), String> {
    let scopes: BTreeSet<&str> = header
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    for required in REQUIRED_SCOPES {
        if !scopes.contains(required) {
            return Err(format!("token is missing required scope '{required}'"));
        }
    }
    let excessive: Vec<&&str> = scopes
        .iter()
        .filter(|s| !ALLOWED_SCOPES.contains(*s))
        .collect();
    if !excessive.is_empty() {
        return Err(format!(
            "token carries broader scopes than required: {excessive:?}; issue a minimal token"
        ));
    }
    Ok(())
}

fn body_links_issue(body: &str, number: u64) -> bool {
    CLOSES_RE
        .captures_iter(body)
        .any(|caps| caps[1].parse::<u64>() == Ok(number))
}

fn classify_status(status: StatusCode, body: &str, context: &str) -> TicketError {
    let detail = format!("{context}: HTTP {status}: {}", truncate(body, 200));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TicketError::Transient(detail)
    } else {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TicketError::Auth(detail),
            StatusCode::NOT_FOUND | StatusCode::GONE => TicketError::NotFound(detail),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => TicketError::Conflict(detail),
            _ => TicketError::Other(anyhow::anyhow!(detail)),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Org or user project URL: `https://<host>/orgs/<login>/projects/<n>` or
/// `https://<host>/users/<login>/projects/<n>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BoardLocator {
    owner_kind: &'static str,
    login: String,
    number: u64,
}

impl BoardLocator {
    fn parse(url: &str) -> Option<Self> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))?;
        let mut segments = rest.trim_end_matches('/').split('/');
        let _host = segments.next()?;
        let kind = segments.next()?;
        let owner_kind = match kind {
            "orgs" => "organization",
            "users" => "user",
            _ => return None,
        };
        let login = segments.next()?.to_string();
        if segments.next()? != "projects" {
            return None;
        }
        let number = segments.next()?.parse().ok()?;
        Some(Self {
            owner_kind,
            login,
            number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_locator_parses_org_and_user_urls() {
        let org = BoardLocator::parse("https://github.com/orgs/acme/projects/4").unwrap();
        assert_eq!(org.owner_kind, "organization");
        assert_eq!(org.login, "acme");
        assert_eq!(org.number, 4);

        let user =
            BoardLocator::parse("https://github.example.com/users/octocat/projects/12/").unwrap();
        assert_eq!(user.owner_kind, "user");
        assert_eq!(user.number, 12);

        assert!(BoardLocator::parse("https://github.com/acme/web").is_none());
        assert!(BoardLocator::parse("https://github.com/orgs/acme/projects/x").is_none());
    }

    #[test]
    fn closes_regex_matches_linking_keywords() {
        assert!(body_links_issue("Closes #42", 42));
        assert!(body_links_issue("this fixes #42 for real", 42));
        assert!(body_links_issue("Resolved #42.", 42));
        assert!(!body_links_issue("Closes #421", 42));
        assert!(!body_links_issue("see #42", 42));
    }

    #[test]
    fn scope_check_requires_minimum_and_rejects_broader() {
        assert!(check_token_scopes("repo, project").is_ok());
        assert!(check_token_scopes("repo, project, read:org").is_ok());
        assert!(check_token_scopes("repo").is_err());
        let err = check_token_scopes("repo, project, delete_repo").unwrap_err();
        assert!(err.contains("broader"));
    }

    #[test]
    fn status_classification() {
        assert!(
            classify_status(StatusCode::BAD_GATEWAY, "", "op").is_transient()
        );
        assert!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "", "op").is_transient()
        );
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "", "op"),
            TicketError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "", "op"),
            TicketError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "", "op"),
            TicketError::Conflict(_)
        ));
    }
}
