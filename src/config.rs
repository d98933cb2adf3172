//! Runtime configuration for the kiln daemon.
//!
//! Configuration lives in `.kiln/config` as `KEY=VALUE` lines; environment
//! variables with the same names override the file. Validation is strict:
//! a daemon with a half-broken configuration refuses to start rather than
//! limp along against the wrong host or project.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_WORKFLOWS: usize = 3;
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_EXECUTOR_CMD: &str = "claude";

/// Which GitHub host the daemon talks to. Exactly one is configured;
/// mutual exclusion is a load-time invariant, not runtime dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    GithubCom { token: String },
    Enterprise {
        host: String,
        token: String,
        user: String,
    },
}

impl Credentials {
    pub fn host(&self) -> &str {
        match self {
            Self::GithubCom { .. } => "github.com",
            Self::Enterprise { host, .. } => host,
        }
    }

    pub fn token(&self) -> &str {
        match self {
            Self::GithubCom { token } => token,
            Self::Enterprise { token, .. } => token,
        }
    }

    pub fn is_enterprise(&self) -> bool {
        matches!(self, Self::Enterprise { .. })
    }
}

/// Per-stage model overrides for the executor. Unset stages use the
/// executor's default model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageModels {
    pub prepare: Option<String>,
    pub research: Option<String>,
    pub plan: Option<String>,
    pub implement: Option<String>,
    pub process_comments: Option<String>,
}

impl StageModels {
    /// Parse `stage:model` pairs, e.g. `prepare:haiku,research:sonnet`.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let mut models = Self::default();
        for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (stage, model) = pair.split_once(':').ok_or_else(|| ConfigError::InvalidValue {
                key: "STAGE_MODELS",
                value: value.to_string(),
                reason: format!("expected stage:model, got '{pair}'"),
            })?;
            let model = Some(model.trim().to_string());
            match stage.trim() {
                "prepare" => models.prepare = model,
                "research" => models.research = model,
                "plan" => models.plan = model,
                "implement" => models.implement = model,
                "process_comments" => models.process_comments = model,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "STAGE_MODELS",
                        value: value.to_string(),
                        reason: format!("unknown stage '{other}'"),
                    });
                }
            }
        }
        Ok(models)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub project_urls: Vec<String>,
    pub allowed_username: String,
    /// Team members whose activity is observed silently: their comments and
    /// moves never trigger work, but are not flagged as intrusions either.
    pub team_usernames: Vec<String>,
    pub poll_interval: Duration,
    pub watched_statuses: Vec<String>,
    pub max_concurrent_workflows: usize,
    pub stage_models: StageModels,
    pub executor_cmd: String,
    pub workspaces_dir: PathBuf,
    pub kiln_dir: PathBuf,
    pub workflow_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
    pub ghes_logs_mask: bool,
    pub mcp_config: Option<PathBuf>,
}

impl Config {
    pub fn host(&self) -> &str {
        self.credentials.host()
    }

    pub fn db_path(&self) -> PathBuf {
        self.kiln_dir.join("db.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.kiln_dir.join("logs")
    }

    pub fn is_allowed(&self, username: &str) -> bool {
        username == self.allowed_username
    }

    pub fn is_team_member(&self, username: &str) -> bool {
        self.team_usernames.iter().any(|u| u == username)
    }

    /// Load from `<kiln_dir>/config`, overlaying process environment
    /// variables on top of file values.
    pub fn load(kiln_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = kiln_dir.join("config");
        let mut map = if config_path.exists() {
            parse_config_file(&config_path)?
        } else {
            HashMap::new()
        };
        for key in KNOWN_KEYS {
            if let Ok(value) = std::env::var(key) {
                map.insert((*key).to_string(), value);
            }
        }
        Self::from_map(map, kiln_dir)
    }

    fn from_map(map: HashMap<String, String>, kiln_dir: &Path) -> Result<Self, ConfigError> {
        let get = |key: &str| map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let github_token = get("GITHUB_TOKEN");
        let ghes_host = get("GITHUB_ENTERPRISE_HOST");
        let credentials = match (github_token, ghes_host) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingHosts),
            (Some(token), None) => Credentials::GithubCom {
                token: token.to_string(),
            },
            (None, Some(host)) => Credentials::Enterprise {
                host: host.to_string(),
                token: get("GITHUB_ENTERPRISE_TOKEN")
                    .ok_or(ConfigError::MissingKey("GITHUB_ENTERPRISE_TOKEN"))?
                    .to_string(),
                user: get("GITHUB_ENTERPRISE_USER")
                    .ok_or(ConfigError::MissingKey("GITHUB_ENTERPRISE_USER"))?
                    .to_string(),
            },
            (None, None) => return Err(ConfigError::MissingKey("GITHUB_TOKEN")),
        };

        let project_urls: Vec<String> = get("PROJECT_URLS")
            .ok_or(ConfigError::MissingKey("PROJECT_URLS"))?
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();
        if project_urls.is_empty() {
            return Err(ConfigError::MissingKey("PROJECT_URLS"));
        }
        for url in &project_urls {
            if !url_belongs_to_host(url, credentials.host()) {
                return Err(ConfigError::ProjectHostMismatch {
                    url: url.clone(),
                    host: credentials.host().to_string(),
                });
            }
        }

        let allowed_username = get("ALLOWED_USERNAME")
            .ok_or(ConfigError::MissingKey("ALLOWED_USERNAME"))?
            .to_string();
        let team_usernames = get("USERNAMES_TEAM")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let watched_statuses = get("WATCHED_STATUSES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|| vec!["Research".into(), "Plan".into(), "Implement".into()]);

        Ok(Self {
            credentials,
            project_urls,
            allowed_username,
            team_usernames,
            poll_interval: Duration::from_secs(parse_u64(
                &map,
                "POLL_INTERVAL",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            watched_statuses,
            max_concurrent_workflows: parse_u64(
                &map,
                "MAX_CONCURRENT_WORKFLOWS",
                DEFAULT_MAX_CONCURRENT_WORKFLOWS as u64,
            )? as usize,
            stage_models: get("STAGE_MODELS")
                .map(StageModels::parse)
                .transpose()?
                .unwrap_or_default(),
            executor_cmd: get("EXECUTOR_CMD")
                .unwrap_or(DEFAULT_EXECUTOR_CMD)
                .to_string(),
            workspaces_dir: get("WORKSPACES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("workspaces")),
            kiln_dir: kiln_dir.to_path_buf(),
            workflow_timeout: Duration::from_secs(parse_u64(
                &map,
                "WORKFLOW_TIMEOUT",
                DEFAULT_WORKFLOW_TIMEOUT_SECS,
            )?),
            idle_timeout: Duration::from_secs(parse_u64(
                &map,
                "IDLE_TIMEOUT",
                DEFAULT_IDLE_TIMEOUT_SECS,
            )?),
            shutdown_grace: Duration::from_secs(parse_u64(
                &map,
                "SHUTDOWN_GRACE",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )?),
            ghes_logs_mask: get("GHES_LOGS_MASK").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            mcp_config: get("MCP_CONFIG").map(PathBuf::from),
        })
    }
}

const KNOWN_KEYS: &[&str] = &[
    "GITHUB_TOKEN",
    "GITHUB_ENTERPRISE_HOST",
    "GITHUB_ENTERPRISE_TOKEN",
    "GITHUB_ENTERPRISE_USER",
    "PROJECT_URLS",
    "ALLOWED_USERNAME",
    "USERNAMES_TEAM",
    "POLL_INTERVAL",
    "WATCHED_STATUSES",
    "MAX_CONCURRENT_WORKFLOWS",
    "STAGE_MODELS",
    "EXECUTOR_CMD",
    "WORKSPACES_DIR",
    "WORKFLOW_TIMEOUT",
    "IDLE_TIMEOUT",
    "SHUTDOWN_GRACE",
    "GHES_LOGS_MASK",
    "MCP_CONFIG",
];

/// Parse a `KEY=VALUE` file. Blank lines and `#` comments are skipped;
/// anything else without an `=` is an error.
pub fn parse_config_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;

    let mut map = HashMap::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::InvalidLine {
            line: idx + 1,
            content: line.to_string(),
        })?;
        map.insert(
            key.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    Ok(map)
}

fn parse_u64(
    map: &HashMap<String, String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected a non-negative integer".to_string(),
        }),
        None => Ok(default),
    }
}

fn url_belongs_to_host(url: &str, host: &str) -> bool {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .map(|rest| {
            rest.strip_prefix(host)
                .is_some_and(|tail| tail.is_empty() || tail.starts_with('/'))
        })
        .unwrap_or(false)
}
