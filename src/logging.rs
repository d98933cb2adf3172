//! Daemon diagnostics and per-run product logs.
//!
//! Two separate concerns:
//!
//! - **Tracing (diagnostics)**: `RUST_LOG`-filtered spans and events on
//!   stderr. Not persisted, not part of the product output.
//! - **Run logs (product artifacts)**: one file per executor run under
//!   `.kiln/logs/<host>/<owner>/<repo>/<issue>/`, always written,
//!   line-flushed so a crash loses at most the line in flight. A
//!   companion `.session` file stores the executor session id.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ticket::IssueRef;

/// Initialize the tracing subscriber. Reads `RUST_LOG`, defaults to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Redacts the enterprise hostname and organization name from run-log
/// lines before they reach disk.
#[derive(Debug, Clone)]
pub struct MaskingFilter {
    hostname: String,
    org: Option<String>,
}

impl MaskingFilter {
    pub fn new(hostname: &str, org: Option<&str>) -> Self {
        Self {
            hostname: hostname.to_string(),
            org: org.map(String::from),
        }
    }

    pub fn apply(&self, line: &str) -> String {
        let mut masked = line.replace(&self.hostname, "***");
        if let Some(org) = &self.org {
            masked = masked.replace(org.as_str(), "***");
        }
        masked
    }
}

/// Append-only log file for a single executor run.
///
/// Cloneable handle; writes are serialized by an internal lock and each
/// line is flushed before the write returns.
#[derive(Clone)]
pub struct RunLogger {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    masking: Option<MaskingFilter>,
}

impl RunLogger {
    /// Create `<base>/<host>/<owner>/<repo>/<issue>/<workflow>-<YYYYMMDD-HHMM>.log`.
    pub fn create(
        base_dir: &Path,
        issue: &IssueRef,
        workflow: &str,
        masking: Option<MaskingFilter>,
    ) -> Result<Self> {
        let dir = base_dir
            .join(&issue.host)
            .join(&issue.owner)
            .join(&issue.repo)
            .join(issue.number.to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log dir {}", dir.display()))?;

        let stamp = Utc::now().format("%Y%m%d-%H%M");
        let path = dir.join(format!("{workflow}-{stamp}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open run log {}", path.display()))?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
            masking,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_line(&self, line: &str) -> Result<()> {
        let rendered = match &self.masking {
            Some(filter) => filter.apply(line),
            None => line.to_string(),
        };
        let mut file = self
            .file
            .lock()
            .map_err(|e| anyhow::anyhow!("Run log lock poisoned: {e}"))?;
        writeln!(file, "{rendered}").context("Failed to write run log line")?;
        file.flush().context("Failed to flush run log")?;
        Ok(())
    }

    /// Write the companion `.session` file next to the log.
    pub fn write_session_file(&self, session_id: &str) -> Result<()> {
        let path = self.path.with_extension("session");
        std::fs::write(&path, format!("{session_id}\n"))
            .with_context(|| format!("Failed to write session file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue() -> IssueRef {
        IssueRef::new("github.example.com", "acme", "web", 7)
    }

    #[test]
    fn run_log_lands_in_per_issue_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::create(dir.path(), &issue(), "research", None).unwrap();
        logger.append_line("hello").unwrap();

        let path = logger.path();
        assert!(path.starts_with(dir.path().join("github.example.com/acme/web/7")));
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("research-"));
        assert!(name.ends_with(".log"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello\n");
    }

    #[test]
    fn masking_redacts_host_and_org() {
        let dir = tempfile::tempdir().unwrap();
        let masking = MaskingFilter::new("github.example.com", Some("acme"));
        let logger =
            RunLogger::create(dir.path(), &issue(), "plan", Some(masking)).unwrap();
        logger
            .append_line("cloning https://github.example.com/acme/web.git")
            .unwrap();

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(!content.contains("github.example.com"));
        assert!(!content.contains("acme"));
        assert!(content.contains("cloning https://***/***/web.git"));
    }

    #[test]
    fn session_file_sits_next_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::create(dir.path(), &issue(), "implement", None).unwrap();
        logger.write_session_file("sess-42").unwrap();
        let session_path = logger.path().with_extension("session");
        assert_eq!(std::fs::read_to_string(session_path).unwrap(), "sess-42\n");
    }
}
