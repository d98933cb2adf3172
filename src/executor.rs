//! Supervision of the external code-generation CLI.
//!
//! One run = one subprocess: prompt on stdin, stream-json on stdout. The
//! runner pumps stdout into the per-run log line by line, extracts the
//! executor's session id, and enforces a wall-clock timeout, an
//! idle-output timeout and cooperative cancellation (SIGTERM, grace wait,
//! SIGKILL). Transient failures are retried with backoff; anything else
//! is terminal.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ExecutorError;
use crate::logging::RunLogger;

/// Backoff schedule for transient executor failures: 2 retries.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_secs(30), Duration::from_secs(90)];

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How many trailing stdout lines are inspected to classify a non-zero
/// exit as transient.
const TAIL_LINES: usize = 40;

/// Output markers indicating a network or authentication hiccup worth
/// retrying. The executor contract publishes no exit-code table, so this
/// list is deliberately one constant that can be refreshed alongside the
/// session-id regex below.
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "network error",
    "connection reset",
    "connection refused",
    "timed out",
    "temporarily unavailable",
    "overloaded",
    "authentication_error",
    "401",
    "529",
];

/// Fallback for plain-text session markers when the stream-json field is
/// absent. Opaque by design: refresh when the executor contract changes.
static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)session[_ -]?id[:=]\s*([0-9a-fA-F][0-9a-fA-F-]{7,})").expect("valid regex")
});

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Executor binary or path.
    pub cmd: String,
    pub wall_timeout: Duration,
    pub idle_timeout: Duration,
}

/// One materialized invocation.
#[derive(Debug, Clone)]
pub struct ExecutorRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub cwd: PathBuf,
    pub resume_session: Option<String>,
    pub mcp_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorOutcome {
    pub session_id: Option<String>,
}

pub struct ExecutorRunner {
    config: ExecutorConfig,
}

impl ExecutorRunner {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Run the executor, retrying transient failures per the backoff
    /// schedule. Timeouts and cancellation are never retried.
    pub async fn run(
        &self,
        request: &ExecutorRequest,
        log: &RunLogger,
        cancel: &CancellationToken,
    ) -> Result<ExecutorOutcome, ExecutorError> {
        let mut attempt = 0;
        loop {
            match self.run_once(request, log, cancel).await {
                Err(ExecutorError::NonZeroExit { exit_code }) if attempt < RETRY_BACKOFF.len() => {
                    // classified transient by run_once via marker scan
                    let delay = RETRY_BACKOFF[attempt];
                    attempt += 1;
                    warn!(
                        exit_code,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "transient executor failure, backing off"
                    );
                    log.append_line(&format!(
                        "[kiln] transient failure (exit {exit_code}), retry {attempt} in {}s",
                        delay.as_secs()
                    ))
                    .map_err(ExecutorError::Other)?;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    async fn run_once(
        &self,
        request: &ExecutorRequest,
        log: &RunLogger,
        cancel: &CancellationToken,
    ) -> Result<ExecutorOutcome, ExecutorError> {
        let mut cmd = Command::new(&self.config.cmd);
        cmd.args(["--print", "--output-format", "stream-json"]);
        if let Some(model) = &request.model {
            cmd.args(["--model", model]);
        }
        if let Some(session) = &request.resume_session {
            cmd.args(["--resume", session]);
            debug!(session, "resuming executor session");
        }
        if let Some(mcp) = &request.mcp_config {
            cmd.arg("--mcp-config").arg(mcp);
        }
        cmd.current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ExecutorError::Spawn)?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        stdin
            .write_all(request.prompt.as_bytes())
            .await
            .map_err(|e| ExecutorError::Other(e.into()))?;
        drop(stdin);

        // stderr is pumped independently; idle detection watches stdout
        // only, matching the executor's progress-stream contract.
        let stderr = child.stderr.take().expect("stderr piped");
        let stderr_log = log.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_log.append_line(&format!("[stderr] {line}"));
            }
        });

        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::Instant::now() + self.config.wall_timeout;
        let mut session_id: Option<String> = None;
        let mut tail: Vec<String> = Vec::new();

        let exit_status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    stderr_task.abort();
                    return Err(ExecutorError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    terminate(&mut child).await;
                    stderr_task.abort();
                    return Err(ExecutorError::Timeout {
                        limit_secs: self.config.wall_timeout.as_secs(),
                    });
                }
                line = tokio::time::timeout(self.config.idle_timeout, lines.next_line()) => {
                    match line {
                        Err(_) => {
                            terminate(&mut child).await;
                            stderr_task.abort();
                            return Err(ExecutorError::Idle {
                                limit_secs: self.config.idle_timeout.as_secs(),
                            });
                        }
                        Ok(Ok(Some(line))) => {
                            log.append_line(&line).map_err(ExecutorError::Other)?;
                            if session_id.is_none() {
                                session_id = extract_session_id(&line);
                                if let Some(id) = &session_id {
                                    debug!(session = id.as_str(), "captured executor session id");
                                }
                            }
                            tail.push(line);
                            if tail.len() > TAIL_LINES {
                                tail.remove(0);
                            }
                        }
                        Ok(Ok(None)) => {
                            break child
                                .wait()
                                .await
                                .map_err(|e| ExecutorError::Other(e.into()))?;
                        }
                        Ok(Err(e)) => {
                            terminate(&mut child).await;
                            stderr_task.abort();
                            return Err(ExecutorError::Other(e.into()));
                        }
                    }
                }
            }
        };

        let _ = stderr_task.await;

        if exit_status.success() {
            info!("executor exited cleanly");
            return Ok(ExecutorOutcome { session_id });
        }

        let exit_code = exit_status.code().unwrap_or(-1);
        if is_transient_failure(&tail) {
            Err(ExecutorError::NonZeroExit { exit_code })
        } else {
            // Bypass the retry loop: non-transient exits are terminal.
            Err(ExecutorError::Other(anyhow::anyhow!(
                "Executor exited with non-zero code {exit_code}"
            )))
        }
    }
}

/// SIGTERM, grace wait, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(TERMINATE_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
        warn!(pid, "executor ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
}

/// Pull a session id out of one output line: stream-json first, opaque
/// plain-text marker second.
fn extract_session_id(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.starts_with('{')
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
        && let Some(id) = value.get("session_id").and_then(|v| v.as_str())
        && !id.is_empty()
    {
        return Some(id.to_string());
    }
    SESSION_ID_RE
        .captures(trimmed)
        .map(|caps| caps[1].to_string())
}

fn is_transient_failure(tail: &[String]) -> bool {
    tail.iter().any(|line| {
        let lower = line.to_lowercase();
        TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::IssueRef;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("executor.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn runner(cmd: &PathBuf, wall: Duration, idle: Duration) -> ExecutorRunner {
        ExecutorRunner::new(ExecutorConfig {
            cmd: cmd.to_string_lossy().to_string(),
            wall_timeout: wall,
            idle_timeout: idle,
        })
    }

    fn request(cwd: &std::path::Path) -> ExecutorRequest {
        ExecutorRequest {
            prompt: "do the thing".to_string(),
            model: Some("sonnet".to_string()),
            cwd: cwd.to_path_buf(),
            resume_session: None,
            mcp_config: None,
        }
    }

    fn run_log(dir: &std::path::Path) -> RunLogger {
        let key = IssueRef::new("github.com", "acme", "web", 1);
        RunLogger::create(dir, &key, "research", None).unwrap()
    }

    #[tokio::test]
    async fn success_captures_session_id_and_logs_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"system","session_id":"abc-123-def"}'
echo '{"type":"result","subtype":"success"}'"#,
        );
        let log = run_log(dir.path());
        let runner = runner(&script, Duration::from_secs(10), Duration::from_secs(10));

        let outcome = runner
            .run(&request(dir.path()), &log, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.session_id.as_deref(), Some("abc-123-def"));

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("\"session_id\":\"abc-123-def\""));
    }

    #[tokio::test]
    async fn non_transient_failure_is_terminal_without_retries() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "cat > /dev/null\necho 'boom'\nexit 3");
        let log = run_log(dir.path());
        let runner = runner(&script, Duration::from_secs(10), Duration::from_secs(10));

        let start = std::time::Instant::now();
        let err = runner
            .run(&request(dir.path()), &log, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Other(_)), "got {err:?}");
        // No 30s backoff happened.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn wall_timeout_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "cat > /dev/null\nwhile true; do echo tick; sleep 0.05; done");
        let log = run_log(dir.path());
        let runner = runner(&script, Duration::from_millis(300), Duration::from_secs(5));

        let err = runner
            .run(&request(dir.path()), &log, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_output_stalls() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "cat > /dev/null\necho started\nsleep 30");
        let log = run_log(dir.path());
        let runner = runner(&script, Duration::from_secs(30), Duration::from_millis(300));

        let err = runner
            .run(&request(dir.path()), &log, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Idle { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "cat > /dev/null\nwhile true; do echo tick; sleep 0.05; done");
        let log = run_log(dir.path());
        let runner = runner(&script, Duration::from_secs(30), Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let err = runner
            .run(&request(dir.path()), &log, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled), "got {err:?}");
    }

    #[test]
    fn session_id_extraction_prefers_stream_json() {
        assert_eq!(
            extract_session_id(r#"{"type":"assistant","session_id":"s-1"}"#),
            Some("s-1".to_string())
        );
        assert_eq!(
            extract_session_id("resuming with session_id: deadbeef-1234"),
            Some("deadbeef-1234".to_string())
        );
        assert_eq!(extract_session_id("no marker here"), None);
    }

    #[test]
    fn transient_classification_scans_the_tail() {
        assert!(is_transient_failure(&["api error: rate limit exceeded".into()]));
        assert!(is_transient_failure(&["HTTP 529 overloaded".into()]));
        assert!(!is_transient_failure(&["assertion failed".into()]));
    }
}
