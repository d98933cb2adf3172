//! Workflow definitions and the uniform four-phase execution.
//!
//! Each workflow is a tagged variant carrying its static policy: label
//! triplet, model key, prompt template and owning column. Execution is
//! the same shape for every stage — acquire the running label and a run
//! row, make sure the workspace exists, drive the executor, then settle
//! labels and the run row. Label writes are ordered add-ready →
//! remove-running (add-failed → remove-running on the error path) so an
//! observer never catches the issue with no kiln label mid-transition.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StageModels;
use crate::db::RunOutcome;
use crate::engine::EngineCtx;
use crate::errors::ExecutorError;
use crate::executor::ExecutorRequest;
use crate::labels;
use crate::logging::{MaskingFilter, RunLogger};
use crate::regions::{self, RegionKind};
use crate::ticket::{Issue, PrState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Workflow {
    Prepare,
    Research,
    Plan,
    Implement,
    ProcessComments,
}

impl Workflow {
    pub fn name(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::ProcessComments => "process_comments",
        }
    }

    /// The column that triggers this workflow, for column-bound stages.
    pub fn column(self) -> Option<&'static str> {
        match self {
            Self::Research => Some("Research"),
            Self::Plan => Some("Plan"),
            Self::Implement => Some("Implement"),
            Self::Prepare | Self::ProcessComments => None,
        }
    }

    pub fn for_status(status: &str) -> Option<Self> {
        match status {
            "Research" => Some(Self::Research),
            "Plan" => Some(Self::Plan),
            "Implement" => Some(Self::Implement),
            _ => None,
        }
    }

    /// Which stage a stale running label belongs to (crash recovery).
    pub fn for_running_label(label: &str) -> Option<Self> {
        match label {
            labels::PREPARING => Some(Self::Prepare),
            labels::RESEARCHING => Some(Self::Research),
            labels::PLANNING => Some(Self::Plan),
            labels::IMPLEMENTING => Some(Self::Implement),
            labels::EDITING => Some(Self::ProcessComments),
            _ => None,
        }
    }

    pub fn running_label(self) -> &'static str {
        match self {
            Self::Prepare => labels::PREPARING,
            Self::Research => labels::RESEARCHING,
            Self::Plan => labels::PLANNING,
            Self::Implement => labels::IMPLEMENTING,
            Self::ProcessComments => labels::EDITING,
        }
    }

    pub fn ready_label(self) -> Option<&'static str> {
        match self {
            Self::Research => Some(labels::RESEARCH_READY),
            Self::Plan => Some(labels::PLAN_READY),
            _ => None,
        }
    }

    pub fn failed_label(self) -> Option<&'static str> {
        match self {
            Self::Research => Some(labels::RESEARCH_FAILED),
            Self::Plan => Some(labels::PLAN_FAILED),
            Self::Implement => Some(labels::IMPLEMENTATION_FAILED),
            Self::Prepare | Self::ProcessComments => None,
        }
    }

    /// Column an issue under `yolo` advances to once this stage is ready.
    pub fn yolo_next_status(self) -> Option<&'static str> {
        match self {
            Self::Research => Some("Plan"),
            Self::Plan => Some("Implement"),
            _ => None,
        }
    }

    pub fn model(self, models: &StageModels) -> Option<String> {
        match self {
            Self::Prepare => models.prepare.clone(),
            Self::Research => models.research.clone(),
            Self::Plan => models.plan.clone(),
            Self::Implement => models.implement.clone(),
            Self::ProcessComments => models.process_comments.clone(),
        }
    }

    /// Executor prompt for this stage, or `None` for stages the daemon
    /// performs natively (Prepare is pure workspace preparation).
    pub fn prompt(self, issue: &Issue, extra: Option<&PromptExtras>) -> Option<String> {
        let url = issue.key.html_url();
        match self {
            Self::Prepare => None,
            Self::Research => Some(format!(
                "Research the codebase for issue {url}. Read the issue, explore the \
                 relevant parts of this repository, and edit the issue DESCRIPTION to \
                 append a research section — replace the existing section if the \
                 description already contains `{open}`. The research section MUST be \
                 wrapped in `{open}` and `{close}` markers.",
                open = RegionKind::Research.open_marker(),
                close = RegionKind::Research.close_marker(),
            )),
            Self::Plan => Some(format!(
                "Create an implementation plan for issue {url} from the research \
                 section in its description. Break the work into numbered TASK items \
                 with checkboxes. Edit the issue DESCRIPTION to append the plan — \
                 replace the existing section if the description already contains \
                 `{open}`. The plan MUST be wrapped in `{open}` and `{close}` markers.",
                open = RegionKind::Plan.open_marker(),
                close = RegionKind::Plan.close_marker(),
            )),
            Self::Implement => Some(format!(
                "Implement the plan for issue {url}. Work in the current directory, \
                 which is a dedicated worktree on this issue's branch. Follow the plan \
                 section in the issue description task by task, committing as you \
                 complete each one. When done, push the branch and open a pull request \
                 whose description contains `Closes #{number}`; open it as a draft and \
                 mark it ready for review once every task checkbox is checked.",
                number = issue.key.number,
            )),
            Self::ProcessComments => {
                let extra = extra?;
                let target = extra.target?;
                Some(format!(
                    "A user left feedback on issue {url}. Apply it to the {target} \
                     section of the issue description: rewrite the content between \
                     `{open}` and `{close}`, keeping the markers in place and leaving \
                     the rest of the description untouched.\n\nFeedback:\n{body}",
                    open = target.open_marker(),
                    close = target.close_marker(),
                    body = extra.comment_body.as_deref().unwrap_or_default(),
                ))
            }
        }
    }
}

/// Stage-specific prompt inputs beyond the issue itself.
#[derive(Debug, Clone, Default)]
pub struct PromptExtras {
    pub comment_body: Option<String>,
    pub target: Option<RegionKind>,
}

/// Run one workflow to completion for an issue. Returns the terminal run
/// outcome; tracker/API errors during the choreography are returned as
/// errors and leave the next tick to reconcile.
pub async fn run_workflow(
    workflow: Workflow,
    issue: &Issue,
    ctx: &EngineCtx,
    cancel: &CancellationToken,
    extra: Option<PromptExtras>,
) -> anyhow::Result<RunOutcome> {
    let key = &issue.key;
    let running_label = workflow.running_label();

    // Acquire: running label first (the soft lock other daemons and the
    // next tick observe), then the run row.
    ctx.tickets.add_label(key, running_label).await?;

    let masking = masking_filter(ctx);
    let log = RunLogger::create(&ctx.config.logs_dir(), key, workflow.name(), masking)?;
    let log_path = log.path().to_string_lossy().to_string();
    let run_id = {
        let key = key.clone();
        let workflow_name = workflow.name().to_string();
        ctx.db
            .call(move |db| db.insert_run(&key, &workflow_name, Some(&log_path)))
            .await?
    };
    info!(issue = %key, workflow = workflow.name(), run_id, "workflow started");

    let result = drive(workflow, issue, ctx, cancel, &log, extra).await;
    settle(workflow, issue, ctx, run_id, &log, result).await
}

/// Phases 2 and 3: workspace preparation and the executor invocation.
async fn drive(
    workflow: Workflow,
    issue: &Issue,
    ctx: &EngineCtx,
    cancel: &CancellationToken,
    log: &RunLogger,
    extra: Option<PromptExtras>,
) -> Result<Option<String>, ExecutorError> {
    let key = &issue.key;

    // Implicit prepare: any stage creates the worktree if missing. The
    // stage's own running label already marks the issue as busy, so no
    // second running label is written — `preparing` belongs to the
    // Prepare workflow alone.
    let workspace = if ctx.workspaces.worktree_exists(key) {
        ctx.workspaces.worktree_path(key)
    } else {
        let clone_url = format!("https://{}/{}.git", key.host, key.repo_slug());
        ctx.workspaces
            .ensure_for_issue(key, &issue.title, &clone_url, None)
            .await
            .map_err(|e| ExecutorError::Other(e.into()))?
    };

    let Some(prompt) = workflow.prompt(issue, extra.as_ref()) else {
        return Ok(None); // native stage, nothing to execute
    };

    let resume_session = {
        let key = key.clone();
        let workflow_name = workflow.name().to_string();
        ctx.db
            .call(move |db| db.get_session(&key, &workflow_name))
            .await
            .map_err(ExecutorError::Other)?
    };

    let request = ExecutorRequest {
        prompt,
        model: workflow.model(&ctx.config.stage_models),
        cwd: workspace,
        resume_session,
        mcp_config: ctx.config.mcp_config.clone(),
    };
    ctx.executor
        .run(&request, log, cancel)
        .await
        .map(|outcome| outcome.session_id)
}

/// Phase 4: interpret the result, write labels in add-before-remove
/// order, and finish the run row.
async fn settle(
    workflow: Workflow,
    issue: &Issue,
    ctx: &EngineCtx,
    run_id: i64,
    log: &RunLogger,
    result: Result<Option<String>, ExecutorError>,
) -> anyhow::Result<RunOutcome> {
    let key = &issue.key;
    let running_label = workflow.running_label();
    let mut run_session: Option<String> = None;

    let outcome = match result {
        Ok(session_id) => {
            run_session = session_id.clone();
            if let Some(id) = &session_id {
                let owned_key = key.clone();
                let workflow_name = workflow.name().to_string();
                let session = id.clone();
                ctx.db
                    .call(move |db| db.set_session(&owned_key, &workflow_name, &session))
                    .await?;
                log.write_session_file(id)?;
            }

            match verify_stage_artifact(workflow, issue, ctx).await? {
                StageVerdict::Ok => {
                    if let Some(ready) = workflow.ready_label() {
                        ctx.tickets.add_label(key, ready).await?;
                    }
                    if workflow == Workflow::Implement {
                        // implementing hands over to reviewing while the
                        // PR sits in draft.
                        ctx.tickets.add_label(key, labels::REVIEWING).await?;
                    }
                    ctx.tickets.remove_label(key, running_label).await?;
                    RunOutcome::Success
                }
                StageVerdict::Stalled => {
                    warn!(issue = %key, workflow = workflow.name(), "stage produced no artifact");
                    if let Some(failed) = workflow.failed_label() {
                        ctx.tickets.add_label(key, failed).await?;
                    }
                    ctx.tickets.remove_label(key, running_label).await?;
                    RunOutcome::Stalled
                }
                StageVerdict::MissingPr => {
                    warn!(issue = %key, "implement finished without a linked pull request");
                    if let Some(failed) = workflow.failed_label() {
                        ctx.tickets.add_label(key, failed).await?;
                    }
                    ctx.tickets.remove_label(key, running_label).await?;
                    RunOutcome::Failure
                }
            }
        }
        Err(error) => {
            let outcome = match &error {
                ExecutorError::Cancelled => RunOutcome::Cancelled,
                e if e.is_timeout() => RunOutcome::Timeout,
                _ => RunOutcome::Failure,
            };
            warn!(issue = %key, workflow = workflow.name(), %error, "workflow failed");
            let _ = log.append_line(&format!("[kiln] {error}"));
            // Cancellation is not a stage failure: reset or shutdown is
            // already rewriting the labels.
            if outcome != RunOutcome::Cancelled
                && let Some(failed) = workflow.failed_label()
            {
                ctx.tickets.add_label(key, failed).await?;
            }
            ctx.tickets.remove_label(key, running_label).await?;
            outcome
        }
    };

    // A failure under yolo halts auto-progression: swap the label for
    // yolo_failed, unless the user already withdrew it.
    if matches!(
        outcome,
        RunOutcome::Failure | RunOutcome::Timeout | RunOutcome::Stalled
    ) && issue.has_label(labels::YOLO)
    {
        let fresh = ctx.tickets.get_labels(key).await?;
        if fresh.contains(labels::YOLO) {
            ctx.tickets.add_label(key, labels::YOLO_FAILED).await?;
            ctx.tickets.remove_label(key, labels::YOLO).await?;
            warn!(issue = %key, "yolo: stage failed, halting auto-progression");
        }
    }

    ctx.db
        .call(move |db| db.finish_run(run_id, outcome, run_session.as_deref()))
        .await?;
    info!(issue = %key, workflow = workflow.name(), run_id, outcome = outcome.as_str(), "workflow settled");
    Ok(outcome)
}

enum StageVerdict {
    Ok,
    /// Executor exited 0 but the required artifact is missing.
    Stalled,
    MissingPr,
}

async fn verify_stage_artifact(
    workflow: Workflow,
    issue: &Issue,
    ctx: &EngineCtx,
) -> anyhow::Result<StageVerdict> {
    match workflow {
        Workflow::Research => {
            let body = ctx.tickets.get_body(&issue.key).await?;
            if regions::contains(&body, RegionKind::Research) {
                Ok(StageVerdict::Ok)
            } else {
                Ok(StageVerdict::Stalled)
            }
        }
        Workflow::Implement => {
            let prs = ctx.tickets.find_linked_prs(&issue.key).await?;
            if prs.iter().any(|pr| pr.state != PrState::Closed) {
                Ok(StageVerdict::Ok)
            } else {
                Ok(StageVerdict::MissingPr)
            }
        }
        _ => Ok(StageVerdict::Ok),
    }
}

fn masking_filter(ctx: &EngineCtx) -> Option<MaskingFilter> {
    if !ctx.config.ghes_logs_mask || !ctx.config.credentials.is_enterprise() {
        return None;
    }
    let org = ctx
        .config
        .project_urls
        .first()
        .and_then(|url| extract_org(url));
    Some(MaskingFilter::new(ctx.config.host(), org.as_deref()))
}

/// `https://host/orgs/<org>/projects/N` → `<org>`.
fn extract_org(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let mut segments = rest.split('/').skip(1);
    match segments.next()? {
        "orgs" | "users" => segments.next().map(String::from),
        _ => None,
    }
}
