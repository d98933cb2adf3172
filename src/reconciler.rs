//! The reconciliation loop: observe every board, decide what each issue
//! needs, and hand actions to the dispatcher.
//!
//! Classification priority per issue: reset > crash recovery > comment
//! iteration > stage trigger > completion handling. Every issue is its
//! own fault domain — an error while classifying one is logged and the
//! tick moves on.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::comments;
use crate::dispatcher::Dispatcher;
use crate::engine::EngineCtx;
use crate::labels;
use crate::ticket::{Comment, Issue, PrState};
use crate::workflow::{self, Workflow};

pub struct Reconciler {
    ctx: EngineCtx,
    dispatcher: Arc<Dispatcher>,
    /// Rotates which project is listed first, round-robin across ticks.
    next_project: usize,
}

impl Reconciler {
    pub fn new(ctx: EngineCtx, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            ctx,
            dispatcher,
            next_project: 0,
        }
    }

    /// One reconciliation pass over every watched project. Returns an
    /// error only for fatal tracker failures (revoked or rescoped
    /// credentials); those shut the daemon down instead of burning a
    /// retry loop against a dead token.
    pub async fn tick(&mut self) -> anyhow::Result<()> {
        let urls = &self.ctx.config.project_urls;
        let start = self.next_project % urls.len();
        self.next_project = self.next_project.wrapping_add(1);

        let mut issues: Vec<Issue> = Vec::new();
        for offset in 0..urls.len() {
            let url = &urls[(start + offset) % urls.len()];
            match self.ctx.tickets.list_board_items(url).await {
                Ok(items) => {
                    debug!(project = url, count = items.len(), "fetched board items");
                    issues.extend(items);
                }
                Err(e) if e.is_fatal() => {
                    error!(project = url, error = %e, "fatal tracker error");
                    return Err(e.into());
                }
                Err(e) => error!(project = url, error = %e, "failed to list board items"),
            }
        }

        for issue in &issues {
            if let Err(e) = self.reconcile_issue(issue).await {
                warn!(issue = %issue.key, error = %e, "skipping issue this tick");
            }
        }
        debug!(issues = issues.len(), "tick completed");
        Ok(())
    }

    async fn reconcile_issue(&self, issue: &Issue) -> anyhow::Result<()> {
        // Reset first: unconditional, and it must win over anything the
        // issue is currently doing.
        if issue.has_label(labels::RESET) {
            return self.submit_reset(issue).await;
        }

        // An in-flight action owns the issue until it settles.
        if self.dispatcher.has_in_flight(&issue.key) {
            return Ok(());
        }

        if issue.is_closed() {
            return self.cleanup_if_needed(issue).await;
        }

        let Some(status) = issue.status.as_deref() else {
            info!(issue = %issue.key, "assigning statusless item to Backlog");
            self.ctx.tickets.move_status(issue, "Backlog").await?;
            return Ok(());
        };

        // Crash recovery: a running label with no in-memory action means
        // the daemon died mid-stage. Every stale running label is
        // examined — a stage label wins over `preparing`/`editing`, so a
        // crash can never route recovery to the wrong workflow. Re-entry
        // is at-least-once with idempotent writes.
        let stale: Vec<String> = issue
            .labels
            .iter()
            .filter(|l| labels::is_running_label(l))
            .cloned()
            .collect();
        if !stale.is_empty() {
            let mut reenter: Option<Workflow> = None;
            for label in &stale {
                match Workflow::for_running_label(label) {
                    Some(Workflow::Prepare) | Some(Workflow::ProcessComments) | None => {
                        // The comment ledger and implicit prepare already
                        // make these safe to re-drive; drop the marker.
                        info!(issue = %issue.key, label, "clearing stale running label");
                        self.ctx.tickets.remove_label(&issue.key, label).await?;
                    }
                    Some(stage) => reenter = Some(stage),
                }
            }
            if let Some(stage) = reenter {
                warn!(issue = %issue.key, stage = stage.name(), "crash recovery: re-entering stage");
                self.submit_stage(issue, stage);
                return Ok(());
            }
        }

        // Comment iteration, only while the issue sits in Research or Plan.
        if (status == "Research" || status == "Plan")
            && let Some(comment) = comments::pending_comment(issue, &self.ctx).await?
        {
            self.submit_comment(issue, comment);
            return Ok(());
        }

        match status {
            "Backlog" => self.maybe_promote_yolo(issue).await,
            "Done" => self.cleanup_if_needed(issue).await,
            _ => {
                if self.handle_pr_lifecycle(issue, status).await? {
                    return Ok(());
                }
                self.maybe_trigger_stage(issue, status).await
            }
        }
    }

    /// `yolo` on a Backlog issue starts auto-progression, provided an
    /// allow-listed user applied the label.
    async fn maybe_promote_yolo(&self, issue: &Issue) -> anyhow::Result<()> {
        if !issue.has_label(labels::YOLO) {
            return Ok(());
        }
        let actor = self
            .ctx
            .tickets
            .label_actor(&issue.key, labels::YOLO)
            .await?;
        match actor {
            Some(user) if self.ctx.config.is_allowed(&user) => {
                info!(issue = %issue.key, user, "yolo: promoting Backlog issue to Research");
                self.ctx.tickets.move_status(issue, "Research").await?;
            }
            Some(user) => {
                debug!(issue = %issue.key, user, "yolo label not applied by allowed user");
            }
            None => {
                warn!(issue = %issue.key, "yolo: cannot establish label actor, denying");
            }
        }
        Ok(())
    }

    /// Implement completion handling: `reviewing` clears when the PR
    /// leaves draft (issue → Validate); a merged or closed PR moves the
    /// issue to Done.
    async fn handle_pr_lifecycle(&self, issue: &Issue, status: &str) -> anyhow::Result<bool> {
        if !issue.has_label(labels::REVIEWING) && status != "Validate" {
            return Ok(false);
        }

        let prs = self.ctx.tickets.find_linked_prs(&issue.key).await?;
        if prs.iter().any(|pr| pr.state == PrState::Merged)
            || (!prs.is_empty() && prs.iter().all(|pr| pr.state == PrState::Closed))
        {
            info!(issue = %issue.key, "linked PR settled, moving to Done");
            if issue.has_label(labels::REVIEWING) {
                self.ctx
                    .tickets
                    .remove_label(&issue.key, labels::REVIEWING)
                    .await?;
            }
            self.ctx.tickets.move_status(issue, "Done").await?;
            return Ok(true);
        }

        if issue.has_label(labels::REVIEWING) {
            if let Some(pr) = prs.iter().find(|pr| pr.state == PrState::Open)
                && !pr.is_draft
            {
                info!(issue = %issue.key, pr = pr.number, "PR ready for review, moving to Validate");
                self.ctx.tickets.move_status(issue, "Validate").await?;
                self.ctx
                    .tickets
                    .remove_label(&issue.key, labels::REVIEWING)
                    .await?;
            }
            return Ok(true);
        }
        Ok(status == "Validate")
    }

    async fn maybe_trigger_stage(&self, issue: &Issue, status: &str) -> anyhow::Result<()> {
        if !self
            .ctx
            .config
            .watched_statuses
            .iter()
            .any(|s| s == status)
        {
            return Ok(());
        }
        let Some(stage) = Workflow::for_status(status) else {
            return Ok(());
        };

        // Trigger precondition: the stage's own running label must be
        // absent, or a zombie label would get a second concurrent run.
        if issue.has_label(stage.running_label()) {
            debug!(issue = %issue.key, label = stage.running_label(), "running label present, not triggering");
            return Ok(());
        }

        // Stage already complete: the only automated column move is the
        // yolo advance.
        if let Some(ready) = stage.ready_label()
            && issue.has_label(ready)
        {
            return self.maybe_advance_yolo(issue, stage).await;
        }

        if let Some(failed) = stage.failed_label()
            && issue.has_label(failed)
        {
            debug!(issue = %issue.key, label = failed, "stage previously failed, awaiting operator");
            return Ok(());
        }

        if !self.stage_authorized(issue, status).await? {
            return Ok(());
        }
        self.submit_stage(issue, stage);
        Ok(())
    }

    /// The authorization gate: whoever last moved the issue into this
    /// column must be the allowed user. Unknown actor denies.
    async fn stage_authorized(&self, issue: &Issue, status: &str) -> anyhow::Result<bool> {
        match self
            .ctx
            .tickets
            .last_status_change_actor(&issue.key)
            .await?
        {
            Some(actor) if self.ctx.config.is_allowed(&actor) => {
                info!(issue = %issue.key, status, actor, "stage trigger authorized");
                Ok(true)
            }
            Some(actor) => {
                if self.ctx.config.is_team_member(&actor) {
                    debug!(issue = %issue.key, actor, "move by team member, observing silently");
                } else {
                    warn!(issue = %issue.key, actor, "BLOCKED: move by non-allowed user");
                }
                Ok(false)
            }
            None => {
                warn!(issue = %issue.key, "cannot establish status actor, denying");
                Ok(false)
            }
        }
    }

    /// Advance a `yolo` issue whose current stage is ready, after a fresh
    /// check that the label is still present and was allow-listed.
    async fn maybe_advance_yolo(&self, issue: &Issue, stage: Workflow) -> anyhow::Result<()> {
        if !issue.has_label(labels::YOLO) {
            return Ok(());
        }
        let Some(next) = stage.yolo_next_status() else {
            return Ok(());
        };
        let fresh = self.ctx.tickets.get_labels(&issue.key).await?;
        if !fresh.contains(labels::YOLO) {
            debug!(issue = %issue.key, "yolo label removed since poll, not advancing");
            return Ok(());
        }
        match self
            .ctx
            .tickets
            .label_actor(&issue.key, labels::YOLO)
            .await?
        {
            Some(user) if self.ctx.config.is_allowed(&user) => {
                info!(issue = %issue.key, next, "yolo: advancing to next column");
                self.ctx.tickets.move_status(issue, next).await?;
            }
            _ => {
                debug!(issue = %issue.key, "yolo label actor not allowed, not advancing");
            }
        }
        Ok(())
    }

    /// Done and closed issues lose their worktree; `cleaned_up` is
    /// idempotently re-applied.
    async fn cleanup_if_needed(&self, issue: &Issue) -> anyhow::Result<()> {
        let key = &issue.key;
        if self.ctx.workspaces.worktree_exists(key) {
            let ctx = self.ctx.clone();
            let issue = issue.clone();
            self.dispatcher.try_submit(key, "cleanup", move |_cancel| {
                async move {
                    let key = issue.key.clone();
                    match ctx
                        .workspaces
                        .cleanup_for_issue(&key, &issue.title, false)
                        .await
                    {
                        Ok(()) => {
                            if let Err(e) = ctx.tickets.add_label(&key, labels::CLEANED_UP).await {
                                warn!(issue = %key, error = %e, "failed to apply cleaned_up label");
                            }
                        }
                        Err(e) => warn!(issue = %key, error = %e, "workspace cleanup failed"),
                    }
                }
            });
        } else if !issue.has_label(labels::CLEANED_UP) && !issue.is_closed() {
            self.ctx.tickets.add_label(key, labels::CLEANED_UP).await?;
        }
        Ok(())
    }

    /// Reset: cancel whatever is in flight, then dispatch the teardown.
    async fn submit_reset(&self, issue: &Issue) -> anyhow::Result<()> {
        self.dispatcher.cancel_issue(&issue.key).await;

        let ctx = self.ctx.clone();
        let issue = issue.clone();
        self.dispatcher
            .try_submit(&issue.key.clone(), "reset", move |_cancel| {
                async move {
                    if let Err(e) = run_reset(&issue, &ctx).await {
                        error!(issue = %issue.key, error = %e, "reset failed");
                    }
                }
            });
        Ok(())
    }

    fn submit_stage(&self, issue: &Issue, stage: Workflow) {
        let ctx = self.ctx.clone();
        let issue = issue.clone();
        self.dispatcher
            .try_submit(&issue.key.clone(), stage.name(), move |cancel| {
                async move {
                    if let Err(e) =
                        workflow::run_workflow(stage, &issue, &ctx, &cancel, None).await
                    {
                        error!(issue = %issue.key, stage = stage.name(), error = %e, "workflow error");
                    }
                }
            });
    }

    fn submit_comment(&self, issue: &Issue, comment: Comment) {
        let ctx = self.ctx.clone();
        let issue = issue.clone();
        self.dispatcher
            .try_submit(&issue.key.clone(), "process_comments", move |cancel| {
                async move {
                    if let Err(e) =
                        comments::process_comment(&issue, &comment, &ctx, &cancel).await
                    {
                        error!(issue = %issue.key, comment = comment.id, error = %e, "comment processing error");
                    }
                }
            });
    }
}

/// Tear an issue back down to Backlog: close PRs, delete branches, strip
/// regions and labels, drop the worktree and cached sessions.
pub async fn run_reset(issue: &Issue, ctx: &EngineCtx) -> anyhow::Result<()> {
    let key = &issue.key;
    info!(issue = %key, "reset started");

    let prs = ctx.tickets.find_linked_prs(key).await.unwrap_or_default();
    for pr in &prs {
        if pr.state == PrState::Open {
            if let Err(e) = ctx.tickets.close_pr(key, pr.number).await {
                warn!(issue = %key, pr = pr.number, error = %e, "failed to close PR");
            }
        }
        if pr.state != PrState::Merged
            && let Err(e) = ctx.tickets.delete_remote_branch(key, &pr.head_branch).await
        {
            warn!(issue = %key, branch = pr.head_branch, error = %e, "failed to delete remote branch");
        }
    }

    ctx.workspaces
        .cleanup_for_issue(key, &issue.title, true)
        .await?;

    let body = ctx.tickets.get_body(key).await?;
    let stripped = crate::regions::strip_all(&body);
    if stripped != body {
        ctx.tickets.update_body(key, &stripped).await?;
    }

    let current = ctx.tickets.get_labels(key).await?;
    for label in current.iter().filter(|l| labels::is_kiln_label(l)) {
        ctx.tickets.remove_label(key, label).await?;
    }

    {
        let owned_key = key.clone();
        ctx.db.call(move |db| db.clear_sessions(&owned_key)).await?;
    }

    ctx.tickets.move_status(issue, "Backlog").await?;
    // Dropping the reset label last signals completion to the operator.
    ctx.tickets.remove_label(key, labels::RESET).await?;
    info!(issue = %key, "reset completed");
    Ok(())
}
