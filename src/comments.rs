//! Comment-driven iteration on research and plan sections.
//!
//! A pending comment is the earliest comment on an issue in Research or
//! Plan that was written by the allowed user, is not one of the daemon's
//! own posts, and is absent from the processed-comment ledger. Processing
//! runs the ProcessComments workflow and reports back with reactions and
//! a diff reply; the ledger row is written only on a terminal outcome so
//! a crash mid-run retries safely.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::RunOutcome;
use crate::engine::EngineCtx;
use crate::regions::{self, RegionKind};
use crate::ticket::{Comment, Issue, Reaction};
use crate::workflow::{self, PromptExtras, Workflow};

/// Marker identifying the daemon's own reply comments.
pub const REPLY_MARKER: &str = "<!-- kiln:reply -->";

/// True for comments the daemon must never treat as feedback: its own
/// replies and anything carrying a managed region.
fn is_kiln_post(body: &str) -> bool {
    body.contains(REPLY_MARKER)
        || RegionKind::all()
            .into_iter()
            .any(|kind| body.contains(kind.open_marker()))
}

/// Which section a comment on this issue edits.
fn target_region(issue: &Issue) -> RegionKind {
    if issue.status_is("Plan") {
        RegionKind::Plan
    } else {
        RegionKind::Research
    }
}

/// The earliest unprocessed authorized comment, if any.
pub async fn pending_comment(
    issue: &Issue,
    ctx: &EngineCtx,
) -> anyhow::Result<Option<Comment>> {
    if issue.comment_count == 0 {
        return Ok(None);
    }

    let comments = ctx.tickets.list_comments_since(&issue.key, None).await?;
    let mut candidates: Vec<Comment> = Vec::new();
    for comment in comments {
        if comment.author != ctx.config.allowed_username {
            if ctx.config.is_team_member(&comment.author) {
                debug!(issue = %issue.key, author = comment.author, "team comment observed silently");
            } else if !is_kiln_post(&comment.body) {
                warn!(
                    issue = %issue.key,
                    author = comment.author,
                    "BLOCKED: comment from non-allowed user ignored"
                );
            }
            continue;
        }
        if is_kiln_post(&comment.body) {
            continue;
        }
        candidates.push(comment);
    }
    candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    for comment in candidates {
        let key = issue.key.clone();
        let id = comment.id.clone();
        let processed = ctx
            .db
            .call(move |db| db.is_comment_processed(&key, &id))
            .await?;
        if !processed {
            return Ok(Some(comment));
        }
    }
    Ok(None)
}

/// Process one pending comment end to end.
pub async fn process_comment(
    issue: &Issue,
    comment: &Comment,
    ctx: &EngineCtx,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let key = &issue.key;
    let target = target_region(issue);
    info!(issue = %key, comment = comment.id, target = %target, "processing comment");

    // Seen: the user gets feedback before the run starts.
    ctx.tickets
        .add_reaction(key, &comment.id, Reaction::Eyes)
        .await?;

    let before = ctx
        .tickets
        .get_body(key)
        .await
        .map(|body| {
            regions::extract(&body, target)
                .unwrap_or_default()
                .to_string()
        })
        .unwrap_or_default();

    let extras = PromptExtras {
        comment_body: Some(comment.body.clone()),
        target: Some(target),
    };
    let outcome =
        workflow::run_workflow(Workflow::ProcessComments, issue, ctx, cancel, Some(extras))
            .await?;

    if outcome == RunOutcome::Cancelled {
        // Not terminal: the ledger stays empty and the next poll retries.
        return Ok(());
    }

    // Terminal outcome: the ledger write comes first so a crash between
    // here and the reactions cannot double-process the comment.
    {
        let owned_key = key.clone();
        let id = comment.id.clone();
        ctx.db
            .call(move |db| db.mark_comment_processed(&owned_key, &id))
            .await?;
    }

    if outcome == RunOutcome::Success {
        let after = ctx
            .tickets
            .get_body(key)
            .await
            .map(|body| {
                regions::extract(&body, target)
                    .unwrap_or_default()
                    .to_string()
            })
            .unwrap_or_default();
        ctx.tickets
            .post_comment(key, &reply_body(target, &before, &after))
            .await?;
        ctx.tickets
            .add_reaction(key, &comment.id, Reaction::ThumbsUp)
            .await?;
    } else {
        ctx.tickets
            .add_reaction(key, &comment.id, Reaction::Confused)
            .await?;
    }
    Ok(())
}

/// Reply comment showing what changed, collapsed behind a details block.
fn reply_body(target: RegionKind, before: &str, after: &str) -> String {
    let diff = regions::line_diff(before, after);
    if diff.is_empty() {
        return format!(
            "{REPLY_MARKER}\nProcessed feedback for **{target}**. \
             No textual changes detected."
        );
    }
    format!(
        "{REPLY_MARKER}\nApplied changes to **{target}**:\n\n\
         <details>\n<summary>Diff</summary>\n\n\
         <pre lang=\"diff\">\n{}\n</pre>\n\n</details>",
        escape_html(diff.trim_end())
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
