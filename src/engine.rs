//! The engine root: owns every collaborator and runs the poll loop.
//!
//! There is no process-wide state — configuration, database handle,
//! ticket client, workspace manager and executor runner are threaded
//! explicitly from here.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::DbHandle;
use crate::dispatcher::Dispatcher;
use crate::executor::ExecutorRunner;
use crate::labels;
use crate::reconciler::Reconciler;
use crate::ticket::{IssueRef, TicketClient};
use crate::workspace::WorkspaceManager;

/// Shared context threaded through workflows, the reconciler and the
/// comment processor.
#[derive(Clone)]
pub struct EngineCtx {
    pub config: Arc<Config>,
    pub db: DbHandle,
    pub tickets: Arc<dyn TicketClient>,
    pub workspaces: Arc<WorkspaceManager>,
    pub executor: Arc<ExecutorRunner>,
}

pub struct Engine {
    ctx: EngineCtx,
    dispatcher: Arc<Dispatcher>,
    reconciler: Reconciler,
}

impl Engine {
    pub fn new(config: Config, tickets: Arc<dyn TicketClient>, db: DbHandle) -> Self {
        let config = Arc::new(config);
        let workspaces = Arc::new(WorkspaceManager::new(config.workspaces_dir.clone()));
        let executor = Arc::new(ExecutorRunner::new(crate::executor::ExecutorConfig {
            cmd: config.executor_cmd.clone(),
            wall_timeout: config.workflow_timeout,
            idle_timeout: config.idle_timeout,
        }));
        let ctx = EngineCtx {
            config: config.clone(),
            db,
            tickets,
            workspaces,
            executor,
        };
        let dispatcher = Arc::new(Dispatcher::new(config.max_concurrent_workflows));
        let reconciler = Reconciler::new(ctx.clone(), dispatcher.clone());
        Self {
            ctx,
            dispatcher,
            reconciler,
        }
    }

    /// Startup validation and bootstrap: credentials, orphaned run rows,
    /// and the label vocabulary in every watched repository.
    pub async fn bootstrap(&self) -> Result<()> {
        self.ctx
            .tickets
            .verify_credentials()
            .await
            .context("credential verification failed")?;
        info!(host = self.ctx.config.host(), "credentials verified");

        let orphaned = self.ctx.db.call(|db| db.cancel_orphaned_runs()).await?;
        if orphaned > 0 {
            warn!(orphaned, "marked leftover running runs as cancelled");
        }

        let mut repos: BTreeSet<IssueRef> = BTreeSet::new();
        for url in &self.ctx.config.project_urls {
            match self.ctx.tickets.list_board_items(url).await {
                Ok(items) => {
                    for item in items {
                        let mut key = item.key.clone();
                        key.number = 0; // one representative per repository
                        repos.insert(key);
                    }
                }
                Err(e) => warn!(project = url, error = %e, "could not enumerate repos for label bootstrap"),
            }
        }
        for repo in &repos {
            for spec in labels::REQUIRED_LABELS {
                if let Err(e) = self.ctx.tickets.ensure_repo_label(repo, spec).await {
                    warn!(repo = %repo.repo_slug(), label = spec.name, error = %e, "label bootstrap failed");
                }
            }
        }
        info!(repos = repos.len(), "label vocabulary bootstrapped");
        Ok(())
    }

    /// Run until a shutdown signal arrives, then drain within the grace
    /// period.
    pub async fn run(mut self) -> Result<()> {
        self.bootstrap().await?;
        info!(
            projects = self.ctx.config.project_urls.len(),
            interval_secs = self.ctx.config.poll_interval.as_secs(),
            "daemon started"
        );

        let outcome = loop {
            if let Err(e) = self.reconciler.tick().await {
                error!(error = %e, "fatal error, shutting down");
                break Err(e);
            }
            tokio::select! {
                _ = tokio::time::sleep(jittered(self.ctx.config.poll_interval)) => {}
                _ = shutdown_signal() => break Ok(()),
            }
        };

        info!("draining in-flight actions");
        self.dispatcher
            .shutdown(self.ctx.config.shutdown_grace)
            .await;
        info!("daemon stopped");
        outcome
    }
}

/// Poll interval with ±10% jitter so a fleet of daemons does not
/// synchronize against the API.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as i64;
    let spread = base_ms / 10;
    if spread == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base_ms + offset).max(1) as u64)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
