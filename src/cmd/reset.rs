use std::path::Path;

use anyhow::{Context, Result};

use kiln::config::Config;
use kiln::labels;
use kiln::ticket::{GithubClient, IssueRef, TicketClient};

/// Apply the `reset` label; the running daemon performs the teardown on
/// its next tick.
pub async fn execute(kiln_dir: &Path, issue: &str) -> Result<()> {
    let key: IssueRef = issue
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("expected host/owner/repo#N")?;
    let config = Config::load(kiln_dir).context("invalid configuration")?;
    anyhow::ensure!(
        key.host == config.host(),
        "issue host {} does not match configured host {}",
        key.host,
        config.host()
    );

    let client = GithubClient::new(&config.credentials)?;
    client.add_label(&key, labels::RESET).await?;
    println!("reset label applied to {key}");
    Ok(())
}
