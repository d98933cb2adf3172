use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use kiln::config::Config;
use kiln::db::{DbHandle, KilnDb};
use kiln::engine::Engine;
use kiln::ticket::GithubClient;

/// Start the daemon. Exits non-zero on configuration or authentication
/// errors; exits zero on a clean signal-driven shutdown.
pub async fn execute(kiln_dir: &Path) -> Result<()> {
    let config = Config::load(kiln_dir).context("invalid configuration")?;
    let tickets = Arc::new(GithubClient::new(&config.credentials)?);
    let db = DbHandle::new(KilnDb::new(&config.db_path())?);
    Engine::new(config, tickets, db).run().await
}
