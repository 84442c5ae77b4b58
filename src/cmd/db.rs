//! Database maintenance commands: `reqforge init-db` and `reqforge purge`.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqforge::config::Config;
use reqforge::hub::{EventHub, SqliteEventLog};
use reqforge::store::{DbHandle, JobDb};

fn open(config: &Config) -> Result<JobDb> {
    JobDb::new(&config.database.path).with_context(|| {
        format!(
            "Failed to open job database at {}",
            config.database.path.display()
        )
    })
}

pub fn cmd_init_db(config: &Config) -> Result<()> {
    open(config)?;
    println!("Initialized job database at {}", config.database.path.display());
    Ok(())
}

pub async fn cmd_purge(config: &Config) -> Result<()> {
    let db = DbHandle::new(open(config)?);
    let hub = EventHub::new(Arc::new(SqliteEventLog::new(db)));
    let purged = hub
        .purge_expired()
        .await
        .context("Failed to purge expired event streams")?;
    println!("Purged {} expired event stream(s)", purged);
    Ok(())
}
