//! `drover init`: write a starter config and create the state store.

use std::path::Path;

use anyhow::{Result, bail};

use drover_db::config::{DATABASE_URL_ENV, DbConfig};
use drover_db::pool;

use crate::config;

const INBOX_TEMPLATE: &str = "\
# Tasks for drover to discover. One [[task]] per entry.
#
# [[task]]
# title = \"Fix dashboard crash\"
# priority = \"high\"
# description = \"null deref when the widget list is empty\"
";

pub async fn run_init(
    cli_config: Option<&Path>,
    cli_db_url: Option<&str>,
    force: bool,
) -> Result<()> {
    let (path, _) = config::select_config_path(cli_config);

    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let db_url = match cli_db_url {
        Some(url) => url.to_string(),
        None => std::env::var(DATABASE_URL_ENV).unwrap_or_else(|_| DbConfig::default_url()),
    };

    let inbox = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("inbox.toml");
    config::write_config(&path, &config::starter_config(&db_url, &inbox))?;
    if !inbox.exists() {
        config::write_config(&inbox, INBOX_TEMPLATE)?;
    }

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  inbox        = {}", inbox.display());

    let db_pool = pool::open(&DbConfig::new(db_url)).await?;
    let counts = pool::table_counts(&db_pool).await?;
    db_pool.close().await;

    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }
    println!();
    println!("Next: add tasks to the inbox, then run `drover discover` or `drover run`.");

    Ok(())
}
