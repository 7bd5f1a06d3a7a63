//! Database bootstrap command: `mission-control init`.

use std::path::PathBuf;

use anyhow::Result;
use mission_control::config::Settings;

pub fn cmd_init(settings: &Settings, db_path: Option<PathBuf>) -> Result<()> {
    let path = db_path.unwrap_or_else(|| settings.database_path.clone());
    super::open_db(&path)?;
    println!("Database initialized at {}", path.display());
    Ok(())
}
