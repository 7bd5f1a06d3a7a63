//! HTTP server command: `mission-control serve`.

use std::path::PathBuf;

use anyhow::Result;
use mission_control::config::Settings;
use mission_control::control::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    mut settings: Settings,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        settings.port = port;
    }
    if let Some(path) = db_path {
        settings.database_path = path;
    }
    start_server(ServerConfig::from_settings(settings, dev)).await
}
