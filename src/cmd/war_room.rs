//! One-shot war room: `mission-control war-room`.

use anyhow::Result;
use mission_control::config::Settings;
use mission_control::control::db::DbHandle;
use mission_control::control::war_room::WarRoom;

/// Run the orchestrator once and print the outcome as JSON on stdout.
/// `--apply-moves` can only turn moves on; the setting is otherwise kept.
pub async fn cmd_war_room(mut settings: Settings, workspace: Option<String>, apply_moves: bool) -> Result<()> {
    if apply_moves {
        settings.apply_war_room_moves = true;
    }
    let db = DbHandle::new(super::open_db(&settings.database_path)?);
    let war_room = WarRoom::configure(db, &settings, workspace.as_deref()).await?;
    let outcome = war_room.run().await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
