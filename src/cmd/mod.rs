//! CLI command implementations.
//!
//! | Module           | Commands handled   |
//! |------------------|--------------------|
//! | `serve`          | `Serve`            |
//! | `init`           | `Init`             |
//! | `war_room`       | `WarRoom`          |
//! | `gateway_status` | `GatewayStatus`    |

pub mod gateway_status;
pub mod init;
pub mod serve;
pub mod war_room;

pub use gateway_status::cmd_gateway_status;
pub use init::cmd_init;
pub use serve::cmd_serve;
pub use war_room::cmd_war_room;

use std::path::Path;

use anyhow::{Context, Result};
use mission_control::control::db::ControlDb;

/// Open (creating if needed) the database at `path`.
pub(crate) fn open_db(path: &Path) -> Result<ControlDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    ControlDb::new(path).with_context(|| format!("Failed to open database {}", path.display()))
}
