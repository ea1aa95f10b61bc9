use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform data directory for `thatpass.db` (`~/.local/share/thatpass/` on Linux),
/// created if missing. An explicit `TP_DATA_DIR` is handled by the server config.
pub fn platform_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "thatpass")
        .context("could not determine platform data directory")?;

    let path = dirs.data_dir().to_owned();
    std::fs::create_dir_all(&path).context("create platform data dir")?;
    Ok(path)
}
